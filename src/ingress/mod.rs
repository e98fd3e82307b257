//! The Ingress aggregate
//!
//! [`AlbIngress`] ties one Kubernetes Ingress to the load balancer tree that
//! serves it. It is built either from the Ingress itself
//! ([`AlbIngress::from_ingress`], once per observed change) or from a live
//! load balancer ([`AlbIngress::from_aws`], on cold start), and is then
//! reconciled against the cloud. Assembly and reconcile on the same aggregate
//! are serialized by its lock; distinct aggregates never share state.

use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::networking::v1::{Ingress, IngressLoadBalancerIngress};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::alb::listeners::Listeners;
use crate::alb::targetgroups::{self, TargetGroups};
use crate::alb::{LoadBalancer, NewLoadBalancerOptions, ReconcileContext};
use crate::annotations::{AnnotationResolver, Annotations, Resolution};
use crate::aws::tags::{cluster_tag, CLUSTER_TAG_OWNED, INGRESS_NAME_TAG, NAMESPACE_TAG};
use crate::aws::{Elbv2, LoadBalancerDescription, Tags};
use crate::cluster::ClusterLookups;
use crate::error::{Error, Result};
use crate::events::{reasons, EventSink, IngressEvents};

/// Lookup key of an aggregate: `namespace/name`
pub fn id(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Caller-supplied tags with the ownership tags of `namespace/name` in
/// `cluster_name`.
///
/// Any supplied `Namespace`, `IngressName` or cluster entry is replaced, so
/// each reserved key appears exactly once.
pub fn ingress_tags(base: &Tags, cluster_name: &str, namespace: &str, name: &str) -> Tags {
    let owner = cluster_tag(cluster_name);
    let mut tags = base.clone();
    tags.remove(NAMESPACE_TAG);
    tags.remove(INGRESS_NAME_TAG);
    tags.remove(&owner);
    tags.push(NAMESPACE_TAG, namespace);
    tags.push(INGRESS_NAME_TAG, name);
    tags.push(owner, CLUSTER_TAG_OWNED);
    tags
}

#[derive(Default)]
struct IngressState {
    valid: bool,
    annotations: Option<Annotations>,
    load_balancer: Option<LoadBalancer>,
}

pub struct NewAlbIngressOptions {
    pub namespace: String,
    pub name: String,
    pub cluster_name: String,
    pub events: Option<Arc<dyn EventSink>>,
}

pub struct FromIngressOptions<'a> {
    pub ingress: &'a Ingress,
    /// Aggregate built for the same Ingress on an earlier tick
    pub existing: Option<Arc<AlbIngress>>,
    pub cluster_name: &'a str,
    pub resolver: &'a AnnotationResolver,
    pub lookups: &'a ClusterLookups,
    pub events: Option<Arc<dyn EventSink>>,
}

pub struct FromAwsOptions<'a> {
    pub load_balancer: LoadBalancerDescription,
    pub cluster_name: &'a str,
    pub elbv2: &'a dyn Elbv2,
    pub events: Option<Arc<dyn EventSink>>,
}

pub struct ReconcileOptions<'a> {
    pub elbv2: &'a dyn Elbv2,
}

/// Result of assembling an Ingress. `valid` is false when the Ingress could
/// not be turned into a desired tree; the aggregate is returned either way.
pub struct Assembly {
    pub ingress: Arc<AlbIngress>,
    pub valid: bool,
}

pub struct AlbIngress {
    id: String,
    namespace: String,
    ingress_name: String,
    cluster_name: String,
    events: Option<Arc<dyn EventSink>>,
    object: RwLock<Option<ObjectReference>>,
    state: Mutex<IngressState>,
}

impl std::fmt::Debug for AlbIngress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlbIngress")
            .field("id", &self.id)
            .field("cluster_name", &self.cluster_name)
            .finish_non_exhaustive()
    }
}

impl AlbIngress {
    pub fn new(opts: NewAlbIngressOptions) -> Self {
        Self {
            id: id(&opts.namespace, &opts.name),
            namespace: opts.namespace,
            ingress_name: opts.name,
            cluster_name: opts.cluster_name,
            events: opts.events,
            object: RwLock::new(None),
            state: Mutex::new(IngressState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ingress_name(&self) -> &str {
        &self.ingress_name
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// `namespace-name`, for display
    pub fn name(&self) -> String {
        format!("{}-{}", self.namespace, self.ingress_name)
    }

    /// Reference to the Ingress this aggregate was last assembled from
    pub fn object_ref(&self) -> Option<ObjectReference> {
        self.object.read().ok().and_then(|o| o.clone())
    }

    fn bind(&self, object: ObjectReference) {
        if let Ok(mut bound) = self.object.write() {
            *bound = Some(object);
        }
    }

    fn events(&self) -> IngressEvents {
        IngressEvents::new(self.events.clone(), self.object_ref())
    }

    pub async fn is_valid(&self) -> bool {
        self.state.lock().await.valid
    }

    pub async fn annotations(&self) -> Option<Annotations> {
        self.state.lock().await.annotations.clone()
    }

    /// Snapshot of the resource tree
    pub async fn load_balancer(&self) -> Option<LoadBalancer> {
        self.state.lock().await.load_balancer.clone()
    }

    /// Build the desired tree for `opts.ingress`, merging it onto the
    /// existing aggregate when one is given.
    ///
    /// Never fails: problems are reported through events and logs and leave
    /// the aggregate invalid with its previous tree untouched.
    #[instrument(skip(opts), fields(ingress = %opts.ingress.name_any()))]
    pub async fn from_ingress(opts: FromIngressOptions<'_>) -> Assembly {
        let namespace = opts
            .ingress
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        let name = opts.ingress.name_any();
        let key = id(&namespace, &name);

        let aggregate = match opts.existing.clone() {
            Some(existing) if existing.id == key => existing,
            other => {
                if let Some(existing) = other {
                    warn!(
                        existing = %existing.id,
                        ingress = %key,
                        "Ignoring existing aggregate built for another ingress"
                    );
                }
                Arc::new(Self::new(NewAlbIngressOptions {
                    namespace,
                    name,
                    cluster_name: opts.cluster_name.to_string(),
                    events: opts.events.clone(),
                }))
            }
        };

        let valid = {
            let mut state = aggregate.state.lock().await;
            aggregate.assemble(&mut state, &opts).await
        };
        Assembly {
            ingress: aggregate,
            valid,
        }
    }

    /// Runs with the state lock held. The existing tree is only replaced once
    /// the whole desired tree has been built.
    async fn assemble(&self, state: &mut IngressState, opts: &FromIngressOptions<'_>) -> bool {
        self.bind(opts.ingress.object_ref(&()));
        let events = self.events();

        let annotations = match opts.resolver.resolve(opts.ingress.annotations()) {
            Ok(Resolution::Resolved(annotations)) => annotations,
            Ok(Resolution::KnownInvalid) => {
                debug!(ingress = %self.id, "Annotations previously failed validation");
                events
                    .warning(
                        reasons::ERROR,
                        "Annotations are unchanged since they last failed validation",
                    )
                    .await;
                return self.invalidate(state, "annotations");
            }
            Err(e) => {
                error!(ingress = %self.id, error = %e, "Error parsing annotations");
                events
                    .warning(reasons::ERROR, format!("Error parsing annotations: {e}"))
                    .await;
                return self.invalidate(state, "annotations");
            }
        };

        let tags = ingress_tags(
            &annotations.tags,
            &self.cluster_name,
            &self.namespace,
            &self.ingress_name,
        );
        let fresh = LoadBalancer::new(NewLoadBalancerOptions {
            cluster_name: opts.cluster_name,
            namespace: &self.namespace,
            ingress_name: &self.ingress_name,
            annotations: &annotations,
            tags: tags.clone(),
        });

        let mut tree = match state.load_balancer.clone() {
            Some(mut existing) => {
                existing.strip_desired_state();
                existing.apply_desired(fresh);
                existing
            }
            None => fresh,
        };

        let load_balancer_id = tree.id().to_string();
        let target_groups = TargetGroups::from_ingress(targetgroups::FromIngressOptions {
            ingress: opts.ingress,
            load_balancer_id: &load_balancer_id,
            existing: std::mem::take(&mut tree.target_groups),
            annotations: &annotations,
            cluster_name: opts.cluster_name,
            namespace: &self.namespace,
            ingress_name: &self.ingress_name,
            tags: &tags,
            lookups: opts.lookups,
        });
        tree.target_groups = match target_groups {
            Ok(target_groups) => target_groups,
            Err(e) => {
                error!(ingress = %self.id, error = %e, "Error instantiating target groups");
                events
                    .warning(
                        reasons::ERROR,
                        format!("Error instantiating target groups: {e}"),
                    )
                    .await;
                return self.invalidate(state, "target_groups");
            }
        };

        let existing = std::mem::take(&mut tree.listeners);
        let listeners = Listeners::from_ingress(opts.ingress, existing, &annotations);
        tree.listeners = match listeners {
            Ok(listeners) => listeners,
            Err(e) => {
                error!(ingress = %self.id, error = %e, "Error instantiating listeners");
                events
                    .warning(
                        reasons::ERROR,
                        format!("Error instantiating listeners: {e}"),
                    )
                    .await;
                return self.invalidate(state, "listeners");
            }
        };

        state.load_balancer = Some(tree);
        state.annotations = Some(annotations);
        state.valid = true;
        true
    }

    fn invalidate(&self, state: &mut IngressState, stage: &str) -> bool {
        state.valid = false;
        state.annotations = None;
        #[cfg(feature = "metrics")]
        crate::metrics::inc_assembly_failure(stage);
        debug!(ingress = %self.id, stage, "Ingress marked invalid");
        false
    }

    /// Rebuild an aggregate from a live load balancer and the resources
    /// attached to it
    #[instrument(skip(opts), fields(load_balancer = %opts.load_balancer.name))]
    pub async fn from_aws(opts: FromAwsOptions<'_>) -> Result<Self> {
        let description = opts.load_balancer;
        let tags = opts.elbv2.describe_tags(&description.arn).await?;

        let missing = |tag: &str| Error::MissingTag {
            tag: tag.to_string(),
            load_balancer: description.name.clone(),
        };
        // A shared name prefix does not make the load balancer ours
        let owner = cluster_tag(opts.cluster_name);
        if tags.get(&owner) != Some(CLUSTER_TAG_OWNED) {
            return Err(missing(&owner));
        }
        let namespace = tags
            .get(NAMESPACE_TAG)
            .ok_or_else(|| missing(NAMESPACE_TAG))?
            .to_string();
        let name = tags
            .get(INGRESS_NAME_TAG)
            .ok_or_else(|| missing(INGRESS_NAME_TAG))?
            .to_string();

        let mut aggregate = Self::new(NewAlbIngressOptions {
            namespace,
            name,
            cluster_name: opts.cluster_name.to_string(),
            events: opts.events,
        });

        let arn = description.arn.clone();
        let load_balancer_name = description.name.clone();
        let mut tree = LoadBalancer::from_aws(description, tags);
        tree.target_groups = TargetGroups::from_aws(opts.elbv2, &arn).await?;
        tree.listeners = Listeners::from_aws(opts.elbv2, &arn).await?;

        let state = aggregate.state.get_mut();
        state.load_balancer = Some(tree);
        state.valid = true;

        info!(
            ingress = %aggregate.id,
            load_balancer = %load_balancer_name,
            "Ingress rebuilt from existing ALB in AWS"
        );
        Ok(aggregate)
    }

    /// Push the desired tree to the cloud.
    ///
    /// Errors are logged and reported as events, never returned; the next
    /// reconcile retries from whatever state this one reached.
    #[instrument(skip(self, opts), fields(ingress = %self.id))]
    pub async fn reconcile(&self, opts: &ReconcileOptions<'_>) {
        let mut state = self.state.lock().await;
        if !state.valid {
            debug!(ingress = %self.id, "Skipping reconcile of invalid ingress");
            return;
        }
        let Some(tree) = state.load_balancer.as_mut() else {
            return;
        };

        let events = self.events();
        let ctx = ReconcileContext {
            elbv2: opts.elbv2,
            events: &events,
        };
        let started = std::time::Instant::now();
        let errors = tree.reconcile(&ctx).await;

        #[cfg(feature = "metrics")]
        crate::metrics::observe_reconcile(&self.id, started.elapsed().as_secs_f64(), errors.len());
        debug!(
            ingress = %self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            errors = errors.len(),
            "Reconcile finished"
        );

        for e in &errors {
            error!(ingress = %self.id, error = %e, "Failed to reconcile state");
            events
                .warning(reasons::ERROR, format!("Failed to reconcile: {e}"))
                .await;
        }

        if tree.is_gone() {
            info!(ingress = %self.id, "Load balancer and its resources are deleted");
            state.load_balancer = None;
        }
    }

    pub async fn strip_desired_state(&self) {
        if let Some(tree) = self.state.lock().await.load_balancer.as_mut() {
            tree.strip_desired_state();
        }
    }

    /// Mark every owned cloud resource for deletion on the next reconcile
    pub async fn prepare_deletion(&self) {
        let mut state = self.state.lock().await;
        if let Some(tree) = state.load_balancer.as_mut() {
            tree.strip_desired_state();
            state.valid = true;
        }
    }

    /// Ownership tags plus the tags requested through annotations
    pub async fn tags(&self) -> Tags {
        let state = self.state.lock().await;
        let base = state
            .annotations
            .as_ref()
            .map(|a| a.tags.clone())
            .unwrap_or_default();
        ingress_tags(&base, &self.cluster_name, &self.namespace, &self.ingress_name)
    }

    /// Load balancer hostname to publish in the Ingress status
    pub async fn hostnames(&self) -> Result<Vec<IngressLoadBalancerIngress>> {
        let state = self.state.lock().await;
        let Some(tree) = state.load_balancer.as_ref() else {
            return Ok(Vec::new());
        };
        let Some(hostname) = tree.dns_name() else {
            warn!(ingress = %self.id, "Load balancer has no DNS name yet");
            return Err(Error::NotReady(self.id.clone()));
        };
        Ok(vec![IngressLoadBalancerIngress {
            hostname: Some(hostname.to_string()),
            ..Default::default()
        }])
    }

    /// Record an event on the bound Ingress. Does nothing without a sink or
    /// before the aggregate has been assembled from an Ingress.
    pub async fn eventf(&self, type_: EventType, reason: &str, message: impl Into<String>) {
        self.events().emit(type_, reason, message).await;
    }
}

#[cfg(test)]
mod assembly_test;
