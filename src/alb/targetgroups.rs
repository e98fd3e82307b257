//! Target groups: one per backend service of the Ingress

use k8s_openapi::api::networking::v1::Ingress;
use serde::Serialize;
use tracing::{debug, info};

use super::{backends, resource_name, sync_tags, BackendService, ReconcileContext};
use crate::annotations::Annotations;
use crate::aws::tags::{SERVICE_NAME_TAG, SERVICE_PORT_TAG};
use crate::aws::{Elbv2, Tags, Target, TargetGroupDescription, TargetGroupSpec};
use crate::cluster::{ClusterLookups, ServicePortRef};
use crate::error::{Error, Result};
use crate::events::reasons;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetGroup {
    id: String,
    backend: BackendService,
    current: Option<TargetGroupDescription>,
    desired: Option<TargetGroupSpec>,
    current_tags: Tags,
    desired_tags: Option<Tags>,
    current_targets: Vec<Target>,
    desired_targets: Option<Vec<Target>>,
}

impl TargetGroup {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &BackendService {
        &self.backend
    }

    pub fn arn(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.arn.as_str())
    }

    pub fn current(&self) -> Option<&TargetGroupDescription> {
        self.current.as_ref()
    }

    pub fn desired(&self) -> Option<&TargetGroupSpec> {
        self.desired.as_ref()
    }

    pub fn current_targets(&self) -> &[Target] {
        &self.current_targets
    }

    pub fn desired_targets(&self) -> Option<&[Target]> {
        self.desired_targets.as_deref()
    }

    pub fn strip_desired_state(&mut self) {
        self.desired = None;
        self.desired_tags = None;
        self.desired_targets = None;
    }

    fn is_empty(&self) -> bool {
        self.current.is_none() && self.desired.is_none()
    }

    async fn reconcile(&mut self, ctx: &ReconcileContext<'_>) -> Result<()> {
        let Some(desired) = self.desired.clone() else {
            return Ok(());
        };
        let desired_tags = self.desired_tags.clone().unwrap_or_default();

        let arn = match &self.current {
            None => {
                let created = ctx
                    .elbv2
                    .create_target_group(&desired, &desired_tags)
                    .await?;
                info!(target_group = %created.name, arn = %created.arn, "Created target group");
                ctx.events
                    .normal(
                        reasons::CREATE,
                        format!("{} target group created", created.name),
                    )
                    .await;
                let arn = created.arn.clone();
                self.current = Some(created);
                self.current_tags = desired_tags.clone();
                self.current_targets.clear();
                arn
            }
            Some(current) => {
                let arn = current.arn.clone();
                if current.health_check != desired.health_check {
                    let modified = ctx.elbv2.modify_target_group(&arn, &desired).await?;
                    info!(target_group = %modified.name, "Modified target group health check");
                    ctx.events
                        .normal(
                            reasons::MODIFY,
                            format!("{} target group modified", modified.name),
                        )
                        .await;
                    self.current = Some(modified);
                }
                if sync_tags(ctx, &arn, &mut self.current_tags, &desired_tags).await? {
                    debug!(target_group = %self.id, "Synchronized target group tags");
                }
                arn
            }
        };

        self.reconcile_targets(ctx, &arn).await
    }

    async fn reconcile_targets(&mut self, ctx: &ReconcileContext<'_>, arn: &str) -> Result<()> {
        let Some(desired) = self.desired_targets.clone() else {
            return Ok(());
        };

        let additions: Vec<Target> = desired
            .iter()
            .filter(|t| !self.current_targets.contains(t))
            .cloned()
            .collect();
        let removals: Vec<Target> = self
            .current_targets
            .iter()
            .filter(|t| !desired.contains(t))
            .cloned()
            .collect();

        if !additions.is_empty() {
            ctx.elbv2.register_targets(arn, &additions).await?;
            ctx.events
                .normal(
                    reasons::MODIFY,
                    format!("{} target(s) registered to {}", additions.len(), self.id),
                )
                .await;
        }
        if !removals.is_empty() {
            ctx.elbv2.deregister_targets(arn, &removals).await?;
            ctx.events
                .normal(
                    reasons::MODIFY,
                    format!("{} target(s) deregistered from {}", removals.len(), self.id),
                )
                .await;
        }
        self.current_targets = desired;
        Ok(())
    }

    async fn delete(&mut self, ctx: &ReconcileContext<'_>) -> Result<()> {
        let Some(current) = &self.current else {
            return Ok(());
        };
        ctx.elbv2.delete_target_group(&current.arn).await?;
        info!(target_group = %current.name, "Deleted target group");
        ctx.events
            .normal(
                reasons::DELETE,
                format!("{} target group deleted", current.name),
            )
            .await;
        self.current = None;
        self.current_tags = Tags::new();
        self.current_targets.clear();
        Ok(())
    }
}

/// Inputs for building the desired target groups of an Ingress
pub struct FromIngressOptions<'a> {
    pub ingress: &'a Ingress,
    pub load_balancer_id: &'a str,
    pub existing: TargetGroups,
    pub annotations: &'a Annotations,
    pub cluster_name: &'a str,
    pub namespace: &'a str,
    pub ingress_name: &'a str,
    pub tags: &'a Tags,
    pub lookups: &'a ClusterLookups,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TargetGroups(Vec<TargetGroup>);

impl TargetGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge desired target groups for every backend of the Ingress onto `existing`
    pub fn from_ingress(opts: FromIngressOptions<'_>) -> Result<Self> {
        let mut groups = opts.existing;
        let nodes = opts.lookups.nodes();
        let protocol = opts.annotations.backend_protocol;

        for backend in backends(opts.ingress)? {
            let node_port = opts.lookups.node_port(
                opts.namespace,
                &backend.service_name,
                &backend.service_port,
            )?;
            let name = resource_name(
                opts.cluster_name,
                &[
                    opts.load_balancer_id,
                    opts.namespace,
                    opts.ingress_name,
                    &backend.service_name,
                    &backend.service_port.to_string(),
                    &node_port.to_string(),
                    &protocol.to_string(),
                ],
            );

            let spec = TargetGroupSpec {
                name: name.clone(),
                port: node_port,
                protocol,
                health_check: opts.annotations.health_check.clone(),
            };
            let tags = opts
                .tags
                .clone()
                .with(SERVICE_NAME_TAG, backend.service_name.clone())
                .with(SERVICE_PORT_TAG, backend.service_port.to_string());
            let targets: Vec<Target> = nodes
                .iter()
                .map(|id| Target {
                    id: id.clone(),
                    port: node_port,
                })
                .collect();

            match groups.0.iter_mut().find(|g| g.id == name) {
                Some(group) => {
                    group.backend = backend;
                    group.desired = Some(spec);
                    group.desired_tags = Some(tags);
                    group.desired_targets = Some(targets);
                }
                None => groups.0.push(TargetGroup {
                    id: name,
                    backend,
                    current: None,
                    desired: Some(spec),
                    current_tags: Tags::new(),
                    desired_tags: Some(tags),
                    current_targets: Vec::new(),
                    desired_targets: Some(targets),
                }),
            }
        }

        groups.0.retain(|g| !g.is_empty());
        Ok(groups)
    }

    /// Rebuild the target groups attached to a live load balancer
    pub async fn from_aws(elbv2: &dyn Elbv2, load_balancer_arn: &str) -> Result<Self> {
        let mut groups = Vec::new();
        for description in elbv2
            .describe_target_groups_for_load_balancer(load_balancer_arn)
            .await?
        {
            let tags = elbv2.describe_tags(&description.arn).await?;
            let service_name = tags.get(SERVICE_NAME_TAG).ok_or_else(|| {
                Error::TargetGroupError(format!(
                    "target group {} does not have a {SERVICE_NAME_TAG} tag",
                    description.name
                ))
            })?;
            let service_port = tags.get(SERVICE_PORT_TAG).ok_or_else(|| {
                Error::TargetGroupError(format!(
                    "target group {} does not have a {SERVICE_PORT_TAG} tag",
                    description.name
                ))
            })?;
            let backend = BackendService {
                service_name: service_name.to_string(),
                service_port: ServicePortRef::parse(service_port),
            };
            let mut targets = elbv2.describe_targets(&description.arn).await?;
            targets.sort();

            groups.push(TargetGroup {
                id: description.name.clone(),
                backend,
                current: Some(description),
                desired: None,
                current_tags: tags,
                desired_tags: None,
                current_targets: targets,
                desired_targets: None,
            });
        }
        Ok(Self(groups))
    }

    pub fn strip_desired_state(&mut self) {
        self.0.iter_mut().for_each(TargetGroup::strip_desired_state);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TargetGroup> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Target group serving `backend`, preferring one that is still desired
    pub fn find_by_backend(&self, backend: &BackendService) -> Option<&TargetGroup> {
        self.0
            .iter()
            .filter(|g| &g.backend == backend)
            .max_by_key(|g| (g.desired.is_some(), g.current.is_some()))
    }

    /// ARN of the desired target group serving `backend`, once it exists
    pub fn arn_for(&self, backend: &BackendService) -> Option<&str> {
        self.0
            .iter()
            .filter(|g| g.desired.is_some() && &g.backend == backend)
            .find_map(TargetGroup::arn)
    }

    /// Create and update desired target groups. Unwanted groups are left for
    /// [`TargetGroups::delete_unwanted`] since listeners may still reference them.
    pub async fn reconcile(&mut self, ctx: &ReconcileContext<'_>) -> Vec<Error> {
        let mut errors = Vec::new();
        for group in &mut self.0 {
            if let Err(e) = group.reconcile(ctx).await {
                errors.push(e);
            }
        }
        errors
    }

    /// Delete every target group that is no longer desired
    pub async fn delete_unwanted(&mut self, ctx: &ReconcileContext<'_>) -> Vec<Error> {
        let mut errors = Vec::new();
        for group in self.0.iter_mut().filter(|g| g.desired.is_none()) {
            if let Err(e) = group.delete(ctx).await {
                errors.push(e);
            }
        }
        self.0.retain(|g| !g.is_empty());
        errors
    }
}

impl<'a> IntoIterator for &'a TargetGroups {
    type Item = &'a TargetGroup;
    type IntoIter = std::slice::Iter<'a, TargetGroup>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
