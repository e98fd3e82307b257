//! The load balancer node at the root of the resource tree

use serde::Serialize;
use tracing::{info, warn};

use super::{resource_name, same_members, sync_tags, Listeners, ReconcileContext, TargetGroups};
use crate::annotations::Annotations;
use crate::aws::{LoadBalancerDescription, LoadBalancerSpec, Tags};
use crate::error::{Error, Result};
use crate::events::reasons;

pub struct NewLoadBalancerOptions<'a> {
    pub cluster_name: &'a str,
    pub namespace: &'a str,
    pub ingress_name: &'a str,
    pub annotations: &'a Annotations,
    pub tags: Tags,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    id: String,
    current: Option<LoadBalancerDescription>,
    desired: Option<LoadBalancerSpec>,
    current_tags: Tags,
    desired_tags: Option<Tags>,
    pub target_groups: TargetGroups,
    pub listeners: Listeners,
}

impl LoadBalancer {
    /// Desired-only load balancer for an Ingress, without target groups or listeners
    pub fn new(opts: NewLoadBalancerOptions<'_>) -> Self {
        let id = resource_name(opts.cluster_name, &[opts.namespace, opts.ingress_name]);
        let desired = LoadBalancerSpec {
            name: id.clone(),
            scheme: opts.annotations.scheme,
            subnets: opts.annotations.subnets.clone(),
            security_groups: opts.annotations.security_groups.clone(),
            ip_address_type: opts.annotations.ip_address_type,
        };
        Self {
            id,
            current: None,
            desired: Some(desired),
            current_tags: Tags::new(),
            desired_tags: Some(opts.tags),
            target_groups: TargetGroups::new(),
            listeners: Listeners::new(),
        }
    }

    /// Current-only load balancer from a live description and its tags
    pub fn from_aws(description: LoadBalancerDescription, tags: Tags) -> Self {
        Self {
            id: description.name.clone(),
            current: Some(description),
            desired: None,
            current_tags: tags,
            desired_tags: None,
            target_groups: TargetGroups::new(),
            listeners: Listeners::new(),
        }
    }

    /// Take the desired load balancer fields of `fresh`, keeping everything
    /// observed on `self` along with its target groups and listeners
    pub fn apply_desired(&mut self, fresh: LoadBalancer) {
        if self.current.is_none() {
            self.id = fresh.id;
        }
        self.desired = fresh.desired;
        self.desired_tags = fresh.desired_tags;
    }

    pub fn strip_desired_state(&mut self) {
        self.desired = None;
        self.desired_tags = None;
        self.target_groups.strip_desired_state();
        self.listeners.strip_desired_state();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn arn(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.arn.as_str())
    }

    pub fn dns_name(&self) -> Option<&str> {
        self.current.as_ref().and_then(|c| c.dns_name.as_deref())
    }

    pub fn current(&self) -> Option<&LoadBalancerDescription> {
        self.current.as_ref()
    }

    pub fn desired(&self) -> Option<&LoadBalancerSpec> {
        self.desired.as_ref()
    }

    pub fn current_tags(&self) -> &Tags {
        &self.current_tags
    }

    pub fn desired_tags(&self) -> Option<&Tags> {
        self.desired_tags.as_ref()
    }

    /// Neither desired nor present in the cloud, and no child resource is
    /// left to delete
    pub fn is_gone(&self) -> bool {
        self.current.is_none()
            && self.desired.is_none()
            && self.target_groups.is_empty()
            && self.listeners.is_empty()
    }

    fn needs_modify(current: &LoadBalancerDescription, desired: &LoadBalancerSpec) -> bool {
        !same_members(&current.subnets, &desired.subnets)
            || !same_members(&current.security_groups, &desired.security_groups)
            || current.ip_address_type != desired.ip_address_type
    }

    /// Push the desired tree to the cloud.
    ///
    /// Errors are collected rather than returned early so that independent
    /// parts of the tree still converge. A load balancer failure stops the
    /// pass since nothing below it can be reconciled.
    pub async fn reconcile(&mut self, ctx: &ReconcileContext<'_>) -> Vec<Error> {
        let Some(desired) = self.desired.clone() else {
            return self.delete(ctx).await;
        };

        if let Err(e) = self.reconcile_load_balancer(ctx, &desired).await {
            return vec![e];
        }
        let Some(arn) = self.arn().map(str::to_string) else {
            return Vec::new();
        };

        let mut errors = self.target_groups.reconcile(ctx).await;
        errors.extend(
            self.listeners
                .reconcile(ctx, &arn, &self.target_groups)
                .await,
        );
        errors.extend(self.target_groups.delete_unwanted(ctx).await);
        errors
    }

    async fn reconcile_load_balancer(
        &mut self,
        ctx: &ReconcileContext<'_>,
        desired: &LoadBalancerSpec,
    ) -> Result<()> {
        let desired_tags = self.desired_tags.clone().unwrap_or_default();

        match self.current.clone() {
            None => self.create(ctx, desired, &desired_tags).await,
            Some(current) if current.scheme != desired.scheme => {
                warn!(
                    load_balancer = %current.name,
                    from = %current.scheme,
                    to = %desired.scheme,
                    "Scheme changed, recreating load balancer"
                );
                self.delete_load_balancer(ctx, &current).await?;
                self.create(ctx, desired, &desired_tags).await
            }
            Some(current) => {
                if Self::needs_modify(&current, desired) {
                    let modified = ctx.elbv2.modify_load_balancer(&current.arn, desired).await?;
                    info!(load_balancer = %modified.name, "Modified load balancer");
                    ctx.events
                        .normal(
                            reasons::MODIFY,
                            format!("{} load balancer modified", modified.name),
                        )
                        .await;
                    self.current = Some(modified);
                }
                if sync_tags(ctx, &current.arn, &mut self.current_tags, &desired_tags).await? {
                    info!(load_balancer = %current.name, "Synchronized load balancer tags");
                    ctx.events
                        .normal(
                            reasons::MODIFY,
                            format!("{} tags modified", current.name),
                        )
                        .await;
                }
                Ok(())
            }
        }
    }

    async fn create(
        &mut self,
        ctx: &ReconcileContext<'_>,
        desired: &LoadBalancerSpec,
        tags: &Tags,
    ) -> Result<()> {
        let created = ctx.elbv2.create_load_balancer(desired, tags).await?;
        info!(load_balancer = %created.name, arn = %created.arn, "Created load balancer");
        ctx.events
            .normal(
                reasons::CREATE,
                format!("{} load balancer created", created.name),
            )
            .await;
        self.id = created.name.clone();
        self.current = Some(created);
        self.current_tags = tags.clone();
        Ok(())
    }

    async fn delete_load_balancer(
        &mut self,
        ctx: &ReconcileContext<'_>,
        current: &LoadBalancerDescription,
    ) -> Result<()> {
        ctx.elbv2.delete_load_balancer(&current.arn).await?;
        info!(load_balancer = %current.name, "Deleted load balancer");
        ctx.events
            .normal(
                reasons::DELETE,
                format!("{} load balancer deleted", current.name),
            )
            .await;
        self.current = None;
        self.current_tags = Tags::new();
        self.listeners.forget_current();
        Ok(())
    }

    /// Remove the load balancer and every target group it owned
    async fn delete(&mut self, ctx: &ReconcileContext<'_>) -> Vec<Error> {
        if let Some(current) = self.current.clone() {
            if let Err(e) = self.delete_load_balancer(ctx, &current).await {
                return vec![e];
            }
        }
        self.target_groups.strip_desired_state();
        self.target_groups.delete_unwanted(ctx).await
    }
}
