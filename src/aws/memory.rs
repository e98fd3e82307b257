//! In-process Elastic Load Balancing backend
//!
//! Keeps load balancers, target groups, listeners and rules in memory and
//! records every call. The `render --plan` command uses it to show which
//! operations a reconcile would issue; failures can be injected per
//! operation to exercise partial reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::elbv2::{
    Elbv2, ListenerDescription, ListenerSpec, LoadBalancerDescription, LoadBalancerSpec,
    RuleDescription, RuleSpec, Target, TargetGroupDescription, TargetGroupSpec,
};
use super::tags::Tags;
use crate::error::{Error, Result};

const ACCOUNT_ID: &str = "000000000000";
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Default)]
struct Inner {
    sequence: u64,
    load_balancers: BTreeMap<String, LoadBalancerDescription>,
    target_groups: BTreeMap<String, TargetGroupDescription>,
    targets: BTreeMap<String, BTreeSet<Target>>,
    listeners: BTreeMap<String, ListenerDescription>,
    rules: BTreeMap<String, RuleDescription>,
    tags: BTreeMap<String, Tags>,
    operations: Vec<String>,
    failures: BTreeSet<String>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Record the call, then fail it if a failure was injected for `operation`
    fn call(&mut self, operation: &str, subject: &str) -> Result<()> {
        self.operations.push(format!("{operation} {subject}"));
        if self.failures.contains(operation) {
            return Err(Error::cloud(operation, "injected failure"));
        }
        Ok(())
    }

    fn target_groups_of(&self, load_balancer_arn: &str) -> BTreeSet<String> {
        let listener_arns: BTreeSet<&String> = self
            .listeners
            .values()
            .filter(|l| l.load_balancer_arn == load_balancer_arn)
            .map(|l| &l.arn)
            .collect();

        let defaults = self
            .listeners
            .values()
            .filter(|l| l.load_balancer_arn == load_balancer_arn)
            .filter_map(|l| l.default_target_group_arn.clone());
        let from_rules = self
            .rules
            .values()
            .filter(|r| listener_arns.contains(&r.listener_arn))
            .map(|r| r.target_group_arn.clone());

        defaults.chain(from_rules).collect()
    }

    fn target_group_in_use(&self, arn: &str) -> bool {
        self.listeners
            .values()
            .any(|l| l.default_target_group_arn.as_deref() == Some(arn))
            || self.rules.values().any(|r| r.target_group_arn == arn)
    }

    fn drop_listener(&mut self, arn: &str) {
        self.listeners.remove(arn);
        self.rules.retain(|_, r| r.listener_arn != arn);
    }
}

pub struct InMemoryElbv2 {
    region: String,
    inner: Mutex<Inner>,
}

impl Default for InMemoryElbv2 {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryElbv2 {
    pub fn new() -> Self {
        Self::with_region(DEFAULT_REGION)
    }

    pub fn with_region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arn(&self, kind: &str, name: &str, id: u64) -> String {
        format!(
            "arn:aws:elasticloadbalancing:{}:{}:{}/{}/{:016x}",
            self.region, ACCOUNT_ID, kind, name, id
        )
    }

    /// Every call made so far, as `"<Operation> <subject>"`
    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    /// Calls whose operation name starts with a mutating verb
    pub fn mutations(&self) -> Vec<String> {
        self.lock()
            .operations
            .iter()
            .filter(|op| !op.starts_with("Describe"))
            .cloned()
            .collect()
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }

    /// Make every subsequent call to `operation` fail
    pub fn fail(&self, operation: &str) {
        self.lock().failures.insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn load_balancer_count(&self) -> usize {
        self.lock().load_balancers.len()
    }

    pub fn target_group_count(&self) -> usize {
        self.lock().target_groups.len()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn rule_count(&self) -> usize {
        self.lock().rules.len()
    }
}

#[async_trait]
impl Elbv2 for InMemoryElbv2 {
    async fn describe_load_balancers(&self) -> Result<Vec<LoadBalancerDescription>> {
        let mut inner = self.lock();
        inner.call("DescribeLoadBalancers", "*")?;
        Ok(inner.load_balancers.values().cloned().collect())
    }

    async fn describe_tags(&self, arn: &str) -> Result<Tags> {
        let mut inner = self.lock();
        inner.call("DescribeTags", arn)?;
        Ok(inner.tags.get(arn).cloned().unwrap_or_default())
    }

    async fn add_tags(&self, arn: &str, tags: &Tags) -> Result<()> {
        let mut inner = self.lock();
        inner.call("AddTags", arn)?;
        let existing = inner.tags.entry(arn.to_string()).or_default();
        for tag in tags {
            existing.set(tag.key.clone(), tag.value.clone());
        }
        Ok(())
    }

    async fn remove_tags(&self, arn: &str, keys: &[String]) -> Result<()> {
        let mut inner = self.lock();
        inner.call("RemoveTags", arn)?;
        if let Some(existing) = inner.tags.get_mut(arn) {
            for key in keys {
                existing.remove(key);
            }
        }
        Ok(())
    }

    async fn create_load_balancer(
        &self,
        spec: &LoadBalancerSpec,
        tags: &Tags,
    ) -> Result<LoadBalancerDescription> {
        let mut inner = self.lock();
        inner.call("CreateLoadBalancer", &spec.name)?;
        if inner.load_balancers.values().any(|lb| lb.name == spec.name) {
            return Err(Error::cloud(
                "CreateLoadBalancer",
                format!("load balancer {} already exists", spec.name),
            ));
        }

        let id = inner.next_id();
        let description = LoadBalancerDescription {
            arn: self.arn("loadbalancer/app", &spec.name, id),
            name: spec.name.clone(),
            dns_name: Some(format!("{}-{}.{}.elb.amazonaws.com", spec.name, id, self.region)),
            scheme: spec.scheme,
            subnets: spec.subnets.clone(),
            security_groups: spec.security_groups.clone(),
            ip_address_type: spec.ip_address_type,
        };
        inner
            .load_balancers
            .insert(description.arn.clone(), description.clone());
        inner.tags.insert(description.arn.clone(), tags.clone());
        Ok(description)
    }

    async fn modify_load_balancer(
        &self,
        arn: &str,
        spec: &LoadBalancerSpec,
    ) -> Result<LoadBalancerDescription> {
        let mut inner = self.lock();
        inner.call("ModifyLoadBalancer", arn)?;
        let lb = inner.load_balancers.get_mut(arn).ok_or_else(|| {
            Error::cloud("ModifyLoadBalancer", format!("load balancer {arn} not found"))
        })?;
        lb.subnets = spec.subnets.clone();
        lb.security_groups = spec.security_groups.clone();
        lb.ip_address_type = spec.ip_address_type;
        Ok(lb.clone())
    }

    async fn delete_load_balancer(&self, arn: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.call("DeleteLoadBalancer", arn)?;
        inner.load_balancers.remove(arn);
        inner.tags.remove(arn);
        let listeners: Vec<String> = inner
            .listeners
            .values()
            .filter(|l| l.load_balancer_arn == arn)
            .map(|l| l.arn.clone())
            .collect();
        for listener in listeners {
            inner.drop_listener(&listener);
        }
        Ok(())
    }

    async fn describe_target_groups_for_load_balancer(
        &self,
        load_balancer_arn: &str,
    ) -> Result<Vec<TargetGroupDescription>> {
        let mut inner = self.lock();
        inner.call("DescribeTargetGroups", load_balancer_arn)?;
        let attached = inner.target_groups_of(load_balancer_arn);
        Ok(inner
            .target_groups
            .values()
            .filter(|tg| attached.contains(&tg.arn))
            .map(|tg| {
                let mut tg = tg.clone();
                tg.load_balancer_arns = vec![load_balancer_arn.to_string()];
                tg
            })
            .collect())
    }

    async fn create_target_group(
        &self,
        spec: &TargetGroupSpec,
        tags: &Tags,
    ) -> Result<TargetGroupDescription> {
        let mut inner = self.lock();
        inner.call("CreateTargetGroup", &spec.name)?;
        if inner.target_groups.values().any(|tg| tg.name == spec.name) {
            return Err(Error::cloud(
                "CreateTargetGroup",
                format!("target group {} already exists", spec.name),
            ));
        }

        let id = inner.next_id();
        let description = TargetGroupDescription {
            arn: self.arn("targetgroup", &spec.name, id),
            name: spec.name.clone(),
            port: spec.port,
            protocol: spec.protocol,
            health_check: spec.health_check.clone(),
            load_balancer_arns: Vec::new(),
        };
        inner
            .target_groups
            .insert(description.arn.clone(), description.clone());
        inner.tags.insert(description.arn.clone(), tags.clone());
        Ok(description)
    }

    async fn modify_target_group(
        &self,
        arn: &str,
        spec: &TargetGroupSpec,
    ) -> Result<TargetGroupDescription> {
        let mut inner = self.lock();
        inner.call("ModifyTargetGroup", arn)?;
        let tg = inner.target_groups.get_mut(arn).ok_or_else(|| {
            Error::cloud("ModifyTargetGroup", format!("target group {arn} not found"))
        })?;
        tg.health_check = spec.health_check.clone();
        Ok(tg.clone())
    }

    async fn delete_target_group(&self, arn: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.call("DeleteTargetGroup", arn)?;
        if inner.target_group_in_use(arn) {
            return Err(Error::cloud(
                "DeleteTargetGroup",
                format!("target group {arn} is currently in use by a listener or a rule"),
            ));
        }
        inner.target_groups.remove(arn);
        inner.targets.remove(arn);
        inner.tags.remove(arn);
        Ok(())
    }

    async fn describe_targets(&self, target_group_arn: &str) -> Result<Vec<Target>> {
        let mut inner = self.lock();
        inner.call("DescribeTargetHealth", target_group_arn)?;
        Ok(inner
            .targets
            .get(target_group_arn)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn register_targets(&self, target_group_arn: &str, targets: &[Target]) -> Result<()> {
        let mut inner = self.lock();
        inner.call("RegisterTargets", target_group_arn)?;
        if !inner.target_groups.contains_key(target_group_arn) {
            return Err(Error::cloud(
                "RegisterTargets",
                format!("target group {target_group_arn} not found"),
            ));
        }
        inner
            .targets
            .entry(target_group_arn.to_string())
            .or_default()
            .extend(targets.iter().cloned());
        Ok(())
    }

    async fn deregister_targets(
        &self,
        target_group_arn: &str,
        targets: &[Target],
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.call("DeregisterTargets", target_group_arn)?;
        if let Some(registered) = inner.targets.get_mut(target_group_arn) {
            for target in targets {
                registered.remove(target);
            }
        }
        Ok(())
    }

    async fn describe_listeners_for_load_balancer(
        &self,
        load_balancer_arn: &str,
    ) -> Result<Vec<ListenerDescription>> {
        let mut inner = self.lock();
        inner.call("DescribeListeners", load_balancer_arn)?;
        Ok(inner
            .listeners
            .values()
            .filter(|l| l.load_balancer_arn == load_balancer_arn)
            .cloned()
            .collect())
    }

    async fn create_listener(
        &self,
        load_balancer_arn: &str,
        spec: &ListenerSpec,
        default_target_group_arn: &str,
    ) -> Result<ListenerDescription> {
        let mut inner = self.lock();
        inner.call("CreateListener", &format!("{load_balancer_arn}:{}", spec.port))?;
        if !inner.load_balancers.contains_key(load_balancer_arn) {
            return Err(Error::cloud(
                "CreateListener",
                format!("load balancer {load_balancer_arn} not found"),
            ));
        }
        if inner
            .listeners
            .values()
            .any(|l| l.load_balancer_arn == load_balancer_arn && l.port == spec.port)
        {
            return Err(Error::cloud(
                "CreateListener",
                format!("a listener already exists on port {}", spec.port),
            ));
        }

        let id = inner.next_id();
        let description = ListenerDescription {
            arn: self.arn("listener/app", &spec.port.to_string(), id),
            load_balancer_arn: load_balancer_arn.to_string(),
            port: spec.port,
            protocol: spec.protocol,
            certificate_arn: spec.certificate_arn.clone(),
            default_target_group_arn: Some(default_target_group_arn.to_string()),
        };
        inner
            .listeners
            .insert(description.arn.clone(), description.clone());
        Ok(description)
    }

    async fn modify_listener(
        &self,
        arn: &str,
        spec: &ListenerSpec,
        default_target_group_arn: &str,
    ) -> Result<ListenerDescription> {
        let mut inner = self.lock();
        inner.call("ModifyListener", arn)?;
        let listener = inner
            .listeners
            .get_mut(arn)
            .ok_or_else(|| {
                Error::cloud("ModifyListener", format!("listener {arn} not found"))
            })?;
        listener.port = spec.port;
        listener.protocol = spec.protocol;
        listener.certificate_arn = spec.certificate_arn.clone();
        listener.default_target_group_arn = Some(default_target_group_arn.to_string());
        Ok(listener.clone())
    }

    async fn delete_listener(&self, arn: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.call("DeleteListener", arn)?;
        inner.drop_listener(arn);
        Ok(())
    }

    async fn describe_rules(&self, listener_arn: &str) -> Result<Vec<RuleDescription>> {
        let mut inner = self.lock();
        inner.call("DescribeRules", listener_arn)?;
        let mut rules: Vec<RuleDescription> = inner
            .rules
            .values()
            .filter(|r| r.listener_arn == listener_arn)
            .cloned()
            .collect();

        // The API always reports the listener's default action as a rule.
        if let Some(listener) = inner.listeners.get(listener_arn) {
            if let Some(default_tg) = &listener.default_target_group_arn {
                rules.push(RuleDescription {
                    arn: format!("{listener_arn}/default"),
                    listener_arn: listener_arn.to_string(),
                    priority: i32::MAX,
                    host: None,
                    path: None,
                    target_group_arn: default_tg.clone(),
                    is_default: true,
                });
            }
        }
        Ok(rules)
    }

    async fn create_rule(
        &self,
        listener_arn: &str,
        spec: &RuleSpec,
        target_group_arn: &str,
    ) -> Result<RuleDescription> {
        let mut inner = self.lock();
        inner.call("CreateRule", &format!("{listener_arn}:{}", spec.priority))?;
        if !inner.listeners.contains_key(listener_arn) {
            return Err(Error::cloud(
                "CreateRule",
                format!("listener {listener_arn} not found"),
            ));
        }
        if inner
            .rules
            .values()
            .any(|r| r.listener_arn == listener_arn && r.priority == spec.priority)
        {
            return Err(Error::cloud(
                "CreateRule",
                format!("priority {} is already in use", spec.priority),
            ));
        }

        let id = inner.next_id();
        let description = RuleDescription {
            arn: self.arn("listener-rule/app", &spec.priority.to_string(), id),
            listener_arn: listener_arn.to_string(),
            priority: spec.priority,
            host: spec.host.clone(),
            path: spec.path.clone(),
            target_group_arn: target_group_arn.to_string(),
            is_default: false,
        };
        inner
            .rules
            .insert(description.arn.clone(), description.clone());
        Ok(description)
    }

    async fn delete_rule(&self, arn: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.call("DeleteRule", arn)?;
        inner.rules.remove(arn);
        Ok(())
    }
}
