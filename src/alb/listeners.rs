//! Listeners and their routing rules
//!
//! One listener per `listen-ports` entry. Every listener forwards to the
//! Ingress default backend and carries one rule per host/path entry,
//! prioritised in declaration order.

use k8s_openapi::api::networking::v1::Ingress;
use serde::Serialize;
use tracing::info;

use super::{default_backend, ingress_paths, BackendService, ReconcileContext, TargetGroups};
use crate::annotations::Annotations;
use crate::aws::{Elbv2, ListenerDescription, ListenerSpec, Protocol, RuleDescription, RuleSpec};
use crate::error::{Error, Result};
use crate::events::reasons;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    current: Option<RuleDescription>,
    desired: Option<RuleSpec>,
    backend: Option<BackendService>,
}

impl Rule {
    pub fn current(&self) -> Option<&RuleDescription> {
        self.current.as_ref()
    }

    pub fn desired(&self) -> Option<&RuleSpec> {
        self.desired.as_ref()
    }

    pub fn backend(&self) -> Option<&BackendService> {
        self.backend.as_ref()
    }

    fn priority(&self) -> Option<i32> {
        self.desired
            .as_ref()
            .map(|d| d.priority)
            .or(self.current.as_ref().map(|c| c.priority))
    }

    fn strip_desired_state(&mut self) {
        self.desired = None;
        self.backend = None;
    }

    fn target_group_arn<'t>(&self, target_groups: &'t TargetGroups) -> Option<&'t str> {
        target_groups.arn_for(self.backend.as_ref()?)
    }

    /// Whether the live rule already routes as desired
    fn in_sync(&self, target_group_arn: Option<&str>) -> bool {
        match (&self.current, &self.desired) {
            (Some(current), Some(desired)) => {
                current.priority == desired.priority
                    && current.host == desired.host
                    && current.path == desired.path
                    && Some(current.target_group_arn.as_str()) == target_group_arn
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    current: Option<ListenerDescription>,
    desired: Option<ListenerSpec>,
    default_backend: Option<BackendService>,
    rules: Vec<Rule>,
}

impl Listener {
    pub fn current(&self) -> Option<&ListenerDescription> {
        self.current.as_ref()
    }

    pub fn desired(&self) -> Option<&ListenerSpec> {
        self.desired.as_ref()
    }

    pub fn default_backend(&self) -> Option<&BackendService> {
        self.default_backend.as_ref()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    fn port(&self) -> Option<i32> {
        self.desired
            .as_ref()
            .map(|d| d.port)
            .or(self.current.as_ref().map(|c| c.port))
    }

    fn strip_desired_state(&mut self) {
        self.desired = None;
        self.default_backend = None;
        self.rules.iter_mut().for_each(Rule::strip_desired_state);
    }

    fn forget_current(&mut self) {
        self.current = None;
        for rule in &mut self.rules {
            rule.current = None;
        }
        self.rules
            .retain(|r| r.current.is_some() || r.desired.is_some());
    }

    fn needs_modify(
        current: &ListenerDescription,
        desired: &ListenerSpec,
        default_arn: &str,
    ) -> bool {
        current.port != desired.port
            || current.protocol != desired.protocol
            || current.certificate_arn != desired.certificate_arn
            || current.default_target_group_arn.as_deref() != Some(default_arn)
    }

    async fn reconcile(
        &mut self,
        ctx: &ReconcileContext<'_>,
        load_balancer_arn: &str,
        target_groups: &TargetGroups,
    ) -> Vec<Error> {
        let Some(desired) = self.desired.clone() else {
            return Vec::new();
        };

        let default_arn = match self
            .default_backend
            .as_ref()
            .and_then(|b| target_groups.arn_for(b))
        {
            Some(arn) => arn.to_string(),
            None => {
                return vec![Error::ListenerError(format!(
                    "no target group available for the default backend of listener {}",
                    desired.port
                ))]
            }
        };

        let result = match self.current.as_ref() {
            None => Some(
                ctx.elbv2
                    .create_listener(load_balancer_arn, &desired, &default_arn)
                    .await
                    .map(|created| (created, reasons::CREATE)),
            ),
            Some(current) if Self::needs_modify(current, &desired, &default_arn) => Some(
                ctx.elbv2
                    .modify_listener(&current.arn, &desired, &default_arn)
                    .await
                    .map(|modified| (modified, reasons::MODIFY)),
            ),
            Some(_) => None,
        };

        match result {
            Some(Ok((description, reason))) => {
                info!(
                    port = desired.port,
                    arn = %description.arn,
                    reason,
                    "Reconciled listener"
                );
                ctx.events
                    .normal(
                        reason,
                        format!(
                            "{} listener on port {} {}",
                            desired.protocol,
                            desired.port,
                            past_tense(reason)
                        ),
                    )
                    .await;
                self.current = Some(description);
            }
            Some(Err(e)) => return vec![e],
            None => {}
        }
        self.reconcile_rules(ctx, target_groups).await
    }

    async fn reconcile_rules(
        &mut self,
        ctx: &ReconcileContext<'_>,
        target_groups: &TargetGroups,
    ) -> Vec<Error> {
        let Some(listener_arn) = self.current.as_ref().map(|c| c.arn.clone()) else {
            return Vec::new();
        };
        let mut errors = Vec::new();

        // Deletions first so freed priorities can be reused below
        for rule in &mut self.rules {
            let target_group_arn = rule.target_group_arn(target_groups);
            let Some(current) = &rule.current else {
                continue;
            };
            if rule.in_sync(target_group_arn) {
                continue;
            }
            match ctx.elbv2.delete_rule(&current.arn).await {
                Ok(()) => {
                    info!(priority = current.priority, "Deleted rule");
                    ctx.events
                        .normal(
                            reasons::DELETE,
                            format!(
                                "rule {} deleted from listener {listener_arn}",
                                current.priority
                            ),
                        )
                        .await;
                    rule.current = None;
                }
                Err(e) => errors.push(e),
            }
        }

        for rule in &mut self.rules {
            let (Some(desired), None) = (&rule.desired, &rule.current) else {
                continue;
            };
            let Some(target_group_arn) = rule.target_group_arn(target_groups) else {
                errors.push(Error::ListenerError(format!(
                    "no target group available for rule {}",
                    desired.priority
                )));
                continue;
            };
            match ctx
                .elbv2
                .create_rule(&listener_arn, desired, target_group_arn)
                .await
            {
                Ok(created) => {
                    info!(priority = created.priority, "Created rule");
                    ctx.events
                        .normal(
                            reasons::CREATE,
                            format!("rule {} created on listener {listener_arn}", created.priority),
                        )
                        .await;
                    rule.current = Some(created);
                }
                Err(e) => errors.push(e),
            }
        }

        self.rules
            .retain(|r| r.current.is_some() || r.desired.is_some());
        errors
    }

    async fn delete(&mut self, ctx: &ReconcileContext<'_>) -> Result<()> {
        let Some(current) = &self.current else {
            return Ok(());
        };
        ctx.elbv2.delete_listener(&current.arn).await?;
        info!(port = current.port, "Deleted listener");
        ctx.events
            .normal(
                reasons::DELETE,
                format!("{} listener on port {} deleted", current.protocol, current.port),
            )
            .await;
        self.forget_current();
        Ok(())
    }
}

fn past_tense(reason: &str) -> &'static str {
    match reason {
        reasons::CREATE => "created",
        reasons::MODIFY => "modified",
        _ => "deleted",
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Listeners(Vec<Listener>);

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge desired listeners for every listen port onto `existing`
    pub fn from_ingress(
        ingress: &Ingress,
        existing: Listeners,
        annotations: &Annotations,
    ) -> Result<Self> {
        let paths = ingress_paths(ingress)?;
        let default = default_backend(ingress)?
            .or_else(|| paths.first().map(|p| p.backend.clone()))
            .ok_or_else(|| {
                Error::ListenerError("the Ingress does not declare any backend".to_string())
            })?;

        let mut listeners = existing;
        for listen_port in &annotations.listen_ports {
            let certificate_arn = match listen_port.protocol {
                Protocol::Https => annotations.certificate_arn.clone(),
                Protocol::Http => None,
            };
            let spec = ListenerSpec {
                port: listen_port.port,
                protocol: listen_port.protocol,
                certificate_arn,
            };

            let index = match listeners
                .0
                .iter()
                .position(|l| l.desired.is_none() && l.port() == Some(listen_port.port))
            {
                Some(index) => index,
                None => {
                    listeners.0.push(Listener {
                        current: None,
                        desired: None,
                        default_backend: None,
                        rules: Vec::new(),
                    });
                    listeners.0.len() - 1
                }
            };
            let listener = &mut listeners.0[index];
            listener.desired = Some(spec);
            listener.default_backend = Some(default.clone());

            for (i, path) in paths.iter().enumerate() {
                let priority = i as i32 + 1;
                let desired = RuleSpec {
                    priority,
                    host: path.host.clone(),
                    path: path.path.clone(),
                };
                match listener
                    .rules
                    .iter_mut()
                    .find(|r| r.desired.is_none() && r.priority() == Some(priority))
                {
                    Some(rule) => {
                        rule.desired = Some(desired);
                        rule.backend = Some(path.backend.clone());
                    }
                    None => listener.rules.push(Rule {
                        current: None,
                        desired: Some(desired),
                        backend: Some(path.backend.clone()),
                    }),
                }
            }
            listener
                .rules
                .retain(|r| r.current.is_some() || r.desired.is_some());
        }

        listeners
            .0
            .retain(|l| l.current.is_some() || l.desired.is_some());
        Ok(listeners)
    }

    /// Rebuild the listeners and rules of a live load balancer
    pub async fn from_aws(elbv2: &dyn Elbv2, load_balancer_arn: &str) -> Result<Self> {
        let mut listeners = Vec::new();
        for description in elbv2
            .describe_listeners_for_load_balancer(load_balancer_arn)
            .await?
        {
            let mut rules: Vec<Rule> = elbv2
                .describe_rules(&description.arn)
                .await?
                .into_iter()
                .filter(|r| !r.is_default)
                .map(|r| Rule {
                    current: Some(r),
                    desired: None,
                    backend: None,
                })
                .collect();
            rules.sort_by_key(|r| r.priority());

            listeners.push(Listener {
                current: Some(description),
                desired: None,
                default_backend: None,
                rules,
            });
        }
        listeners.sort_by_key(|l| l.port());
        Ok(Self(listeners))
    }

    pub fn strip_desired_state(&mut self) {
        self.0.iter_mut().for_each(Listener::strip_desired_state);
    }

    /// Drop all observed state. Used when the load balancer was deleted,
    /// which takes its listeners and rules with it.
    pub fn forget_current(&mut self) {
        self.0.iter_mut().for_each(Listener::forget_current);
        self.0.retain(|l| l.desired.is_some());
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Listener> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub async fn reconcile(
        &mut self,
        ctx: &ReconcileContext<'_>,
        load_balancer_arn: &str,
        target_groups: &TargetGroups,
    ) -> Vec<Error> {
        let mut errors = Vec::new();

        for listener in self.0.iter_mut().filter(|l| l.desired.is_none()) {
            if let Err(e) = listener.delete(ctx).await {
                errors.push(e);
            }
        }
        for listener in self.0.iter_mut().filter(|l| l.desired.is_some()) {
            errors.extend(
                listener
                    .reconcile(ctx, load_balancer_arn, target_groups)
                    .await,
            );
        }

        self.0
            .retain(|l| l.current.is_some() || l.desired.is_some());
        errors
    }
}

impl<'a> IntoIterator for &'a Listeners {
    type Item = &'a Listener;
    type IntoIter = std::slice::Iter<'a, Listener>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::alb::test_support::{backend, ingress};
    use crate::annotations::{CERTIFICATE_ARN, LISTEN_PORTS, SUBNETS};

    fn annotations(extra: &[(&str, &str)]) -> Annotations {
        let mut raw = BTreeMap::new();
        raw.insert(SUBNETS.to_string(), "subnet-a,subnet-b".to_string());
        for (k, v) in extra {
            raw.insert(k.to_string(), v.to_string());
        }
        Annotations::parse(&raw).unwrap()
    }

    #[test]
    fn test_one_listener_per_port_with_prioritised_rules() {
        let ing = ingress("shop.example.com", &[("/cart", "cart"), ("/pay", "pay")]);
        let annotations = annotations(&[
            (LISTEN_PORTS, r#"[{"HTTP": 80}, {"HTTPS": 443}]"#),
            (CERTIFICATE_ARN, "arn:cert"),
        ]);

        let listeners = Listeners::from_ingress(&ing, Listeners::new(), &annotations).unwrap();
        assert_eq!(listeners.len(), 2);

        let https = listeners.iter().nth(1).unwrap();
        assert_eq!(
            https.desired().unwrap().certificate_arn.as_deref(),
            Some("arn:cert")
        );
        assert_eq!(https.default_backend().unwrap().service_name, "cart");
        let priorities: Vec<i32> = https
            .rules()
            .iter()
            .map(|r| r.desired().unwrap().priority)
            .collect();
        assert_eq!(priorities, vec![1, 2]);

        let http = listeners.iter().next().unwrap();
        assert_eq!(http.desired().unwrap().certificate_arn, None);
    }

    #[test]
    fn test_spec_default_backend_wins() {
        let mut ing = ingress("shop.example.com", &[("/cart", "cart")]);
        if let Some(spec) = ing.spec.as_mut() {
            spec.default_backend = Some(backend("web", 80));
        }
        let listeners =
            Listeners::from_ingress(&ing, Listeners::new(), &annotations(&[])).unwrap();
        let listener = listeners.iter().next().unwrap();
        assert_eq!(listener.default_backend().unwrap().service_name, "web");
    }

    #[test]
    fn test_ingress_without_backends_fails() {
        let ing = ingress("shop.example.com", &[]);
        let err = Listeners::from_ingress(&ing, Listeners::new(), &annotations(&[])).unwrap_err();
        assert!(matches!(err, Error::ListenerError(_)));
    }

    #[test]
    fn test_rebuild_drops_stale_rules() {
        let two = ingress("shop.example.com", &[("/cart", "cart"), ("/pay", "pay")]);
        let one = ingress("shop.example.com", &[("/cart", "cart")]);

        let mut listeners =
            Listeners::from_ingress(&two, Listeners::new(), &annotations(&[])).unwrap();
        listeners.strip_desired_state();
        let listeners = Listeners::from_ingress(&one, listeners, &annotations(&[])).unwrap();

        let listener = listeners.iter().next().unwrap();
        assert_eq!(listener.rules().len(), 1);
    }
}
