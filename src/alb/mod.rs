//! Resource tree of one Application Load Balancer
//!
//! A [`LoadBalancer`] owns its [`TargetGroups`] and [`Listeners`]. Every node
//! keeps the state last observed in the cloud (`current`) apart from the state
//! computed from the Ingress (`desired`); reconcile pushes the difference.

pub mod listeners;
pub mod loadbalancer;
pub mod targetgroups;

use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::aws::{Elbv2, Tags};
use crate::cluster::ServicePortRef;
use crate::error::{Error, Result};
use crate::events::IngressEvents;

pub use listeners::{Listener, Listeners, Rule};
pub use loadbalancer::{LoadBalancer, NewLoadBalancerOptions};
pub use targetgroups::{TargetGroup, TargetGroups};

/// Longest name ELBv2 accepts for load balancers and target groups
pub const MAX_NAME_LENGTH: usize = 32;
const MAX_PREFIX_LENGTH: usize = 11;
const HASH_LENGTH: usize = 20;

/// Everything a tree node needs while reconciling
pub struct ReconcileContext<'a> {
    pub elbv2: &'a dyn Elbv2,
    pub events: &'a IngressEvents,
}

/// A Kubernetes service and port an Ingress routes to
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendService {
    pub service_name: String,
    pub service_port: ServicePortRef,
}

impl std::fmt::Display for BackendService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.service_name, self.service_port)
    }
}

/// One host/path routing entry of an Ingress
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressPath {
    pub host: Option<String>,
    pub path: Option<String>,
    pub backend: BackendService,
}

fn service_backend(backend: &IngressBackend) -> Result<BackendService> {
    let service = backend.service.as_ref().ok_or_else(|| {
        Error::TargetGroupError("only service backends are supported".to_string())
    })?;
    let port = service.port.as_ref();
    let service_port = match (
        port.and_then(|p| p.number),
        port.and_then(|p| p.name.as_ref()),
    ) {
        (Some(number), _) => ServicePortRef::Number(number),
        (None, Some(name)) => ServicePortRef::Name(name.clone()),
        (None, None) => {
            return Err(Error::TargetGroupError(format!(
                "backend service {} has no port",
                service.name
            )))
        }
    };
    Ok(BackendService {
        service_name: service.name.clone(),
        service_port,
    })
}

/// Default backend declared in the Ingress spec
pub fn default_backend(ingress: &Ingress) -> Result<Option<BackendService>> {
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.default_backend.as_ref())
        .map(service_backend)
        .transpose()
}

/// Host/path entries across every rule, in declaration order
pub fn ingress_paths(ingress: &Ingress) -> Result<Vec<IngressPath>> {
    let rules = ingress.spec.as_ref().and_then(|s| s.rules.as_ref());

    let mut paths = Vec::new();
    for rule in rules.into_iter().flatten() {
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        for path in &http.paths {
            paths.push(IngressPath {
                host: rule.host.clone(),
                path: path.path.clone(),
                backend: service_backend(&path.backend)?,
            });
        }
    }
    Ok(paths)
}

/// Distinct backends of an Ingress, default backend first
pub fn backends(ingress: &Ingress) -> Result<Vec<BackendService>> {
    let mut backends: Vec<BackendService> = default_backend(ingress)?.into_iter().collect();
    for path in ingress_paths(ingress)? {
        if !backends.contains(&path.backend) {
            backends.push(path.backend);
        }
    }
    Ok(backends)
}

/// Cluster name reduced to the characters ELBv2 accepts in names
pub fn name_prefix(cluster_name: &str) -> String {
    let sanitized: String = cluster_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(MAX_PREFIX_LENGTH)
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "alb".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Deterministic `{prefix}-{hash}` name over `parts`
pub fn resource_name(cluster_name: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", name_prefix(cluster_name), &digest[..HASH_LENGTH])
}

/// Bring the tags on `arn` from `current` to `desired`
pub(crate) async fn sync_tags(
    ctx: &ReconcileContext<'_>,
    arn: &str,
    current: &mut Tags,
    desired: &Tags,
) -> Result<bool> {
    let changed = desired.changed_from(current);
    let removed = desired.keys_removed_from(current);
    if changed.is_empty() && removed.is_empty() {
        return Ok(false);
    }

    if !changed.is_empty() {
        ctx.elbv2.add_tags(arn, &changed).await?;
    }
    if !removed.is_empty() {
        ctx.elbv2.remove_tags(arn, &removed).await?;
    }
    *current = desired.clone();
    Ok(true)
}

/// Order-insensitive comparison of id lists
pub(crate) fn same_members(a: &[String], b: &[String]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

#[cfg(test)]
pub(crate) mod test_support {
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, ServiceBackendPort,
    };
    use kube::api::ObjectMeta;

    pub fn backend(service: &str, port: i32) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    name: None,
                }),
            }),
            resource: None,
        }
    }

    /// Ingress routing `host` paths to `(path, service)` pairs on port 80
    pub fn ingress(host: &str, paths: &[(&str, &str)]) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("checkout".to_string()),
                namespace: Some("payments".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: paths
                            .iter()
                            .map(|(path, service)| HTTPIngressPath {
                                path: Some(path.to_string()),
                                path_type: "Prefix".to_string(),
                                backend: backend(service, 80),
                            })
                            .collect(),
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
