//! Cluster-side lookups used while building target groups
//!
//! Target groups register every eligible node on the node port of the backend
//! service. Both lookups are injected so assembly can run against reflector
//! stores in the controller or against fixed values from the CLI.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Service};
use kube::runtime::reflector::{ObjectRef, Store};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Service port as referenced by an Ingress backend
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServicePortRef {
    Number(i32),
    Name(String),
}

impl fmt::Display for ServicePortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServicePortRef::Number(n) => write!(f, "{n}"),
            ServicePortRef::Name(name) => write!(f, "{name}"),
        }
    }
}

impl ServicePortRef {
    /// Parses the `ServicePort` tag value written by [`fmt::Display`]
    pub fn parse(value: &str) -> Self {
        match value.parse::<i32>() {
            Ok(n) => ServicePortRef::Number(n),
            Err(_) => ServicePortRef::Name(value.to_string()),
        }
    }
}

type NodePortFn = dyn Fn(&str, &str, &ServicePortRef) -> Result<i32> + Send + Sync;
type NodesFn = dyn Fn() -> Vec<String> + Send + Sync;

/// Node-port resolution and node listing
#[derive(Clone)]
pub struct ClusterLookups {
    node_port: Arc<NodePortFn>,
    nodes: Arc<NodesFn>,
}

impl fmt::Debug for ClusterLookups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterLookups").finish_non_exhaustive()
    }
}

impl ClusterLookups {
    pub fn new<P, N>(node_port: P, nodes: N) -> Self
    where
        P: Fn(&str, &str, &ServicePortRef) -> Result<i32> + Send + Sync + 'static,
        N: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            node_port: Arc::new(node_port),
            nodes: Arc::new(nodes),
        }
    }

    /// Lookups backed by reflector caches
    pub fn from_stores(services: Store<Service>, nodes: Store<Node>) -> Self {
        Self::new(
            move |namespace, name, port| {
                let service = services
                    .get(&ObjectRef::new(name).within(namespace))
                    .ok_or_else(|| {
                        Error::ServiceLookupError(format!("Service {namespace}/{name} not found"))
                    })?;
                node_port_for(&service, port)
            },
            move || eligible_instances(nodes.state().iter().map(|n| n.as_ref())),
        )
    }

    /// Lookups over fixed values, keyed by `(namespace, service, port)`
    pub fn fixed(node_ports: BTreeMap<(String, String, String), i32>, nodes: Vec<String>) -> Self {
        Self::new(
            move |namespace, name, port| {
                let key = (namespace.to_string(), name.to_string(), port.to_string());
                node_ports.get(&key).copied().ok_or_else(|| {
                    Error::ServiceLookupError(format!(
                        "No node port known for {namespace}/{name}:{port}"
                    ))
                })
            },
            move || nodes.clone(),
        )
    }

    pub fn node_port(&self, namespace: &str, service: &str, port: &ServicePortRef) -> Result<i32> {
        (self.node_port)(namespace, service, port)
    }

    pub fn nodes(&self) -> Vec<String> {
        (self.nodes)()
    }
}

/// Node port exposed for `port` on a NodePort or LoadBalancer service
pub fn node_port_for(service: &Service, port: &ServicePortRef) -> Result<i32> {
    let name = service.metadata.name.as_deref().unwrap_or_default();
    let spec = service
        .spec
        .as_ref()
        .ok_or_else(|| Error::ServiceLookupError(format!("Service {name} has no spec")))?;

    let service_type = spec.type_.as_deref().unwrap_or("ClusterIP");
    if service_type != "NodePort" && service_type != "LoadBalancer" {
        return Err(Error::ServiceLookupError(format!(
            "Service {name} is of type {service_type}, must be NodePort or LoadBalancer"
        )));
    }

    let matched = spec.ports.iter().flatten().find(|p| match port {
        ServicePortRef::Number(n) => p.port == *n,
        ServicePortRef::Name(wanted) => p.name.as_deref() == Some(wanted.as_str()),
    });

    matched
        .and_then(|p| p.node_port)
        .ok_or_else(|| {
            Error::ServiceLookupError(format!("Service {name} has no node port for port {port}"))
        })
}

/// EC2 instance id from a provider id such as `aws:///us-east-1a/i-0abc`
pub fn instance_id(node: &Node) -> Option<String> {
    node.spec
        .as_ref()?
        .provider_id
        .as_deref()?
        .rsplit('/')
        .next()
        .filter(|id| id.starts_with("i-"))
        .map(str::to_string)
}

fn is_eligible(node: &Node) -> bool {
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    let control_plane = node
        .metadata
        .labels
        .as_ref()
        .is_some_and(|labels| CONTROL_PLANE_LABELS.iter().any(|l| labels.contains_key(*l)));
    !unschedulable && !control_plane
}

/// Sorted instance ids of the nodes that should receive traffic
pub fn eligible_instances<'a>(nodes: impl Iterator<Item = &'a Node>) -> Vec<String> {
    let mut ids: Vec<String> = nodes
        .filter(|n| is_eligible(n))
        .filter_map(instance_id)
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
