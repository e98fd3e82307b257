//! Controller helpers around the Ingress aggregate
//!
//! The watch loop that decides when to call these is left to the embedding
//! binary. These helpers keep the aggregate cache keyed by id, rebuild it from
//! the cloud on start, and publish load balancer hostnames back to Kubernetes.

mod cache;
mod status;
mod sync;

pub use cache::IngressCache;
pub use status::publish_status;
pub use sync::{import_from_aws, reconcile_all, retire_ingress, sync_ingress, SyncContext};
