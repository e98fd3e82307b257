//! ALB ingress: reconciliation core of an AWS Application Load Balancer
//! ingress controller.
//!
//! Each Kubernetes Ingress maps to one [`ingress::AlbIngress`] aggregate that
//! owns the load balancer tree serving it. Aggregates are assembled from the
//! Ingress or rebuilt from live cloud resources, then reconciled against the
//! Elastic Load Balancing API.

pub mod alb;
pub mod annotations;
pub mod aws;
pub mod cluster;
pub mod controller;
pub mod error;
pub mod events;
pub mod ingress;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod telemetry;

pub use crate::error::{Error, Result};
