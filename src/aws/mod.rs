//! AWS-side model: tags, the ELBv2 client contract and an in-memory backend

pub mod elbv2;
pub mod memory;
pub mod tags;

pub use elbv2::{
    Elbv2, HealthCheck, IpAddressType, ListenerDescription, ListenerSpec,
    LoadBalancerDescription, LoadBalancerSpec, Protocol, RuleDescription, RuleSpec, Scheme,
    Target, TargetGroupDescription, TargetGroupSpec,
};
pub use memory::InMemoryElbv2;
pub use tags::{Tag, Tags};
