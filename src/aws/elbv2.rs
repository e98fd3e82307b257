//! Elastic Load Balancing (v2) model and client contract
//!
//! The controller only talks to the cloud through [`Elbv2`]. Descriptions
//! (`*Description`) mirror what the API reports for live resources; specs
//! (`*Spec`) carry what the controller asks for.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::tags::Tags;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "HTTP"),
            Protocol::Https => write!(f, "HTTPS"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            other => Err(Error::AnnotationError(format!(
                "invalid protocol {other}, must be HTTP or HTTPS"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scheme {
    #[default]
    Internal,
    InternetFacing,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Internal => write!(f, "internal"),
            Scheme::InternetFacing => write!(f, "internet-facing"),
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "internal" => Ok(Scheme::Internal),
            "internet-facing" => Ok(Scheme::InternetFacing),
            other => Err(Error::AnnotationError(format!(
                "invalid scheme {other}, must be internal or internet-facing"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAddressType {
    #[default]
    Ipv4,
    Dualstack,
}

impl fmt::Display for IpAddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddressType::Ipv4 => write!(f, "ipv4"),
            IpAddressType::Dualstack => write!(f, "dualstack"),
        }
    }
}

impl FromStr for IpAddressType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ipv4" => Ok(IpAddressType::Ipv4),
            "dualstack" => Ok(IpAddressType::Dualstack),
            other => Err(Error::AnnotationError(format!(
                "invalid ip address type {other}, must be ipv4 or dualstack"
            ))),
        }
    }
}

// ============================================================================
// Load balancers
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    pub name: String,
    pub scheme: Scheme,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub ip_address_type: IpAddressType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerDescription {
    pub arn: String,
    pub name: String,
    pub dns_name: Option<String>,
    pub scheme: Scheme,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub ip_address_type: IpAddressType,
}

// ============================================================================
// Target groups
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub path: String,
    pub interval_seconds: i32,
    pub success_codes: String,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            interval_seconds: 15,
            success_codes: "200".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetGroupSpec {
    pub name: String,
    pub port: i32,
    pub protocol: Protocol,
    pub health_check: HealthCheck,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetGroupDescription {
    pub arn: String,
    pub name: String,
    pub port: i32,
    pub protocol: Protocol,
    pub health_check: HealthCheck,
    pub load_balancer_arns: Vec<String>,
}

/// A registered instance and the port traffic is sent to
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub port: i32,
}

// ============================================================================
// Listeners and rules
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    pub port: i32,
    pub protocol: Protocol,
    pub certificate_arn: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerDescription {
    pub arn: String,
    pub load_balancer_arn: String,
    pub port: i32,
    pub protocol: Protocol,
    pub certificate_arn: Option<String>,
    pub default_target_group_arn: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    pub priority: i32,
    pub host: Option<String>,
    pub path: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDescription {
    pub arn: String,
    pub listener_arn: String,
    pub priority: i32,
    pub host: Option<String>,
    pub path: Option<String>,
    pub target_group_arn: String,
    pub is_default: bool,
}

// ============================================================================
// Client contract
// ============================================================================

/// Elastic Load Balancing v2 operations used by the controller.
///
/// Deleting a load balancer deletes its listeners and rules. Target groups
/// outlive it and must be deleted separately once no listener references them.
#[async_trait]
pub trait Elbv2: Send + Sync {
    async fn describe_load_balancers(&self) -> Result<Vec<LoadBalancerDescription>>;

    async fn describe_tags(&self, arn: &str) -> Result<Tags>;

    async fn add_tags(&self, arn: &str, tags: &Tags) -> Result<()>;

    async fn remove_tags(&self, arn: &str, keys: &[String]) -> Result<()>;

    async fn create_load_balancer(
        &self,
        spec: &LoadBalancerSpec,
        tags: &Tags,
    ) -> Result<LoadBalancerDescription>;

    async fn modify_load_balancer(
        &self,
        arn: &str,
        spec: &LoadBalancerSpec,
    ) -> Result<LoadBalancerDescription>;

    async fn delete_load_balancer(&self, arn: &str) -> Result<()>;

    async fn describe_target_groups_for_load_balancer(
        &self,
        load_balancer_arn: &str,
    ) -> Result<Vec<TargetGroupDescription>>;

    async fn create_target_group(
        &self,
        spec: &TargetGroupSpec,
        tags: &Tags,
    ) -> Result<TargetGroupDescription>;

    async fn modify_target_group(
        &self,
        arn: &str,
        spec: &TargetGroupSpec,
    ) -> Result<TargetGroupDescription>;

    async fn delete_target_group(&self, arn: &str) -> Result<()>;

    async fn describe_targets(&self, target_group_arn: &str) -> Result<Vec<Target>>;

    async fn register_targets(&self, target_group_arn: &str, targets: &[Target]) -> Result<()>;

    async fn deregister_targets(&self, target_group_arn: &str, targets: &[Target])
        -> Result<()>;

    async fn describe_listeners_for_load_balancer(
        &self,
        load_balancer_arn: &str,
    ) -> Result<Vec<ListenerDescription>>;

    async fn create_listener(
        &self,
        load_balancer_arn: &str,
        spec: &ListenerSpec,
        default_target_group_arn: &str,
    ) -> Result<ListenerDescription>;

    async fn modify_listener(
        &self,
        arn: &str,
        spec: &ListenerSpec,
        default_target_group_arn: &str,
    ) -> Result<ListenerDescription>;

    async fn delete_listener(&self, arn: &str) -> Result<()>;

    async fn describe_rules(&self, listener_arn: &str) -> Result<Vec<RuleDescription>>;

    async fn create_rule(
        &self,
        listener_arn: &str,
        spec: &RuleSpec,
        target_group_arn: &str,
    ) -> Result<RuleDescription>;

    async fn delete_rule(&self, arn: &str) -> Result<()>;
}
