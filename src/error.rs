//! Error types for the ALB ingress reconciliation core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML manifest could not be decoded
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid operator configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Ingress annotations could not be parsed or failed validation
    #[error("{0}")]
    AnnotationError(String),

    /// A call against the Elastic Load Balancing API failed
    #[error("{operation} failed: {message}")]
    CloudError { operation: String, message: String },

    /// A backend service or its node port could not be resolved
    #[error("Service lookup failed: {0}")]
    ServiceLookupError(String),

    #[error("Target group error: {0}")]
    TargetGroupError(String),

    #[error("Listener error: {0}")]
    ListenerError(String),

    /// A live load balancer lacks one of the ownership tags
    #[error("The LoadBalancer {load_balancer} does not have a {tag} tag, can't import")]
    MissingTag { tag: String, load_balancer: String },

    /// The load balancer exists but has not been assigned a hostname yet
    #[error("No ALB hostnames for ingress {0}")]
    NotReady(String),

    #[error("Telemetry error: {0}")]
    TelemetryError(String),
}

impl Error {
    /// Create a cloud error for the named ELBv2 operation
    pub fn cloud(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::CloudError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether retrying on the next tick can succeed without a spec change
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::CloudError { .. }
                | Error::ServiceLookupError(_)
                | Error::NotReady(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tag_message_names_tag_and_load_balancer() {
        let err = Error::MissingTag {
            tag: "IngressName".to_string(),
            load_balancer: "prod-0a1b2c".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "The LoadBalancer prod-0a1b2c does not have a IngressName tag, can't import"
        );
    }

    #[test]
    fn test_retriable_classification() {
        assert!(Error::cloud("CreateLoadBalancer", "throttled").is_retriable());
        assert!(Error::NotReady("default/web".to_string()).is_retriable());
        assert!(!Error::AnnotationError("bad scheme".to_string()).is_retriable());
        assert!(!Error::ListenerError("no backends".to_string()).is_retriable());
    }
}
