//! Kubernetes Event recording
//!
//! Aggregates report failures and cloud mutations as Events on the Ingress
//! they were built from. Events are fire-and-forget: a failed publish is
//! logged and never interrupts assembly or reconciliation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Reporting component shown on published Events
pub const REPORTER: &str = "alb-ingress-controller";

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    pub const ERROR: &str = "ERROR";
    pub const CREATE: &str = "CREATE";
    pub const MODIFY: &str = "MODIFY";
    pub const DELETE: &str = "DELETE";
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: String,
    );
}

/// Publishes Events through the Kubernetes API
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        Self::with_reporter(client, REPORTER)
    }

    pub fn with_reporter(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: None,
            },
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn record(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: String,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(
                reason,
                object = ?object.name,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub type_: EventType,
    pub reason: String,
    pub message: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// Keeps every event in memory. Used by the `render` command and in tests.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn warnings(&self) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.type_ == EventType::Warning)
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn record(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        message: String,
    ) {
        let event = RecordedEvent {
            type_,
            reason: reason.to_string(),
            message,
            namespace: object.namespace.clone(),
            name: object.name.clone(),
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Event handle bound to one Ingress.
///
/// Emitting is a no-op unless both a sink and an object reference are present.
#[derive(Clone, Default)]
pub struct IngressEvents {
    sink: Option<Arc<dyn EventSink>>,
    object: Option<ObjectReference>,
}

impl IngressEvents {
    pub fn new(sink: Option<Arc<dyn EventSink>>, object: Option<ObjectReference>) -> Self {
        Self { sink, object }
    }

    pub fn is_bound(&self) -> bool {
        self.sink.is_some() && self.object.is_some()
    }

    pub async fn emit(&self, type_: EventType, reason: &str, message: impl Into<String>) {
        if let (Some(sink), Some(object)) = (&self.sink, &self.object) {
            sink.record(object, type_, reason, message.into()).await;
        }
    }

    pub async fn normal(&self, reason: &str, message: impl Into<String>) {
        self.emit(EventType::Normal, reason, message).await;
    }

    pub async fn warning(&self, reason: &str, message: impl Into<String>) {
        self.emit(EventType::Warning, reason, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> ObjectReference {
        ObjectReference {
            kind: Some("Ingress".to_string()),
            namespace: Some("payments".to_string()),
            name: Some("checkout".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_bound_handle_records() {
        let sink = Arc::new(MemoryEventSink::new());
        let events = IngressEvents::new(Some(sink.clone()), Some(object()));

        events.warning(reasons::ERROR, "bad annotations").await;
        events.normal(reasons::CREATE, "created listener").await;

        let recorded = sink.events();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].type_, EventType::Warning);
        assert_eq!(recorded[0].reason, "ERROR");
        assert_eq!(recorded[0].name.as_deref(), Some("checkout"));
        assert_eq!(sink.warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_unbound_handle_is_silent() {
        let sink = Arc::new(MemoryEventSink::new());

        IngressEvents::new(Some(sink.clone()), None)
            .warning(reasons::ERROR, "dropped")
            .await;
        IngressEvents::new(None, Some(object()))
            .warning(reasons::ERROR, "dropped")
            .await;
        IngressEvents::default()
            .warning(reasons::ERROR, "dropped")
            .await;

        assert!(sink.events().is_empty());
    }

    mod kube_sink {
        use super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        const EVENTS_PATH: &str = "/apis/events.k8s.io/v1/namespaces/payments/events";

        fn sink(server: &MockServer) -> KubeEventSink {
            let config = kube::Config::new(server.uri().parse().unwrap());
            KubeEventSink::new(Client::try_from(config).unwrap())
        }

        #[tokio::test]
        async fn test_event_is_posted_against_the_object() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path(EVENTS_PATH))
                .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                    "apiVersion": "events.k8s.io/v1",
                    "kind": "Event",
                    "metadata": { "name": "alb-ingress-controller-x", "namespace": "payments" }
                })))
                .expect(1)
                .mount(&server)
                .await;

            sink(&server)
                .record(
                    &object(),
                    EventType::Warning,
                    reasons::ERROR,
                    "Error parsing annotations".to_string(),
                )
                .await;

            let requests = server.received_requests().await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
            assert_eq!(body["type"], "Warning");
            assert_eq!(body["reason"], "ERROR");
            assert_eq!(body["note"], "Error parsing annotations");
            assert_eq!(body["regarding"]["name"], "checkout");
            assert_eq!(body["reportingController"], REPORTER);
        }

        #[tokio::test]
        async fn test_publish_failure_is_swallowed() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(500))
                .expect(1)
                .mount(&server)
                .await;

            sink(&server)
                .record(
                    &object(),
                    EventType::Normal,
                    reasons::CREATE,
                    "listener created".to_string(),
                )
                .await;
        }
    }
}
