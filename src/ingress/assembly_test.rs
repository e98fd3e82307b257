//! Unit tests for Ingress aggregate assembly, import and reconcile dispatch.
//!
//! Run with: `cargo test assembly_test`

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::networking::v1::Ingress;
    use kube::runtime::events::EventType;

    use crate::alb::test_support;
    use crate::annotations::{AnnotationResolver, SUBNETS, TAGS};
    use crate::aws::tags::{cluster_tag, CLUSTER_TAG_OWNED, INGRESS_NAME_TAG, NAMESPACE_TAG};
    use crate::aws::{
        Elbv2, InMemoryElbv2, IpAddressType, LoadBalancerSpec, Scheme, Tags,
    };
    use crate::cluster::ClusterLookups;
    use crate::error::Error;
    use crate::events::{EventSink, MemoryEventSink};
    use crate::ingress::{
        id, AlbIngress, Assembly, FromAwsOptions, FromIngressOptions, NewAlbIngressOptions,
        ReconcileOptions,
    };

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    const CLUSTER: &str = "prod";

    fn ingress(annotations: &[(&str, &str)], paths: &[(&str, &str)]) -> Ingress {
        let mut ing = test_support::ingress("shop.example.com", paths);
        ing.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        ing
    }

    fn valid_ingress() -> Ingress {
        ingress(
            &[(SUBNETS, "subnet-a,subnet-b"), (TAGS, "Team=payments")],
            &[("/cart", "cart"), ("/pay", "pay")],
        )
    }

    fn broken_ingress() -> Ingress {
        ingress(&[(SUBNETS, "subnet-a")], &[("/cart", "cart")])
    }

    fn lookups() -> ClusterLookups {
        ClusterLookups::new(
            |_, service, _| match service {
                "cart" => Ok(30001),
                "pay" => Ok(30002),
                other => Err(Error::ServiceLookupError(format!("{other} not found"))),
            },
            || vec!["i-1".to_string(), "i-2".to_string()],
        )
    }

    struct Fixture {
        resolver: AnnotationResolver,
        lookups: ClusterLookups,
        sink: Arc<MemoryEventSink>,
        elbv2: InMemoryElbv2,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                resolver: AnnotationResolver::default(),
                lookups: lookups(),
                sink: Arc::new(MemoryEventSink::new()),
                elbv2: InMemoryElbv2::new(),
            }
        }

        fn sink(&self) -> Option<Arc<dyn EventSink>> {
            Some(self.sink.clone())
        }

        async fn assemble(&self, ing: &Ingress, existing: Option<Arc<AlbIngress>>) -> Assembly {
            AlbIngress::from_ingress(FromIngressOptions {
                ingress: ing,
                existing,
                cluster_name: CLUSTER,
                resolver: &self.resolver,
                lookups: &self.lookups,
                events: self.sink(),
            })
            .await
        }

        async fn reconcile(&self, aggregate: &AlbIngress) {
            aggregate
                .reconcile(&ReconcileOptions {
                    elbv2: &self.elbv2,
                })
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    #[test]
    fn test_id_format() {
        assert_eq!(id("payments", "checkout"), "payments/checkout");
        assert_eq!(id("payments", "checkout"), id("payments", "checkout"));
        assert_ne!(id("payments", "checkout"), id("payment", "scheckout"));
        assert_ne!(id("a", "b"), id("b", "a"));
    }

    #[tokio::test]
    async fn test_new_aggregate_holds_identity_only() {
        let aggregate = AlbIngress::new(NewAlbIngressOptions {
            namespace: "payments".to_string(),
            name: "checkout".to_string(),
            cluster_name: CLUSTER.to_string(),
            events: None,
        });

        assert_eq!(aggregate.id(), "payments/checkout");
        assert_eq!(aggregate.name(), "payments-checkout");
        assert!(!aggregate.is_valid().await);
        assert!(aggregate.load_balancer().await.is_none());
        assert!(aggregate.object_ref().is_none());
    }

    // -----------------------------------------------------------------------
    // Spec-driven assembly
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_valid_ingress_assembles() {
        let fx = Fixture::new();
        let assembly = fx.assemble(&valid_ingress(), None).await;

        assert!(assembly.valid);
        let aggregate = assembly.ingress;
        assert_eq!(aggregate.id(), "payments/checkout");
        assert!(aggregate.is_valid().await);

        let tree = aggregate.load_balancer().await.unwrap();
        assert_eq!(tree.target_groups.len(), 2);
        assert_eq!(tree.listeners.len(), 1);

        let tags = aggregate.tags().await;
        assert_eq!(tags.get(NAMESPACE_TAG), Some("payments"));
        assert_eq!(tags.get(INGRESS_NAME_TAG), Some("checkout"));
        assert_eq!(tags.get("Team"), Some("payments"));
        assert!(fx.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_annotations_without_existing_tree() {
        let fx = Fixture::new();
        let assembly = fx.assemble(&broken_ingress(), None).await;

        assert!(!assembly.valid);
        assert_eq!(assembly.ingress.id(), "payments/checkout");
        assert!(assembly.ingress.load_balancer().await.is_none());
        assert!(assembly.ingress.annotations().await.is_none());

        let warnings = fx.sink.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.starts_with("Error parsing annotations"));
        assert_eq!(warnings[0].name.as_deref(), Some("checkout"));
    }

    #[tokio::test]
    async fn test_assembly_is_idempotent() {
        let fx = Fixture::new();
        let first = fx.assemble(&valid_ingress(), None).await;
        let before = first.ingress.load_balancer().await;

        let second = fx
            .assemble(&valid_ingress(), Some(first.ingress.clone()))
            .await;

        assert!(second.valid);
        assert!(Arc::ptr_eq(&first.ingress, &second.ingress));
        assert_eq!(second.ingress.id(), first.ingress.id());
        assert_eq!(second.ingress.load_balancer().await, before);
    }

    #[tokio::test]
    async fn test_failed_assembly_keeps_previous_tree() {
        let fx = Fixture::new();
        let aggregate = fx.assemble(&valid_ingress(), None).await.ingress;
        fx.reconcile(&aggregate).await;
        let before = aggregate.load_balancer().await;
        assert!(before.as_ref().and_then(|lb| lb.arn()).is_some());

        let failed = fx
            .assemble(&broken_ingress(), Some(aggregate.clone()))
            .await;
        assert!(!failed.valid);
        assert!(!aggregate.is_valid().await);
        assert_eq!(aggregate.load_balancer().await, before);

        // The same broken set again is reported without re-validation
        let again = fx
            .assemble(&broken_ingress(), Some(aggregate.clone()))
            .await;
        assert!(!again.valid);
        assert_eq!(aggregate.load_balancer().await, before);
        assert_eq!(fx.sink.warnings().len(), 2);

        // Invalid aggregates are not reconciled
        fx.elbv2.clear_operations();
        fx.reconcile(&aggregate).await;
        assert!(fx.elbv2.operations().is_empty());
    }

    #[tokio::test]
    async fn test_target_group_failure_keeps_previous_tree() {
        let fx = Fixture::new();
        let aggregate = fx.assemble(&valid_ingress(), None).await.ingress;
        let before = aggregate.load_balancer().await;

        let unknown_service = ingress(&[(SUBNETS, "subnet-a,subnet-b")], &[("/", "missing")]);
        let failed = fx
            .assemble(&unknown_service, Some(aggregate.clone()))
            .await;

        assert!(!failed.valid);
        assert_eq!(aggregate.load_balancer().await, before);
        let warnings = fx.sink.warnings();
        assert!(warnings[0]
            .message
            .starts_with("Error instantiating target groups"));
    }

    #[tokio::test]
    async fn test_listener_failure_invalidates() {
        let fx = Fixture::new();
        let no_backends = ingress(&[(SUBNETS, "subnet-a,subnet-b")], &[]);
        let assembly = fx.assemble(&no_backends, None).await;

        assert!(!assembly.valid);
        assert!(assembly.ingress.load_balancer().await.is_none());
        assert!(fx.sink.warnings()[0]
            .message
            .starts_with("Error instantiating listeners"));
    }

    #[tokio::test]
    async fn test_rebuild_leaves_no_stale_desired_state() {
        let fx = Fixture::new();
        let aggregate = fx.assemble(&valid_ingress(), None).await.ingress;
        fx.reconcile(&aggregate).await;

        let cart_only = ingress(&[(SUBNETS, "subnet-a,subnet-b")], &[("/cart", "cart")]);
        let rebuilt = fx.assemble(&cart_only, Some(aggregate.clone())).await;
        assert!(rebuilt.valid);

        let tree = aggregate.load_balancer().await.unwrap();
        let desired: Vec<&str> = tree
            .target_groups
            .iter()
            .filter(|g| g.desired().is_some())
            .map(|g| g.backend().service_name.as_str())
            .collect();
        assert_eq!(desired, vec!["cart"]);
        // The pay group is still observed until a reconcile deletes it
        assert_eq!(tree.target_groups.len(), 2);
        assert_eq!(tree.desired_tags().and_then(|t| t.get("Team")), None);

        fx.reconcile(&aggregate).await;
        let tree = aggregate.load_balancer().await.unwrap();
        assert_eq!(tree.target_groups.len(), 1);
        assert_eq!(fx.elbv2.target_group_count(), 1);
    }

    #[tokio::test]
    async fn test_existing_aggregate_for_other_ingress_is_ignored() {
        let fx = Fixture::new();
        let other = Arc::new(AlbIngress::new(NewAlbIngressOptions {
            namespace: "payments".to_string(),
            name: "other".to_string(),
            cluster_name: CLUSTER.to_string(),
            events: None,
        }));

        let assembly = fx.assemble(&valid_ingress(), Some(other.clone())).await;
        assert!(assembly.valid);
        assert_eq!(assembly.ingress.id(), "payments/checkout");
        assert!(!Arc::ptr_eq(&assembly.ingress, &other));
        assert!(other.load_balancer().await.is_none());
    }

    // -----------------------------------------------------------------------
    // Supporting operations
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_reserved_tags_win_over_annotation_tags() {
        let fx = Fixture::new();
        let ing = ingress(
            &[
                (SUBNETS, "subnet-a,subnet-b"),
                (
                    TAGS,
                    "Namespace=spoofed,IngressName=spoofed,kubernetes.io/cluster/prod=shared,Team=payments",
                ),
            ],
            &[("/cart", "cart")],
        );
        let aggregate = fx.assemble(&ing, None).await.ingress;

        let tags = aggregate.tags().await;
        assert_eq!(tags.len(), 4);
        assert_eq!(tags.get(&cluster_tag(CLUSTER)), Some(CLUSTER_TAG_OWNED));
        assert_eq!(tags.keys().filter(|k| *k == NAMESPACE_TAG).count(), 1);
        assert_eq!(tags.keys().filter(|k| *k == INGRESS_NAME_TAG).count(), 1);
        assert_eq!(tags.get(NAMESPACE_TAG), Some("payments"));
        assert_eq!(tags.get(INGRESS_NAME_TAG), Some("checkout"));

        // Fresh value on every call
        let mut copy = aggregate.tags().await;
        copy.set("Team", "changed");
        assert_eq!(aggregate.tags().await.get("Team"), Some("payments"));
    }

    #[tokio::test]
    async fn test_tags_of_unassembled_aggregate() {
        let aggregate = AlbIngress::new(NewAlbIngressOptions {
            namespace: "payments".to_string(),
            name: "checkout".to_string(),
            cluster_name: CLUSTER.to_string(),
            events: None,
        });
        let tags = aggregate.tags().await;
        assert_eq!(
            tags,
            Tags::new()
                .with(NAMESPACE_TAG, "payments")
                .with(INGRESS_NAME_TAG, "checkout")
                .with(cluster_tag(CLUSTER), CLUSTER_TAG_OWNED)
        );
    }

    #[tokio::test]
    async fn test_hostnames_readiness() {
        let fx = Fixture::new();
        let bare = AlbIngress::new(NewAlbIngressOptions {
            namespace: "payments".to_string(),
            name: "checkout".to_string(),
            cluster_name: CLUSTER.to_string(),
            events: None,
        });
        assert!(bare.hostnames().await.unwrap().is_empty());

        let aggregate = fx.assemble(&valid_ingress(), None).await.ingress;
        assert!(matches!(
            aggregate.hostnames().await,
            Err(Error::NotReady(id)) if id == "payments/checkout"
        ));

        fx.reconcile(&aggregate).await;
        let hostnames = aggregate.hostnames().await.unwrap();
        assert_eq!(hostnames.len(), 1);
        assert!(hostnames[0]
            .hostname
            .as_deref()
            .unwrap()
            .ends_with(".elb.amazonaws.com"));
    }

    #[tokio::test]
    async fn test_eventf_requires_binding_and_sink() {
        let sink = Arc::new(MemoryEventSink::new());
        let unbound = AlbIngress::new(NewAlbIngressOptions {
            namespace: "payments".to_string(),
            name: "checkout".to_string(),
            cluster_name: CLUSTER.to_string(),
            events: Some(sink.clone()),
        });
        unbound
            .eventf(EventType::Warning, "ERROR", "not delivered")
            .await;
        assert!(sink.events().is_empty());

        let fx = Fixture::new();
        let bound = fx.assemble(&valid_ingress(), None).await.ingress;
        bound
            .eventf(EventType::Normal, "CREATE", format!("{} ready", bound.name()))
            .await;
        let events = fx.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "payments-checkout ready");
    }

    #[tokio::test]
    async fn test_strip_desired_state_is_idempotent() {
        let fx = Fixture::new();
        let aggregate = fx.assemble(&valid_ingress(), None).await.ingress;

        aggregate.strip_desired_state().await;
        let once = aggregate.load_balancer().await.unwrap();
        aggregate.strip_desired_state().await;
        let twice = aggregate.load_balancer().await.unwrap();

        assert_eq!(once, twice);
        assert!(once.desired().is_none());
        assert!(once.target_groups.iter().all(|g| g.desired().is_none()));
    }

    #[tokio::test]
    async fn test_prepare_deletion_removes_cloud_resources() {
        let fx = Fixture::new();
        let aggregate = fx.assemble(&valid_ingress(), None).await.ingress;
        fx.reconcile(&aggregate).await;
        assert_eq!(fx.elbv2.load_balancer_count(), 1);
        assert_eq!(fx.elbv2.target_group_count(), 2);

        aggregate.prepare_deletion().await;
        fx.reconcile(&aggregate).await;

        assert_eq!(fx.elbv2.load_balancer_count(), 0);
        assert_eq!(fx.elbv2.target_group_count(), 0);
        assert!(aggregate.load_balancer().await.is_none());
        assert!(aggregate.hostnames().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_teardown_keeps_tree_until_target_groups_are_deleted() {
        let fx = Fixture::new();
        let aggregate = fx.assemble(&valid_ingress(), None).await.ingress;
        fx.reconcile(&aggregate).await;

        aggregate.prepare_deletion().await;
        fx.elbv2.fail("DeleteTargetGroup");
        fx.reconcile(&aggregate).await;

        assert_eq!(fx.elbv2.load_balancer_count(), 0);
        assert_eq!(fx.elbv2.target_group_count(), 2);
        let tree = aggregate.load_balancer().await.unwrap();
        assert!(tree.current().is_none());
        assert_eq!(tree.target_groups.len(), 2);

        // The next pass picks up where the failed one stopped
        fx.elbv2.clear_failures();
        fx.reconcile(&aggregate).await;

        assert_eq!(fx.elbv2.target_group_count(), 0);
        assert!(aggregate.load_balancer().await.is_none());
    }

    #[tokio::test]
    async fn test_repeated_tag_key_converges() {
        let fx = Fixture::new();
        let ing = ingress(
            &[(SUBNETS, "subnet-a,subnet-b"), (TAGS, "Team=a,Team=b")],
            &[("/cart", "cart")],
        );
        let aggregate = fx.assemble(&ing, None).await.ingress;
        fx.reconcile(&aggregate).await;
        assert_eq!(aggregate.tags().await.get("Team"), Some("b"));

        let again = fx.assemble(&ing, Some(aggregate.clone())).await;
        assert!(again.valid);
        fx.elbv2.clear_operations();
        fx.reconcile(&aggregate).await;
        assert!(fx.elbv2.mutations().is_empty(), "{:?}", fx.elbv2.mutations());
    }

    // -----------------------------------------------------------------------
    // Cloud import
    // -----------------------------------------------------------------------

    async fn import_tagged(tags: Tags) -> crate::Result<AlbIngress> {
        let elbv2 = InMemoryElbv2::new();
        let description = elbv2
            .create_load_balancer(
                &LoadBalancerSpec {
                    name: "prod-untagged".to_string(),
                    scheme: Scheme::Internal,
                    subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
                    security_groups: Vec::new(),
                    ip_address_type: IpAddressType::Ipv4,
                },
                &tags,
            )
            .await
            .unwrap();

        AlbIngress::from_aws(FromAwsOptions {
            load_balancer: description,
            cluster_name: CLUSTER,
            elbv2: &elbv2,
            events: None,
        })
        .await
    }

    #[tokio::test]
    async fn test_import_requires_ingress_name_tag() {
        let err = import_tagged(
            Tags::new()
                .with(NAMESPACE_TAG, "payments")
                .with(cluster_tag(CLUSTER), CLUSTER_TAG_OWNED),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            &err,
            Error::MissingTag { tag, load_balancer }
                if tag == INGRESS_NAME_TAG && load_balancer == "prod-untagged"
        ));
    }

    #[tokio::test]
    async fn test_import_requires_ownership_by_this_cluster() {
        let ours = || {
            Tags::new()
                .with(NAMESPACE_TAG, "payments")
                .with(INGRESS_NAME_TAG, "checkout")
        };

        // Created by a cluster whose name shares the prefix
        let err = import_tagged(ours().with(cluster_tag("prod-east"), CLUSTER_TAG_OWNED))
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            Error::MissingTag { tag, .. } if *tag == cluster_tag(CLUSTER)
        ));

        // Tagged for this cluster but not owned by it
        assert!(import_tagged(ours().with(cluster_tag(CLUSTER), "shared"))
            .await
            .is_err());

        let imported = import_tagged(ours().with(cluster_tag(CLUSTER), CLUSTER_TAG_OWNED))
            .await
            .unwrap();
        assert_eq!(imported.id(), "payments/checkout");
    }

    #[tokio::test]
    async fn test_import_then_merge_converges_without_changes() {
        let fx = Fixture::new();
        let original = fx.assemble(&valid_ingress(), None).await.ingress;
        fx.reconcile(&original).await;

        let description = fx
            .elbv2
            .describe_load_balancers()
            .await
            .unwrap()
            .remove(0);
        let imported = AlbIngress::from_aws(FromAwsOptions {
            load_balancer: description,
            cluster_name: CLUSTER,
            elbv2: &fx.elbv2,
            events: fx.sink(),
        })
        .await
        .unwrap();

        assert_eq!(imported.id(), "payments/checkout");
        assert!(imported.is_valid().await);
        let tree = imported.load_balancer().await.unwrap();
        assert!(tree.desired().is_none());
        assert_eq!(tree.target_groups.len(), 2);
        assert_eq!(tree.listeners.len(), 1);
        assert_eq!(tree.listeners.iter().next().unwrap().rules().len(), 2);

        let imported = Arc::new(imported);
        let merged = fx.assemble(&valid_ingress(), Some(imported.clone())).await;
        assert!(merged.valid);

        fx.elbv2.clear_operations();
        fx.reconcile(&imported).await;
        assert!(fx.elbv2.mutations().is_empty(), "{:?}", fx.elbv2.mutations());
    }

    // -----------------------------------------------------------------------
    // Reconcile dispatch
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_reconcile_errors_are_reported_not_raised() {
        let fx = Fixture::new();
        fx.elbv2.fail("CreateRule");
        let aggregate = fx.assemble(&valid_ingress(), None).await.ingress;

        fx.reconcile(&aggregate).await;

        // Everything but the rules converged
        assert_eq!(fx.elbv2.load_balancer_count(), 1);
        assert_eq!(fx.elbv2.listener_count(), 1);
        assert_eq!(fx.elbv2.rule_count(), 0);
        let warnings = fx.sink.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].message.starts_with("Failed to reconcile"));

        fx.elbv2.clear_failures();
        fx.reconcile(&aggregate).await;
        assert_eq!(fx.elbv2.rule_count(), 2);
    }
}
