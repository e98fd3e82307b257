use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::cache::IngressCache;
use crate::alb::name_prefix;
use crate::annotations::AnnotationResolver;
use crate::aws::Elbv2;
use crate::cluster::ClusterLookups;
use crate::error::Result;
use crate::events::EventSink;
use crate::ingress::{
    self, AlbIngress, Assembly, FromAwsOptions, FromIngressOptions, ReconcileOptions,
};

/// Shared inputs of assembling aggregates from Ingress objects
pub struct SyncContext {
    pub cluster_name: String,
    pub resolver: AnnotationResolver,
    pub lookups: ClusterLookups,
    pub events: Option<Arc<dyn EventSink>>,
}

/// Assemble `ingress` onto its cached aggregate (if any) and cache the result
#[instrument(skip(cache, ingress, ctx), fields(ingress = %ingress.name_any()))]
pub async fn sync_ingress(cache: &IngressCache, ingress: &Ingress, ctx: &SyncContext) -> Assembly {
    let namespace = ingress.namespace().unwrap_or_else(|| "default".to_string());
    let key = ingress::id(&namespace, &ingress.name_any());
    let existing = cache.get(&key).await;

    let assembly = AlbIngress::from_ingress(FromIngressOptions {
        ingress,
        existing,
        cluster_name: &ctx.cluster_name,
        resolver: &ctx.resolver,
        lookups: &ctx.lookups,
        events: ctx.events.clone(),
    })
    .await;

    cache.insert(assembly.ingress.clone()).await;
    debug!(ingress = %key, valid = assembly.valid, "Synchronized ingress");
    assembly
}

/// Rebuild aggregates for every load balancer this cluster owns.
///
/// The name prefix only narrows the candidates, since prefixes are truncated
/// and can collide; ownership is decided by the cluster tag. Load balancers
/// that cannot be imported are skipped with a warning.
#[instrument(skip(elbv2, events))]
pub async fn import_from_aws(
    elbv2: &dyn Elbv2,
    cluster_name: &str,
    events: Option<Arc<dyn EventSink>>,
) -> Result<Vec<AlbIngress>> {
    let prefix = format!("{}-", name_prefix(cluster_name));
    let mut imported = Vec::new();

    for load_balancer in elbv2.describe_load_balancers().await? {
        if !load_balancer.name.starts_with(&prefix) {
            continue;
        }
        let name = load_balancer.name.clone();
        match AlbIngress::from_aws(FromAwsOptions {
            load_balancer,
            cluster_name,
            elbv2,
            events: events.clone(),
        })
        .await
        {
            Ok(aggregate) => {
                #[cfg(feature = "metrics")]
                crate::metrics::inc_import("imported");
                imported.push(aggregate);
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                crate::metrics::inc_import("skipped");
                warn!(load_balancer = %name, error = %e, "Skipping load balancer");
            }
        }
    }

    info!(count = imported.len(), "Imported load balancers from AWS");
    Ok(imported)
}

/// Reconcile every cached aggregate concurrently
pub async fn reconcile_all(cache: &IngressCache, elbv2: &dyn Elbv2) {
    let aggregates = cache.all().await;
    let opts = ReconcileOptions { elbv2 };
    join_all(aggregates.iter().map(|a| a.reconcile(&opts))).await;
}

/// Delete the cloud resources `id` owned and drop it from the cache.
///
/// An aggregate whose teardown did not finish stays cached, so the next
/// [`reconcile_all`] retries the deletion.
#[instrument(skip(cache, elbv2))]
pub async fn retire_ingress(cache: &IngressCache, id: &str, elbv2: &dyn Elbv2) {
    let Some(aggregate) = cache.get(id).await else {
        debug!(ingress = %id, "No cached aggregate to retire");
        return;
    };
    aggregate.prepare_deletion().await;
    aggregate.reconcile(&ReconcileOptions { elbv2 }).await;

    if aggregate.load_balancer().await.is_some() {
        warn!(ingress = %id, "Teardown incomplete, keeping ingress for the next reconcile");
        return;
    }
    cache.remove(id).await;
    #[cfg(feature = "metrics")]
    crate::metrics::forget_ingress(id);
    info!(ingress = %id, "Retired ingress");
}
