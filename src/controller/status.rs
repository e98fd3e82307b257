use k8s_openapi::api::networking::v1::{Ingress, IngressLoadBalancerIngress};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, instrument};

use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "alb-ingress-controller";

/// Merge-patch `status.loadBalancer.ingress` of the Ingress
#[instrument(skip(client, ingress, hostnames), fields(ingress = %ingress.name_any()))]
pub async fn publish_status(
    client: &Client,
    ingress: &Ingress,
    hostnames: &[IngressLoadBalancerIngress],
) -> Result<()> {
    let namespace = ingress.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Ingress> = Api::namespaced(client.clone(), &namespace);

    let current = ingress
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_deref())
        .unwrap_or_default();
    if current == hostnames {
        debug!("Ingress status already up to date");
        return Ok(());
    }

    let patch = serde_json::json!({
        "status": { "loadBalancer": { "ingress": hostnames } }
    });
    api.patch_status(
        &ingress.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    debug!(hostnames = hostnames.len(), "Published ingress status");
    Ok(())
}
