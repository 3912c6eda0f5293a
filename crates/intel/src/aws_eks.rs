//! Amazon EKS: discovers clusters and syncs `awsEks` from its connected `awsEksCluster`.

use serde_json::Value;
use tracing::{debug, info};
use vigil_core::{DiscoveryNode, EntityRef, Op, ResourceState};
use vigil_provider::{ProviderCall, ProviderClient};

use crate::{parse_output, propagate_from, DiscoveryError, DiscoveryRequest, DiscoveryResult, Intel, SyncResourceRequest};

pub const KUBERNETES_CLUSTER: &str = "kubernetesCluster";
pub const AWS_EKS: &str = "awsEks";
pub const AWS_EKS_CLUSTER: &str = "awsEksCluster";

#[derive(Debug, Clone, Copy, Default)]
pub struct AwsEks;

fn eks_call(operation: &str, region: &str) -> ProviderCall {
    let call = ProviderCall::new("eks", operation);
    if region.is_empty() { call } else { call.arg("--region").arg(region) }
}

/// `kubernetesCluster → awsEks → awsEksCluster` for one described cluster.
fn cluster_tree(listed_name: &str, cluster: &Value) -> DiscoveryNode {
    let name = cluster.get("name").and_then(Value::as_str).unwrap_or(listed_name);

    let mut concrete = EntityRef::named(AWS_EKS_CLUSTER, name);
    concrete.add_op(Op::inferred(["name"], Value::from(name)));
    if let Some(version) = cluster.get("version") {
        concrete.add_op(Op::inferred(["kubernetesVersion"], version.clone()));
    }
    for (field, path) in [("arn", "arn"), ("endpoint", "endpoint"), ("roleArn", "roleArn"), ("status", "clusterStatus")] {
        if let Some(v) = cluster.get(field).filter(|v| !v.is_null()) {
            concrete.add_op(Op::inferred([path], v.clone()));
        }
    }

    let mut eks = EntityRef::named(AWS_EKS, name);
    eks.add_op(Op::inferred(["name"], Value::from(name)));

    let mut k8s = EntityRef::named(KUBERNETES_CLUSTER, name);
    k8s.add_op(Op::inferred(["name"], Value::from(name)));

    DiscoveryNode::leaf(k8s).with_child(DiscoveryNode::leaf(eks).with_child(DiscoveryNode::leaf(concrete)))
}

#[async_trait::async_trait]
impl Intel for AwsEks {
    fn entity_type(&self) -> &'static str { AWS_EKS }

    async fn discover(&self, provider: &dyn ProviderClient, req: &DiscoveryRequest) -> Result<DiscoveryResult, DiscoveryError> {
        let region = req.provider.region.as_str();
        let env = &req.provider.env;

        let list = eks_call("list-clusters", region);
        let listed = parse_output(&list, &provider.call(&list, env).await?)?;
        let names: Vec<&str> = listed
            .get("clusters")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        debug!(execution_id = %req.execution_id, region, count = names.len(), "eks clusters listed");

        let mut discovered = Vec::with_capacity(names.len());
        for name in names {
            let describe = eks_call("describe-cluster", region).arg("--name").arg(name);
            let described = parse_output(&describe, &provider.call(&describe, env).await?)?;
            match described.get("cluster").filter(|c| c.is_object()) {
                Some(cluster) => discovered.push(cluster_tree(name, cluster)),
                None => debug!(execution_id = %req.execution_id, cluster = name, "describe-cluster returned no cluster; skipping"),
            }
        }
        info!(execution_id = %req.execution_id, region, discovered = discovered.len(), "eks discovery done");
        Ok(DiscoveryResult { discovered })
    }

    fn sync(&self, req: &SyncResourceRequest) -> ResourceState {
        propagate_from(req, AWS_EKS_CLUSTER, "No cluster connected").1
    }
}
