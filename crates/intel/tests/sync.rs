#![forbid(unsafe_code)]

use serde_json::json;
use vigil_core::{
    EntityRef, ExecutionId, ResourceHealth, ResourceInternalHealth, ResourceInternalStatus, ResourceSnapshot,
    ResourceState,
};
use vigil_intel::aws_eks::{AWS_EKS, AWS_EKS_CLUSTER};
use vigil_intel::{propagate_from, AwsEks, Intel, SyncOutcome, SyncResourceRequest};

fn request(predecessors: Vec<EntityRef>, resource_context: Vec<ResourceSnapshot>) -> SyncResourceRequest {
    SyncResourceRequest {
        execution_id: ExecutionId::new("sync-1"),
        entity: EntityRef::named(AWS_EKS, "a"),
        resource: ResourceState {
            data: json!({"stale": true}),
            internal_status: ResourceInternalStatus::Created,
            sub_resources: json!({"nodegroup": {}}),
            ..Default::default()
        },
        predecessors,
        resource_context,
    }
}

fn healthy_snapshot(entity_id: &str, x: i64) -> ResourceSnapshot {
    ResourceSnapshot {
        entity_id: entity_id.to_string(),
        state: ResourceState {
            data: json!({"x": x}),
            error: None,
            state: "ok".into(),
            health: ResourceHealth::Ok,
            internal_health: ResourceInternalHealth::Ok,
            internal_status: ResourceInternalStatus::Created,
            sub_resources: json!({"pods": 3}),
        },
    }
}

#[test]
fn absent_dependency_is_an_error_state() {
    let req = request(vec![], vec![]);
    let st = AwsEks.sync(&req);
    assert_eq!(st.state, "error");
    assert_eq!(st.health, ResourceHealth::Error);
    assert_eq!(st.internal_health, ResourceInternalHealth::Error);
    assert_eq!(st.error.as_deref(), Some("No cluster connected"));
    assert_eq!(st.data, json!({}));
    // carried over from the current resource
    assert_eq!(st.internal_status, ResourceInternalStatus::Created);
}

#[test]
fn dependency_without_snapshot_is_unknown() {
    let cluster = EntityRef::named(AWS_EKS_CLUSTER, "a");
    let req = request(vec![cluster], vec![healthy_snapshot("entity:someone-else", 1)]);
    let st = AwsEks.sync(&req);
    assert_eq!(st.state, "unknown");
    assert_eq!(st.health, ResourceHealth::Unknown);
    assert_eq!(st.internal_health, ResourceInternalHealth::Unknown);
    assert!(st.error.is_none());
}

#[test]
fn matching_snapshot_is_copied_exactly() {
    let cluster = EntityRef::named(AWS_EKS_CLUSTER, "a");
    let snap = healthy_snapshot(&cluster.id, 1);
    let req = request(vec![EntityRef::named("awsRegion", "us-east-1"), cluster], vec![snap.clone()]);
    let st = AwsEks.sync(&req);
    assert_eq!(st, snap.state);
    // caller-owned context is untouched
    assert_eq!(req.resource_context, vec![snap]);
}

#[test]
fn first_matching_snapshot_wins() {
    let cluster = EntityRef::named(AWS_EKS_CLUSTER, "a");
    let first = healthy_snapshot(&cluster.id, 1);
    let second = healthy_snapshot(&cluster.id, 2);
    let req = request(vec![cluster], vec![first.clone(), second]);
    let (outcome, st) = propagate_from(&req, AWS_EKS_CLUSTER, "No cluster connected");
    assert_eq!(outcome, SyncOutcome::SnapshotFound);
    assert_eq!(st.data, json!({"x": 1}));
}

#[test]
fn request_parses_from_wire_shape() {
    let req: SyncResourceRequest = serde_json::from_value(json!({
        "executionId": "sync-9",
        "entity": {"id": "entity:eks", "entityType": "awsEks", "name": "a"},
        "predecessors": [{"id": "entity:cluster", "entityType": "awsEksCluster", "name": "a"}],
        "resourceContext": [{
            "entityId": "entity:cluster",
            "data": {"x": 1},
            "state": "ok",
            "health": "ok",
            "internalHealth": "Ok",
            "internalStatus": "Created",
            "subResources": {}
        }]
    }))
    .unwrap();
    let st = AwsEks.sync(&req);
    assert_eq!(st.health, ResourceHealth::Ok);
    assert_eq!(st.data, json!({"x": 1}));
}
