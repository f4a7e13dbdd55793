use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::key::ObjectKey;

/// A namespaced grouping of pending workloads backed by one ClusterQueue.
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "kueue.x-k8s.io",
    version = "v1alpha1",
    kind = "Queue",
    namespaced,
    status = "QueueStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    pub cluster_queue: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    // derived by the controller, never authored by users
    #[serde(default)]
    pub pending_workloads: i32,
}

impl Queue {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_resource(self)
    }
}
