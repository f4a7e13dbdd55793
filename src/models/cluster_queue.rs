use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Capacity bearing entity that admits workloads from the queues pointing at
/// it. Only its name matters to this controller.
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[kube(group = "kueue.x-k8s.io", version = "v1alpha1", kind = "ClusterQueue", derive = "PartialEq")]
#[serde(rename_all = "camelCase")]
pub struct ClusterQueueSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohort: Option<String>,
}
