use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::key::ObjectKey;

/// The Workload was admitted through a ClusterQueue.
pub const WORKLOAD_ADMITTED: &str = "Admitted";

/// The job behind the Workload finished running (failed or succeeded).
pub const WORKLOAD_FINISHED: &str = "Finished";

/// A unit of schedulable work waiting in a `Queue` until a `ClusterQueue`
/// admits it.
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "kueue.x-k8s.io",
    version = "v1alpha1",
    kind = "Workload",
    namespaced,
    status = "WorkloadStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    // homogeneous pod sets, names unique within the workload
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_sets: Vec<PodSet>,

    pub queue_name: String,

    // present iff the workload is admitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<Admission>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    // higher is served first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSet {
    pub name: String,

    #[schemars(with = "serde_json::Value")]
    #[serde(default)]
    pub spec: PodSpec,

    pub count: i32,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub cluster_queue: String,

    #[serde(default)]
    pub pod_set_flavors: Vec<PodSetFlavors>,
}

/// Flavor assignment for one entry of `spec.podSets`, keyed by resource name.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSetFlavors {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flavors: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    // a map keyed by condition type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<WorkloadCondition>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[schemars(with = "Option<String>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<Time>,

    #[schemars(with = "Option<String>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl WorkloadCondition {
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: Time,
    ) -> Self {
        WorkloadCondition {
            type_: type_.to_string(),
            status,
            last_probe_time: Some(now.clone()),
            last_transition_time: Some(now),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether writing `other` over this condition would change anything
    /// besides its timestamps.
    pub fn same_state(&self, other: &WorkloadCondition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

impl WorkloadStatus {
    pub fn find_condition(&self, type_: &str) -> Option<&WorkloadCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Sets `condition` in place of any condition of the same type. The
    /// previous transition time is kept unless the status changed.
    pub fn set_condition(&mut self, mut condition: WorkloadCondition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time.clone();
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }
}

impl Workload {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_resource(self)
    }

    pub fn find_condition(&self, type_: &str) -> Option<&WorkloadCondition> {
        self.status.as_ref().and_then(|s| s.find_condition(type_))
    }

    /// True when the condition of the given type is present with status True.
    pub fn in_condition(&self, type_: &str) -> bool {
        self.find_condition(type_)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Name of the ClusterQueue that admitted this workload, if any.
    pub fn admitted_cluster_queue(&self) -> Option<&str> {
        self.spec.admission.as_ref().map(|a| a.cluster_queue.as_str())
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::{
        ConditionStatus, WorkloadCondition, WorkloadStatus, WORKLOAD_ADMITTED, WORKLOAD_FINISHED,
    };

    fn at(secs: i64) -> Time {
        Time(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn set_condition_appends_new_types() {
        let mut status = WorkloadStatus::default();
        status.set_condition(WorkloadCondition::new(
            WORKLOAD_ADMITTED,
            ConditionStatus::False,
            "Inadmissible",
            "",
            at(1),
        ));
        status.set_condition(WorkloadCondition::new(
            WORKLOAD_FINISHED,
            ConditionStatus::True,
            "",
            "",
            at(2),
        ));

        assert_eq!(status.conditions.len(), 2);
        let finished = status.find_condition(WORKLOAD_FINISHED).unwrap();
        assert_eq!(finished.status, ConditionStatus::True);
    }

    #[test]
    fn transition_time_kept_when_status_unchanged() {
        let mut status = WorkloadStatus::default();
        status.set_condition(WorkloadCondition::new(
            WORKLOAD_ADMITTED,
            ConditionStatus::False,
            "Inadmissible",
            "a",
            at(1),
        ));
        status.set_condition(WorkloadCondition::new(
            WORKLOAD_ADMITTED,
            ConditionStatus::False,
            "Inadmissible",
            "b",
            at(5),
        ));

        let condition = status.find_condition(WORKLOAD_ADMITTED).unwrap();
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(condition.message, "b");
        assert_eq!(condition.last_transition_time, Some(at(1)));
        assert_eq!(condition.last_probe_time, Some(at(5)));
    }

    #[test]
    fn transition_time_moves_when_status_changes() {
        let mut status = WorkloadStatus::default();
        status.set_condition(WorkloadCondition::new(
            WORKLOAD_ADMITTED,
            ConditionStatus::False,
            "Inadmissible",
            "",
            at(1),
        ));
        status.set_condition(WorkloadCondition::new(
            WORKLOAD_ADMITTED,
            ConditionStatus::True,
            "",
            "",
            at(7),
        ));

        let condition = status.find_condition(WORKLOAD_ADMITTED).unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.last_transition_time, Some(at(7)));
        assert!(condition.reason.is_empty());
    }
}
