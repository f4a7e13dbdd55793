use std::fmt;

use super::workload::{Workload, WORKLOAD_FINISHED};
use crate::runtime::source::WatchEvent;

/// Where a workload is in its life. Exactly one holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    Pending,
    Admitted,
    Finished,
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadState::Pending => "pending",
            WorkloadState::Admitted => "admitted",
            WorkloadState::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Classifies a workload snapshot. A true `Finished` condition wins over
/// admission, and admission presence is what separates admitted from pending.
pub fn classify(workload: &Workload) -> WorkloadState {
    if workload.in_condition(WORKLOAD_FINISHED) {
        WorkloadState::Finished
    } else if workload.spec.admission.is_some() {
        WorkloadState::Admitted
    } else {
        WorkloadState::Pending
    }
}

/// The lifecycle transition a workload watch event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Created(WorkloadState),
    /// `None` when the watch could not tell whether this was a confirmed
    /// deletion; the snapshot is the last one observed.
    Deleted(Option<WorkloadState>),
    Finished { from: WorkloadState },
    PendingUpdated,
    Admitted,
    Evicted,
    /// Any other pair of states, including admitted to admitted.
    Updated { from: WorkloadState, to: WorkloadState },
}

impl Transition {
    pub fn of_update(old: &Workload, new: &Workload) -> Self {
        let from = classify(old);
        match (from, classify(new)) {
            (_, WorkloadState::Finished) => Transition::Finished { from },
            (WorkloadState::Pending, WorkloadState::Pending) => Transition::PendingUpdated,
            (WorkloadState::Pending, WorkloadState::Admitted) => Transition::Admitted,
            (WorkloadState::Admitted, WorkloadState::Pending) => Transition::Evicted,
            (from, to) => Transition::Updated { from, to },
        }
    }

    pub fn of_event(event: &WatchEvent<Workload>) -> Self {
        match event {
            WatchEvent::Create(wl) => Transition::Created(classify(wl)),
            WatchEvent::Update { old, new } => Transition::of_update(old, new),
            WatchEvent::Delete { object, state_unknown } => {
                let state = if *state_unknown { None } else { Some(classify(object)) };
                Transition::Deleted(state)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::{classify, Transition, WorkloadState};
    use crate::models::workload::{
        Admission, ConditionStatus, Workload, WorkloadCondition, WorkloadSpec, WorkloadStatus,
        WORKLOAD_FINISHED,
    };
    use crate::runtime::source::WatchEvent;

    fn workload() -> Workload {
        let mut wl = Workload::new(
            "job",
            WorkloadSpec {
                pod_sets: vec![],
                queue_name: "q1".to_string(),
                admission: None,
                priority_class_name: None,
                priority: None,
            },
        );
        wl.metadata.namespace = Some("default".to_string());
        wl
    }

    fn admitted() -> Workload {
        let mut wl = workload();
        wl.spec.admission = Some(Admission {
            cluster_queue: "cq1".to_string(),
            pod_set_flavors: vec![],
        });
        wl
    }

    fn finished(mut wl: Workload, status: ConditionStatus) -> Workload {
        let mut workload_status = WorkloadStatus::default();
        workload_status.set_condition(WorkloadCondition::new(
            WORKLOAD_FINISHED,
            status,
            "",
            "",
            Time(Utc::now()),
        ));
        wl.status = Some(workload_status);
        wl
    }

    #[test]
    fn classifies_each_state() {
        assert_eq!(classify(&workload()), WorkloadState::Pending);
        assert_eq!(classify(&admitted()), WorkloadState::Admitted);
        assert_eq!(classify(&finished(admitted(), ConditionStatus::True)), WorkloadState::Finished);
        assert_eq!(classify(&finished(workload(), ConditionStatus::True)), WorkloadState::Finished);
    }

    #[test]
    fn finished_condition_must_be_true() {
        let not_finished = finished(admitted(), ConditionStatus::False);
        assert_eq!(classify(&not_finished), WorkloadState::Admitted);
        let unknown = finished(workload(), ConditionStatus::Unknown);
        assert_eq!(classify(&unknown), WorkloadState::Pending);
    }

    #[test]
    fn classification_independent_of_call_order() {
        let old = workload();
        let new = admitted();
        let first = (classify(&old), classify(&new));
        let second = (classify(&new), classify(&old));
        assert_eq!(first, (second.1, second.0));
    }

    #[test]
    fn update_transitions() {
        assert_eq!(Transition::of_update(&workload(), &workload()), Transition::PendingUpdated);
        assert_eq!(Transition::of_update(&workload(), &admitted()), Transition::Admitted);
        assert_eq!(Transition::of_update(&admitted(), &workload()), Transition::Evicted);
        assert_eq!(
            Transition::of_update(&admitted(), &finished(admitted(), ConditionStatus::True)),
            Transition::Finished {
                from: WorkloadState::Admitted
            }
        );
        assert_eq!(
            Transition::of_update(&admitted(), &admitted()),
            Transition::Updated {
                from: WorkloadState::Admitted,
                to: WorkloadState::Admitted
            }
        );
    }

    #[test]
    fn delete_with_unknown_state_has_no_state() {
        let event = WatchEvent::Delete {
            object: admitted(),
            state_unknown: true,
        };
        assert_eq!(Transition::of_event(&event), Transition::Deleted(None));

        let event = WatchEvent::Delete {
            object: admitted(),
            state_unknown: false,
        };
        assert_eq!(
            Transition::of_event(&event),
            Transition::Deleted(Some(WorkloadState::Admitted))
        );
        assert_eq!(
            Transition::of_event(&WatchEvent::Create(workload())),
            Transition::Created(WorkloadState::Pending)
        );
    }
}
