//! Workload synchronizer.
//!
//! Watch events drive the pending ledger and the admission cache directly,
//! one lifecycle transition at a time. `reconcile` only keeps the `Admitted`
//! condition of a workload in line with what the indices know about it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube_runtime::controller::ReconcilerAction;
use log::{debug, error};

use super::client::KubeClient;
use crate::indices::{AdmissionCache, PendingLedger};
use crate::models::lifecycle::{classify, Transition, WorkloadState};
use crate::models::workload::{ConditionStatus, Workload, WorkloadCondition, WORKLOAD_ADMITTED};
use crate::runtime::controller::Reconciler;
use crate::runtime::source::{EventHandler, WatchEvent};
use crate::utils::error::{ignore_not_found, Error};

const INADMISSIBLE: &str = "Inadmissible";

/// Observer of every workload snapshot the synchronizer handled.
#[async_trait]
pub trait WorkloadUpdateWatcher: Send + Sync {
    async fn notify_workload_update(&self, workload: &Workload);
}

pub struct WorkloadReconciler {
    client: Arc<dyn KubeClient>,
    queues: Arc<dyn PendingLedger>,
    cache: Arc<dyn AdmissionCache>,
    watchers: Vec<Arc<dyn WorkloadUpdateWatcher>>,
}

impl WorkloadReconciler {
    pub fn new(
        client: Arc<dyn KubeClient>,
        queues: Arc<dyn PendingLedger>,
        cache: Arc<dyn AdmissionCache>,
        watchers: Vec<Arc<dyn WorkloadUpdateWatcher>>,
    ) -> Self {
        WorkloadReconciler {
            client,
            queues,
            cache,
            watchers,
        }
    }

    /// Applies the transition carried by `event` to the indices and notifies
    /// the watchers of every snapshot involved.
    pub async fn handle(&self, event: WatchEvent<Workload>) {
        let old = match &event {
            WatchEvent::Update { old, .. } => Some(old),
            _ => None,
        };
        let new = event.object();

        self.apply(Transition::of_event(&event), old.unwrap_or(new), new);

        if let Some(old) = old {
            self.notify_watchers(old).await;
        }
        self.notify_watchers(new).await;
    }

    fn apply(&self, transition: Transition, old: &Workload, wl: &Workload) {
        let context = describe(transition, old, wl);
        match transition {
            Transition::Created(WorkloadState::Finished) => {
                debug!("Workload create event: {}", context);
            }
            Transition::Created(WorkloadState::Pending) => {
                debug!("Workload create event: {}", context);
                if !self.queues.add_or_update_workload(wl) {
                    debug!("Queue for workload didn't exist; ignored for now: {}", context);
                }
            }
            Transition::Created(WorkloadState::Admitted) => {
                debug!("Workload create event: {}", context);
                if !self.cache.add_or_update_workload(wl) {
                    debug!("ClusterQueue for workload didn't exist; ignored for now: {}", context);
                }
            }
            Transition::Deleted(state) => {
                debug!("Workload delete event: {}", context);
                // A workload of unknown state may have been assumed in the
                // cache; absence there is expected.
                if wl.spec.admission.is_some() || state.is_none() {
                    if let Err(err) = self.cache.delete_workload(wl) {
                        if state == Some(WorkloadState::Admitted) {
                            error!("Failed to delete workload from cache: {}: {}", context, err);
                        }
                    }
                    self.queues.queue_associated_inadmissible_workloads(wl);
                }
                if wl.spec.admission.is_none() {
                    self.queues.delete_workload(wl);
                }
            }
            Transition::Finished { from } => {
                debug!("Workload update event: {}", context);
                if let Err(err) = self.cache.delete_workload(old) {
                    if from == WorkloadState::Admitted {
                        error!("Failed to delete workload from cache: {}: {}", context, err);
                    }
                }
                self.queues.delete_workload(old);
                self.queues.queue_associated_inadmissible_workloads(wl);
            }
            Transition::PendingUpdated => {
                debug!("Workload update event: {}", context);
                if !self.queues.update_workload(old, wl) {
                    debug!(
                        "Queue for updated workload didn't exist; ignoring for now: {}",
                        context
                    );
                }
            }
            Transition::Admitted => {
                debug!("Workload update event: {}", context);
                self.queues.delete_workload(old);
                if !self.cache.add_or_update_workload(wl) {
                    debug!("ClusterQueue for workload didn't exist; ignored for now: {}", context);
                }
            }
            Transition::Evicted => {
                debug!("Workload update event: {}", context);
                if let Err(err) = self.cache.delete_workload(old) {
                    error!("Failed to delete workload from cache: {}: {}", context, err);
                }
                self.queues.queue_associated_inadmissible_workloads(old);
                if !self.queues.add_or_update_workload(wl) {
                    debug!("Queue for workload didn't exist; ignored for now: {}", context);
                }
            }
            Transition::Updated { .. } => {
                debug!("Workload update event: {}", context);
                // some fields are immutable and change nothing here
                if let Err(err) = self.cache.update_workload(old, wl) {
                    error!("Updating workload in cache: {}: {}", context, err);
                }
            }
        }
    }

    async fn notify_watchers(&self, workload: &Workload) {
        for watcher in &self.watchers {
            watcher.notify_workload_update(workload).await;
        }
    }

    /// Writes the `Admitted` condition unless the stored one already has the
    /// same status, reason and message.
    async fn update_status_if_changed(
        &self,
        wl: &Workload,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Result<(), Error> {
        let condition =
            WorkloadCondition::new(WORKLOAD_ADMITTED, status, reason, message, Time(Utc::now()));
        if let Some(current) = wl.find_condition(WORKLOAD_ADMITTED) {
            if current.same_state(&condition) {
                return Ok(());
            }
        }

        let mut updated = wl.clone();
        updated
            .status
            .get_or_insert_with(Default::default)
            .set_condition(condition);
        self.client.replace_workload_status(&updated).await
    }
}

fn describe(transition: Transition, old: &Workload, wl: &Workload) -> String {
    let status = classify(wl);
    let mut context = format!("workload={}, queue={}", wl.key(), wl.spec.queue_name);
    match transition {
        Transition::Deleted(None) => context.push_str(", status=unknown"),
        _ => context.push_str(&format!(", status={}", status)),
    }
    if old.spec.queue_name != wl.spec.queue_name {
        context.push_str(&format!(", prevQueue={}", old.spec.queue_name));
    }
    let prev_status = classify(old);
    if prev_status != status {
        context.push_str(&format!(", prevStatus={}", prev_status));
    }
    if let Some(cq) = wl.admitted_cluster_queue() {
        context.push_str(&format!(", clusterQueue={}", cq));
    }
    if let Some(prev_cq) = old.admitted_cluster_queue() {
        if wl.admitted_cluster_queue() != Some(prev_cq) {
            context.push_str(&format!(", prevClusterQueue={}", prev_cq));
        }
    }
    context
}

#[async_trait]
impl EventHandler<Workload> for WorkloadReconciler {
    async fn handle(&self, event: WatchEvent<Workload>) {
        WorkloadReconciler::handle(self, event).await
    }
}

#[async_trait]
impl Reconciler<Workload> for WorkloadReconciler {
    async fn reconcile(&self, wl: &Workload) -> Result<ReconcilerAction, Error> {
        debug!("Reconciling Workload {}", wl.key());

        let result = match classify(wl) {
            WorkloadState::Pending if !self.queues.queue_for_workload_exists(wl) => {
                let message = format!("Queue {} doesn't exist", wl.spec.queue_name);
                self.update_status_if_changed(wl, ConditionStatus::False, INADMISSIBLE, &message)
                    .await
            }
            WorkloadState::Pending => match self.queues.cluster_queue_for_workload(wl) {
                (_, true) => Ok(()),
                (cq_name, false) => {
                    let message = format!("ClusterQueue {} doesn't exist", cq_name);
                    let status = ConditionStatus::False;
                    self.update_status_if_changed(wl, status, INADMISSIBLE, &message).await
                }
            },
            WorkloadState::Admitted => {
                self.update_status_if_changed(wl, ConditionStatus::True, "", "").await
            }
            WorkloadState::Finished => Ok(()),
        };
        // deleted concurrently, nothing to do
        ignore_not_found(result)?;
        Ok(ReconcilerAction { requeue_after: None })
    }
}
