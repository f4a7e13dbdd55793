//! Queue status aggregator.
//!
//! Queues are reconciled when they change and, with a fixed delay, whenever
//! the workload synchronizer reports a workload of theirs. Bursts of workload
//! events against one queue collapse into a single recompute of
//! `status.pendingWorkloads`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, Stream, StreamExt, TryStreamExt};
use kube_runtime::controller::ReconcilerAction;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::scheduler::{scheduler, ScheduleRequest};
use log::{debug, error, trace, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use super::client::KubeClient;
use super::workload::WorkloadUpdateWatcher;
use crate::indices::pending::queue_key;
use crate::indices::PendingLedger;
use crate::models::queue::{Queue, QueueStatus};
use crate::models::workload::Workload;
use crate::runtime::controller::Reconciler;
use crate::runtime::source::{EventHandler, WatchEvent};
use crate::utils::config::OverflowPolicy;
use crate::utils::error::{ignore_not_found, Error};

pub struct QueueReconciler {
    client: Arc<dyn KubeClient>,
    queues: Arc<dyn PendingLedger>,
    workloads: Store<Workload>,
}

impl QueueReconciler {
    /// `workloads` is the workload watch store, used to adopt workloads
    /// that were seen before their queue.
    pub fn new(
        client: Arc<dyn KubeClient>,
        queues: Arc<dyn PendingLedger>,
        workloads: Store<Workload>,
    ) -> Self {
        QueueReconciler {
            client,
            queues,
            workloads,
        }
    }
}

#[async_trait]
impl Reconciler<Queue> for QueueReconciler {
    async fn reconcile(&self, queue: &Queue) -> Result<ReconcilerAction, Error> {
        let key = queue.key();
        debug!("Reconciling Queue {}", key);

        let status = QueueStatus {
            pending_workloads: self.queues.pending_workloads(&key)?,
        };
        if queue.status.clone().unwrap_or_default() != status {
            let mut updated = queue.clone();
            updated.status = Some(status);
            ignore_not_found(self.client.replace_queue_status(&updated).await)?;
        }
        Ok(ReconcilerAction { requeue_after: None })
    }
}

#[async_trait]
impl EventHandler<Queue> for QueueReconciler {
    async fn handle(&self, event: WatchEvent<Queue>) {
        match &event {
            WatchEvent::Create(queue) => {
                debug!("Queue create event: {}", queue.key());
                if let Err(err) = self.queues.add_queue(queue, &self.workloads.state()) {
                    error!("Failed to add queue to system: {}", err);
                }
            }
            WatchEvent::Update { new, .. } => {
                debug!("Queue update event: {}", new.key());
                if let Err(err) = self.queues.update_queue(new) {
                    error!("Failed to update queue in system: {}", err);
                }
            }
            WatchEvent::Delete { object, .. } => {
                debug!("Queue delete event: {}", object.key());
                self.queues.delete_queue(object);
            }
        }
    }
}

/// Sending half of the workload notification channel.
pub struct QueueUpdateNotifier {
    sender: mpsc::Sender<Workload>,
    overflow: OverflowPolicy,
}

/// A bounded channel carrying workload snapshots from the workload
/// synchronizer to `delayed_queue_triggers`.
pub fn notification_channel(
    capacity: usize,
    overflow: OverflowPolicy,
) -> (QueueUpdateNotifier, mpsc::Receiver<Workload>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (QueueUpdateNotifier { sender, overflow }, receiver)
}

#[async_trait]
impl WorkloadUpdateWatcher for QueueUpdateNotifier {
    async fn notify_workload_update(&self, workload: &Workload) {
        match self.overflow {
            OverflowPolicy::Block => {
                if self.sender.send(workload.clone()).await.is_err() {
                    debug!("Queue update channel closed, dropping update of {}", workload.key());
                }
            }
            OverflowPolicy::Drop => match self.sender.try_send(workload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Queue update channel full, dropping update of {}", workload.key());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Queue update channel closed, dropping update of {}", workload.key());
                }
            },
        }
    }
}

/// Turns every workload notification into a reconcile trigger for the
/// workload's queue, due `delay` after the notification. A queue with a
/// trigger already due keeps the earlier deadline.
pub fn delayed_queue_triggers(
    updates: mpsc::Receiver<Workload>,
    delay: Duration,
) -> impl Stream<Item = Result<ObjectRef<Queue>, Error>> {
    let requests = ReceiverStream::new(updates).filter_map(move |workload| {
        if workload.metadata.name.as_deref().unwrap_or_default().is_empty() {
            return future::ready(None);
        }
        let key = queue_key(&workload);
        trace!("Queue {} reconcile requested by workload {}", key, workload.key());
        future::ready(Some(ScheduleRequest {
            message: ObjectRef::new(&key.name).within(&key.namespace),
            run_at: Instant::now() + delay,
        }))
    });
    scheduler(requests).map_err(Error::from)
}
