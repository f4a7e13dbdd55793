//! Pending workload ledger.
//!
//! Workloads are grouped by the Queue they name. Each ClusterQueue keeps the
//! pending workloads of all its Queues split into an active set, which the
//! admission subsystem draws from with `pop_head`, and an inadmissible set of
//! workloads parked until capacity may have freed up.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::convert::TryFrom;

use chrono::{DateTime, Utc};
use log::debug;
#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;

use crate::models::key::ObjectKey;
use crate::models::lifecycle::{classify, WorkloadState};
use crate::models::queue::Queue;
use crate::models::workload::Workload;
use crate::utils::error::Error;

/// Index of pending workloads keyed by Queue, as seen by the workload
/// synchronizer and the queue status aggregator.
#[cfg_attr(test, automock)]
pub trait PendingLedger: Send + Sync {
    /// Returns false if the workload's Queue, or that Queue's ClusterQueue, is
    /// not known yet. The workload is kept under its Queue when only the
    /// ClusterQueue is missing.
    fn add_or_update_workload(&self, workload: &Workload) -> bool;

    /// Replaces `old` with `new`, following a change of Queue. Returns false
    /// under the same conditions as `add_or_update_workload`.
    fn update_workload(&self, old: &Workload, new: &Workload) -> bool;

    fn delete_workload(&self, workload: &Workload);

    fn queue_for_workload_exists(&self, workload: &Workload) -> bool;

    /// The ClusterQueue named by the workload's Queue, and whether that
    /// ClusterQueue is known. The name is empty when the Queue is unknown.
    fn cluster_queue_for_workload(&self, workload: &Workload) -> (String, bool);

    fn pending_workloads(&self, queue: &ObjectKey) -> Result<i32, Error>;

    /// Moves every inadmissible workload of the ClusterQueue associated with
    /// `workload` back to the active set.
    fn queue_associated_inadmissible_workloads(&self, workload: &Workload);

    /// Registers a Queue, adopting the pending workloads among `known` that
    /// name it.
    fn add_queue(&self, queue: &Queue, known: &[Workload]) -> Result<(), Error>;

    fn update_queue(&self, queue: &Queue) -> Result<(), Error>;

    fn delete_queue(&self, queue: &Queue);

    fn add_cluster_queue(&self, name: &str);

    fn delete_cluster_queue(&self, name: &str);
}

pub fn queue_key(workload: &Workload) -> ObjectKey {
    ObjectKey {
        namespace: workload.metadata.namespace.clone().unwrap_or_default(),
        name: workload.spec.queue_name.clone(),
    }
}

struct QueueEntry {
    cluster_queue: String,
    workloads: HashMap<ObjectKey, Workload>,
}

#[derive(Default)]
struct ClusterQueueEntry {
    active: HashMap<ObjectKey, Workload>,
    inadmissible: HashMap<ObjectKey, Workload>,
}

impl ClusterQueueEntry {
    fn push_or_update(&mut self, workload: Workload) {
        let key = workload.key();
        self.inadmissible.remove(&key);
        self.active.insert(key, workload);
    }

    fn remove(&mut self, key: &ObjectKey) {
        self.active.remove(key);
        self.inadmissible.remove(key);
    }
}

#[derive(Default)]
struct Ledger {
    queues: HashMap<ObjectKey, QueueEntry>,
    cluster_queues: HashMap<String, ClusterQueueEntry>,
}

impl Ledger {
    fn add_or_update(&mut self, workload: &Workload) -> bool {
        let key = workload.key();
        let queue = match self.queues.get_mut(&queue_key(workload)) {
            Some(queue) => queue,
            None => return false,
        };
        queue.workloads.insert(key, workload.clone());
        match self.cluster_queues.get_mut(&queue.cluster_queue) {
            Some(cq) => {
                cq.push_or_update(workload.clone());
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, workload: &Workload) {
        let key = workload.key();
        if let Some(queue) = self.queues.get_mut(&queue_key(workload)) {
            queue.workloads.remove(&key);
            if let Some(cq) = self.cluster_queues.get_mut(&queue.cluster_queue) {
                cq.remove(&key);
            }
        }
    }
}

/// In-memory `PendingLedger`.
#[derive(Default)]
pub struct QueueManager {
    ledger: RwLock<Ledger>,
}

impl QueueManager {
    pub fn new() -> Self {
        QueueManager::default()
    }

    /// Parks an active workload as inadmissible until the next
    /// `queue_associated_inadmissible_workloads` for its ClusterQueue.
    pub fn park_inadmissible(&self, workload: &Workload) -> bool {
        let mut ledger = self.ledger.write();
        let cq_name = match ledger.queues.get(&queue_key(workload)) {
            Some(queue) => queue.cluster_queue.clone(),
            None => return false,
        };
        let key = workload.key();
        match ledger.cluster_queues.get_mut(&cq_name) {
            Some(cq) => match cq.active.remove(&key) {
                Some(parked) => {
                    cq.inadmissible.insert(key, parked);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Takes the highest priority active workload of a ClusterQueue, oldest
    /// first among equal priorities. The workload stays counted under its
    /// Queue until it is deleted from the ledger.
    pub fn pop_head(&self, cluster_queue: &str) -> Option<Workload> {
        let mut ledger = self.ledger.write();
        let cq = ledger.cluster_queues.get_mut(cluster_queue)?;
        let head = cq
            .active
            .iter()
            .max_by_key(|(key, wl)| {
                (wl.priority(), Reverse(created_at(wl)), Reverse((*key).clone()))
            })
            .map(|(key, _)| key.clone())?;
        cq.active.remove(&head)
    }

    /// Active and inadmissible workload counts of a ClusterQueue.
    pub fn cluster_queue_depth(&self, cluster_queue: &str) -> Option<(usize, usize)> {
        let ledger = self.ledger.read();
        ledger
            .cluster_queues
            .get(cluster_queue)
            .map(|cq| (cq.active.len(), cq.inadmissible.len()))
    }
}

fn created_at(workload: &Workload) -> Option<DateTime<Utc>> {
    workload.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

impl PendingLedger for QueueManager {
    fn add_or_update_workload(&self, workload: &Workload) -> bool {
        self.ledger.write().add_or_update(workload)
    }

    fn update_workload(&self, old: &Workload, new: &Workload) -> bool {
        let mut ledger = self.ledger.write();
        ledger.delete(old);
        ledger.add_or_update(new)
    }

    fn delete_workload(&self, workload: &Workload) {
        self.ledger.write().delete(workload)
    }

    fn queue_for_workload_exists(&self, workload: &Workload) -> bool {
        self.ledger.read().queues.contains_key(&queue_key(workload))
    }

    fn cluster_queue_for_workload(&self, workload: &Workload) -> (String, bool) {
        let ledger = self.ledger.read();
        match ledger.queues.get(&queue_key(workload)) {
            Some(queue) => (
                queue.cluster_queue.clone(),
                ledger.cluster_queues.contains_key(&queue.cluster_queue),
            ),
            None => (String::new(), false),
        }
    }

    fn pending_workloads(&self, queue: &ObjectKey) -> Result<i32, Error> {
        let ledger = self.ledger.read();
        let entry = ledger
            .queues
            .get(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        Ok(i32::try_from(entry.workloads.len()).unwrap_or(i32::MAX))
    }

    fn queue_associated_inadmissible_workloads(&self, workload: &Workload) {
        let mut ledger = self.ledger.write();
        let cq_name = match workload.admitted_cluster_queue() {
            Some(name) => name.to_string(),
            None => match ledger.queues.get(&queue_key(workload)) {
                Some(queue) => queue.cluster_queue.clone(),
                None => return,
            },
        };
        if let Some(cq) = ledger.cluster_queues.get_mut(&cq_name) {
            if !cq.inadmissible.is_empty() {
                debug!(
                    "Requeueing {} inadmissible workloads of ClusterQueue {}",
                    cq.inadmissible.len(),
                    cq_name
                );
            }
            let parked: Vec<(ObjectKey, Workload)> = cq.inadmissible.drain().collect();
            cq.active.extend(parked);
        }
    }

    fn add_queue(&self, queue: &Queue, known: &[Workload]) -> Result<(), Error> {
        let key = queue.key();
        let mut ledger = self.ledger.write();
        if ledger.queues.contains_key(&key) {
            return Err(Error::QueueAlreadyExists(key.to_string()));
        }
        ledger.queues.insert(
            key.clone(),
            QueueEntry {
                cluster_queue: queue.spec.cluster_queue.clone(),
                workloads: HashMap::new(),
            },
        );
        for workload in known {
            if queue_key(workload) == key && classify(workload) == WorkloadState::Pending {
                ledger.add_or_update(workload);
            }
        }
        Ok(())
    }

    fn update_queue(&self, queue: &Queue) -> Result<(), Error> {
        let key = queue.key();
        let mut ledger = self.ledger.write();
        let Ledger { queues, cluster_queues } = &mut *ledger;
        let entry = queues.get_mut(&key).ok_or_else(|| Error::QueueNotFound(key.to_string()))?;
        if entry.cluster_queue == queue.spec.cluster_queue {
            return Ok(());
        }
        if let Some(old_cq) = cluster_queues.get_mut(&entry.cluster_queue) {
            for wl_key in entry.workloads.keys() {
                old_cq.remove(wl_key);
            }
        }
        entry.cluster_queue = queue.spec.cluster_queue.clone();
        if let Some(new_cq) = cluster_queues.get_mut(&entry.cluster_queue) {
            for workload in entry.workloads.values() {
                new_cq.push_or_update(workload.clone());
            }
        }
        Ok(())
    }

    fn delete_queue(&self, queue: &Queue) {
        let mut ledger = self.ledger.write();
        if let Some(entry) = ledger.queues.remove(&queue.key()) {
            if let Some(cq) = ledger.cluster_queues.get_mut(&entry.cluster_queue) {
                for wl_key in entry.workloads.keys() {
                    cq.remove(wl_key);
                }
            }
        }
    }

    fn add_cluster_queue(&self, name: &str) {
        let mut ledger = self.ledger.write();
        if ledger.cluster_queues.contains_key(name) {
            return;
        }
        let mut cq = ClusterQueueEntry::default();
        for queue in ledger.queues.values().filter(|q| q.cluster_queue == name) {
            for workload in queue.workloads.values() {
                cq.push_or_update(workload.clone());
            }
        }
        ledger.cluster_queues.insert(name.to_string(), cq);
    }

    fn delete_cluster_queue(&self, name: &str) {
        self.ledger.write().cluster_queues.remove(name);
    }
}
