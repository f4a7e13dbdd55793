//! Admitted workload cache, keyed by ClusterQueue.

use std::collections::{BTreeMap, BTreeSet, HashMap};

#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;

use crate::models::key::ObjectKey;
use crate::models::lifecycle::{classify, WorkloadState};
use crate::models::workload::Workload;
use crate::utils::error::Error;

/// Capacity bookkeeping of admitted workloads.
#[cfg_attr(test, automock)]
pub trait AdmissionCache: Send + Sync {
    /// Returns false if the workload is not admitted or its ClusterQueue is
    /// not known yet.
    fn add_or_update_workload(&self, workload: &Workload) -> bool;

    /// Moves the bookkeeping of `old` over to `new`. A `new` without
    /// admission only removes `old`.
    fn update_workload(&self, old: &Workload, new: &Workload) -> Result<(), Error>;

    fn delete_workload(&self, workload: &Workload) -> Result<(), Error>;

    /// Registers a ClusterQueue, adopting the workloads among `known` it
    /// admitted.
    fn add_cluster_queue(&self, name: &str, known: &[Workload]);

    fn delete_cluster_queue(&self, name: &str);
}

#[derive(Default)]
struct CachedClusterQueue {
    workloads: HashMap<ObjectKey, Workload>,
    // admitted pods per flavor
    usage: BTreeMap<String, i64>,
}

impl CachedClusterQueue {
    fn add(&mut self, workload: &Workload) {
        let key = workload.key();
        if let Some(previous) = self.workloads.remove(&key) {
            self.account(&previous, -1);
        }
        self.account(workload, 1);
        self.workloads.insert(key, workload.clone());
    }

    fn remove(&mut self, workload: &Workload) {
        if let Some(previous) = self.workloads.remove(&workload.key()) {
            self.account(&previous, -1);
        }
    }

    fn account(&mut self, workload: &Workload, sign: i64) {
        let admission = match &workload.spec.admission {
            Some(admission) => admission,
            None => return,
        };
        for assignment in &admission.pod_set_flavors {
            let count = workload
                .spec
                .pod_sets
                .iter()
                .find(|ps| ps.name == assignment.name)
                .map(|ps| i64::from(ps.count))
                .unwrap_or(0);
            let flavors: BTreeSet<&String> = assignment.flavors.values().collect();
            for flavor in flavors {
                let used = self.usage.entry(flavor.clone()).or_insert(0);
                *used += sign * count;
                if *used == 0 {
                    self.usage.remove(flavor);
                }
            }
        }
    }
}

/// In-memory `AdmissionCache`.
#[derive(Default)]
pub struct ClusterQueueCache {
    cluster_queues: RwLock<HashMap<String, CachedClusterQueue>>,
}

impl ClusterQueueCache {
    pub fn new() -> Self {
        ClusterQueueCache::default()
    }

    pub fn admitted_workloads(&self, cluster_queue: &str) -> Option<usize> {
        self.cluster_queues.read().get(cluster_queue).map(|cq| cq.workloads.len())
    }

    pub fn flavor_usage(&self, cluster_queue: &str) -> BTreeMap<String, i64> {
        self.cluster_queues
            .read()
            .get(cluster_queue)
            .map(|cq| cq.usage.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.cluster_queues.read().values().any(|cq| cq.workloads.contains_key(key))
    }
}

fn owner(workload: &Workload) -> Result<&str, Error> {
    workload
        .admitted_cluster_queue()
        .ok_or_else(|| Error::WorkloadNotAdmitted(workload.key().to_string()))
}

impl AdmissionCache for ClusterQueueCache {
    fn add_or_update_workload(&self, workload: &Workload) -> bool {
        let name = match workload.admitted_cluster_queue() {
            Some(name) => name,
            None => return false,
        };
        match self.cluster_queues.write().get_mut(name) {
            Some(cq) => {
                cq.add(workload);
                true
            }
            None => false,
        }
    }

    fn update_workload(&self, old: &Workload, new: &Workload) -> Result<(), Error> {
        let mut cluster_queues = self.cluster_queues.write();
        if let Some(name) = old.admitted_cluster_queue() {
            let cq = cluster_queues
                .get_mut(name)
                .ok_or_else(|| Error::ClusterQueueNotFound(name.to_string()))?;
            cq.remove(old);
        }
        let name = match new.admitted_cluster_queue() {
            Some(name) => name,
            None => return Ok(()),
        };
        let cq = cluster_queues
            .get_mut(name)
            .ok_or_else(|| Error::ClusterQueueNotFound(name.to_string()))?;
        cq.add(new);
        Ok(())
    }

    fn delete_workload(&self, workload: &Workload) -> Result<(), Error> {
        let name = owner(workload)?;
        let mut cluster_queues = self.cluster_queues.write();
        let cq = cluster_queues
            .get_mut(name)
            .ok_or_else(|| Error::ClusterQueueNotFound(name.to_string()))?;
        cq.remove(workload);
        Ok(())
    }

    fn add_cluster_queue(&self, name: &str, known: &[Workload]) {
        let mut cluster_queues = self.cluster_queues.write();
        if cluster_queues.contains_key(name) {
            return;
        }
        let mut cq = CachedClusterQueue::default();
        // finished workloads keep their admission but hold no capacity
        let admitted = known.iter().filter(|wl| {
            classify(wl) == WorkloadState::Admitted && wl.admitted_cluster_queue() == Some(name)
        });
        for workload in admitted {
            cq.add(workload);
        }
        cluster_queues.insert(name.to_string(), cq);
    }

    fn delete_cluster_queue(&self, name: &str) {
        self.cluster_queues.write().remove(name);
    }
}
