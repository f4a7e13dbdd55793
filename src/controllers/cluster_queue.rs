use std::sync::Arc;

use async_trait::async_trait;
use kube_runtime::reflector::Store;
use log::{debug, trace};

use crate::indices::{AdmissionCache, PendingLedger};
use crate::models::cluster_queue::ClusterQueue;
use crate::models::workload::Workload;
use crate::runtime::source::{EventHandler, WatchEvent};

/// Keeps both indices aware of which ClusterQueues exist.
pub struct ClusterQueueObserver {
    queues: Arc<dyn PendingLedger>,
    cache: Arc<dyn AdmissionCache>,
    workloads: Store<Workload>,
}

impl ClusterQueueObserver {
    pub fn new(
        queues: Arc<dyn PendingLedger>,
        cache: Arc<dyn AdmissionCache>,
        workloads: Store<Workload>,
    ) -> Self {
        ClusterQueueObserver {
            queues,
            cache,
            workloads,
        }
    }
}

fn name_of(cq: &ClusterQueue) -> &str {
    cq.metadata.name.as_deref().unwrap_or_default()
}

#[async_trait]
impl EventHandler<ClusterQueue> for ClusterQueueObserver {
    async fn handle(&self, event: WatchEvent<ClusterQueue>) {
        match &event {
            WatchEvent::Create(cq) => {
                debug!("ClusterQueue create event: {}", name_of(cq));
                self.queues.add_cluster_queue(name_of(cq));
                self.cache.add_cluster_queue(name_of(cq), &self.workloads.state());
            }
            WatchEvent::Delete { object, .. } => {
                debug!("ClusterQueue delete event: {}", name_of(object));
                self.queues.delete_cluster_queue(name_of(object));
                self.cache.delete_cluster_queue(name_of(object));
            }
            WatchEvent::Update { new, .. } => trace!("ClusterQueue update event: {}", name_of(new)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube_runtime::watcher::Event;

    use super::ClusterQueueObserver;
    use crate::indices::admission::MockAdmissionCache;
    use crate::indices::pending::MockPendingLedger;
    use crate::indices::{AdmissionCache, ClusterQueueCache, PendingLedger, QueueManager};
    use crate::models::cluster_queue::{ClusterQueue, ClusterQueueSpec};
    use crate::models::workload::{
        Admission, ConditionStatus, Workload, WorkloadCondition, WorkloadSpec, WorkloadStatus,
        WORKLOAD_FINISHED,
    };
    use crate::runtime::source::{EventHandler, EventTranslator, WatchEvent};

    fn admitted(name: &str) -> Workload {
        let mut wl = Workload::new(
            name,
            WorkloadSpec {
                pod_sets: vec![],
                queue_name: "q1".to_string(),
                admission: Some(Admission {
                    cluster_queue: "cq1".to_string(),
                    pod_set_flavors: vec![],
                }),
                priority_class_name: None,
                priority: None,
            },
        );
        wl.metadata.namespace = Some("default".to_string());
        wl
    }

    #[tokio::test]
    async fn registers_with_known_workloads() {
        let mut translator = EventTranslator::new();
        translator.translate(Event::Applied(admitted("a")));

        let mut queues = MockPendingLedger::new();
        queues
            .expect_add_cluster_queue()
            .withf(|name: &str| name == "cq1")
            .times(1)
            .return_const(());
        queues
            .expect_delete_cluster_queue()
            .withf(|name: &str| name == "cq1")
            .times(1)
            .return_const(());
        let mut cache = MockAdmissionCache::new();
        cache
            .expect_add_cluster_queue()
            .withf(|name: &str, known: &[Workload]| name == "cq1" && known.len() == 1)
            .times(1)
            .return_const(());
        cache
            .expect_delete_cluster_queue()
            .times(1)
            .return_const(());

        let observer =
            ClusterQueueObserver::new(Arc::new(queues), Arc::new(cache), translator.store());
        let cq = ClusterQueue::new("cq1", ClusterQueueSpec::default());
        observer.handle(WatchEvent::Create(cq.clone())).await;
        observer
            .handle(WatchEvent::Update {
                old: cq.clone(),
                new: cq.clone(),
            })
            .await;
        observer
            .handle(WatchEvent::Delete {
                object: cq,
                state_unknown: false,
            })
            .await;
    }

    #[tokio::test]
    async fn finished_workloads_are_not_adopted() {
        let mut done = admitted("done");
        let mut status = WorkloadStatus::default();
        status.set_condition(WorkloadCondition::new(
            WORKLOAD_FINISHED,
            ConditionStatus::True,
            "",
            "",
            Time(Utc::now()),
        ));
        done.status = Some(status);

        let mut translator = EventTranslator::new();
        translator.translate(Event::Applied(done.clone()));
        translator.translate(Event::Applied(admitted("a")));

        let cache = Arc::new(ClusterQueueCache::new());
        let observer = ClusterQueueObserver::new(
            Arc::new(QueueManager::new()) as Arc<dyn PendingLedger>,
            Arc::clone(&cache) as Arc<dyn AdmissionCache>,
            translator.store(),
        );
        observer
            .handle(WatchEvent::Create(ClusterQueue::new("cq1", ClusterQueueSpec::default())))
            .await;

        assert!(!cache.contains(&done.key()));
        assert!(cache.contains(&admitted("a").key()));
        assert_eq!(cache.admitted_workloads("cq1"), Some(1));
    }
}
