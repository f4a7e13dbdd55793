//! Controllers and the manager wiring them to watches and reconcile loops.

pub mod client;
pub mod cluster_queue;
pub mod queue;
pub mod workload;

use std::sync::Arc;
use std::time::Duration;

use futures::{future, stream, Stream, StreamExt};
use kube::api::ListParams;
use kube::{Api, Client, Resource};
use kube_runtime::watcher::{self, watcher};
use log::info;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use self::client::{KubeApiClient, KubeClient};
use self::cluster_queue::ClusterQueueObserver;
use self::queue::{delayed_queue_triggers, notification_channel, QueueReconciler};
use self::workload::{WorkloadReconciler, WorkloadUpdateWatcher};
use crate::indices::{AdmissionCache, ClusterQueueCache, PendingLedger, QueueManager};
use crate::models::cluster_queue::ClusterQueue;
use crate::models::queue::Queue;
use crate::models::workload::Workload;
use crate::runtime::controller::{self, Backoff};
use crate::runtime::source::{dispatch, EventTranslator};
use crate::utils::config::ControllerConfig;

/// The two reconciliation loops and the ClusterQueue observer, sharing one
/// pending ledger and one admission cache.
pub struct Controllers {
    pub workloads: Arc<WorkloadReconciler>,
    pub queues: Arc<QueueReconciler>,
    pub cluster_queues: Arc<ClusterQueueObserver>,
    workload_translator: EventTranslator<Workload>,
    queue_translator: EventTranslator<Queue>,
    updates: mpsc::Receiver<Workload>,
    batch_period: Duration,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl Controllers {
    pub fn new(client: Arc<dyn KubeClient>, config: &ControllerConfig) -> Self {
        let ledger = Arc::new(QueueManager::new());
        let cache = Arc::new(ClusterQueueCache::new());
        let workload_translator = EventTranslator::new();
        let queue_translator = EventTranslator::new();
        let (notifier, updates) =
            notification_channel(config.notification_buffer, config.notification_overflow);

        let queues = Arc::new(QueueReconciler::new(
            Arc::clone(&client),
            Arc::clone(&ledger) as Arc<dyn PendingLedger>,
            workload_translator.store(),
        ));
        let workloads = Arc::new(WorkloadReconciler::new(
            client,
            Arc::clone(&ledger) as Arc<dyn PendingLedger>,
            Arc::clone(&cache) as Arc<dyn AdmissionCache>,
            vec![Arc::new(notifier) as Arc<dyn WorkloadUpdateWatcher>],
        ));
        let cluster_queues = Arc::new(ClusterQueueObserver::new(
            ledger,
            cache,
            workload_translator.store(),
        ));

        Controllers {
            workloads,
            queues,
            cluster_queues,
            workload_translator,
            queue_translator,
            updates,
            batch_period: config.updates_batch_period(),
            retry_base_delay: config.retry_base_delay(),
            retry_max_delay: config.retry_max_delay(),
        }
    }

    /// Feeds the three watches into the ClusterQueue observer and both
    /// reconcile loops until `token` is cancelled.
    pub async fn run<C, Q, W>(
        self,
        cluster_queue_events: C,
        queue_events: Q,
        workload_events: W,
        token: CancellationToken,
    ) where
        C: Stream<Item = watcher::Result<watcher::Event<ClusterQueue>>>,
        Q: Stream<Item = watcher::Result<watcher::Event<Queue>>>,
        W: Stream<Item = watcher::Result<watcher::Event<Workload>>>,
    {
        let Controllers {
            workloads,
            queues,
            cluster_queues,
            workload_translator,
            queue_translator,
            updates,
            batch_period,
            retry_base_delay,
            retry_max_delay,
        } = self;
        let workload_store = workload_translator.store();
        let queue_store = queue_translator.store();

        // ClusterQueues have no reconcile loop; their events only feed the indices
        let cluster_queue_events = dispatch(
            cluster_queue_events,
            EventTranslator::new(),
            cluster_queues,
            token.clone(),
        )
        .take_until(token.cancelled())
        .for_each(|_| future::ready(()));
        let workload_triggers =
            dispatch(workload_events, workload_translator, Arc::clone(&workloads), token.clone());
        let queue_triggers = stream::select(
            dispatch(queue_events, queue_translator, Arc::clone(&queues), token.clone()),
            delayed_queue_triggers(updates, batch_period),
        );

        tokio::join!(
            cluster_queue_events,
            controller::run(
                "workload",
                workloads,
                workload_store,
                workload_triggers,
                Backoff::new(retry_base_delay, retry_max_delay),
                token.clone(),
            ),
            controller::run(
                "queue",
                queues,
                queue_store,
                queue_triggers,
                Backoff::new(retry_base_delay, retry_max_delay),
                token.clone(),
            ),
        );
    }
}

fn scoped<K>(client: &Client, namespace: &Option<String>) -> Api<K>
where
    K: Resource,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Watches ClusterQueues, Queues and Workloads and runs the controllers until
/// `token` is cancelled.
pub async fn run(client: Client, config: ControllerConfig, token: CancellationToken) {
    let controllers = Controllers::new(Arc::new(KubeApiClient::new(client.clone())), &config);

    info!(
        "Starting controllers, watching {}",
        config.namespace.as_deref().unwrap_or("all namespaces")
    );
    controllers
        .run(
            watcher(Api::<ClusterQueue>::all(client.clone()), ListParams::default()),
            watcher(scoped::<Queue>(&client, &config.namespace), ListParams::default()),
            watcher(scoped::<Workload>(&client, &config.namespace), ListParams::default()),
            token,
        )
        .await;
    info!("Controllers stopped");
}
