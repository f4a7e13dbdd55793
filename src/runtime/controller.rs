//! Reconcile loops.
//!
//! Each loop is a kube-runtime `applier` over a reflector store. Triggers come
//! from the watch dispatch and any other stream merged into it; the applier
//! keeps one reconcile in flight per object and requeues it on failure with
//! a per-object exponential backoff.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use kube::Resource;
use kube_runtime::applier;
use kube_runtime::controller::{self, Context, ReconcilerAction};
use kube_runtime::reflector::{ObjectRef, Store};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::models::key::ObjectKey;
use crate::utils::error::Error;

/// A reconciliation loop body. It receives the latest snapshot from the
/// loop's store; any error returned is retried with backoff.
#[async_trait]
pub trait Reconciler<K: Send + Sync>: Send + Sync {
    async fn reconcile(&self, object: &K) -> Result<ReconcilerAction, Error>;
}

/// Per-object exponential backoff, reset by the first success.
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure of `key` and returns how long to wait before retrying.
    pub fn next(&self, key: &ObjectKey) -> Duration {
        let failures = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let factor = 2u32.saturating_pow(failures - 1);
        std::cmp::min(self.base.saturating_mul(factor), self.max)
    }

    pub fn reset(&self, key: &ObjectKey) {
        self.failures.lock().remove(key);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("reconciliation of {key} failed: {source}")]
pub struct ReconcileFailure {
    source: Error,
    key: ObjectKey,
    retry_in: Duration,
}

/// Context injected with each `reconcile` and `on_error` invocation.
struct ContextData<R: ?Sized> {
    name: &'static str,
    reconciler: Arc<R>,
    backoff: Backoff,
}

fn reconcile<K, R>(
    object: K,
    context: Context<ContextData<R>>,
) -> BoxFuture<'static, Result<ReconcilerAction, ReconcileFailure>>
where
    K: Resource + Send + Sync + 'static,
    R: Reconciler<K> + ?Sized + 'static,
{
    async move {
        let data = context.get_ref();
        let key = ObjectKey::from_resource(&object);
        match data.reconciler.reconcile(&object).await {
            Ok(action) => {
                data.backoff.reset(&key);
                Ok(action)
            }
            Err(source) => Err(ReconcileFailure {
                retry_in: data.backoff.next(&key),
                key,
                source,
            }),
        }
    }
    .boxed()
}

fn on_error<R: ?Sized>(
    failure: &ReconcileFailure,
    context: Context<ContextData<R>>,
) -> ReconcilerAction {
    error!("{} {}", context.get_ref().name, failure);
    ReconcilerAction {
        requeue_after: Some(failure.retry_in),
    }
}

/// Reconciles every object `triggers` names, reading it from `store`, until
/// `token` is cancelled. Reconciles in flight at cancellation are finished.
pub async fn run<K, R, S>(
    name: &'static str,
    reconciler: Arc<R>,
    store: Store<K>,
    triggers: S,
    backoff: Backoff,
    token: CancellationToken,
) where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Debug + Eq + Hash + Clone + Unpin,
    R: Reconciler<K> + ?Sized + 'static,
    S: Stream<Item = Result<ObjectRef<K>, Error>>,
{
    let context = Context::new(ContextData {
        name,
        reconciler,
        backoff,
    });
    applier(
        reconcile::<K, R>,
        on_error::<R>,
        context,
        store,
        triggers.take_until(token.cancelled()),
    )
    .for_each(|result| async move {
        match result {
            Ok((object, _)) => trace!("{} reconciled {}", name, object),
            // deleted since it was triggered
            Err(controller::Error::ObjectNotFound { obj_ref, .. }) => {
                debug!("{} object {} is gone", name, obj_ref)
            }
            // logged by on_error
            Err(controller::Error::ReconcilerFailed { .. }) => {}
            Err(err) => warn!("{} loop error: {}", name, err),
        }
    })
    .await;
    debug!("{} loop stopped", name);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::channel::mpsc;
    use futures::SinkExt;
    use kube_runtime::controller::ReconcilerAction;
    use kube_runtime::reflector::ObjectRef;
    use kube_runtime::watcher::Event;
    use parking_lot::Mutex;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use super::{run, Backoff, Reconciler};
    use crate::models::key::ObjectKey;
    use crate::models::queue::{Queue, QueueSpec};
    use crate::runtime::source::EventTranslator;
    use crate::utils::error::Error;

    struct Flaky {
        failures_left: AtomicUsize,
        seen: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Reconciler<Queue> for Flaky {
        async fn reconcile(&self, queue: &Queue) -> Result<ReconcilerAction, Error> {
            self.seen.lock().push(Instant::now());
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::QueueNotFound(queue.key().to_string()));
            }
            Ok(ReconcilerAction { requeue_after: None })
        }
    }

    fn queue(name: &str) -> Queue {
        let mut q = Queue::new(
            name,
            QueueSpec {
                cluster_queue: "cq1".to_string(),
            },
        );
        q.metadata.namespace = Some("default".to_string());
        q
    }

    #[test]
    fn backoff_doubles_until_reset() {
        let backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(15));
        let key = ObjectKey::new("default", "q1");

        assert_eq!(backoff.next(&key), Duration::from_millis(5));
        assert_eq!(backoff.next(&key), Duration::from_millis(10));
        assert_eq!(backoff.next(&key), Duration::from_millis(15));
        assert_eq!(backoff.next(&ObjectKey::new("default", "q2")), Duration::from_millis(5));

        backoff.reset(&key);
        assert_eq!(backoff.next(&key), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconciles_are_retried_until_success() {
        let mut translator = EventTranslator::new();
        translator.translate(Event::Applied(queue("q1")));
        let reconciler = Arc::new(Flaky {
            failures_left: AtomicUsize::new(2),
            seen: Mutex::new(vec![]),
        });
        let token = CancellationToken::new();
        let (mut triggers, receiver) = mpsc::unbounded::<Result<ObjectRef<Queue>, Error>>();

        let scenario = async {
            triggers
                .send(Ok(ObjectRef::new("q1").within("default")))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        };
        tokio::join!(
            scenario,
            run(
                "test",
                Arc::clone(&reconciler),
                translator.store(),
                receiver,
                Backoff::new(Duration::from_millis(5), Duration::from_secs(1)),
                token.clone(),
            )
        );

        let seen = reconciler.seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen[1] - seen[0] >= Duration::from_millis(5));
        assert!(seen[2] - seen[1] >= Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_for_unknown_objects_are_skipped() {
        let translator: EventTranslator<Queue> = EventTranslator::new();
        let reconciler = Arc::new(Flaky {
            failures_left: AtomicUsize::new(0),
            seen: Mutex::new(vec![]),
        });
        let token = CancellationToken::new();
        let (mut triggers, receiver) = mpsc::unbounded::<Result<ObjectRef<Queue>, Error>>();

        let scenario = async {
            triggers
                .send(Ok(ObjectRef::new("gone").within("default")))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        };
        tokio::join!(
            scenario,
            run(
                "test",
                Arc::clone(&reconciler),
                translator.store(),
                receiver,
                Backoff::new(Duration::from_millis(5), Duration::from_secs(1)),
                token.clone(),
            )
        );

        assert!(reconciler.seen.lock().is_empty());
    }
}
