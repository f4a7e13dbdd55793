//! Watch event source.
//!
//! kube-runtime watchers only report what an object looks like now. The
//! controllers need the previous snapshot as well, and need to know when a
//! deletion was inferred from a relist rather than observed. `EventTranslator`
//! compares every raw watcher event with the reflector store it maintains and
//! turns it into `WatchEvent`s.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use kube::Resource;
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher;
use log::warn;
use tokio_util::sync::CancellationToken;

use crate::utils::error::Error;

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// A change notification with the snapshots needed to interpret it.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Create(K),
    Update { old: K, new: K },
    /// `state_unknown` is set when the deletion was inferred because the
    /// object was missing from a relist; `object` is then the last snapshot
    /// observed and may be stale.
    Delete { object: K, state_unknown: bool },
}

impl<K> WatchEvent<K> {
    /// The most recent snapshot the event carries.
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Create(object) => object,
            WatchEvent::Update { new, .. } => new,
            WatchEvent::Delete { object, .. } => object,
        }
    }
}

#[async_trait]
pub trait EventHandler<K>: Send + Sync {
    async fn handle(&self, event: WatchEvent<K>);
}

/// Owns the reflector store of one watch. Readers obtained from `store` see
/// every event once it has been translated.
pub struct EventTranslator<K>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash,
{
    writer: Writer<K>,
}

impl<K> Default for EventTranslator<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Default + Eq + Hash,
{
    fn default() -> Self {
        EventTranslator {
            writer: Writer::default(),
        }
    }
}

impl<K> EventTranslator<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Default + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    pub fn translate(&mut self, event: watcher::Event<K>) -> Vec<WatchEvent<K>> {
        let store = self.writer.as_reader();
        let events = match &event {
            watcher::Event::Applied(object) => changed(&store, object).into_iter().collect(),
            watcher::Event::Deleted(object) => vec![WatchEvent::Delete {
                object: object.clone(),
                state_unknown: false,
            }],
            watcher::Event::Restarted(objects) => {
                let seen: HashSet<ObjectRef<K>> = objects.iter().map(ObjectRef::from_obj).collect();
                let mut events: Vec<WatchEvent<K>> =
                    objects.iter().filter_map(|o| changed(&store, o)).collect();
                let missing = store
                    .state()
                    .into_iter()
                    .filter(|o| !seen.contains(&ObjectRef::from_obj(o)));
                events.extend(missing.map(|object| WatchEvent::Delete {
                    object,
                    state_unknown: true,
                }));
                events
            }
        };
        self.writer.apply_watcher_event(&event);
        events
    }
}

fn changed<K>(store: &Store<K>, object: &K) -> Option<WatchEvent<K>>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Default + Eq + Hash,
{
    match store.get(&ObjectRef::from_obj(object)) {
        None => Some(WatchEvent::Create(object.clone())),
        Some(old)
            if old.meta().resource_version.is_some()
                && old.meta().resource_version == object.meta().resource_version =>
        {
            None
        }
        Some(old) => Some(WatchEvent::Update {
            old,
            new: object.clone(),
        }),
    }
}

/// Feeds every event of a kube-runtime watch into `handler` and yields a
/// reconcile trigger for each object it touched, once the handler is done
/// with it. Watch errors are logged and the stream is polled again after a
/// delay; the watcher relists on its own.
pub fn dispatch<K, H, S>(
    events: S,
    mut translator: EventTranslator<K>,
    handler: Arc<H>,
    token: CancellationToken,
) -> impl Stream<Item = Result<ObjectRef<K>, Error>>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Clone + Default + Eq + Hash,
    H: EventHandler<K> + ?Sized,
    S: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    events
        .then(move |event| {
            let translated = event.map(|event| translator.translate(event));
            let handler = Arc::clone(&handler);
            let token = token.clone();
            async move {
                match translated {
                    Ok(events) => {
                        let mut touched = Vec::with_capacity(events.len());
                        for event in events {
                            touched.push(ObjectRef::from_obj(event.object()));
                            handler.handle(event).await;
                        }
                        touched
                    }
                    Err(err) => {
                        warn!("Watch stream error: {}", err);
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                        }
                        vec![]
                    }
                }
            }
        })
        .flat_map(stream::iter)
        .map(Ok)
}
