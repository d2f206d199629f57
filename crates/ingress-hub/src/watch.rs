//! Watch loops: apply store events to the local index and enqueue keys

use std::sync::Arc;

use futures::StreamExt;
use ingress_common::kube_utils::identity_key;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::index::IndexWriter;
use crate::queue::WorkQueue;
use crate::store::{EventStream, WatchEvent, WatchedResource};

/// Apply `event` to the index and return the key to enqueue, if any.
///
/// Modified events whose object is identical to the indexed one (typically a
/// resync) change nothing and enqueue nothing.
pub fn handle_event<K: WatchedResource>(
    index: &mut IndexWriter<K>,
    event: WatchEvent<K>,
) -> Option<String> {
    match event {
        WatchEvent::Added(obj) => {
            let key = identity_key(&obj);
            index.insert(key.clone(), obj);
            Some(key)
        }
        WatchEvent::Modified(obj) => {
            let key = identity_key(&obj);
            let unchanged = index
                .insert(key.clone(), obj.clone())
                .is_some_and(|prev| prev == obj);
            (!unchanged).then_some(key)
        }
        WatchEvent::Deleted(obj) => {
            let key = identity_key(&obj);
            index.remove(&key);
            Some(key)
        }
    }
}

/// Consume `events` until the stream ends or `shutdown` fires.
///
/// Keys are enqueued through [`ResourceKind::work_key`] so membership changes
/// never alias a routing object. When `enqueue` is false the loop only keeps
/// the index current.
///
/// [`ResourceKind::work_key`]: crate::store::ResourceKind::work_key
pub async fn run_watch_loop<K: WatchedResource>(
    mut events: EventStream<K>,
    mut index: IndexWriter<K>,
    queue: Arc<WorkQueue>,
    enqueue: bool,
    shutdown: CancellationToken,
) {
    info!(kind = %K::KIND, enqueue, "Starting watch loop");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(kind = %K::KIND, "Watch loop cancelled");
                break;
            }
            next = events.next() => match next {
                Some(Ok(event)) => {
                    if let Some(key) = handle_event(&mut index, event) {
                        if enqueue {
                            let key = K::KIND.work_key(&key);
                            debug!(kind = %K::KIND, key = %key, "Queuing key");
                            queue.add(key);
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(kind = %K::KIND, error = %e, "Watch error, stream will retry");
                }
                None => {
                    warn!(kind = %K::KIND, "Watch stream ended");
                    break;
                }
            }
        }
    }
}
