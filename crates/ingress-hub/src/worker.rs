//! Snapshot worker: drains the work queue, rebuilds, publishes
//!
//! Exactly one worker runs per hub, so rebuilds never overlap and snapshots
//! reach the hub in the order they were built.

use std::collections::HashMap;
use std::sync::Arc;

use ingress_common::retry::RetryPolicy;
use tracing::{debug, error, info, warn};

use crate::builder::SnapshotBuilder;
use crate::hub::Publisher;
use crate::queue::WorkQueue;
use crate::types::Snapshot;

/// Processes queued keys one at a time
pub struct SnapshotWorker {
    queue: Arc<WorkQueue>,
    builder: SnapshotBuilder,
    publisher: Publisher<Snapshot>,
    retry: RetryPolicy,
    failures: HashMap<String, u32>,
}

impl SnapshotWorker {
    /// Create a worker publishing into `publisher`
    pub fn new(
        queue: Arc<WorkQueue>,
        builder: SnapshotBuilder,
        publisher: Publisher<Snapshot>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            builder,
            publisher,
            retry,
            failures: HashMap::new(),
        }
    }

    /// Run until the queue is shut down and drained.
    ///
    /// Returns the publisher so the caller decides when the hub closes.
    pub async fn run(mut self) -> Publisher<Snapshot> {
        info!(max_attempts = self.retry.max_attempts, "Snapshot worker started");

        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
        }

        info!("Snapshot worker stopped");
        self.publisher
    }

    async fn process(&mut self, key: &str) {
        match self.builder.build(key).await {
            Ok(snapshot) => {
                self.failures.remove(key);
                debug!(
                    key = %key,
                    services = snapshot.services.len(),
                    "Publishing snapshot"
                );
                self.publisher.publish(snapshot);
                self.queue.done(key);
            }
            Err(e) => {
                let attempts = self.record_failure(key);

                if !self.retry.should_retry(attempts) {
                    error!(
                        key = %key,
                        attempts,
                        error = %e,
                        "Giving up on key after repeated rebuild failures"
                    );
                    self.failures.remove(key);
                    self.queue.done(key);
                    return;
                }

                warn!(
                    key = %key,
                    attempts,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Rebuild failed, requeuing"
                );
                if !self.queue.requeue(key) {
                    debug!(key = %key, "Queue shutting down, dropping failed key");
                    self.failures.remove(key);
                }
                // Let the watch loops run between retries of a failing key
                tokio::task::yield_now().await;
            }
        }
    }

    /// Count one more failed rebuild of `key`, saturating at `u32::MAX`
    fn record_failure(&mut self, key: &str) -> u32 {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::channel;
    use crate::index::{resource_index, IndexWriter};
    use crate::secrets::{MockSecretMaterializer, SecretMaterializer};
    use ingress_common::Error;
    use k8s_openapi::api::core::v1::Endpoints;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, ServiceBackendPort,
    };
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn ingress(name: &str, host: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: name.to_string(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(80),
                                        name: None,
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Materializer failing its first `failures` calls, counting every call
    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> Arc<dyn SecretMaterializer> {
        let mut mock = MockSecretMaterializer::new();
        mock.expect_resolve().returning(move |_| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                Err(Error::secret("default", "web-tls", "secret not found"))
            } else {
                Ok(BTreeMap::new())
            }
        });
        Arc::new(mock)
    }

    fn worker(
        materializer: Arc<dyn SecretMaterializer>,
        retry: RetryPolicy,
    ) -> (
        SnapshotWorker,
        Arc<WorkQueue>,
        IndexWriter<Ingress>,
        crate::hub::Subscriber<Snapshot>,
    ) {
        let (ing_writer, ing_reader) = resource_index();
        let (_ep_writer, ep_reader) = resource_index::<Endpoints>();
        let queue = Arc::new(WorkQueue::new());
        let (publisher, subscriber) = channel();
        let builder = SnapshotBuilder::new(ing_reader, ep_reader, materializer);
        (
            SnapshotWorker::new(queue.clone(), builder, publisher, retry),
            queue,
            ing_writer,
            subscriber,
        )
    }

    #[tokio::test]
    async fn successful_build_is_published() {
        let calls = Arc::new(AtomicU32::new(0));
        let (worker, queue, mut ingresses, mut snapshots) =
            worker(flaky(0, calls.clone()), RetryPolicy::unbounded());
        ingresses.insert("default/web".into(), ingress("web", "web.com"));
        queue.add("default/web");

        let handle = tokio::spawn(worker.run());
        let snapshot = tokio::time::timeout(Duration::from_secs(1), snapshots.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.services.len(), 1);
        assert_eq!(snapshot.delta.len(), 1);

        queue.shut_down();
        let publisher = handle.await.unwrap();
        drop(publisher);
        assert!(snapshots.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_key_is_retried_until_it_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let (worker, queue, mut ingresses, mut snapshots) =
            worker(flaky(3, calls.clone()), RetryPolicy::unbounded());
        ingresses.insert("default/web".into(), ingress("web", "web.com"));
        queue.add("default/web");

        let handle = tokio::spawn(worker.run());
        let snapshot = tokio::time::timeout(Duration::from_secs(1), snapshots.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.services[0].host, "web.com");
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        queue.shut_down();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failing_key_stays_queued_without_publishing() {
        let calls = Arc::new(AtomicU32::new(0));
        let (worker, queue, mut ingresses, mut snapshots) =
            worker(flaky(u32::MAX, calls.clone()), RetryPolicy::unbounded());
        ingresses.insert("default/web".into(), ingress("web", "web.com"));
        queue.add("default/web");

        let handle = tokio::spawn(worker.run());
        tokio::time::timeout(Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) < 5 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(snapshots.try_recv().is_none());

        queue.shut_down();
        handle.await.unwrap();
        assert!(snapshots.try_recv().is_none());
    }

    #[tokio::test]
    async fn bounded_policy_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let (worker, queue, mut ingresses, mut snapshots) =
            worker(flaky(u32::MAX, calls.clone()), RetryPolicy::with_max_attempts(3));
        ingresses.insert("default/web".into(), ingress("web", "web.com"));
        queue.add("default/web");

        let handle = tokio::spawn(worker.run());
        tokio::time::timeout(Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) < 3 || !queue.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        queue.shut_down();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(snapshots.try_recv().is_none());
    }

    #[test]
    fn failure_count_saturates_instead_of_wrapping() {
        let calls = Arc::new(AtomicU32::new(0));
        let (mut worker, _queue, _ingresses, _snapshots) =
            worker(flaky(0, calls), RetryPolicy::unbounded());
        worker.failures.insert("default/web".to_string(), u32::MAX - 1);

        assert_eq!(worker.record_failure("default/web"), u32::MAX);
        assert_eq!(worker.record_failure("default/web"), u32::MAX);
        assert!(worker.retry.should_retry(worker.failures["default/web"]));
        assert_eq!(worker.record_failure("default/other"), 1);
    }

    #[tokio::test]
    async fn queued_keys_drain_after_shutdown() {
        let calls = Arc::new(AtomicU32::new(0));
        let (worker, queue, mut ingresses, mut snapshots) =
            worker(flaky(0, calls.clone()), RetryPolicy::unbounded());
        ingresses.insert("default/a".into(), ingress("a", "a.com"));
        ingresses.insert("default/b".into(), ingress("b", "b.com"));
        queue.add("default/a");
        queue.add("default/b");
        queue.shut_down();

        let publisher = worker.run().await;
        drop(publisher);

        // Both keys were processed; only the latest snapshot survives
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let snapshot = snapshots.recv().await.unwrap();
        assert_eq!(snapshot.delta[0].host, "b.com");
        assert!(snapshots.recv().await.is_none());
    }
}
