//! Change-driven routing snapshots over Ingress and Endpoints
//!
//! Two watch loops keep local indexes of Ingresses (routing configuration)
//! and Endpoints (service membership) and feed changed identity keys into a
//! de-duplicating [`WorkQueue`]. A single [`SnapshotWorker`] drains the queue,
//! rebuilds the full set of [`RoutingRule`]s, and publishes the result into a
//! latest-value-wins hub read by one consumer (for example a config
//! generator for a load balancer).
//!
//! ```text
//! Ingress store ──▶ watch loop ──┐
//!                                ├──▶ WorkQueue ──▶ worker ──▶ hub ──▶ consumer
//! Endpoints store ─▶ watch loop ─┘                    │
//!                                        indexes + secrets
//! ```

#![deny(missing_docs)]

pub mod builder;
pub mod hub;
pub mod index;
pub mod queue;
pub mod receivers;
pub mod secrets;
pub mod store;
pub mod types;
pub mod watch;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use ingress_common::retry::RetryPolicy;
use ingress_common::Error;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use builder::SnapshotBuilder;
pub use hub::{Publisher, Subscriber};
pub use queue::WorkQueue;
pub use receivers::{Receiver, ReceiverClient};
pub use secrets::{KubeSecretMaterializer, SecretMaterializer};
pub use store::{KubeResourceStore, ResourceKind, ResourceStore, WatchEvent};
pub use types::{RoutingRule, SecretBundle, Snapshot};
pub use worker::SnapshotWorker;

/// Default interval between full resyncs of each store
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10);

/// Default server-side watch timeout, below the client read timeout
pub const DEFAULT_WATCHER_TIMEOUT_SECS: u32 = 25;

/// Hub configuration
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Namespace to watch; all namespaces when `None`
    pub namespace: Option<String>,
    /// Interval between full resyncs of each store
    pub resync_period: Duration,
    /// How often a failing key is rebuilt before it is dropped
    pub retry: RetryPolicy,
    /// Whether Endpoints changes enqueue a rebuild of their own.
    ///
    /// Off by default: Endpoints are only indexed and read by the next
    /// rebuild an Ingress change triggers.
    pub membership_triggers_rebuild: bool,
    /// Server-side timeout of each watch request
    pub watcher_timeout_secs: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_period: DEFAULT_RESYNC_PERIOD,
            retry: RetryPolicy::unbounded(),
            membership_triggers_rebuild: false,
            watcher_timeout_secs: DEFAULT_WATCHER_TIMEOUT_SECS,
        }
    }
}

/// A running hub
pub struct HubHandle {
    /// Published snapshots; yields `None` once the hub has stopped
    pub snapshots: Subscriber<Snapshot>,
    /// Completes after the watch loops and the worker have stopped
    pub task: JoinHandle<()>,
}

/// Start the pipeline over the given stores.
///
/// Cancelling `shutdown` stops both watch loops. Keys already queued are
/// still rebuilt and published, then the hub closes.
pub fn start_hub<I, E>(
    config: &HubConfig,
    ingresses: &I,
    endpoints: &E,
    materializer: Arc<dyn SecretMaterializer>,
    shutdown: CancellationToken,
) -> HubHandle
where
    I: ResourceStore<Ingress> + ?Sized,
    E: ResourceStore<Endpoints> + ?Sized,
{
    let queue = Arc::new(WorkQueue::new());
    let (ing_writer, ing_reader) = index::resource_index::<Ingress>();
    let (ep_writer, ep_reader) = index::resource_index::<Endpoints>();
    let (publisher, subscriber) = hub::channel();

    let routing = tokio::spawn(watch::run_watch_loop(
        ingresses.watch(),
        ing_writer,
        queue.clone(),
        true,
        shutdown.clone(),
    ));
    let membership = tokio::spawn(watch::run_watch_loop(
        endpoints.watch(),
        ep_writer,
        queue.clone(),
        config.membership_triggers_rebuild,
        shutdown.clone(),
    ));

    let builder = SnapshotBuilder::new(ing_reader, ep_reader, materializer);
    let worker = tokio::spawn(
        SnapshotWorker::new(queue.clone(), builder, publisher, config.retry).run(),
    );

    let task = tokio::spawn(async move {
        let mut routing = routing;
        let mut membership = membership;

        // Either loop stopping (cancelled or stream ended) stops the other
        let (first, rest, rest_kind) = tokio::select! {
            r = &mut routing => (
                (ResourceKind::RoutingConfig, r),
                membership,
                ResourceKind::ServiceMembership,
            ),
            r = &mut membership => (
                (ResourceKind::ServiceMembership, r),
                routing,
                ResourceKind::RoutingConfig,
            ),
        };
        shutdown.cancel();
        for (kind, result) in [first, (rest_kind, rest.await)] {
            if let Err(e) = result {
                warn!(kind = %kind, error = %e, "Watch loop task failed");
            }
        }

        queue.shut_down();

        match worker.await {
            Ok(publisher) => publisher.close(),
            Err(e) => warn!(error = %e, "Snapshot worker task failed"),
        }
        info!("Hub stopped");
    });

    HubHandle {
        snapshots: subscriber,
        task,
    }
}

/// Start the pipeline against the Kubernetes API.
///
/// Both stores must answer a list request before anything is started.
pub async fn start_kube_hub(
    client: Client,
    config: &HubConfig,
    shutdown: CancellationToken,
) -> Result<HubHandle, Error> {
    let namespace = config.namespace.as_deref();
    let ingresses = KubeResourceStore::<Ingress>::new(
        client.clone(),
        namespace,
        config.resync_period,
        config.watcher_timeout_secs,
    );
    let endpoints = KubeResourceStore::<Endpoints>::new(
        client.clone(),
        namespace,
        config.resync_period,
        config.watcher_timeout_secs,
    );

    ingresses.connect().await?;
    endpoints.connect().await?;

    info!(
        namespace = namespace.unwrap_or("<all>"),
        resync_secs = config.resync_period.as_secs(),
        membership_triggers_rebuild = config.membership_triggers_rebuild,
        "Starting ingress hub"
    );

    let materializer = Arc::new(KubeSecretMaterializer::new(client));
    Ok(start_hub(config, &ingresses, &endpoints, materializer, shutdown))
}
