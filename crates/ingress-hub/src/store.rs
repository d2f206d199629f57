//! Cluster resource store: list + watch + resync per resource kind
//!
//! The pipeline only sees a [`ResourceStore`] producing [`WatchEvent`]s. The
//! Kubernetes implementation sits on top of `kube::runtime::watcher` and adds
//! what the watcher does not do on its own:
//! - classifying applies as Added or Modified
//! - turning objects that vanished across a relist into Deleted events
//! - periodically re-delivering every known object as Modified (resync)

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use ingress_common::kube_utils::identity_key;
use ingress_common::Error;
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// Buffered events between the kube watcher task and the watch loop
const WATCH_BUFFER: usize = 256;

/// Shortest resync period accepted; shorter values are clamped
pub const MIN_RESYNC_PERIOD: Duration = Duration::from_secs(1);

/// Prefix of work keys produced by ServiceMembership changes.
///
/// Namespaces cannot contain `:`, so prefixed keys never equal a
/// `namespace/name` identity.
pub const MEMBERSHIP_KEY_PREFIX: &str = "endpoints:";

/// The two resource kinds the hub watches
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Desired host/path to backend mappings (Ingress)
    RoutingConfig,
    /// Live endpoint addresses of a backend service (Endpoints)
    ServiceMembership,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::RoutingConfig => write!(f, "RoutingConfig"),
            ResourceKind::ServiceMembership => write!(f, "ServiceMembership"),
        }
    }
}

impl ResourceKind {
    /// Work queue key for a change to the object `identity`.
    ///
    /// RoutingConfig keys are the bare identity; ServiceMembership keys carry
    /// [`MEMBERSHIP_KEY_PREFIX`] so a rebuild they trigger has an empty delta
    /// even when an Ingress shares the name.
    pub fn work_key(&self, identity: &str) -> String {
        match self {
            ResourceKind::RoutingConfig => identity.to_string(),
            ResourceKind::ServiceMembership => format!("{MEMBERSHIP_KEY_PREFIX}{identity}"),
        }
    }
}

/// A Kubernetes type the hub can watch
pub trait WatchedResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + PartialEq
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
    /// Which side of the pipeline this type feeds
    const KIND: ResourceKind;
}

impl WatchedResource for Ingress {
    const KIND: ResourceKind = ResourceKind::RoutingConfig;
}

impl WatchedResource for Endpoints {
    const KIND: ResourceKind = ResourceKind::ServiceMembership;
}

/// A change to one watched object
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<K> {
    /// The object appeared
    Added(K),
    /// The object changed, or was re-delivered by a resync
    Modified(K),
    /// The object is gone; carries its last known state
    Deleted(K),
}

/// Infinite, restartable stream of watch events
pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>, Error>>;

/// Source of list + watch + resync events for one resource kind.
///
/// The stream starts with every existing object as [`WatchEvent::Added`].
pub trait ResourceStore<K>: Send + Sync {
    /// Start watching
    fn watch(&self) -> EventStream<K>;
}

/// Turns kube-runtime watcher events into [`WatchEvent`]s.
pub struct EventTranslator<K> {
    known: BTreeMap<String, K>,
    relisted: Option<BTreeSet<String>>,
}

impl<K: WatchedResource> Default for EventTranslator<K> {
    fn default() -> Self {
        Self {
            known: BTreeMap::new(),
            relisted: None,
        }
    }
}

impl<K: WatchedResource> EventTranslator<K> {
    /// Translator with nothing known yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one watcher event
    pub fn translate(&mut self, event: Event<K>) -> Vec<WatchEvent<K>> {
        match event {
            Event::Init => {
                self.relisted = Some(BTreeSet::new());
                vec![]
            }
            Event::InitApply(obj) => {
                let key = identity_key(&obj);
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(key.clone());
                }
                vec![self.apply(key, obj)]
            }
            Event::InitDone => {
                let Some(seen) = self.relisted.take() else {
                    return vec![];
                };
                let gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                gone.iter()
                    .filter_map(|key| self.known.remove(key))
                    .map(WatchEvent::Deleted)
                    .collect()
            }
            Event::Apply(obj) => {
                let key = identity_key(&obj);
                vec![self.apply(key, obj)]
            }
            Event::Delete(obj) => {
                self.known.remove(&identity_key(&obj));
                vec![WatchEvent::Deleted(obj)]
            }
        }
    }

    /// Every known object as a Modified event
    pub fn resync(&self) -> Vec<WatchEvent<K>> {
        self.known.values().cloned().map(WatchEvent::Modified).collect()
    }

    fn apply(&mut self, key: String, obj: K) -> WatchEvent<K> {
        match self.known.insert(key, obj.clone()) {
            Some(_) => WatchEvent::Modified(obj),
            None => WatchEvent::Added(obj),
        }
    }
}

/// [`ResourceStore`] backed by the Kubernetes API.
pub struct KubeResourceStore<K> {
    api: Api<K>,
    watcher_config: watcher::Config,
    resync_period: Duration,
}

impl<K: WatchedResource> KubeResourceStore<K> {
    /// Watch `K` in `namespace`, or in all namespaces when `None`
    pub fn new(
        client: Client,
        namespace: Option<&str>,
        resync_period: Duration,
        watcher_timeout_secs: u32,
    ) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self {
            api,
            // Must stay below the client's read timeout so the server closes
            // the watch before the client gives up on it
            watcher_config: watcher::Config::default().timeout(watcher_timeout_secs),
            resync_period: resync_period.max(MIN_RESYNC_PERIOD),
        }
    }

    /// Check that the API server answers list requests for `K`.
    ///
    /// Called once at startup; a failure here is fatal.
    pub async fn connect(&self) -> Result<(), Error> {
        self.api.list(&ListParams::default().limit(1)).await?;
        info!(kind = %K::KIND, "Connected to cluster resource store");
        Ok(())
    }
}

impl<K: WatchedResource> ResourceStore<K> for KubeResourceStore<K> {
    fn watch(&self) -> EventStream<K> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let stream =
            watcher::watcher(self.api.clone(), self.watcher_config.clone()).default_backoff();
        let period = self.resync_period;

        tokio::spawn(forward_events::<K, _, _>(stream, tx, period));

        ReceiverStream::new(rx).boxed()
    }
}

/// Translate watcher events onto `tx`, interleaving resyncs every `period`.
///
/// Returns when the watcher ends or the receiving watch loop is gone, even if
/// the watcher is idle.
async fn forward_events<K, S, E>(
    stream: S,
    tx: mpsc::Sender<Result<WatchEvent<K>, Error>>,
    period: Duration,
) where
    K: WatchedResource,
    S: Stream<Item = Result<Event<K>, E>>,
    E: fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut translator = EventTranslator::<K>::new();
    let mut resync = tokio::time::interval_at(Instant::now() + period, period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let events: Vec<Result<WatchEvent<K>, Error>> = tokio::select! {
            _ = tx.closed() => {
                debug!(kind = %K::KIND, "Watch loop gone, stopping watcher");
                return;
            }
            next = stream.next() => match next {
                Some(Ok(event)) => translator.translate(event).into_iter().map(Ok).collect(),
                Some(Err(e)) => vec![Err(Error::internal_with_context(
                    "watcher",
                    format!("{} watch failed: {}", K::KIND, e),
                ))],
                None => break,
            },
            _ = resync.tick() => translator.resync().into_iter().map(Ok).collect(),
        };

        for event in events {
            if tx.send(event).await.is_err() {
                debug!(kind = %K::KIND, "Watch loop gone, stopping watcher");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn ingress(name: &str, generation: i64) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn first_apply_is_added_then_modified() {
        let mut translator = EventTranslator::new();
        assert_eq!(
            translator.translate(Event::Apply(ingress("web", 1))),
            vec![WatchEvent::Added(ingress("web", 1))]
        );
        assert_eq!(
            translator.translate(Event::Apply(ingress("web", 2))),
            vec![WatchEvent::Modified(ingress("web", 2))]
        );
    }

    #[test]
    fn delete_forgets_object() {
        let mut translator = EventTranslator::new();
        translator.translate(Event::Apply(ingress("web", 1)));
        assert_eq!(
            translator.translate(Event::Delete(ingress("web", 1))),
            vec![WatchEvent::Deleted(ingress("web", 1))]
        );
        assert!(translator.resync().is_empty());
        assert_eq!(
            translator.translate(Event::Apply(ingress("web", 2))),
            vec![WatchEvent::Added(ingress("web", 2))]
        );
    }

    #[test]
    fn initial_list_is_delivered_as_added() {
        let mut translator = EventTranslator::new();
        assert!(translator.translate(Event::Init).is_empty());
        assert_eq!(
            translator.translate(Event::InitApply(ingress("a", 1))),
            vec![WatchEvent::Added(ingress("a", 1))]
        );
        assert_eq!(
            translator.translate(Event::InitApply(ingress("b", 1))),
            vec![WatchEvent::Added(ingress("b", 1))]
        );
        assert!(translator.translate(Event::InitDone).is_empty());
    }

    #[test]
    fn relist_deletes_objects_that_disappeared() {
        let mut translator = EventTranslator::new();
        translator.translate(Event::Apply(ingress("a", 1)));
        translator.translate(Event::Apply(ingress("b", 1)));

        // Watch desync: the relist only contains `a`
        translator.translate(Event::Init);
        assert_eq!(
            translator.translate(Event::InitApply(ingress("a", 1))),
            vec![WatchEvent::Modified(ingress("a", 1))]
        );
        assert_eq!(
            translator.translate(Event::InitDone),
            vec![WatchEvent::Deleted(ingress("b", 1))]
        );
        assert_eq!(translator.resync().len(), 1);
    }

    #[test]
    fn stray_init_done_deletes_nothing() {
        let mut translator = EventTranslator::new();
        translator.translate(Event::Apply(ingress("a", 1)));
        assert!(translator.translate(Event::InitDone).is_empty());
        assert_eq!(translator.resync().len(), 1);
    }

    #[test]
    fn resync_redelivers_everything_as_modified() {
        let mut translator = EventTranslator::new();
        translator.translate(Event::Apply(ingress("a", 1)));
        translator.translate(Event::Apply(ingress("b", 3)));

        assert_eq!(
            translator.resync(),
            vec![
                WatchEvent::Modified(ingress("a", 1)),
                WatchEvent::Modified(ingress("b", 3)),
            ]
        );
    }

    #[test]
    fn membership_work_keys_never_equal_routing_keys() {
        assert_eq!(ResourceKind::RoutingConfig.work_key("default/web"), "default/web");
        let membership = ResourceKind::ServiceMembership.work_key("default/web");
        assert_eq!(membership, "endpoints:default/web");
        assert_ne!(membership, ResourceKind::RoutingConfig.work_key("default/web"));
    }

    #[tokio::test]
    async fn watcher_events_are_forwarded_translated() {
        let (tx, mut rx) = mpsc::channel(4);
        let events = futures::stream::iter(vec![
            Ok::<_, String>(Event::Apply(ingress("web", 1))),
            Ok(Event::Apply(ingress("web", 2))),
            Err("connection reset".to_string()),
        ]);

        forward_events::<Ingress, _, _>(events, tx, Duration::from_secs(3600)).await;

        assert_eq!(rx.recv().await.unwrap().unwrap(), WatchEvent::Added(ingress("web", 1)));
        assert_eq!(
            rx.recv().await.unwrap().unwrap(),
            WatchEvent::Modified(ingress("web", 2))
        );
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn idle_watcher_stops_when_receiver_is_dropped() {
        let (tx, rx) = mpsc::channel::<Result<WatchEvent<Ingress>, Error>>(4);
        let idle = futures::stream::pending::<Result<Event<Ingress>, String>>();
        let handle = tokio::spawn(forward_events(idle, tx, Duration::from_secs(3600)));

        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("forwarder should stop once the receiver is gone")
            .unwrap();
    }

    #[test]
    fn kinds_map_to_resource_types() {
        assert_eq!(Ingress::KIND, ResourceKind::RoutingConfig);
        assert_eq!(Endpoints::KIND, ResourceKind::ServiceMembership);
        assert_eq!(ResourceKind::ServiceMembership.to_string(), "ServiceMembership");
    }
}
