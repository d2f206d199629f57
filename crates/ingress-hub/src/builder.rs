//! Snapshot builder: local indexes + secrets → routing rules
//!
//! Every rebuild starts from scratch: all Ingresses currently indexed are
//! turned into rules, in key order, so an unchanged cluster always yields the
//! same `services`. A single failing secret aborts the whole rebuild; a
//! partial snapshot is never produced.

use std::collections::BTreeMap;
use std::sync::Arc;

use ingress_common::kube_utils::cluster_dns_name;
use ingress_common::{Error, DEFAULT_FRONTEND_PORT};
use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend, ServiceBackendPort};
use kube::ResourceExt;
use tracing::{debug, trace};

use crate::index::IndexReader;
use crate::secrets::SecretMaterializer;
use crate::types::{RoutingRule, SecretBundle, Snapshot};

/// Rebuilds the routing snapshot from the local indexes
pub struct SnapshotBuilder {
    ingresses: IndexReader<Ingress>,
    endpoints: IndexReader<Endpoints>,
    materializer: Arc<dyn SecretMaterializer>,
}

impl SnapshotBuilder {
    /// Create a builder over the given indexes
    pub fn new(
        ingresses: IndexReader<Ingress>,
        endpoints: IndexReader<Endpoints>,
        materializer: Arc<dyn SecretMaterializer>,
    ) -> Self {
        Self {
            ingresses,
            endpoints,
            materializer,
        }
    }

    /// Build the snapshot for a change to `key`.
    ///
    /// The rules of the Ingress whose identity key equals `key` become the
    /// delta. A key with no live Ingress (a deletion, or a prefixed
    /// ServiceMembership work key) yields an empty delta.
    pub async fn build(&self, key: &str) -> Result<Snapshot, Error> {
        let mut snapshot = Snapshot::default();

        for (ingress_key, ingress) in self.ingresses.list() {
            // A missing secret fails the whole rebuild
            let bundles = self.materializer.resolve(&ingress).await?;
            let rules = self.rules_for(&ingress, &bundles);
            trace!(ingress = %ingress_key, rules = rules.len(), "Built rules");

            if ingress_key == key {
                snapshot.delta = rules.clone();
            }
            snapshot.services.extend(rules);
        }

        debug!(
            key = %key,
            services = snapshot.services.len(),
            delta = snapshot.delta.len(),
            "Rebuilt snapshot"
        );
        Ok(snapshot)
    }

    /// Rules of one Ingress: one per `(host, path)`, then the default backend.
    fn rules_for(
        &self,
        ingress: &Ingress,
        bundles: &BTreeMap<String, SecretBundle>,
    ) -> Vec<RoutingRule> {
        let namespace = ingress.namespace().unwrap_or_default();
        let Some(spec) = ingress.spec.as_ref() else {
            return Vec::new();
        };

        let mut rules = Vec::new();
        for rule in spec.rules.iter().flatten() {
            let host = rule.host.clone().unwrap_or_default();
            let Some(http) = rule.http.as_ref() else {
                continue;
            };
            for path in &http.paths {
                let path_str = path.path.clone().unwrap_or_default();
                if let Some(routing_rule) = self.routing_rule(
                    &namespace,
                    &path.backend,
                    &host,
                    &path_str,
                    bundles.get(&host),
                ) {
                    rules.push(routing_rule);
                }
            }
        }

        // TODO: pipe a wildcard certificate to the default backend
        if let Some(backend) = spec.default_backend.as_ref() {
            if let Some(routing_rule) = self.routing_rule(&namespace, backend, "", "", None) {
                rules.push(routing_rule);
            }
        }

        rules
    }

    fn routing_rule(
        &self,
        namespace: &str,
        backend: &IngressBackend,
        host: &str,
        path: &str,
        bundle: Option<&SecretBundle>,
    ) -> Option<RoutingRule> {
        let Some(service) = backend.service.as_ref() else {
            debug!(host = %host, path = %path, "Skipping non-service backend");
            return None;
        };

        let port = bundle
            .map(|b| b.port)
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_FRONTEND_PORT);

        Some(RoutingRule {
            host: host.to_string(),
            port,
            path: path.to_string(),
            endpoints: self.endpoints_for(namespace, &service.name, service.port.as_ref()),
            cluster_dns_name: cluster_dns_name(&service.name, namespace),
            crt_path: bundle.map(|b| b.crt_path.clone()).unwrap_or_default(),
            key_path: bundle.map(|b| b.key_path.clone()).unwrap_or_default(),
        })
    }

    /// `ip:port` of every address behind `service` on the given port.
    ///
    /// The union over all subsets that expose the port: every address of a
    /// matching subset can serve it.
    fn endpoints_for(
        &self,
        namespace: &str,
        service: &str,
        port: Option<&ServiceBackendPort>,
    ) -> Vec<String> {
        let Some(port) = port else {
            return Vec::new();
        };
        let Some(endpoints) = self.endpoints.get(&format!("{}/{}", namespace, service)) else {
            return Vec::new();
        };

        let mut addresses = Vec::new();
        for subset in endpoints.subsets.iter().flatten() {
            for ep_port in subset.ports.iter().flatten() {
                if !port_matches(port, ep_port.name.as_deref(), ep_port.port) {
                    continue;
                }
                for address in subset.addresses.iter().flatten() {
                    addresses.push(format!("{}:{}", address.ip, ep_port.port));
                }
            }
        }
        addresses
    }
}

/// A backend port matches an endpoint port by number, or by name.
fn port_matches(backend: &ServiceBackendPort, ep_name: Option<&str>, ep_number: i32) -> bool {
    match (backend.number, backend.name.as_deref()) {
        (Some(number), _) => number == ep_number,
        (None, Some(name)) => ep_name == Some(name),
        (None, None) => false,
    }
}
