//! Shared Kubernetes utilities using kube-rs

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource, ResourceExt};

use crate::{Error, CLUSTER_DNS_SUFFIX};

/// Default connect timeout for the API client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout for the API client; watch timeouts must stay below it
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity key of an object: `namespace/name`, or `name` when cluster scoped.
///
/// Keys are what the change queue de-duplicates on and what the local
/// indexes are keyed by.
pub fn identity_key<K>(obj: &K) -> String
where
    K: Resource,
{
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, obj.name_any()),
        _ => obj.name_any(),
    }
}

/// Split an identity key back into `(namespace, name)`.
pub fn split_identity_key(key: &str) -> Result<(&str, &str), Error> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        _ => Err(Error::validation_for(
            key,
            "expected an identity key of the form namespace/name",
        )),
    }
}

/// In-cluster DNS name of a service
pub fn cluster_dns_name(service: &str, namespace: &str) -> String {
    format!("{}.{}.{}", service, namespace, CLUSTER_DNS_SUFFIX)
}

/// Create a kube client from optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
