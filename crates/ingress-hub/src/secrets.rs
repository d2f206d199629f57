//! Secret materialization: receiver secrets → `.crt`/`.key` files on disk
//!
//! Secrets are resolved on every rebuild. Files that already exist are left
//! untouched, so an unchanged secret costs one API read and no writes.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use ingress_common::Error;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::receivers::{parse_receivers, Receiver};
use crate::types::SecretBundle;

/// Resolves the TLS receivers of an Ingress into files on disk
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretMaterializer: Send + Sync {
    /// One bundle per receiver host.
    ///
    /// Fails if a referenced secret is missing or lacks its `.crt` or `.key`.
    async fn resolve(&self, ingress: &Ingress) -> Result<BTreeMap<String, SecretBundle>, Error>;
}

/// [`SecretMaterializer`] reading Secrets from the Kubernetes API
pub struct KubeSecretMaterializer {
    client: Client,
}

impl KubeSecretMaterializer {
    /// Create a materializer using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretMaterializer for KubeSecretMaterializer {
    async fn resolve(&self, ingress: &Ingress) -> Result<BTreeMap<String, SecretBundle>, Error> {
        let receivers = parse_receivers(ingress.metadata.annotations.as_ref())?;
        if receivers.is_empty() {
            return Ok(BTreeMap::new());
        }

        let namespace = ingress.namespace().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        let mut bundles = BTreeMap::new();
        for receiver in receivers {
            let secret = api.get(&receiver.secret).await.map_err(|e| {
                Error::secret(&namespace, &receiver.secret, format!("failed to get secret: {}", e))
            })?;
            let data: BTreeMap<String, Vec<u8>> = secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect();

            let bundle = materialize_receiver(&namespace, &receiver, &data).await?;
            bundles.insert(receiver.host.clone(), bundle);
        }
        Ok(bundles)
    }
}

/// Write the `.crt`/`.key` entries of `data` into the receiver's directory.
///
/// Entries are named `<stem>.<ext>`; anything else is ignored. Nothing is
/// written unless `data` holds both a `.crt` and a `.key` entry.
pub async fn materialize_receiver(
    namespace: &str,
    receiver: &Receiver,
    data: &BTreeMap<String, Vec<u8>>,
) -> Result<SecretBundle, Error> {
    let mut bundle = SecretBundle {
        host: receiver.host.clone(),
        port: receiver.port,
        ..Default::default()
    };

    let mut files = Vec::new();
    for (name, contents) in data {
        let Some((stem, ext)) = split_entry_name(name) else {
            continue;
        };
        let path = Path::new(&receiver.ssl_dir).join(format!("{}.{}", stem, ext));
        let path_str = path.to_string_lossy().into_owned();
        match ext {
            "crt" => bundle.crt_path = path_str,
            "key" => bundle.key_path = path_str,
            _ => continue,
        }
        files.push((path, contents));
    }

    if bundle.key_path.is_empty() || bundle.crt_path.is_empty() {
        return Err(Error::secret(
            namespace,
            &receiver.secret,
            "only had one of key/crt; both a .crt and a .key entry are required",
        ));
    }

    tokio::fs::create_dir_all(&receiver.ssl_dir)
        .await
        .map_err(|e| Error::io(&receiver.ssl_dir, e))?;

    for (path, contents) in files {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "Secret file already exists, not overwriting");
            continue;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::io(&path, e))?;
        debug!(path = %path.display(), secret = %receiver.secret, "Wrote secret file");
    }
    Ok(bundle)
}

fn split_entry_name(name: &str) -> Option<(&str, &str)> {
    let mut parts = name.split('.');
    let stem = parts.next()?;
    let ext = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((stem, ext))
}
