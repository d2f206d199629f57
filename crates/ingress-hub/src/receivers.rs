//! TLS receivers declared on an Ingress
//!
//! An Ingress lists its receivers as a JSON array in the `Ingress.receivers`
//! annotation. Each receiver names the Kubernetes Secret holding the
//! certificate for one host and the directory its files are written to.

use std::collections::BTreeMap;

use ingress_common::{Error, DEFAULT_SSL_DIR, RECEIVERS_ANNOTATION};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::info;

/// SSL/TLS information for one host of an Ingress
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receiver {
    /// Host the certificate is for
    pub host: String,
    /// Frontend port to listen on (0 = default)
    #[serde(default)]
    pub port: u16,
    /// Name of the Secret holding `<name>.crt` and `<name>.key`
    pub secret: String,
    /// Directory the certificate files are written to
    #[serde(default = "default_ssl_dir")]
    pub ssl_dir: String,
}

fn default_ssl_dir() -> String {
    DEFAULT_SSL_DIR.to_string()
}

/// Decode the receivers annotation. A missing annotation means no receivers.
pub fn parse_receivers(
    annotations: Option<&BTreeMap<String, String>>,
) -> Result<Vec<Receiver>, Error> {
    match annotations.and_then(|a| a.get(RECEIVERS_ANNOTATION)) {
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            Error::serialization_for_kind(
                RECEIVERS_ANNOTATION,
                format!("invalid receivers annotation: {}", e),
            )
        }),
        None => Ok(Vec::new()),
    }
}

/// Replace every receiver for `receiver.host`, or append it if the host is new
pub fn upsert_receiver(receivers: &mut Vec<Receiver>, receiver: Receiver) {
    let mut replaced = false;
    for existing in receivers.iter_mut() {
        if existing.host == receiver.host {
            *existing = receiver.clone();
            replaced = true;
        }
    }
    if !replaced {
        receivers.push(receiver);
    }
}

/// Reads and updates receiver annotations on Ingresses
pub struct ReceiverClient {
    client: Client,
}

impl ReceiverClient {
    /// Create a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Receivers of the Ingress `namespace/name`
    pub async fn get(&self, namespace: &str, name: &str) -> Result<Vec<Receiver>, Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let ingress = api.get(name).await?;
        parse_receivers(ingress.metadata.annotations.as_ref())
    }

    /// Add or replace the receiver for `receiver.host` on `namespace/name`.
    ///
    /// The Ingress is replaced with the resourceVersion it was read at, so a
    /// concurrent writer makes this fail instead of being clobbered.
    pub async fn update(
        &self,
        namespace: &str,
        name: &str,
        receiver: Receiver,
    ) -> Result<(), Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let mut ingress = api.get(name).await?;

        let mut receivers = parse_receivers(ingress.metadata.annotations.as_ref())?;
        let host = receiver.host.clone();
        upsert_receiver(&mut receivers, receiver);

        let encoded = serde_json::to_string(&receivers)?;
        ingress
            .annotations_mut()
            .insert(RECEIVERS_ANNOTATION.to_string(), encoded);

        api.replace(name, &PostParams::default(), &ingress).await?;
        info!(
            namespace = %namespace,
            ingress = %name,
            host = %host,
            "Updated receivers annotation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receiver(host: &str, secret: &str) -> Receiver {
        Receiver {
            host: host.to_string(),
            port: 443,
            secret: secret.to_string(),
            ssl_dir: "/tmp/certs".to_string(),
        }
    }

    #[test]
    fn missing_annotation_means_no_receivers() {
        assert!(parse_receivers(None).unwrap().is_empty());
        assert!(parse_receivers(Some(&BTreeMap::new())).unwrap().is_empty());
    }

    #[test]
    fn parses_camel_case_annotation() {
        let annotations = BTreeMap::from([(
            RECEIVERS_ANNOTATION.to_string(),
            r#"[{"host":"foo.bar.com","port":8443,"secret":"foo-tls","sslDir":"/etc/certs"}]"#
                .to_string(),
        )]);

        let receivers = parse_receivers(Some(&annotations)).unwrap();
        assert_eq!(
            receivers,
            vec![Receiver {
                host: "foo.bar.com".to_string(),
                port: 8443,
                secret: "foo-tls".to_string(),
                ssl_dir: "/etc/certs".to_string(),
            }]
        );
    }

    #[test]
    fn ssl_dir_and_port_have_defaults() {
        let annotations = BTreeMap::from([(
            RECEIVERS_ANNOTATION.to_string(),
            r#"[{"host":"foo.bar.com","secret":"foo-tls"}]"#.to_string(),
        )]);

        let receivers = parse_receivers(Some(&annotations)).unwrap();
        assert_eq!(receivers[0].ssl_dir, DEFAULT_SSL_DIR);
        assert_eq!(receivers[0].port, 0);
    }

    #[test]
    fn malformed_annotation_is_a_serialization_error() {
        let annotations =
            BTreeMap::from([(RECEIVERS_ANNOTATION.to_string(), "{not json".to_string())]);
        let err = parse_receivers(Some(&annotations)).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn upsert_replaces_existing_host() {
        let mut receivers = vec![receiver("a.com", "old"), receiver("b.com", "b")];
        upsert_receiver(&mut receivers, receiver("a.com", "new"));

        assert_eq!(receivers.len(), 2);
        assert_eq!(receivers[0].secret, "new");
        assert_eq!(receivers[1].secret, "b");
    }

    #[test]
    fn upsert_appends_new_host() {
        let mut receivers = vec![receiver("a.com", "a")];
        upsert_receiver(&mut receivers, receiver("c.com", "c"));
        assert_eq!(receivers.len(), 2);
        assert_eq!(receivers[1].host, "c.com");
    }

    #[test]
    fn encoded_receivers_use_annotation_field_names() {
        let encoded = serde_json::to_string(&vec![receiver("a.com", "a")]).unwrap();
        assert!(encoded.contains("\"sslDir\":\"/tmp/certs\""));
        assert!(encoded.contains("\"secret\":\"a\""));
    }
}
