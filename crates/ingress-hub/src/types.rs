//! Routing snapshot types handed to the downstream consumer.

use serde::{Deserialize, Serialize};

/// One routable destination.
///
/// A `host` of `"_"` or an empty `path` tells the consumer to apply its
/// catch-all rule. Empty `crt_path`/`key_path` mean no forced TLS: the
/// consumer may fall back to its default certificate or plain HTTP.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    /// DNS hostname requests are matched on (e.g. `foo.bar.com`)
    pub host: String,
    /// Frontend port the load balancer listens on
    pub port: u16,
    /// URL path routed to the endpoints
    pub path: String,
    /// Backend addresses as `ip:port`, in endpoint subset order
    pub endpoints: Vec<String>,
    /// DNS name of the backend service inside the cluster
    pub cluster_dns_name: String,
    /// Path to the `.crt` file used for SSL
    pub crt_path: String,
    /// Path to the `.key` file used for SSL
    pub key_path: String,
}

impl RoutingRule {
    /// Whether the consumer should terminate TLS for this rule
    pub fn has_tls(&self) -> bool {
        !self.crt_path.is_empty() && !self.key_path.is_empty()
    }
}

/// The complete routing state plus the rules changed by the last rebuild.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every routing rule currently in effect
    pub services: Vec<RoutingRule>,
    /// Rules of the object whose change triggered this snapshot; empty on delete
    pub delta: Vec<RoutingRule>,
}

/// Filesystem locations of the TLS material for one host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretBundle {
    /// Host the certificate is for
    pub host: String,
    /// Frontend port declared by the receiver (0 when unset)
    pub port: u16,
    /// Path to the written `.key` file
    pub key_path: String,
    /// Path to the written `.crt` file
    pub crt_path: String,
}
