//! Common types for the ingress hub: errors, telemetry and Kubernetes helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Annotation on an Ingress holding the JSON-encoded list of TLS receivers
pub const RECEIVERS_ANNOTATION: &str = "Ingress.receivers";

/// Directory receivers write their `.crt`/`.key` files to when none is given
pub const DEFAULT_SSL_DIR: &str = "/etc/kubernetes/ingress/certs";

/// Frontend port used for a routing rule whose host has no receiver port
pub const DEFAULT_FRONTEND_PORT: u16 = 443;

/// Host value telling the consumer to apply a catch-all server rule
pub const CATCH_ALL_HOST: &str = "_";

/// Cluster DNS suffix appended to `<service>.<namespace>`
pub const CLUSTER_DNS_SUFFIX: &str = "svc.cluster.local";
