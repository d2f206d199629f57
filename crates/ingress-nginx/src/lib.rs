//! nginx configuration for routing snapshots
//!
//! Every routing rule becomes one `server` block proxying to the backend
//! service's cluster DNS name. Rules carrying a certificate terminate TLS.

use std::path::{Path, PathBuf};

use ingress_common::{CATCH_ALL_HOST, DEFAULT_FRONTEND_PORT};
use ingress_hub::RoutingRule;
use minijinja::{context, Environment};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Default `worker_connections` of the events block
pub const DEFAULT_WORKER_CONNECTIONS: u32 = 1024;

const NGINX_TEMPLATE: &str = include_str!("../templates/nginx.conf.j2");
const TEMPLATE_NAME: &str = "nginx.conf";

/// Rendering or writing a configuration failed
#[derive(Debug, Error)]
pub enum RenderError {
    /// Template failed to compile or render
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Writing the configuration failed
    #[error("failed to write {path}: {source}")]
    Io {
        /// Destination path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// One `server` block
#[derive(Debug, Serialize)]
struct Server<'a> {
    listen: u16,
    server_name: &'a str,
    location: &'a str,
    upstream: &'a str,
    tls: bool,
    crt: &'a str,
    key: &'a str,
}

impl<'a> From<&'a RoutingRule> for Server<'a> {
    fn from(rule: &'a RoutingRule) -> Self {
        Self {
            listen: if rule.port == 0 {
                DEFAULT_FRONTEND_PORT
            } else {
                rule.port
            },
            server_name: if rule.host.is_empty() {
                CATCH_ALL_HOST
            } else {
                &rule.host
            },
            location: if rule.path.is_empty() { "/" } else { &rule.path },
            upstream: &rule.cluster_dns_name,
            tls: rule.has_tls(),
            crt: &rule.crt_path,
            key: &rule.key_path,
        }
    }
}

/// Renders nginx configurations from routing rules
pub struct NginxRenderer {
    env: Environment<'static>,
    worker_connections: u32,
}

impl NginxRenderer {
    /// Compile the template
    pub fn new(worker_connections: u32) -> Result<Self, RenderError> {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template(TEMPLATE_NAME, NGINX_TEMPLATE)?;
        Ok(Self {
            env,
            worker_connections,
        })
    }

    /// Render the configuration for `services`
    pub fn render(&self, services: &[RoutingRule]) -> Result<String, RenderError> {
        let servers: Vec<Server<'_>> = services.iter().map(Server::from).collect();
        let rendered = self.env.get_template(TEMPLATE_NAME)?.render(context! {
            worker_connections => self.worker_connections,
            servers => servers,
        })?;
        Ok(rendered)
    }
}

/// Write `config` to `path`, replacing it atomically.
///
/// Readers never observe a partially written file.
pub fn write_config(path: &Path, config: &str) -> Result<(), RenderError> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, config).map_err(|source| RenderError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), bytes = config.len(), "Wrote nginx config");
    Ok(())
}
