//! Ingress hub - routing snapshots from Ingress and Endpoints

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ingress_common::kube_utils::{create_client, split_identity_key};
use ingress_common::retry::RetryPolicy;
use ingress_common::telemetry::{init_telemetry, TelemetryConfig};
use ingress_common::{DEFAULT_FRONTEND_PORT, DEFAULT_SSL_DIR};
use ingress_hub::{
    start_kube_hub, HubConfig, Receiver, ReceiverClient, DEFAULT_WATCHER_TIMEOUT_SECS,
};
use ingress_nginx::{write_config, NginxRenderer, DEFAULT_WORKER_CONNECTIONS};

/// Ingress hub - watches Ingress and Endpoints and renders load balancer config
#[derive(Parser, Debug)]
#[command(name = "ingress", version, about, long_about = None)]
struct Cli {
    /// Path to a kubeconfig; in-cluster or default config when unset
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Human readable logs instead of JSON lines
    #[arg(long, global = true)]
    plain_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the hub and render an nginx config for every snapshot
    Nginx(NginxArgs),

    /// Inspect or edit the TLS receivers of an Ingress
    Receiver {
        #[command(subcommand)]
        command: ReceiverCommands,
    },
}

/// Hub and renderer arguments
#[derive(Parser, Debug)]
struct NginxArgs {
    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "INGRESS_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds between full resyncs of the watched resources
    #[arg(long, env = "INGRESS_RESYNC_SECS", default_value = "10")]
    resync_secs: u64,

    /// Attempts per failing key before it is dropped (0 = retry forever)
    #[arg(long, env = "INGRESS_MAX_RETRIES", default_value = "0")]
    max_retries: u32,

    /// Also rebuild when only Endpoints change
    #[arg(long, env = "INGRESS_MEMBERSHIP_REBUILD")]
    membership_rebuild: bool,

    /// Write the config to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// worker_connections of the nginx events block
    #[arg(long, default_value_t = DEFAULT_WORKER_CONNECTIONS)]
    worker_connections: u32,
}

impl From<&NginxArgs> for HubConfig {
    fn from(args: &NginxArgs) -> Self {
        Self {
            namespace: args.namespace.clone(),
            resync_period: Duration::from_secs(args.resync_secs),
            retry: RetryPolicy::with_max_attempts(args.max_retries),
            membership_triggers_rebuild: args.membership_rebuild,
            watcher_timeout_secs: DEFAULT_WATCHER_TIMEOUT_SECS,
        }
    }
}

#[derive(Subcommand, Debug)]
enum ReceiverCommands {
    /// Add or replace the receiver for a host
    Set {
        /// Ingress as namespace/name
        #[arg(long)]
        ingress: String,

        /// Host the certificate is for
        #[arg(long)]
        host: String,

        /// Frontend port
        #[arg(long, default_value_t = DEFAULT_FRONTEND_PORT)]
        port: u16,

        /// Secret holding `<name>.crt` and `<name>.key`
        #[arg(long)]
        secret: String,

        /// Directory the certificate files are written to
        #[arg(long, default_value = DEFAULT_SSL_DIR)]
        ssl_dir: String,
    },

    /// Print the receivers of an Ingress
    Get {
        /// Ingress as namespace/name
        #[arg(long)]
        ingress: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: !cli.plain_logs,
        ..Default::default()
    })?;

    match cli.command {
        Commands::Nginx(args) => run_nginx(cli.kubeconfig, args).await,
        Commands::Receiver { command } => run_receiver(cli.kubeconfig, command).await,
    }
}

/// Run the hub and render each snapshot until interrupted
async fn run_nginx(kubeconfig: Option<PathBuf>, args: NginxArgs) -> anyhow::Result<()> {
    let renderer = NginxRenderer::new(args.worker_connections)?;
    let client = create_client(kubeconfig.as_deref()).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
        signal.cancel();
    });

    let config = HubConfig::from(&args);
    let mut hub = start_kube_hub(client, &config, shutdown).await?;

    info!("Subscribing to snapshots");
    while let Some(snapshot) = hub.snapshots.recv().await {
        info!(
            services = snapshot.services.len(),
            delta = snapshot.delta.len(),
            "Received snapshot"
        );

        let rendered = match renderer.render(&snapshot.services) {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(error = %e, "Failed to render nginx config");
                continue;
            }
        };

        match &args.output {
            Some(path) => {
                if let Err(e) = write_config(path, &rendered) {
                    error!(error = %e, "Failed to write nginx config");
                }
            }
            None => println!("{rendered}"),
        }
    }

    hub.task.await?;
    Ok(())
}

/// Read or update the receivers annotation
async fn run_receiver(
    kubeconfig: Option<PathBuf>,
    command: ReceiverCommands,
) -> anyhow::Result<()> {
    let client = ReceiverClient::new(create_client(kubeconfig.as_deref()).await?);

    let ingress = match command {
        ReceiverCommands::Set {
            ingress,
            host,
            port,
            secret,
            ssl_dir,
        } => {
            let (namespace, name) = split_identity_key(&ingress)?;
            client
                .update(
                    namespace,
                    name,
                    Receiver {
                        host,
                        port,
                        secret,
                        ssl_dir,
                    },
                )
                .await?;
            ingress
        }
        ReceiverCommands::Get { ingress } => ingress,
    };

    let (namespace, name) = split_identity_key(&ingress)?;
    let receivers = client.get(namespace, name).await?;
    println!("{}", serde_json::to_string_pretty(&receivers)?);
    Ok(())
}
