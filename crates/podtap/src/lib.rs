use anyhow::Context;
use std::sync::Arc;
use tokio::signal::unix;

pub mod artifacts;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod watch;

pub use reconcile::Reconciler;
pub use registry::Registry;

#[derive(clap::Parser, Debug, serde::Serialize)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Name of the node this agent runs on.
    /// Only pods scheduled to it are handled.
    #[clap(long = "node-name", env = "NODE_NAME")]
    node_name: String,
    /// Directory into which capture artifacts are written.
    #[clap(long = "output-dir", env = "PODTAP_OUTPUT_DIR", default_value = "/outputs")]
    output_dir: std::path::PathBuf,
    /// External capture tool to run.
    #[clap(
        long = "capture-command",
        env = "PODTAP_CAPTURE_COMMAND",
        default_value = "tcpdump"
    )]
    capture_command: String,
    /// Interface to capture on.
    #[clap(long = "interface", env = "PODTAP_INTERFACE", default_value = "any")]
    interface: String,
    /// Capture duration used when the annotation value is malformed or
    /// non-positive.
    #[clap(
        long = "default-duration",
        env = "PODTAP_DEFAULT_DURATION",
        default_value = "10s"
    )]
    #[serde(with = "humantime_serde")]
    #[arg(value_parser = humantime::parse_duration)]
    default_duration: std::time::Duration,
    /// How long a stopping capture process may take to exit gracefully before
    /// it is killed.
    #[clap(
        long = "grace-timeout",
        env = "PODTAP_GRACE_TIMEOUT",
        default_value = "15s"
    )]
    #[serde(with = "humantime_serde")]
    #[arg(value_parser = humantime::parse_duration)]
    grace_timeout: std::time::Duration,
    /// Also delete artifact files when a capture ends by natural expiry.
    /// Explicit annotation removal and pod deletion always delete them.
    #[clap(long = "delete-on-expiry", env = "PODTAP_DELETE_ON_EXPIRY")]
    delete_on_expiry: bool,
    /// Rotate capture files at this size (in millions of bytes). When set,
    /// the annotation value is the number of rotated files to keep, and
    /// sessions run without an expiry timer.
    #[clap(long = "rotate-file-size", env = "PODTAP_ROTATE_FILE_SIZE")]
    rotate_file_size: Option<u64>,
    /// Upper bound of the watch reconnect backoff.
    #[clap(
        long = "watch-backoff-max",
        env = "PODTAP_WATCH_BACKOFF_MAX",
        default_value = "5m"
    )]
    #[serde(with = "humantime_serde")]
    #[arg(value_parser = humantime::parse_duration)]
    watch_backoff_max: std::time::Duration,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            node_name: self.node_name,
            output_dir: self.output_dir,
            capture_command: self.capture_command,
            interface: self.interface,
            default_duration: self.default_duration,
            grace_timeout: self.grace_timeout,
            delete_on_expiry: self.delete_on_expiry,
            rotate_file_size: self.rotate_file_size,
            watch_backoff_max: self.watch_backoff_max,
        }
    }
}

/// Validated runtime configuration, shared by all components.
#[derive(Debug)]
pub struct Config {
    pub node_name: String,
    pub output_dir: std::path::PathBuf,
    pub capture_command: String,
    pub interface: String,
    pub default_duration: std::time::Duration,
    pub grace_timeout: std::time::Duration,
    pub delete_on_expiry: bool,
    pub rotate_file_size: Option<u64>,
    pub watch_backoff_max: std::time::Duration,
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?DebugJson(&args),
        "podtap started"
    );
    let config = Arc::new(args.into_config());

    std::fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.output_dir.display()
        )
    })?;

    let client = kube::Client::try_default()
        .await
        .context("failed to construct cluster API client")?;
    watch::probe(&client).await?;

    let registry = Arc::new(Registry::new());
    let reconciler = Reconciler::new(registry.clone(), config.clone());
    let watch = tokio::spawn(watch::serve(client, reconciler, config.watch_backoff_max));

    // Gracefully exit on either SIGINT (ctrl-c) or SIGTERM.
    let mut sigint = unix::signal(unix::SignalKind::interrupt())
        .context("failed to install SIGINT handler")?;
    let mut sigterm = unix::signal(unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = sigint.recv() => (),
        _ = sigterm.recv() => (),
    }
    tracing::info!("caught signal to exit");

    // Quiesce ingestion so no further session can start, then drain.
    watch.abort();
    _ = watch.await;
    session::drain_all(&registry, &config).await;

    tracing::info!("all captures stopped, exiting");
    Ok(())
}

/// Debug-formats as its own JSON serialization, for startup config logging.
struct DebugJson<S: serde::Serialize>(S);

impl<S: serde::Serialize> std::fmt::Debug for DebugJson<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(value) => f.write_str(&value),
            Err(_) => Err(std::fmt::Error),
        }
    }
}
