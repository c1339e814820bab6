//! USB/IP host daemon.
//!
//! Shares USB devices attached to this host over the network using the
//! USB/IP protocol. Headless by design (`spec.md` §1 Non-goals exclude a
//! CLI/TUI front end); the teacher's service-mode path
//! (`server/src/main.rs::run_service`) is the closest analogue.

use anyhow::{Context, Result};
use clap::Parser;
use common::{DeviceEnumerator, DeviceStore, PolicyEngine, setup_logging};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use usbipd::acceptor::ConnectionAcceptor;
use usbipd::capture::CaptureSink;
use usbipd::collaborators::{AllowAllPolicy, RusbDeviceEnumerator, RusbDeviceStore, RusbDriverBinder};
use usbipd::config::DaemonConfig;
use usbipd::lock::SingleInstanceLock;
use usbipd::session::SessionBinder;

#[derive(Parser, Debug)]
#[command(name = "usbipd")]
#[command(author, version, about = "Share USB devices over the network via USB/IP")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Address to bind the USB/IP listener to, overriding the config file
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error), overriding the config file
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write a PcapNG capture of the session to this path, overriding the config file
    #[arg(long, value_name = "PATH")]
    capture: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        DaemonConfig::load(Some(path.clone())).context("failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(capture_path) = args.capture {
        config.capture.path = Some(capture_path);
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("failed to set up logging")?;

    info!("usbipd v{}", env!("CARGO_PKG_VERSION"));
    info!("log level: {}", log_level);

    let lock_dir = DaemonConfig::default_path()
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from(".config/usbipd"));
    let _instance_lock = SingleInstanceLock::acquire(&lock_dir)
        .context("another usbipd instance is already running (failed to acquire single-instance lock)")?;
    info!("acquired single-instance lock at {}", _instance_lock.path().display());

    let context = rusb::Context::new().context("failed to initialize libusb context")?;

    let store: Arc<dyn DeviceStore> = Arc::new(RusbDeviceStore::new(context.clone()));
    let binder: SessionBinder = Arc::new(RusbDriverBinder::new(context.clone()));
    let policy: Arc<dyn PolicyEngine> = Arc::new(AllowAllPolicy);
    let enumerator: Arc<dyn DeviceEnumerator> = Arc::new(RusbDeviceEnumerator::new(context));

    let capture = match &config.capture.path {
        Some(path) => {
            info!("capturing session traffic to {}", path.display());
            let sink = CaptureSink::open(path, config.capture.snaplen)
                .with_context(|| format!("failed to open capture file {}", path.display()))?;
            Some(Arc::new(sink))
        }
        None => None,
    };

    let acceptor = ConnectionAcceptor::bind(
        &config.server.bind_addr,
        store,
        binder,
        policy,
        enumerator,
        capture.clone(),
    )
    .await
    .context("failed to bind USB/IP listener")?;

    let shutdown_tx = acceptor.shutdown_handle();
    let shutdown_rx = shutdown_tx.subscribe();

    let run_handle = tokio::spawn(acceptor.run(shutdown_rx));

    info!("press Ctrl+C to shut down");
    match signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("error waiting for Ctrl+C: {e}"),
    }

    shutdown_tx.send(()).ok();
    if let Err(e) = run_handle.await.context("acceptor task panicked")? {
        error!("acceptor error: {e:#}");
    }

    if let Some(sink) = capture {
        sink.close().await;
    }

    info!("shutdown complete");
    Ok(())
}
