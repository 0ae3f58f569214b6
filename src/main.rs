//! snigate - multi-tenant TLS-terminating reverse proxy
//!
//! Process wiring: CLI parsing, logging, certificate-manager selection,
//! proxy startup, and the reload paths (SIGHUP and config-file watch).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use notify::{RecursiveMode, Watcher};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use snigate::cert_manager::{AcmeManager, CertManager, TestCertManager};
use snigate::config::Config;
use snigate::proxy::Proxy;

/// Multi-tenant TLS-terminating reverse proxy with SNI routing
#[derive(Parser, Debug)]
#[command(name = "snigate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/snigate/config.yaml", env = "SNIGATE_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SNIGATE_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "SNIGATE_JSON_LOGS")]
    json_logs: bool,

    /// Use an ephemeral in-process CA instead of ACME (local testing)
    #[arg(long)]
    ephemeral_ca: bool,

    /// Watch the configuration file and reload on change
    #[arg(long, default_value = "true")]
    watch_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the rustls CryptoProvider before any TLS operations.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("starting snigate v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %args.config.display(), "loading configuration");

    let cfg = Config::load(&args.config)?;
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let cert_manager: Arc<dyn CertManager> = if args.ephemeral_ca {
        warn!("using ephemeral CA; clients will not trust these certificates");
        Arc::new(TestCertManager::new("snigate-ephemeral-ca")?)
    } else {
        AcmeManager::new(cfg.cache_dir.clone(), cfg.email.clone(), cfg.accept_tos)
    };

    let proxy = Proxy::new(cfg, cert_manager).await?;
    proxy.start().await?;

    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
    let _watcher = if args.watch_config {
        match watch_config(&args.config, reload_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "config watch unavailable");
                None
            }
        }
    } else {
        None
    };

    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload(&proxy, &args.config).await;
            }
            Some(()) = reload_rx.recv() => {
                info!("configuration file changed, reloading");
                reload(&proxy, &args.config).await;
            }
        }
    }

    proxy.stop();
    Ok(())
}

/// Reload and apply the configuration file; the previous configuration
/// stays in effect on any error.
async fn reload(proxy: &Proxy, path: &Path) {
    match Config::load(path) {
        Ok(cfg) => {
            if let Err(e) = proxy.reconfigure(cfg).await {
                error!(error = %e, "reconfiguration rejected");
            }
        }
        Err(e) => error!(error = %e, "configuration reload failed"),
    }
}

/// Watch the configuration file's directory for changes.
fn watch_config(
    path: &Path,
    tx: mpsc::Sender<()>,
) -> notify::Result<notify::RecommendedWatcher> {
    let file_name = path.file_name().map(|n| n.to_owned());
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else { return };
        if !(event.kind.is_modify() || event.kind.is_create()) {
            return;
        }
        let relevant = match &file_name {
            Some(name) => event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(name.as_os_str())),
            None => true,
        };
        if relevant {
            let _ = tx.try_send(());
        }
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("snigate={level},info")));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("logging init: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("logging init: {e}"))?;
    }
    Ok(())
}
