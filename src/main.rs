use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use vhostgate::config::Config;
use vhostgate::gateway::Gateway;
use vhostgate::loader;
use vhostgate::registry::SiteRegistry;
use vhostgate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vhostgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    let mut registry = SiteRegistry::from_config(&config.server);
    let www_dir = config.server.www_dir();
    let report = loader::load_sites(&www_dir, &mut registry).map_err(|e| {
        error!(path = %www_dir.display(), error = %e, "Failed to load sites");
        e
    })?;
    info!(
        loaded = report.loaded.len(),
        skipped = report.skipped.len(),
        "Sites loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let running = Gateway::new(config.server.clone(), registry)
        .start(shutdown_rx)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start gateway");
            e
        })?;

    for listener in running.listeners() {
        info!(
            port = listener.port,
            addr = %listener.local_addr,
            kind = ?listener.kind,
            domains = ?listener.domains,
            "Listener started"
        );
    }
    for failure in running.failures() {
        warn!(
            port = failure.port,
            domains = ?failure.domains,
            error = %failure.error,
            "Listener unavailable"
        );
    }
    for domain in &report.loaded {
        if let Some(url) = running.url_for(domain.as_str()) {
            info!(domain = %domain, url = %url, "Site ready");
        }
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);
    running.shutdown(Duration::from_secs(5)).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        hostname = %config.server.hostname,
        default_port = config.server.default_port,
        acme_http_port = config.server.acme_http_port,
        local = config.server.local,
        "Server configuration"
    );
    if config.server.local {
        info!(
            min_port = config.server.min_local_port,
            max_port = config.server.local_port_max(),
            "Local mode port range"
        );
    } else {
        info!(
            email = %config.server.email,
            staging = config.server.staging,
            cluster = config.server.cluster,
            cert_store = %config.server.cert_store_dir().display(),
            refresh_interval_secs = config.server.cert_refresh_interval_secs,
            "Certificate settings"
        );
    }
    info!(
        www = %config.server.www_dir().display(),
        max_body_bytes = config.server.max_body_bytes,
        "Site settings"
    );
}
