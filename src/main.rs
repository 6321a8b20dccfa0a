//! authrelay - Entry Point
//!
//! Starts the proxy listener and the feed poller with graceful shutdown
//! support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use authrelay::config::{Config, LogFormat};
use authrelay::error::{RelayError, Result};
use authrelay::proxy::{ListenerSupervisor, ProxyNode};
use authrelay::services::{FeedPoller, FeedPollerHandle};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    info!("Starting authrelay");

    let root = ProxyNode::new(config.proxy_settings())?;
    info!("Upstream: {:?}", root);

    // Bind failure is not fatal; the feed poller retries it
    let proxy = Arc::new(ListenerSupervisor::new(root, config.listen_addr()));
    match proxy.ensure_running().await {
        Ok(_) => {}
        Err(e @ RelayError::ListenerBindFailed { .. }) => {
            error!("{}; continuing without the proxy listener", e);
        }
        Err(e) => return Err(e),
    }

    let feed = if config.feed.enabled {
        let poller =
            FeedPoller::new(config.feed_poller_config())?.with_listener(Arc::clone(&proxy));
        let mut announced = poller.subscribe();
        let listen_addr = config.listen_addr();

        tokio::spawn(async move {
            loop {
                match announced.recv().await {
                    Ok(new_entry) => info!(
                        "Available for download: http://{}{} ({})",
                        listen_addr, new_entry.download_path, new_entry.entry.label
                    ),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} feed announcements", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Some(FeedPollerHandle::spawn(poller))
    } else {
        info!("Feed poller disabled");
        None
    };

    info!("authrelay started on {}", config.listen_addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    if let Some((handle, task)) = feed {
        handle.shutdown();
        if let Err(e) = task.await {
            error!("Feed poller task failed: {}", e);
        }
    }

    proxy.shutdown().await;

    info!("authrelay stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("authrelay={}", config.log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    match config.log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
