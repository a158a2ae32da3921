// Tether Linux: peripheral daemon. Link bridge, catalog store, content fetcher.

mod bridge;
mod catalog;
mod config;
mod events;
mod fetch;
mod host;
mod playback;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tether_core::{PeripheralCore, SourceArbiter, SystemClock};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("tether-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!(version = VERSION, service = tether_core::SERVICE_UUID, "starting");

    let store = catalog::load(cfg.catalog_path.as_deref())?;
    let mut core = PeripheralCore::new(
        Arc::new(store),
        Arc::new(SourceArbiter::new()),
        Arc::new(SystemClock {
            utc_offset_minutes: cfg.utc_offset_minutes,
        }),
        cfg.core_config(),
    );
    core.start_advertising();
    let core = Arc::new(tokio::sync::Mutex::new(core));
    let fetcher = Arc::new(fetch::Fetcher::new(Duration::from_secs(
        cfg.fetch_timeout_secs,
    ))?);

    let rt = tokio::runtime::Runtime::new().context("starting runtime")?;
    rt.block_on(async {
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let host = host::Host::new(
            core.clone(),
            fetcher,
            Arc::new(playback::LoggingSink),
            events_tx.clone(),
            cfg.pacing,
            Duration::from_millis(cfg.frame_interval_ms),
        );
        tokio::spawn(host.run(events_rx));

        let bridge_events = events_tx.clone();
        let port = cfg.listen_port;
        tokio::spawn(async move {
            if let Err(e) = bridge::run_bridge(port, bridge_events).await {
                tracing::error!(error = %e, "link bridge stopped");
            }
        });
        tokio::spawn(async move {
            if let Err(e) = events::run_stdin(events_tx).await {
                tracing::warn!(error = %e, "stdin events stopped");
            }
        });

        shutdown_signal().await
    })?;
    core.blocking_lock().stop_advertising();
    tracing::info!("stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
