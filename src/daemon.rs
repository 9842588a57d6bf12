//! Process wiring: configuration, metrics endpoint, cycle engine and signals.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError};
use crate::location;
use crate::metrics::{LiveSnapshot, MetricsError, SensorMetrics};
use crate::probe::{NetworkProbes, ProbeError};
use crate::scheduler::{CycleEngine, SystemClock};
use crate::sink::build_sinks;
use crate::web::Server;

/// Startup failures. Anything after startup is logged, never fatal.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot bind metrics port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to set up probes: {0}")]
    Probe(#[from] ProbeError),
    #[error("failed to set up metrics: {0}")]
    Metrics(#[from] MetricsError),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    /// Overrides `log_path` from the configuration.
    pub log_path: Option<PathBuf>,
}

/// Run the sensor until SIGINT or SIGTERM.
pub async fn run(options: RunOptions) -> Result<(), DaemonError> {
    let mut config = Config::load(&options.config_path)?;
    if let Some(path) = options.log_path {
        config.log_path = path;
    }
    let config = Arc::new(config);

    tracing::info!(
        "Starting netsensor {} as {} ({})",
        env!("CARGO_PKG_VERSION"),
        config.sensor_name,
        config.sensor_id
    );

    let listener = Server::bind(config.metrics_port)
        .await
        .map_err(|source| DaemonError::Bind {
            port: config.metrics_port,
            source,
        })?;

    let live = Arc::new(LiveSnapshot::new());
    let mut metrics = SensorMetrics::new(&config, Arc::clone(&live))?;
    if let Some(loc) = location::resolve(&config.location).await {
        metrics.set_location(loc.latitude, loc.longitude, &loc.address_notes);
    }

    let prober = Arc::new(NetworkProbes::new(&config)?);
    let sinks = build_sinks(&config);
    let cancel = CancellationToken::new();

    let engine = CycleEngine::new(
        Arc::clone(&config),
        prober,
        Arc::new(SystemClock),
        metrics,
        sinks,
        cancel.clone(),
    );

    let server = Server::new(live);
    let server_token = cancel.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.serve(listener, server_token).await {
            tracing::error!("Metrics endpoint stopped: {}", e);
        }
    });

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown requested; finishing the current test");
        signal_token.cancel();
    });

    if let Err(e) = tokio::spawn(engine.run()).await {
        tracing::error!("Cycle engine task failed: {}", e);
    }

    cancel.cancel();
    if let Err(e) = server_task.await {
        tracing::error!("Metrics endpoint task failed: {}", e);
    }

    tracing::info!("netsensor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_config_is_fatal() {
        let dir = TempDir::new().unwrap();
        let outcome = run(RunOptions {
            config_path: dir.path().join("absent.yaml"),
            log_path: None,
        })
        .await;
        assert!(matches!(
            outcome,
            Err(DaemonError::Config(ConfigError::Missing(_)))
        ));
    }

    #[tokio::test]
    async fn test_port_in_use_is_fatal() {
        let busy = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = busy.local_addr().unwrap().port();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            format!("metrics_port: {port}\nwired: [{{ iface: eth0 }}]\n"),
        )
        .unwrap();

        let outcome = run(RunOptions {
            config_path: path,
            log_path: None,
        })
        .await;
        assert!(matches!(outcome, Err(DaemonError::Bind { .. })));
    }
}
