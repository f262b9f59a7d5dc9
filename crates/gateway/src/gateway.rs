use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::analyzer::DataAnalyzer;
use crate::buffer::SharedBuffer;
use crate::config::GatewayConfig;
use crate::connection::{ConnectionManager, ConnectionStats, ConnectionSummary};
use crate::error::{GatewayError, TransportError};
use crate::event::EventLogger;
use crate::sensor_map::{self, SensorMapping};
use crate::storage::PersistenceConsumer;
use crate::transport::SensorListener;

/// Totals reported after a complete run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySummary {
    pub connections: ConnectionSummary,
    pub analyzed: u64,
    pub persisted: u64,
    /// Lines written to the event log
    pub events: u64,
    /// Buffer entries released at teardown, marker included
    pub released: usize,
}

enum Finished {
    Connections(Result<ConnectionSummary, GatewayError>),
    Analyzer(Result<u64, GatewayError>),
    Persistence(Result<u64, GatewayError>),
}

/// Gateway orchestrates the ingestion and fan-out pipeline
pub struct Gateway {
    config: GatewayConfig,
    mappings: Vec<SensorMapping>,
    listener: SensorListener,
    buffer: Arc<SharedBuffer>,
    stats: ConnectionStats,
}

impl Gateway {
    /// Validate configuration, load the sensor map and bind the listener.
    /// Every failure here is a fatal startup error.
    pub fn bind(config: GatewayConfig, port: u16) -> Result<Self, GatewayError> {
        config.validate()?;
        let mappings = sensor_map::load(&config.analyzer.sensor_map)?;
        info!(
            sensors = mappings.len(),
            path = %config.analyzer.sensor_map.display(),
            "Loaded sensor map"
        );

        let listener = SensorListener::bind(port)?;
        info!(addr = %listener.local_addr()?, "Listening for sensor nodes");

        let stats = ConnectionStats::new(config.max_connections);
        Ok(Self {
            config,
            mappings,
            listener,
            buffer: Arc::new(SharedBuffer::new()),
            stats,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr()
    }

    /// Handle to the shared buffer (for the health server)
    pub fn buffer(&self) -> Arc<SharedBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Handle to the live connection counters (for the health server)
    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    /// Run the pipeline to completion: serve the connection budget, let both
    /// consumers reach the end-of-stream marker, tear down the buffer and wait
    /// for the event log to close.
    ///
    /// Returns as soon as any worker fails; the remaining threads are left to
    /// the process exit.
    pub fn run(self) -> Result<GatewaySummary, GatewayError> {
        let Gateway {
            config,
            mappings,
            listener,
            buffer,
            stats,
        } = self;

        let data_file_name = config
            .storage
            .data_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| config.storage.data_file.display().to_string());
        let (events, logger) = EventLogger::spawn(&config.log_file, data_file_name)?;

        let analyzer = DataAnalyzer::new(&mappings, config.analyzer.clone(), events.clone());
        let persistence = PersistenceConsumer::open(&config.storage, events.clone())?;
        let manager = ConnectionManager::new(
            listener,
            Arc::clone(&buffer),
            events,
            stats,
            config.receive_timeout(),
        );

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let tx = done_tx.clone();
        spawn_worker("connmgr", move || {
            let _ = tx.send(Finished::Connections(manager.run()));
        })?;

        let tx = done_tx.clone();
        let analyzer_buffer = Arc::clone(&buffer);
        spawn_worker("analyzer", move || {
            let _ = tx.send(Finished::Analyzer(analyzer.run(&analyzer_buffer)));
        })?;

        let tx = done_tx;
        let storage_buffer = Arc::clone(&buffer);
        spawn_worker("storage", move || {
            let _ = tx.send(Finished::Persistence(persistence.run(&storage_buffer)));
        })?;

        let mut connections = None;
        let mut analyzed = None;
        let mut persisted = None;

        while connections.is_none() || analyzed.is_none() || persisted.is_none() {
            let finished = done_rx
                .blocking_recv()
                .ok_or(GatewayError::ThreadPanicked("pipeline worker"))?;
            match finished {
                Finished::Connections(result) => {
                    connections = Some(result.inspect_err(|e| {
                        error!(error = %e, operation = "connection manager", "Fatal pipeline error")
                    })?)
                }
                Finished::Analyzer(result) => {
                    analyzed = Some(result.inspect_err(|e| {
                        error!(error = %e, operation = "data analyzer", "Fatal pipeline error")
                    })?)
                }
                Finished::Persistence(result) => {
                    persisted = Some(result.inspect_err(|e| {
                        error!(error = %e, operation = "persistence", "Fatal pipeline error")
                    })?)
                }
            }
        }

        let released = buffer.teardown()?;

        let events = logger
            .join()
            .map_err(|_| GatewayError::ThreadPanicked("event logger"))??;

        let summary = GatewaySummary {
            connections: connections.unwrap_or_default(),
            analyzed: analyzed.unwrap_or_default(),
            persisted: persisted.unwrap_or_default(),
            events,
            released,
        };
        info!(?summary, "Gateway finished");
        Ok(summary)
    }
}

fn spawn_worker(name: &'static str, f: impl FnOnce() + Send + 'static) -> Result<(), GatewayError> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(|e| GatewayError::Spawn(name, e))
}
