//! sensor-gateway: Sensor data ingestion and fan-out runtime
//!
//! Accepts readings from sensor nodes over TCP, appends them to a shared
//! multi-cursor buffer and fans them out to a running-average analyzer and a
//! CSV persistence consumer. Lifecycle and anomaly events go to a dedicated
//! event logger over a fixed-record channel.

pub mod analyzer;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod gateway;
pub mod metrics;
pub mod reading;
pub mod sensor_map;
pub mod server;
pub mod storage;
pub mod transport;

pub use analyzer::{DataAnalyzer, SensorRecord};
pub use buffer::{Cursor, SharedBuffer};
pub use config::{AnalyzerConfig, GatewayConfig, StorageConfig};
pub use connection::{ConnectionManager, ConnectionStats, ConnectionSummary};
pub use error::{BufferError, ConfigError, GatewayError, StorageError, TransportError};
pub use event::{Event, EventKind, EventLogger, EventSender};
pub use gateway::{Gateway, GatewaySummary};
pub use reading::Reading;
pub use server::{create_router, run_server, ServerState};
pub use storage::PersistenceConsumer;
pub use transport::SensorClient;
