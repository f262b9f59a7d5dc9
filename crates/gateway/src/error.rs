use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("buffer has been torn down")]
    TornDown,
    #[error("sensor id 0 is reserved for the end-of-stream marker")]
    ReservedSensorId,
    #[error("end-of-stream marker already inserted")]
    AlreadyTerminated,
    #[error("teardown before end-of-stream marker was inserted")]
    NotTerminated,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
    #[error("receive failed: {0}")]
    Receive(std::io::Error),
    #[error("send failed: {0}")]
    Send(std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed: {0}")]
    WriteFailed(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("sensor map line {line}: {reason}")]
    SensorMap { line: usize, reason: String },
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("event log error: {0}")]
    EventLog(std::io::Error),
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}
