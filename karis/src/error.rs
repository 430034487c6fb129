use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the karis components and devices.
#[derive(Debug, Error)]
pub enum KarisError {
    /// The config file does not exist on disk.
    #[error("Could not locate the config file {0:?}")]
    MissingConfig(PathBuf),
    /// The config file could not be read or deserialised.
    #[error("Failed to parse config file: {0}")]
    Config(#[from] config::ConfigError),
    /// The config parsed but describes something that cannot be run.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    /// The broker answered the connect request with a refusal.
    #[error("Broker {host}:{port} refused the connection: {code:?}")]
    ConnectionRefused {
        host: String,
        port: u16,
        code: rumqttc::ConnectReturnCode,
    },
    /// The transport failed before the broker acknowledged the connection.
    #[error("Failed to connect to broker {host}:{port}: {source}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: rumqttc::ConnectionError,
    },
    /// The client request queue is closed, usually after a disconnect.
    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Failed to encode message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to write csv: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
