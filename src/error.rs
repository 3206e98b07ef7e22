use thiserror::Error;

/// Result type for Snapcast operations
pub type Result<T> = std::result::Result<T, SnapError>;

/// JSON-RPC error code for an unknown method
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Errors that can occur when talking to a Snapcast server
#[derive(Error, Debug)]
pub enum SnapError {
    /// TCP connect did not complete within the configured timeout
    #[error("Connection to {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },

    /// TCP connect was refused or failed at the socket level
    #[error("Connection to {host}:{port} refused: {source}")]
    ConnectRefused {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or unparseable wire data; fatal to the connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A single request exceeded its deadline
    #[error("Request {id} ({method}) timed out")]
    RequestTimeout { id: u64, method: String },

    /// The server rejected a request
    #[error("RPC error [{code}] {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The connection was closed, locally or by the server
    #[error("Connection closed")]
    ConnectionClosed,

    /// No live connection to issue the request on
    #[error("Not connected")]
    NotConnected,

    /// Argument rejected before any request was sent
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced client, group or source is not in the current snapshot
    #[error("Unknown {kind}: {id}")]
    UnknownEntity { kind: &'static str, id: String },

    /// Response payload did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl SnapError {
    /// Whether this is an ordinary connectivity fault rather than an
    /// answer the server gave but that could not be used
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SnapError::ConnectTimeout { .. }
                | SnapError::ConnectRefused { .. }
                | SnapError::ConnectionClosed
                | SnapError::RequestTimeout { .. }
                | SnapError::Protocol(_)
                | SnapError::Io(_)
        )
    }

    /// Whether this is a server-side "method not found" rejection
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, SnapError::Rpc { code, .. } if *code == METHOD_NOT_FOUND)
    }
}
