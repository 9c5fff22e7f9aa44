use thiserror::Error;

/// Errors produced by the chapi bridge.
#[derive(Debug, Error)]
pub enum ChapiError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("payload is not valid {charset}: {reason}")]
    Encoding { charset: &'static str, reason: String },

    /// The channel service refused to issue a token. Always fatal for the
    /// request that triggered it.
    #[error("failed to create channel for client {0}")]
    TokenIssuance(String),

    #[error("token error: {0}")]
    Token(String),

    /// A presence notification names a client that has no held connection.
    #[error("no held connection for client {0}")]
    ConnectionNotFound(String),

    #[error("delivery to {client_id} failed: {reason}")]
    Delivery { client_id: String, reason: String },

    #[error("connection limit ({0}) reached")]
    ConnectionLimit(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ChapiError {
    /// Whether this error means the deployment itself is broken (channel
    /// service unreachable, presence layer out of sync with the registry).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChapiError::TokenIssuance(_) | ChapiError::ConnectionNotFound(_) | ChapiError::Config(_)
        )
    }
}

pub type ChapiResult<T> = Result<T, ChapiError>;
