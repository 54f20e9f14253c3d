use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("remote mutation failed: {0}")]
    RemoteMutation(String),

    #[error("remote query failed: {0}")]
    RemoteQuery(String),

    #[error("subscription dropped: {0}")]
    SubscriptionDropped(String),

    #[error("reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type SyncResult<T> = Result<T, TetherError>;
