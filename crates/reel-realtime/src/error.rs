use thiserror::Error;

/// The feed transport refused or failed to open a channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("unknown table {schema}.{table}")]
    UnknownTable { schema: String, table: String },

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Datastore collaborator failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("not authorized")]
    Unauthorized,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("datastore error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no identity is signed in")]
    SignedOut,
}
