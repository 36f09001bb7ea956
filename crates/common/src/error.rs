use thiserror::Error;

/// Infrastructure errors raised by stores, queues and locks.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failures recorded on a job or recipient during dispatch.
///
/// None of these escape the dispatch boundary: the message becomes the
/// `error_info` of the job (or the `info` of a recipient) and the status
/// moves to `Error`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Cannot find doc {document_type} id {document_id}")]
    NotFound {
        document_type: String,
        document_id: String,
    },

    #[error("Cannot generate wechat template {what} for {document_type}")]
    DataGeneration {
        document_type: String,
        what: &'static str,
    },

    #[error("{0}")]
    Configuration(String),

    #[error("Remote call failed: {0}")]
    RemoteCall(String),

    #[error(transparent)]
    Store(#[from] AppError),
}
