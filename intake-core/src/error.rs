use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("mail error: {0}")]
    Mail(String),

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("workflow error: {0}")]
    Workflow(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<intake_model::ModelError> for CoreError {
    fn from(err: intake_model::ModelError) -> Self {
        CoreError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
