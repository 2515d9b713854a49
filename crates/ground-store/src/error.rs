use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("timestamp format: {0}")]
    Format(#[from] time::error::Format),
}
