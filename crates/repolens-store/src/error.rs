use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("repository not found: {0}")]
    NotFound(String),
    #[error("repository already exists: {0}")]
    Duplicate(String),
    #[error("invalid stored value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}
