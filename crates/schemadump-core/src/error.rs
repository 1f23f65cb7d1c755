use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Failed to open process {pid}: {message}")]
    ProcessOpenFailed { pid: u32, message: String },

    #[error("Failed to read process memory at address {address:#x} ({size} bytes)")]
    MemoryReadFailed { address: u64, size: usize },

    #[error("Malformed PE image at {base:#x}: {message}")]
    InvalidImage { base: u64, message: String },

    #[error("Invalid signature pattern: {0}")]
    InvalidPattern(String),

    #[error("Schema system walk failed: {0}")]
    SchemaWalkFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_image(base: u64, message: impl Into<String>) -> Self {
        Self::InvalidImage {
            base,
            message: message.into(),
        }
    }

    pub fn schema_walk_failed(message: impl Into<String>) -> Self {
        Self::SchemaWalkFailed(message.into())
    }
}
