use std::path::PathBuf;

/// Errors raised while loading a pipe table.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The table file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The table file exceeds the configured size limit.
    #[error("{} is too large ({size} bytes, limit {max})", path.display())]
    TooLarge { path: PathBuf, size: u64, max: usize },

    /// The document is not valid JSON or does not match the typed model.
    #[error("invalid pipe table JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The embedded schema failed to compile.
    #[error("failed to compile pipe table schema: {0}")]
    SchemaCompile(String),

    /// The document violates the pipe table schema.
    #[error("pipe table failed validation: {message}")]
    Invalid { message: String },

    /// Cross-field checks failed.
    #[error("inconsistent pipe table: {0}")]
    Semantic(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
