use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Missing secret: environment variable {var} is not set")]
    MissingSecret { var: String },

    #[error("Parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Store failures abort the pass they occur in.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, SyncError::Store(_) | SyncError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
