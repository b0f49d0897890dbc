use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("{path} does not name a handler")]
    NotAHandler { path: PathBuf },
    #[error("no handler named {0:?} in catalog")]
    UnknownHandler(String),
    #[error("handler {name:?} rejected its params: {source}")]
    Factory {
        name: String,
        source: anyhow::Error,
    },
    #[error("registration failed: {0}")]
    Register(anyhow::Error),
}
