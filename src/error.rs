use thiserror::Error;

/// Errors surfaced by the client layer.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Core(#[from] tsbridge_core::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no connection named '{0}'")]
    UnknownConnection(String),

    /// The backend answered with a failed result.
    #[error("backend error: {0}")]
    Backend(String),

    /// A command-line expression could not be parsed.
    #[error("invalid argument: {0}")]
    Argument(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
