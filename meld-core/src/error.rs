use thiserror::Error;

/// Unified startup-time error for meld.
///
/// The serving loop never returns this type: request-path failures are
/// expressed through the client error vocabulary instead.
#[derive(Error, Debug)]
pub enum MeldError {
    #[error("invalid configuration:\n{0}")]
    Config(String),

    #[error("flow compilation failed: {0}")]
    FlowCompile(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}
