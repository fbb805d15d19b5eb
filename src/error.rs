use thiserror::Error;

#[derive(Error, Debug)]
pub enum CigateError {
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GraphQL query failed: {0}")]
    GraphQL(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("No data in GraphQL response")]
    NoResponseData,

    #[error("A watch is already in progress on this poller")]
    AlreadyWatching,

    #[error("Status source failed {attempts} times in a row, giving up: {last_error}")]
    SourceExhausted { attempts: u32, last_error: String },
}

pub type Result<T> = std::result::Result<T, CigateError>;
