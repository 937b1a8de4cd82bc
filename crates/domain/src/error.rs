/// Shared error type used across all Switchboard crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("at capacity: {0}")]
    AtCapacity(String),

    #[error("rate limited")]
    RateLimited,

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("agent startup timeout after {0}s")]
    SpawnTimeout(u64),

    #[error("agent exited prematurely: {0}")]
    AgentPrematureExit(String),

    #[error("signal delivery failed: {0}")]
    SignalFailed(String),

    #[error("invalid webhook signature")]
    SignatureInvalid,

    #[error("token: {0}")]
    Token(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
