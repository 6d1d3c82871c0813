use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Failure inside an injected store or connector.
    #[error("store: {0}")]
    Store(String),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Proof creation failed; verification failures are reported as `false`, not errors.
    #[error("proof: {0}")]
    Proof(String),
    #[error("schema: {0}")]
    Schema(String),
    #[error("config: {0}")]
    Config(&'static str),
    #[error("invalid state: {0}")]
    State(&'static str),
}
