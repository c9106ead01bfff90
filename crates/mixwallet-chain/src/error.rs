use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("rpc call failed: {0}")]
    Rpc(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("rescan required before this operation can complete")]
    RescanRequired,
}
