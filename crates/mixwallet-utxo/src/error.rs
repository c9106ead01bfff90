use thiserror::Error;

#[derive(Error, Debug)]
pub enum UtxoError {
    #[error("utxo not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("insufficient funds: need {target} sats, have {available} sats among eligible coins")]
    InsufficientFunds { target: u64, available: u64 },
}
