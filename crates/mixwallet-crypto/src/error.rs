use thiserror::Error;

/// Errors raised by a [`crate::ScriptEngine`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("BIP32 derivation failed: {0}")]
    Derivation(String),

    #[error("invalid derivation path: {0}")]
    InvalidPath(String),

    #[error("operation not supported for this script type")]
    UnsupportedOperation,

    #[error("invalid WIF: {0}")]
    InvalidWif(String),

    #[error("invalid script for this engine: {0}")]
    InvalidScript(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("invalid seed entropy: {0}")]
    InvalidEntropy(String),

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
}
