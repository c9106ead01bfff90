use thiserror::Error;

/// Logical wallet faults: unknown key, invalid mixdepth, duplicate
/// import, bad network, disabled script minting.
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("unknown script")]
    UnknownScript,

    #[error("invalid mixdepth {0}")]
    InvalidMixdepth(u32),

    #[error("duplicate import at mixdepth {mixdepth} slot {slot}")]
    DuplicateImport { mixdepth: u32, slot: usize },

    #[error("network mismatch: wallet is {wallet}, requested {requested}")]
    NetworkMismatch { wallet: String, requested: String },

    #[error("new script minting is disabled on this wallet")]
    NewScriptsDisabled,

    #[error("index {requested} is behind current {current}; use force to rewind")]
    IndexNotMonotonic { current: u32, requested: u32 },

    #[error("wallet has no tracked entropy and cannot be persisted")]
    NotStorageBacked,

    #[error(transparent)]
    Engine(#[from] mixwallet_crypto::EngineError),

    #[error(transparent)]
    Utxo(#[from] mixwallet_utxo::UtxoError),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

/// Errors raised while driving sync against a `BlockchainInterface`.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to sync in fast mode after {batches} batches")]
    FastSyncExhausted { batches: u32 },

    #[error("node requires a rescan before sync can complete")]
    RescanRequired,

    #[error(transparent)]
    Chain(#[from] mixwallet_chain::ChainError),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

/// Errors raised by the wallet service's orchestration layer, including
/// the fatal fee-absurdity condition.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("estimated fee {estimated} sats/kb exceeds configured ceiling {ceiling} sats/kb")]
    FeeAbsurd { estimated: u64, ceiling: u64 },

    #[error(transparent)]
    Chain(#[from] mixwallet_chain::ChainError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}
