//! Mixwallet
//!
//! HD wallet core for a Bitcoin CoinJoin client: mixdepth-partitioned
//! accounts over a single BIP32 tree, a UTXO store with pluggable coin
//! selection, transaction reconciliation and signing, and a wallet
//! service that drives sync and a periodic transaction monitor loop
//! against an abstract [`mixwallet_chain::BlockchainInterface`].

pub mod config;
pub mod error;
pub mod fees;
pub mod hdwallet;
pub mod imported;
pub mod service;
pub mod storage;

pub use config::{NetworkSetting, PolicyConfig, SyncConfig, WalletServiceConfig};
pub use error::{ServiceError, SyncError, WalletError};
pub use hdwallet::{AddedUtxo, HdWallet, ProcessTxResult, RemovedUtxo, WalletPath};
pub use imported::ImportedOverlay;
pub use service::{CallbackKey, WalletService};
pub use storage::{Storage, StorageError, WalletBlob};

pub use mixwallet_chain::{BlockchainInterface, ChainError};
pub use mixwallet_crypto::{engine_for, ScriptEngine, ScriptType, Seed};
pub use mixwallet_utxo::{selector_registry, SelectFilter, SelectFn, UtxoError, UtxoStore};
