//! Mixwallet Crypto
//!
//! Per-script-type key derivation, signing and address encoding.
//!
//! Three script types share one BIP32 derivation tree rooted at a single
//! seed: legacy P2PKH, wrapped-segwit P2SH-P2WPKH, and native-segwit
//! P2WPKH. Each is exposed through a [`ScriptEngine`] implementation so
//! callers can select behavior by script type without matching on an enum
//! at every call site.

pub mod engine;
pub mod error;
pub mod memory;
pub mod seed;

pub use engine::{
    account_path, bip44_coin_type, derive_bip32_master_key, derive_bip32_privkey, engine_for,
    parse_path, script_path, wif_to_privkey, P2pkhEngine, P2shP2wpkhEngine, P2wpkhEngine,
    ScriptEngine, ScriptType,
};
pub use error::EngineError;
pub use seed::Seed;
