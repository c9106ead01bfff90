//! In-process configuration values.
//!
//! Config *file* parsing is out of scope — the embedding application
//! parses its own TOML/JSON/whatever and hands these structs in, the way
//! the teacher's `ServerConfig` sections are parsed by `main.rs` before
//! `daemon::run` ever sees them. No `toml` dependency lives in this
//! crate.

use serde::{Deserialize, Serialize};

/// `POLICY.*` options from the external-interfaces table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Confirm-target passed to `estimate_fee_per_kb`.
    pub tx_fees: u32,
    /// Hard fee ceiling in sats/kb; exceeding it is fatal.
    pub absurd_fee_per_kb: u64,
    /// One of `default`, `gradual`, `greedy`, `greediest`.
    pub merge_algorithm: String,
    /// Reuse-freeze threshold in sats; `-1` means always freeze reused
    /// addresses regardless of value.
    pub max_sats_freeze_reuse: i64,
    /// Passed verbatim to the node's `listunspent` RPC.
    pub listunspent_args: Vec<serde_json::Value>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            tx_fees: 6,
            absurd_fee_per_kb: 350_000,
            merge_algorithm: "default".to_string(),
            max_sats_freeze_reuse: 20_000,
            listunspent_args: Vec::new(),
        }
    }
}

/// `BLOCKCHAIN.network`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkSetting {
    Mainnet,
    Testnet,
    Regtest,
}

impl NetworkSetting {
    pub fn to_bitcoin_network(self) -> bitcoin::Network {
        match self {
            NetworkSetting::Mainnet => bitcoin::Network::Bitcoin,
            NetworkSetting::Testnet => bitcoin::Network::Testnet,
            NetworkSetting::Regtest => bitcoin::Network::Regtest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub gap_limit: u32,
    pub fast_sync_batch_size: u32,
    pub fast_sync_max_batches: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            gap_limit: 6,
            fast_sync_batch_size: 100,
            fast_sync_max_batches: 20,
        }
    }
}

/// Top-level configuration value handed to `WalletService::new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletServiceConfig {
    pub network: NetworkSetting,
    pub policy: PolicyConfig,
    pub sync: SyncConfig,
    /// How often the monitor loop ticks, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for WalletServiceConfig {
    fn default() -> Self {
        Self {
            network: NetworkSetting::Mainnet,
            policy: PolicyConfig::default(),
            sync: SyncConfig::default(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serde_roundtrips() {
        let config = WalletServiceConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let reparsed: WalletServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn poll_interval_defaults_to_five_seconds() {
        let json = r#"{"network":"Mainnet","policy":{"tx_fees":6,"absurd_fee_per_kb":350000,"merge_algorithm":"default","max_sats_freeze_reuse":20000,"listunspent_args":[]},"sync":{"gap_limit":6,"fast_sync_batch_size":100,"fast_sync_max_batches":20}}"#;
        let config: WalletServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.poll_interval_secs, 5);
    }
}
