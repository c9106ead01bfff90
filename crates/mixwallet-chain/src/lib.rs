//! Mixwallet Chain
//!
//! The abstract contract the wallet service drives a sync/monitor loop
//! against. No concrete transport lives here — an embedding application
//! supplies a `BlockchainInterface` backed by Bitcoin Core RPC or
//! whatever node connection it has; this crate only names the shape of
//! that connection.

pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod types;

pub use error::ChainError;
pub use types::{ListedTx, TxInfo, UtxoSetEntry};

use bitcoin::{OutPoint, Transaction, Txid};

/// Operations the wallet service's sync and monitor logic consumes.
/// Implementations wrap an actual Bitcoin Core RPC connection (or an
/// Electrum-style indexer); this crate only states the contract.
pub trait BlockchainInterface: Send + Sync {
    fn get_current_block_height(&self) -> Result<u64, ChainError>;

    /// Most recent `n` transactions the node knows about, newest first.
    fn list_transactions(&self, n: usize) -> Result<Vec<ListedTx>, ChainError>;

    fn get_transaction(&self, txid: &Txid) -> Result<TxInfo, ChainError>;

    /// Deserialize the raw hex a `get_transaction` call returned.
    fn get_deser_from_gettransaction(&self, info: &TxInfo) -> Result<Transaction, ChainError> {
        bitcoin::consensus::deserialize(&info.hex)
            .map_err(|e| ChainError::Rpc(format!("malformed transaction hex: {e}")))
    }

    fn is_address_imported(&self, address: &str) -> Result<bool, ChainError>;

    /// Import addresses under `label`, optionally invoking `restart_cb`
    /// once the import completes (the node may need a restart/rescan
    /// before imported addresses are queryable).
    fn import_addresses(
        &self,
        addresses: &[String],
        label: &str,
        restart_cb: Option<&dyn Fn()>,
    ) -> Result<(), ChainError>;

    /// Import whatever subset of `addresses` is not already known.
    /// Returns `true` if anything was imported (a rescan is needed).
    fn import_addresses_if_needed(
        &self,
        addresses: &[String],
        label: &str,
    ) -> Result<bool, ChainError> {
        let mut missing = Vec::new();
        for addr in addresses {
            if !self.is_address_imported(addr)? {
                missing.push(addr.clone());
            }
        }
        if missing.is_empty() {
            return Ok(false);
        }
        self.import_addresses(&missing, label, None)?;
        Ok(true)
    }

    fn is_address_labeled(&self, tx: &ListedTx, label: &str) -> bool {
        tx.label.as_deref() == Some(label)
    }

    fn estimate_fee_per_kb(&self, confirm_target: u32) -> Result<u64, ChainError>;

    /// Escape hatch for node calls this contract doesn't otherwise name.
    fn rpc(&self, method: &str, params: &[serde_json::Value]) -> Result<serde_json::Value, ChainError>;

    fn query_utxo_set(
        &self,
        outpoints: &[OutPoint],
        include_confs: bool,
    ) -> Result<Vec<Option<UtxoSetEntry>>, ChainError>;
}
