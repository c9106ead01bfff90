//! An in-memory `BlockchainInterface` for exercising the wallet service
//! without a real node connection. Plays the role the teacher's
//! `#[ignore = "requires network access"]` Electrum tests play, except
//! this one runs by default since it needs no network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitcoin::{OutPoint, Transaction, Txid};

use crate::error::ChainError;
use crate::types::{ListedTx, TxInfo, UtxoSetEntry};
use crate::BlockchainInterface;

#[derive(Default)]
pub struct MockChain {
    height: Mutex<u64>,
    /// Newest-first order of pushed txids, matching `list_transactions`'s
    /// contract.
    order: Mutex<Vec<Txid>>,
    txs: Mutex<HashMap<Txid, (TxInfo, ListedTx)>>,
    imported: Mutex<HashMap<String, String>>,
    utxos: Mutex<HashMap<OutPoint, UtxoSetEntry>>,
    fee_per_kb: Mutex<u64>,
    /// Canned responses for the `rpc` escape hatch, keyed by method name.
    rpc_responses: Mutex<HashMap<String, serde_json::Value>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            fee_per_kb: Mutex::new(1_000),
            ..Default::default()
        }
    }

    pub fn set_height(&self, height: u64) {
        *self.height.lock().unwrap() = height;
    }

    pub fn set_fee_per_kb(&self, sats: u64) {
        *self.fee_per_kb.lock().unwrap() = sats;
    }

    /// Register a transaction as if the node had just observed it, most
    /// recent first.
    pub fn push_tx(&self, tx: &Transaction, address: Option<String>, label: Option<String>, confirmations: i64) {
        let txid = tx.compute_txid();
        let hex = bitcoin::consensus::serialize(tx);
        self.txs.lock().unwrap().insert(
            txid,
            (
                TxInfo { confirmations, hex },
                ListedTx {
                    txid,
                    address,
                    label,
                },
            ),
        );
        let mut order = self.order.lock().unwrap();
        order.retain(|t| t != &txid);
        order.insert(0, txid);
    }

    /// Update a previously-pushed transaction's confirmation count, e.g.
    /// to simulate it confirming on the next tick.
    pub fn set_confirmations(&self, txid: &Txid, confirmations: i64) {
        if let Some((info, _)) = self.txs.lock().unwrap().get_mut(txid) {
            info.confirmations = confirmations;
        }
    }

    pub fn add_utxo(&self, entry: UtxoSetEntry) {
        self.utxos.lock().unwrap().insert(entry.outpoint, entry);
    }

    pub fn mark_imported(&self, address: &str, label: &str) {
        self.imported
            .lock()
            .unwrap()
            .insert(address.to_string(), label.to_string());
    }

    pub fn set_rpc_response(&self, method: &str, response: serde_json::Value) {
        self.rpc_responses
            .lock()
            .unwrap()
            .insert(method.to_string(), response);
    }
}

impl BlockchainInterface for MockChain {
    fn get_current_block_height(&self) -> Result<u64, ChainError> {
        Ok(*self.height.lock().unwrap())
    }

    fn list_transactions(&self, n: usize) -> Result<Vec<ListedTx>, ChainError> {
        let order = self.order.lock().unwrap();
        let txs = self.txs.lock().unwrap();
        Ok(order
            .iter()
            .take(n)
            .filter_map(|txid| txs.get(txid).map(|(_, listed)| listed.clone()))
            .collect())
    }

    fn get_transaction(&self, txid: &Txid) -> Result<TxInfo, ChainError> {
        self.txs
            .lock()
            .unwrap()
            .get(txid)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| ChainError::NotFound(txid.to_string()))
    }

    fn is_address_imported(&self, address: &str) -> Result<bool, ChainError> {
        Ok(self.imported.lock().unwrap().contains_key(address))
    }

    fn import_addresses(
        &self,
        addresses: &[String],
        label: &str,
        restart_cb: Option<&dyn Fn()>,
    ) -> Result<(), ChainError> {
        let mut imported = self.imported.lock().unwrap();
        for addr in addresses {
            imported.insert(addr.clone(), label.to_string());
        }
        drop(imported);
        if let Some(cb) = restart_cb {
            cb();
        }
        Ok(())
    }

    fn estimate_fee_per_kb(&self, _confirm_target: u32) -> Result<u64, ChainError> {
        Ok(*self.fee_per_kb.lock().unwrap())
    }

    fn rpc(&self, method: &str, _params: &[serde_json::Value]) -> Result<serde_json::Value, ChainError> {
        self.rpc_responses
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .ok_or_else(|| ChainError::Rpc(format!("MockChain has no handler for {method}")))
    }

    fn query_utxo_set(
        &self,
        outpoints: &[OutPoint],
        _include_confs: bool,
    ) -> Result<Vec<Option<UtxoSetEntry>>, ChainError> {
        let utxos = self.utxos.lock().unwrap();
        Ok(outpoints.iter().map(|op| utxos.get(op).cloned()).collect())
    }
}

/// Lets a caller hold onto an `Arc<MockChain>` for direct assertions
/// while also handing a `Box<dyn BlockchainInterface>` built from a
/// clone of the same `Arc` to the code under test.
impl BlockchainInterface for Arc<MockChain> {
    fn get_current_block_height(&self) -> Result<u64, ChainError> {
        (**self).get_current_block_height()
    }

    fn list_transactions(&self, n: usize) -> Result<Vec<ListedTx>, ChainError> {
        (**self).list_transactions(n)
    }

    fn get_transaction(&self, txid: &Txid) -> Result<TxInfo, ChainError> {
        (**self).get_transaction(txid)
    }

    fn is_address_imported(&self, address: &str) -> Result<bool, ChainError> {
        (**self).is_address_imported(address)
    }

    fn import_addresses(
        &self,
        addresses: &[String],
        label: &str,
        restart_cb: Option<&dyn Fn()>,
    ) -> Result<(), ChainError> {
        (**self).import_addresses(addresses, label, restart_cb)
    }

    fn estimate_fee_per_kb(&self, confirm_target: u32) -> Result<u64, ChainError> {
        (**self).estimate_fee_per_kb(confirm_target)
    }

    fn rpc(&self, method: &str, params: &[serde_json::Value]) -> Result<serde_json::Value, ChainError> {
        (**self).rpc(method, params)
    }

    fn query_utxo_set(
        &self,
        outpoints: &[OutPoint],
        include_confs: bool,
    ) -> Result<Vec<Option<UtxoSetEntry>>, ChainError> {
        (**self).query_utxo_set(outpoints, include_confs)
    }
}
