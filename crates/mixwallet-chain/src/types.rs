use bitcoin::{OutPoint, ScriptBuf, Txid};

/// One entry of `list_transactions` — the node's lightweight transaction
/// listing, filtered to this wallet's watched labels by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedTx {
    pub txid: Txid,
    pub address: Option<String>,
    pub label: Option<String>,
}

/// The result of `get_transaction`: node-reported confirmation count
/// (negative means conflicted/abandoned) plus the raw transaction bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInfo {
    pub confirmations: i64,
    pub hex: Vec<u8>,
}

impl TxInfo {
    pub fn is_conflicted(&self) -> bool {
        self.confirmations < 0
    }
}

/// One entry of `query_utxo_set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoSetEntry {
    pub outpoint: OutPoint,
    pub value: u64,
    pub address: Option<String>,
    pub script: ScriptBuf,
    pub confirmations: Option<u32>,
}
