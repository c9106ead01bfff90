//! Per-mixdepth UTXO tracking.
//!
//! Generalizes the teacher's single-descriptor `PolicyState::utxos` list
//! (outpoint + value + height, keyed by `HashMap`) to N mixdepths, plus a
//! disable-flag side table that survives a UTXO's removal so re-spend and
//! re-creation of the same outpoint does not reset its freeze state.

use std::collections::HashMap;

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::error::UtxoError;

/// An opaque wallet derivation path, serialized the way the owning wallet
/// formats it (`m/84'/0'/0'/0/3`, `imported/0/2`, ...). This crate never
/// interprets the string, only stores and returns it.
pub type WalletPath = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub path: WalletPath,
    pub value: u64,
    /// `None` means unconfirmed (the spec's `height = +infinity`).
    pub height: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UtxoMeta {
    pub disabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectableUtxo {
    pub outpoint: OutPoint,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedUtxoEntry {
    pub path: String,
    pub value: u64,
    pub height: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedMeta {
    pub disabled: bool,
}

/// The on-disk shape described in the data model: two top-level maps,
/// `utxo` keyed by mixdepth-decimal-string then composite hex key, and
/// `meta` keyed flatly by the same composite hex key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedStore {
    pub utxo: HashMap<String, HashMap<String, PersistedUtxoEntry>>,
    pub meta: HashMap<String, PersistedMeta>,
}

/// `txid || be_uint32(vout)`, hex-encoded, used as the composite storage
/// key. JSON can't hold raw byte strings, so the byte concatenation the
/// data model specifies is hex-encoded for serialization.
fn composite_key(outpoint: &OutPoint) -> String {
    let mut bytes = Vec::with_capacity(36);
    bytes.extend_from_slice(&outpoint.txid.to_byte_array());
    bytes.extend_from_slice(&outpoint.vout.to_be_bytes());
    hex::encode(bytes)
}

fn parse_composite_key(key: &str) -> Result<OutPoint, UtxoError> {
    let bytes = hex::decode(key)
        .map_err(|e| UtxoError::InvalidArgument(format!("bad composite key {key}: {e}")))?;
    if bytes.len() != 36 {
        return Err(UtxoError::InvalidArgument(format!(
            "composite key {key} has wrong length {}",
            bytes.len()
        )));
    }
    let txid_bytes: [u8; 32] = bytes[..32].try_into().unwrap();
    let txid = Txid::from_byte_array(txid_bytes);
    let vout = u32::from_be_bytes(bytes[32..36].try_into().unwrap());
    Ok(OutPoint { txid, vout })
}

/// Filter applied before a selector runs: outpoints to exclude outright,
/// and a maximum confirmation height (coins confirmed later than this are
/// ineligible). Disabled coins are always excluded unless explicitly
/// overridden by `balance_by_mixdepth(include_disabled = true)`.
#[derive(Debug, Clone, Default)]
pub struct SelectFilter {
    pub exclude: Vec<OutPoint>,
    pub maxheight: Option<u64>,
}

pub type SelectFn = fn(&[SelectableUtxo], u64) -> Result<Vec<SelectableUtxo>, UtxoError>;

#[derive(Debug, Clone, Default)]
pub struct UtxoStore {
    utxos: HashMap<u32, HashMap<OutPoint, UtxoEntry>>,
    meta: HashMap<OutPoint, UtxoMeta>,
}

impl UtxoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        outpoint: OutPoint,
        path: WalletPath,
        value: u64,
        mixdepth: u32,
        height: Option<u64>,
    ) -> Result<(), UtxoError> {
        if path.is_empty() {
            return Err(UtxoError::InvalidArgument("path must not be empty".into()));
        }
        self.utxos.entry(mixdepth).or_default().insert(
            outpoint,
            UtxoEntry {
                path,
                value,
                height,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, outpoint: &OutPoint, mixdepth: u32) -> Result<UtxoEntry, UtxoError> {
        self.utxos
            .get_mut(&mixdepth)
            .and_then(|m| m.remove(outpoint))
            .ok_or_else(|| UtxoError::NotFound(format!("{outpoint} not in mixdepth {mixdepth}")))
    }

    /// Scan every mixdepth for `outpoint`, returning which one holds it.
    /// `include_disabled = false` skips outpoints flagged disabled.
    pub fn have(&self, outpoint: &OutPoint, include_disabled: bool) -> Option<u32> {
        for (md, entries) in &self.utxos {
            if entries.contains_key(outpoint) {
                if !include_disabled && self.is_disabled(outpoint) {
                    continue;
                }
                return Some(*md);
            }
        }
        None
    }

    pub fn disable(&mut self, outpoint: OutPoint) {
        self.meta.entry(outpoint).or_default().disabled = true;
    }

    pub fn enable(&mut self, outpoint: OutPoint) {
        self.meta.entry(outpoint).or_default().disabled = false;
    }

    pub fn is_disabled(&self, outpoint: &OutPoint) -> bool {
        self.meta.get(outpoint).map(|m| m.disabled).unwrap_or(false)
    }

    fn eligible(&self, mixdepth: u32, filter: &SelectFilter) -> Vec<SelectableUtxo> {
        let Some(entries) = self.utxos.get(&mixdepth) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|(op, _)| !filter.exclude.contains(op))
            .filter(|(_, e)| match (filter.maxheight, e.height) {
                (Some(max), Some(h)) => h <= max,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter(|(op, _)| !self.is_disabled(op))
            .map(|(op, e)| SelectableUtxo {
                outpoint: *op,
                value: e.value,
            })
            .collect()
    }

    pub fn select(
        &self,
        mixdepth: u32,
        amount: u64,
        filter: &SelectFilter,
        select_fn: SelectFn,
    ) -> Result<HashMap<OutPoint, (WalletPath, u64)>, UtxoError> {
        let available = self.eligible(mixdepth, filter);
        let selected = select_fn(&available, amount)?;
        let entries = self.utxos.get(&mixdepth).expect("eligible() only returns known outpoints");
        Ok(selected
            .into_iter()
            .map(|s| {
                let entry = &entries[&s.outpoint];
                (s.outpoint, (entry.path.clone(), entry.value))
            })
            .collect())
    }

    pub fn balance_by_mixdepth(
        &self,
        max_mixdepth: u32,
        include_disabled: bool,
        maxheight: Option<u64>,
    ) -> HashMap<u32, u64> {
        let mut out = HashMap::new();
        for (&md, entries) in &self.utxos {
            if md > max_mixdepth {
                continue;
            }
            let sum: u64 = entries
                .iter()
                .filter(|(op, _)| include_disabled || !self.is_disabled(op))
                .filter(|(_, e)| match (maxheight, e.height) {
                    (Some(max), Some(h)) => h <= max,
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .map(|(_, e)| e.value)
                .sum();
            out.insert(md, sum);
        }
        out
    }

    pub fn mixdepths(&self) -> impl Iterator<Item = u32> + '_ {
        self.utxos.keys().copied()
    }

    /// Every tracked `(mixdepth, outpoint)` pair, for callers that need
    /// to replace the whole store's contents (e.g. reconciling against a
    /// node's `listunspent` at the end of sync).
    pub fn all_outpoints(&self) -> Vec<(u32, OutPoint)> {
        self.utxos
            .iter()
            .flat_map(|(&md, entries)| entries.keys().map(move |op| (md, *op)))
            .collect()
    }

    pub fn to_persisted(&self) -> PersistedStore {
        let mut utxo = HashMap::new();
        for (md, entries) in &self.utxos {
            let mut inner = HashMap::new();
            for (op, e) in entries {
                inner.insert(
                    composite_key(op),
                    PersistedUtxoEntry {
                        path: e.path.clone(),
                        value: e.value,
                        height: e.height,
                    },
                );
            }
            utxo.insert(md.to_string(), inner);
        }
        let mut meta = HashMap::new();
        for (op, m) in &self.meta {
            meta.insert(composite_key(op), PersistedMeta { disabled: m.disabled });
        }
        PersistedStore { utxo, meta }
    }

    pub fn from_persisted(persisted: &PersistedStore) -> Result<Self, UtxoError> {
        let mut store = Self::new();
        for (md_str, inner) in &persisted.utxo {
            let md: u32 = md_str
                .parse()
                .map_err(|_| UtxoError::InvalidArgument(format!("bad mixdepth key {md_str}")))?;
            for (key, entry) in inner {
                let outpoint = parse_composite_key(key)?;
                store.add(outpoint, entry.path.clone(), entry.value, md, entry.height)?;
            }
        }
        for (key, meta) in &persisted.meta {
            let outpoint = parse_composite_key(key)?;
            if meta.disabled {
                store.disable(outpoint);
            }
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([byte; 32]),
            vout,
        }
    }

    #[test]
    fn add_then_have_reports_mixdepth() {
        let mut store = UtxoStore::new();
        let op = outpoint(1, 0);
        store.add(op, "m/84'/0'/0'/0/0".into(), 1_000, 0, Some(10)).unwrap();
        assert_eq!(store.have(&op, true), Some(0));
    }

    #[test]
    fn remove_returns_entry_and_clears_it() {
        let mut store = UtxoStore::new();
        let op = outpoint(2, 0);
        store.add(op, "path".into(), 500, 1, None).unwrap();
        let entry = store.remove(&op, 1).unwrap();
        assert_eq!(entry.value, 500);
        assert!(store.remove(&op, 1).is_err());
    }

    #[test]
    fn disable_persists_across_remove_and_readd() {
        let mut store = UtxoStore::new();
        let op = outpoint(3, 0);
        store.add(op, "path".into(), 500, 0, None).unwrap();
        store.disable(op);
        store.remove(&op, 0).unwrap();
        store.add(op, "path".into(), 500, 0, None).unwrap();
        assert!(store.is_disabled(&op));
    }

    #[test]
    fn balance_by_mixdepth_sums_and_filters_disabled() {
        let mut store = UtxoStore::new();
        store.add(outpoint(4, 0), "a".into(), 1_000, 0, Some(5)).unwrap();
        store.add(outpoint(5, 0), "b".into(), 2_000, 0, Some(5)).unwrap();
        store.disable(outpoint(5, 0));
        let balances = store.balance_by_mixdepth(0, false, None);
        assert_eq!(balances[&0], 1_000);
        let balances_incl = store.balance_by_mixdepth(0, true, None);
        assert_eq!(balances_incl[&0], 3_000);
    }

    #[test]
    fn maxheight_filter_excludes_unconfirmed_and_later_coins() {
        let mut store = UtxoStore::new();
        store.add(outpoint(6, 0), "a".into(), 1_000, 0, Some(100)).unwrap();
        store.add(outpoint(7, 0), "b".into(), 1_000, 0, Some(200)).unwrap();
        store.add(outpoint(8, 0), "c".into(), 1_000, 0, None).unwrap();
        let balances = store.balance_by_mixdepth(0, true, Some(150));
        assert_eq!(balances[&0], 1_000);
    }

    #[test]
    fn persistence_roundtrip_preserves_everything() {
        let mut store = UtxoStore::new();
        let op = outpoint(9, 3);
        store.add(op, "m/84'/0'/2'/0/1".into(), 12_345, 2, Some(777)).unwrap();
        store.disable(op);
        let persisted = store.to_persisted();
        let json = serde_json::to_string(&persisted).unwrap();
        let reparsed: PersistedStore = serde_json::from_str(&json).unwrap();
        let restored = UtxoStore::from_persisted(&reparsed).unwrap();
        assert_eq!(restored.have(&op, true), Some(2));
        assert!(restored.is_disabled(&op));
        assert_eq!(restored.balance_by_mixdepth(2, true, None)[&2], 12_345);
    }

    #[test]
    fn composite_key_roundtrips() {
        let op = outpoint(42, 7);
        let key = composite_key(&op);
        assert_eq!(parse_composite_key(&key).unwrap(), op);
    }
}
