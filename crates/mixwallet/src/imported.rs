//! Imported-key overlay.
//!
//! A mixdepth-partitioned list of non-derived keys layered on top of the
//! HD wallet's deterministic derivation. Slot indices are stable: removing
//! a key writes a tombstone rather than shifting later slots down, so a
//! `("imported", mixdepth, slot)` path always resolves to the same slot
//! even after earlier slots are removed.

use std::collections::HashMap;

use bitcoin::secp256k1::SecretKey;

use mixwallet_crypto::memory::LockedBuffer;
use mixwallet_crypto::ScriptType;

use crate::error::WalletError;
use crate::storage::{script_type_to_wallet_type, wallet_type_to_script_type};

struct ImportedKeySlot {
    key: LockedBuffer,
    key_type: ScriptType,
}

/// A slot holds `Some(slot)` while live, or `None` once tombstoned.
type Slot = Option<ImportedKeySlot>;

#[derive(Default)]
pub struct ImportedOverlay {
    slots: HashMap<u32, Vec<Slot>>,
}

impl ImportedOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key to `mixdepth`, returning its stable slot index. The key
    /// is copied into a memory-locked buffer rather than kept as a bare
    /// `SecretKey`.
    pub fn import(&mut self, mixdepth: u32, privkey: SecretKey, key_type: ScriptType) -> usize {
        let mut buf = LockedBuffer::new(32);
        buf.as_mut_slice().copy_from_slice(&privkey.secret_bytes());
        let slots = self.slots.entry(mixdepth).or_default();
        slots.push(Some(ImportedKeySlot { key: buf, key_type }));
        slots.len() - 1
    }

    /// Tombstone a slot. Idempotent: removing an already-removed or
    /// out-of-range slot is a no-op, matching "unbounded growth is
    /// preserved, not compacted" semantics.
    pub fn remove(&mut self, mixdepth: u32, slot: usize) {
        if let Some(slots) = self.slots.get_mut(&mixdepth) {
            if let Some(entry) = slots.get_mut(slot) {
                *entry = None;
            }
        }
    }

    pub fn get(&self, mixdepth: u32, slot: usize) -> Option<(SecretKey, ScriptType)> {
        let entry = self.slots.get(&mixdepth)?.get(slot)?.as_ref()?;
        let privkey = SecretKey::from_slice(entry.key.as_slice()).ok()?;
        Some((privkey, entry.key_type))
    }

    pub fn is_tombstoned(&self, mixdepth: u32, slot: usize) -> bool {
        matches!(self.slots.get(&mixdepth).and_then(|s| s.get(slot)), Some(None))
    }

    pub fn slot_count(&self, mixdepth: u32) -> usize {
        self.slots.get(&mixdepth).map(|s| s.len()).unwrap_or(0)
    }

    /// Every live `(mixdepth, slot, privkey, key_type)` tuple, for
    /// rebuilding the script map at load time.
    pub fn iter_active(&self) -> impl Iterator<Item = (u32, usize, SecretKey, ScriptType)> + '_ {
        self.slots.iter().flat_map(|(&mixdepth, slots)| {
            slots.iter().enumerate().filter_map(move |(slot, entry)| {
                let entry = entry.as_ref()?;
                let privkey = SecretKey::from_slice(entry.key.as_slice()).ok()?;
                Some((mixdepth, slot, privkey, entry.key_type))
            })
        })
    }

    /// Serialize to the wallet blob's `imported_keys` shape: hex-encoded
    /// private-key bytes paired with the wallet-type code for their
    /// script type, tombstones as `("", -1)`.
    pub fn to_persisted(&self) -> HashMap<String, Vec<(String, i32)>> {
        self.slots
            .iter()
            .map(|(&mixdepth, slots)| {
                let raw = slots
                    .iter()
                    .map(|slot| match slot {
                        Some(entry) => (
                            hex::encode(entry.key.as_slice()),
                            script_type_to_wallet_type(entry.key_type) as i32,
                        ),
                        None => (String::new(), -1),
                    })
                    .collect();
                (mixdepth.to_string(), raw)
            })
            .collect()
    }

    /// Rebuild from the wallet blob's `imported_keys` shape.
    pub fn from_persisted(
        raw: &HashMap<String, Vec<(String, i32)>>,
    ) -> Result<Self, WalletError> {
        let mut overlay = Self::new();
        for (mixdepth_str, entries) in raw {
            let mixdepth: u32 = mixdepth_str
                .parse()
                .map_err(|_| WalletError::Storage(crate::storage::StorageError::Malformed(
                    format!("non-numeric mixdepth key {mixdepth_str:?} in imported_keys"),
                )))?;
            let mut slots = Vec::with_capacity(entries.len());
            for (raw_key, type_code) in entries {
                if *type_code < 0 {
                    slots.push(None);
                    continue;
                }
                let key_type = wallet_type_to_script_type(*type_code as u8)?;
                let key_bytes = hex::decode(raw_key).map_err(|e| {
                    WalletError::Storage(crate::storage::StorageError::Malformed(format!(
                        "malformed imported key hex: {e}"
                    )))
                })?;
                let mut buf = LockedBuffer::new(key_bytes.len());
                buf.as_mut_slice().copy_from_slice(&key_bytes);
                slots.push(Some(ImportedKeySlot { key: buf, key_type }));
            }
            overlay.slots.insert(mixdepth, slots);
        }
        Ok(overlay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn import_assigns_sequential_stable_slots() {
        let mut overlay = ImportedOverlay::new();
        let a = overlay.import(0, key(1), ScriptType::P2wpkh);
        let b = overlay.import(0, key(2), ScriptType::P2wpkh);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
    }

    #[test]
    fn remove_tombstones_without_shifting_later_slots() {
        let mut overlay = ImportedOverlay::new();
        overlay.import(0, key(1), ScriptType::P2wpkh);
        let b = overlay.import(0, key(2), ScriptType::P2wpkh);
        overlay.remove(0, 0);
        assert!(overlay.is_tombstoned(0, 0));
        assert_eq!(overlay.get(0, b), Some((key(2), ScriptType::P2wpkh)));
        assert_eq!(overlay.slot_count(0), 2);
    }

    #[test]
    fn remove_is_idempotent_for_out_of_range_slots() {
        let mut overlay = ImportedOverlay::new();
        overlay.remove(5, 100);
    }

    #[test]
    fn iter_active_skips_tombstones() {
        let mut overlay = ImportedOverlay::new();
        overlay.import(0, key(1), ScriptType::P2wpkh);
        overlay.import(0, key(2), ScriptType::P2wpkh);
        overlay.remove(0, 0);
        let active: Vec<_> = overlay.iter_active().collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].1, 1);
    }

    #[test]
    fn secp_context_not_required_for_overlay_storage() {
        // The overlay only stores raw secret-key bytes; script derivation
        // happens in `ScriptEngine`, which needs its own context.
        let _secp = Secp256k1::new();
        let overlay = ImportedOverlay::new();
        assert_eq!(overlay.slot_count(0), 0);
    }
}
