//! Wallet Service: owns an `HdWallet` plus a `BlockchainInterface`,
//! drives sync and the periodic transaction monitor loop, and dispatches
//! callbacks the way the teacher's daemon loop dispatches notifications.
//!
//! The service owns the wallet, not the other way around — a wallet
//! never reaches back into a node connection on its own.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bitcoin::{ScriptBuf, Transaction, Txid};

use mixwallet_chain::{BlockchainInterface, ChainError, ListedTx};

use crate::error::{ServiceError, SyncError, WalletError};
use crate::hdwallet::{HdWallet, ProcessTxResult, WalletPath};
use crate::storage::Storage;

/// Label used on the node for the wallet's watch-only address set, per
/// the external interfaces table.
pub fn wallet_notify_label() -> &'static str {
    "joinmarket-notify"
}

/// Key a callback is registered against: either a specific txid, or a
/// specific output set (script, value) pairs — a transaction matches an
/// output-keyed callback regardless of which txid eventually carries
/// those outputs, which lets a caller register "notify me when this
/// payment arrives" before broadcasting its own transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallbackKey {
    Txid(Txid),
    Outputs(Vec<(ScriptBuf, u64)>),
}

type AllCallback = Box<dyn FnMut(&Transaction, &Txid) + Send>;
type UnconfirmedCallback = Box<dyn FnMut(&Transaction, &Txid) -> bool + Send>;
type ConfirmedCallback = Box<dyn FnMut(&Transaction, &Txid, i64) -> bool + Send>;
type AutofreezeCallback = Box<dyn FnMut(&str) + Send>;

/// Composition root: `Wallet + Blockchain Interface` plus the monitor
/// loop's running state. Sync and tick are ordinary methods so a caller
/// can drive them from its own event loop instead of `run_forever`.
pub struct WalletService {
    wallet: HdWallet,
    chain: Box<dyn BlockchainInterface>,
    config: crate::config::WalletServiceConfig,
    current_blockheight: u64,
    /// Txids seen on the previous tick, used to detect new arrivals.
    old_txs: Vec<Txid>,
    /// Unconfirmed txids currently being watched across ticks.
    active_txids: Vec<Txid>,
    /// Txids that have already run through reuse detection once.
    processed_txids: HashSet<Txid>,
    used_addresses: HashSet<String>,
    all_callbacks: Vec<AllCallback>,
    unconfirmed_callbacks: HashMap<CallbackKey, Vec<UnconfirmedCallback>>,
    confirmed_callbacks: HashMap<CallbackKey, Vec<ConfirmedCallback>>,
    autofreeze_callback: Option<AutofreezeCallback>,
    synced: bool,
}

impl WalletService {
    pub fn new(
        wallet: HdWallet,
        chain: Box<dyn BlockchainInterface>,
        config: crate::config::WalletServiceConfig,
    ) -> Self {
        Self {
            wallet,
            chain,
            config,
            current_blockheight: 0,
            old_txs: Vec::new(),
            active_txids: Vec::new(),
            processed_txids: HashSet::new(),
            used_addresses: HashSet::new(),
            all_callbacks: Vec::new(),
            unconfirmed_callbacks: HashMap::new(),
            confirmed_callbacks: HashMap::new(),
            autofreeze_callback: None,
            synced: false,
        }
    }

    /// Build a service around a wallet reopened from a persisted blob,
    /// the composition-root equivalent of the daemon re-attaching to an
    /// already-initialized wallet file instead of minting a fresh one.
    pub fn open(
        storage: &Storage,
        max_mixdepth: u32,
        chain: Box<dyn BlockchainInterface>,
        config: crate::config::WalletServiceConfig,
    ) -> Result<Self, WalletError> {
        let wallet = HdWallet::open(storage, max_mixdepth)?;
        Ok(Self::new(wallet, chain, config))
    }

    /// Flush the wallet's current state back to `storage`. A no-op
    /// wrapper over `HdWallet::persist` so callers don't need to reach
    /// into `wallet_mut()` just to save.
    pub fn persist(&self, storage: &mut Storage) -> Result<(), WalletError> {
        self.wallet.persist(storage)
    }

    pub fn wallet(&self) -> &HdWallet {
        &self.wallet
    }

    pub fn wallet_mut(&mut self) -> &mut HdWallet {
        &mut self.wallet
    }

    pub fn current_blockheight(&self) -> u64 {
        self.current_blockheight
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Fires for every transaction carrying the wallet's own label,
    /// confirmed or not. Never removed.
    pub fn register_all<F>(&mut self, cb: F)
    where
        F: FnMut(&Transaction, &Txid) + Send + 'static,
    {
        self.all_callbacks.push(Box::new(cb));
    }

    /// Fires while a matching transaction sits unconfirmed. Removed once
    /// the callback returns `true`.
    pub fn register_unconfirmed<F>(&mut self, key: CallbackKey, cb: F)
    where
        F: FnMut(&Transaction, &Txid) -> bool + Send + 'static,
    {
        self.unconfirmed_callbacks.entry(key).or_default().push(Box::new(cb));
    }

    /// Fires once a matching transaction gains its first confirmation
    /// (and on every subsequent tick until it returns `true`).
    pub fn register_confirmed<F>(&mut self, key: CallbackKey, cb: F)
    where
        F: FnMut(&Transaction, &Txid, i64) -> bool + Send + 'static,
    {
        self.confirmed_callbacks.entry(key).or_default().push(Box::new(cb));
    }

    pub fn set_autofreeze_callback<F>(&mut self, cb: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.autofreeze_callback = Some(Box::new(cb));
    }

    /// Every known script's address plus freshly-minted gap-limit
    /// addresses for each branch, ready to hand to `import_addresses`.
    fn collect_addresses_gap(&mut self) -> Vec<String> {
        let gap = self.config.sync.gap_limit;
        let max_mixdepth = self.wallet.max_mixdepth();
        let mut addresses = Vec::new();
        for mixdepth in 0..=max_mixdepth {
            let next = self
                .wallet
                .index_cache_snapshot()
                .get(&mixdepth)
                .copied()
                .unwrap_or([0, 0]);
            for (branch, &next_unused) in next.iter().enumerate() {
                let internal = branch == 1;
                for index in 0..(next_unused + gap) {
                    if let Ok(script) = self.wallet.get_new_script_override_disable(mixdepth, internal, index) {
                        if let Ok(address) = self.wallet.script_address(&script) {
                            addresses.push(address.to_string());
                        }
                    }
                }
            }
        }
        addresses.extend(self.wallet.all_known_addresses());
        addresses.sort();
        addresses.dedup();
        addresses
    }

    /// Replace the wallet's per-mixdepth UTXO state wholesale with what
    /// the node currently reports for our addresses. Both sync modes end
    /// with this step. `listunspent` is not a named operation in the
    /// blockchain interface contract, so it rides the `rpc` escape hatch;
    /// a node that doesn't answer it leaves the wallet's own bookkeeping
    /// untouched rather than failing sync outright.
    fn replace_utxo_state_from_node(&mut self) -> Result<(), SyncError> {
        let response = match self.chain.rpc("listunspent", &self.config.policy.listunspent_args) {
            Ok(v) => v,
            Err(ChainError::Rpc(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Some(entries) = response.as_array() else {
            return Ok(());
        };

        for (mixdepth, outpoint) in self.wallet.utxo_store().all_outpoints() {
            let _ = self.wallet.utxo_store_mut().remove(&outpoint, mixdepth);
        }

        for entry in entries {
            let (Some(txid_hex), Some(vout), Some(script_hex), Some(amount_btc), Some(confirmations)) = (
                entry.get("txid").and_then(|v| v.as_str()),
                entry.get("vout").and_then(|v| v.as_u64()),
                entry.get("scriptPubKey").and_then(|v| v.as_str()),
                entry.get("amount").and_then(|v| v.as_f64()),
                entry.get("confirmations").and_then(|v| v.as_i64()),
            ) else {
                continue;
            };
            let Ok(txid) = txid_hex.parse::<Txid>() else { continue };
            let outpoint = bitcoin::OutPoint { txid, vout: vout as u32 };
            let Ok(script_bytes) = hex::decode(script_hex) else { continue };
            let script = ScriptBuf::from_bytes(script_bytes);
            let Some(path) = self.wallet.script_to_path(&script).copied() else {
                continue;
            };
            let value = (amount_btc * 100_000_000.0).round() as u64;
            let height = if confirmations <= 0 {
                None
            } else {
                Some(self.current_blockheight.saturating_sub(confirmations as u64) + 1)
            };
            let _ = self
                .wallet
                .utxo_store_mut()
                .add(outpoint, path.encode(), value, path.mixdepth(), height);
        }
        Ok(())
    }

    /// Flatten an `index_cache_snapshot` (`mixdepth -> [external, internal]`)
    /// into the `(mixdepth, branch) -> next_index` shape `rewind_wallet_indices`
    /// expects.
    fn flatten_saved_indices(saved: &HashMap<u32, [u32; 2]>) -> HashMap<(u32, u32), u32> {
        let mut flat = HashMap::new();
        for (&mixdepth, slots) in saved {
            flat.insert((mixdepth, 0), slots[0]);
            flat.insert((mixdepth, 1), slots[1]);
        }
        flat
    }

    /// Build the `(mixdepth, branch) -> next_index` map implied by the
    /// addresses actually seen in `recent`, for feeding into
    /// `rewind_wallet_indices`.
    fn compute_used_indices(&self, recent: &[ListedTx]) -> HashMap<(u32, u32), u32> {
        let mut used: HashMap<(u32, u32), u32> = HashMap::new();
        for listed in recent {
            let Some(addr_str) = &listed.address else { continue };
            let Ok(address) = addr_str.parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>() else {
                continue;
            };
            let Ok(address) = address.require_network(self.wallet.network()) else {
                continue;
            };
            if let Some(WalletPath::Derived { mixdepth, branch, index }) = self.wallet.addr_to_path(&address).copied() {
                let entry = used.entry((mixdepth, branch)).or_insert(0);
                if index + 1 > *entry {
                    *entry = index + 1;
                }
            }
        }
        used
    }

    /// Fast sync: import the wallet's own gap-limit address set if the
    /// node has never seen it, otherwise scan recent transactions in
    /// growing batches to find every index actually in use.
    pub fn fast_sync(&mut self) -> Result<(), SyncError> {
        self.current_blockheight = self.chain.get_current_block_height()?;
        let wallet_label = self.wallet.wallet_label();

        let recent = self.chain.list_transactions(500)?;
        let has_wallet_activity = recent.iter().any(|t| self.chain.is_address_labeled(t, &wallet_label));

        if !has_wallet_activity {
            let addresses = self.collect_addresses_gap();
            self.chain.import_addresses_if_needed(&addresses, &wallet_label)?;
            let saved_indices = self.wallet.index_cache_snapshot();
            let used = self.compute_used_indices(&recent);
            self.wallet.rewind_wallet_indices(&used, &Self::flatten_saved_indices(&saved_indices))?;
            self.synced = true;
            self.replace_utxo_state_from_node()?;
            return Ok(());
        }

        let mut unmatched: HashSet<String> = self
            .wallet
            .all_known_addresses()
            .into_iter()
            .filter(|a| self.chain.is_address_imported(a).unwrap_or(false))
            .collect();

        let batch_size = self.config.sync.fast_sync_batch_size as usize;
        let max_batches = self.config.sync.fast_sync_max_batches;
        let mut exhausted = true;
        let mut last_batch: Vec<ListedTx> = Vec::new();
        for batch in 1..=max_batches {
            let txs = self.chain.list_transactions(batch_size * batch as usize)?;
            for tx in &txs {
                if let Some(addr) = &tx.address {
                    unmatched.remove(addr);
                }
            }
            last_batch = txs;
            if unmatched.is_empty() {
                exhausted = false;
                break;
            }
        }
        if exhausted {
            return Err(SyncError::FastSyncExhausted { batches: max_batches });
        }

        let addresses = self.collect_addresses_gap();
        self.chain.import_addresses_if_needed(&addresses, &wallet_label)?;
        let saved_indices = self.wallet.index_cache_snapshot();
        let used = self.compute_used_indices(&last_batch);
        self.wallet.rewind_wallet_indices(&used, &Self::flatten_saved_indices(&saved_indices))?;
        self.synced = true;
        self.replace_utxo_state_from_node()?;
        Ok(())
    }

    /// Recover sync: iteratively widen the imported address set from the
    /// index cache's current state until a rewind produces no further
    /// movement, requesting a rescan whenever addresses are newly
    /// imported along the way.
    pub fn recover_sync(&mut self) -> Result<(), SyncError> {
        self.current_blockheight = self.chain.get_current_block_height()?;
        let wallet_label = self.wallet.wallet_label();

        loop {
            let addresses = self.collect_addresses_gap();
            let imported_new = self.chain.import_addresses_if_needed(&addresses, &wallet_label)?;
            if imported_new {
                return Err(SyncError::RescanRequired);
            }

            let saved_indices = self.wallet.index_cache_snapshot();
            let recent = self.chain.list_transactions(
                (self.config.sync.fast_sync_batch_size * self.config.sync.fast_sync_max_batches) as usize,
            )?;
            let used = self.compute_used_indices(&recent);

            self.wallet.rewind_wallet_indices(&used, &Self::flatten_saved_indices(&saved_indices))?;
            let after = self.wallet.index_cache_snapshot();
            let moved = after.iter().any(|(mixdepth, slots)| {
                *slots != saved_indices.get(mixdepth).copied().unwrap_or([0, 0])
            });
            if !moved {
                break;
            }
        }

        self.synced = true;
        self.replace_utxo_state_from_node()?;
        Ok(())
    }

    fn apply_reuse_policy(&mut self, result: &ProcessTxResult) {
        let threshold = self.config.policy.max_sats_freeze_reuse;
        for added in &result.added {
            let Some(addr) = &added.address else { continue };
            if !self.used_addresses.contains(addr) {
                continue;
            }
            let freeze = threshold < 0 || (added.value as i64) <= threshold;
            if !freeze {
                continue;
            }
            self.wallet.utxo_store_mut().disable(added.outpoint);
            log::warn!(
                "address reuse detected on {}:{}, auto-freezing",
                added.outpoint.txid,
                added.outpoint.vout
            );
            if let Some(cb) = &mut self.autofreeze_callback {
                cb(&format!("{}:{}", added.outpoint.txid, added.outpoint.vout));
            }
        }
        for addr in result.added_addresses() {
            self.used_addresses.insert(addr.to_string());
        }
    }

    /// One pass of the monitor loop: refresh height, pull the recent
    /// transaction list, reconcile every newly-observed transaction
    /// against the wallet, run reuse detection once per txid, and
    /// dispatch callbacks.
    pub fn tick(&mut self) -> Result<(), ServiceError> {
        self.current_blockheight = self.chain.get_current_block_height()?;
        let txlist = self.chain.list_transactions(100)?;

        let old_set: HashSet<Txid> = self.old_txs.iter().copied().collect();
        let new_txs: Vec<ListedTx> = txlist
            .iter()
            .filter(|t| self.active_txids.contains(&t.txid) || !old_set.contains(&t.txid))
            .cloned()
            .collect();
        self.old_txs = txlist.iter().map(|t| t.txid).collect();

        let wallet_label = self.wallet.wallet_label();
        let notify_label = wallet_notify_label().to_string();

        for listed in new_txs {
            let info = match self.chain.get_transaction(&listed.txid) {
                Ok(info) => info,
                Err(e) => {
                    log::warn!("could not fetch {}: {e}", listed.txid);
                    continue;
                }
            };
            if info.is_conflicted() {
                log::warn!("transaction {} is conflicted, skipping", listed.txid);
                continue;
            }
            let height = if info.confirmations == 0 {
                None
            } else {
                Some(self.current_blockheight.saturating_sub(info.confirmations as u64) + 1)
            };
            let tx = match self.chain.get_deser_from_gettransaction(&info) {
                Ok(tx) => tx,
                Err(e) => {
                    log::warn!("could not deserialize {}: {e}", listed.txid);
                    continue;
                }
            };

            let result = self.wallet.process_new_tx(&tx, height);

            if !self.processed_txids.contains(&listed.txid) {
                self.apply_reuse_policy(&result);
                self.processed_txids.insert(listed.txid);
            }

            let labeled = self.chain.is_address_labeled(&listed, &wallet_label)
                || self.chain.is_address_labeled(&listed, &notify_label);
            if !labeled {
                continue;
            }

            for cb in &mut self.all_callbacks {
                cb(&tx, &listed.txid);
            }

            let event_relevant =
                !result.added.is_empty() || !result.removed.is_empty() || self.active_txids.contains(&listed.txid);
            if !event_relevant {
                continue;
            }

            let txid_key = CallbackKey::Txid(listed.txid);
            let outputs_key =
                CallbackKey::Outputs(tx.output.iter().map(|o| (o.script_pubkey.clone(), o.value.to_sat())).collect());

            if info.confirmations == 0 {
                for key in [txid_key, outputs_key] {
                    if let Some(cbs) = self.unconfirmed_callbacks.get_mut(&key) {
                        let mut keep = Vec::new();
                        for mut cb in cbs.drain(..) {
                            if cb(&tx, &listed.txid) {
                                continue;
                            }
                            keep.push(cb);
                        }
                        *cbs = keep;
                    }
                }
                if !self.active_txids.contains(&listed.txid) {
                    self.active_txids.push(listed.txid);
                }
            } else {
                for key in [txid_key, outputs_key] {
                    if let Some(cbs) = self.confirmed_callbacks.get_mut(&key) {
                        let mut keep = Vec::new();
                        for mut cb in cbs.drain(..) {
                            if cb(&tx, &listed.txid, info.confirmations) {
                                continue;
                            }
                            keep.push(cb);
                        }
                        *cbs = keep;
                    }
                }
                self.active_txids.retain(|t| t != &listed.txid);
            }
        }
        Ok(())
    }

    /// Block forever, ticking on the configured interval until
    /// `shutdown` reports `true`. Mirrors the teacher's
    /// sleep-then-check-cycle daemon loop, with a shutdown channel added
    /// since this loop runs inside a library rather than owning `main`.
    pub async fn run_forever(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick() {
                        log::error!("monitor tick failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
