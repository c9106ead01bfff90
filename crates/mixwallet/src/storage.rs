//! Persistent wallet blob with atomic save semantics.
//!
//! The teacher's `WatchState::save` writes the whole file with a single
//! `fs::write` call, which is not atomic: a crash mid-write can leave a
//! truncated or corrupt file. This store instead writes to a sibling
//! temp file, flushes it to disk, then renames it over the real path —
//! POSIX rename is atomic, so a crash leaves either the old file or the
//! fully-written new one, never a partial write.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use bitcoin::Network;
use mixwallet_crypto::ScriptType;
use mixwallet_utxo::PersistedStore;

pub const WALLET_TYPE_P2PKH: u8 = 0x01;
pub const WALLET_TYPE_P2SH_P2WPKH: u8 = 0x02;
pub const WALLET_TYPE_P2WPKH: u8 = 0x03;

pub fn script_type_to_wallet_type(t: ScriptType) -> u8 {
    match t {
        ScriptType::P2pkh => WALLET_TYPE_P2PKH,
        ScriptType::P2shP2wpkh => WALLET_TYPE_P2SH_P2WPKH,
        ScriptType::P2wpkh => WALLET_TYPE_P2WPKH,
    }
}

pub fn wallet_type_to_script_type(code: u8) -> Result<ScriptType, StorageError> {
    match code {
        WALLET_TYPE_P2PKH => Ok(ScriptType::P2pkh),
        WALLET_TYPE_P2SH_P2WPKH => Ok(ScriptType::P2shP2wpkh),
        WALLET_TYPE_P2WPKH => Ok(ScriptType::P2wpkh),
        other => Err(StorageError::Malformed(format!(
            "unknown wallet_type code {other}"
        ))),
    }
}

/// The wallet blob's `network` field is the lowercase network name, not
/// `bitcoin::Network`'s own `Display` form.
pub fn network_to_wallet_string(network: Network) -> String {
    match network {
        Network::Bitcoin => "mainnet".to_string(),
        Network::Testnet => "testnet".to_string(),
        Network::Regtest => "regtest".to_string(),
        Network::Signet => "signet".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}

pub fn wallet_string_to_network(s: &str) -> Result<Network, StorageError> {
    match s {
        "mainnet" => Ok(Network::Bitcoin),
        "testnet" => Ok(Network::Testnet),
        "regtest" => Ok(Network::Regtest),
        "signet" => Ok(Network::Signet),
        other => Err(StorageError::Malformed(format!("unknown network {other:?}"))),
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed wallet blob: {0}")]
    Malformed(String),

    #[error("storage is read-only")]
    ReadOnly,
}

/// One imported key slot: `(priv_hex, key_type)`. A tombstoned slot
/// (removed but index-preserving) is `("", -1)`.
pub type ImportedSlot = (String, i32);

/// The required top-level keys of the persistent wallet blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBlob {
    pub wallet_type: u8,
    pub network: String,
    pub created: String,
    pub entropy: Vec<u8>,
    pub seed_extension: Option<String>,
    pub index_cache: std::collections::HashMap<String, std::collections::HashMap<String, u32>>,
    #[serde(flatten)]
    pub utxo_store: PersistedStore,
    pub imported_keys: std::collections::HashMap<String, Vec<ImportedSlot>>,
}

pub struct Storage {
    path: PathBuf,
    data: WalletBlob,
    read_only: bool,
}

impl Storage {
    /// Create a new wallet blob on disk at `path`, failing if a file is
    /// already there.
    pub fn create(path: impl Into<PathBuf>, data: WalletBlob) -> Result<Self, StorageError> {
        let path = path.into();
        if path.exists() {
            return Err(StorageError::Malformed(format!(
                "{} already exists",
                path.display()
            )));
        }
        let storage = Self {
            path,
            data,
            read_only: false,
        };
        storage.save()?;
        Ok(storage)
    }

    pub fn load(path: impl Into<PathBuf>, read_only: bool) -> Result<Self, StorageError> {
        let path = path.into();
        let bytes = fs::read(&path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        let data: WalletBlob = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Malformed(e.to_string()))?;
        Ok(Self {
            path,
            data,
            read_only,
        })
    }

    pub fn data(&self) -> &WalletBlob {
        &self.data
    }

    pub fn data_mut(&mut self) -> Result<&mut WalletBlob, StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(&mut self.data)
    }

    /// Flush the current in-memory blob to disk atomically.
    pub fn save(&self) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let serialized = serde_json::to_vec_pretty(&self.data)
            .map_err(|e| StorageError::Malformed(e.to_string()))?;

        let tmp_path = self.tmp_path();
        {
            let mut file = File::create(&tmp_path).map_err(|source| StorageError::Io {
                path: tmp_path.clone(),
                source,
            })?;
            file.write_all(&serialized).map_err(|source| StorageError::Io {
                path: tmp_path.clone(),
                source,
            })?;
            file.sync_all().map_err(|source| StorageError::Io {
                path: tmp_path.clone(),
                source,
            })?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    pub fn close(self) {
        drop(self);
    }

    pub fn get_location(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixwallet_utxo::UtxoStore;

    fn sample_blob() -> WalletBlob {
        WalletBlob {
            wallet_type: WALLET_TYPE_P2WPKH,
            network: "mainnet".into(),
            created: "2026/01/01 00:00:00".into(),
            entropy: vec![0u8; 16],
            seed_extension: None,
            index_cache: Default::default(),
            utxo_store: UtxoStore::new().to_persisted(),
            imported_keys: Default::default(),
        }
    }

    #[test]
    fn create_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let storage = Storage::create(&path, sample_blob()).unwrap();
        assert_eq!(storage.data().network, "mainnet");

        let reloaded = Storage::load(&path, false).unwrap();
        assert_eq!(reloaded.data().wallet_type, WALLET_TYPE_P2WPKH);
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let storage = Storage::create(&path, sample_blob()).unwrap();
        storage.save().unwrap();
        assert!(!storage.tmp_path().exists());
        assert!(path.exists());
    }

    #[test]
    fn read_only_storage_rejects_save_and_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        Storage::create(&path, sample_blob()).unwrap();
        let mut ro = Storage::load(&path, true).unwrap();
        assert!(ro.data_mut().is_err());
        assert!(ro.save().is_err());
    }

    #[test]
    fn create_refuses_to_overwrite_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        Storage::create(&path, sample_blob()).unwrap();
        assert!(Storage::create(&path, sample_blob()).is_err());
    }
}
