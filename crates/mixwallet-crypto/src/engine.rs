//! Per-script-type key derivation, signing and addressing.

use std::str::FromStr;

use base64::Engine as _;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, PrivateKey, PublicKey, ScriptBuf, Transaction,
    Witness,
};

use crate::error::EngineError;
use crate::seed::Seed;

/// The three script types this crate derives keys for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
}

impl ScriptType {
    pub fn all() -> &'static [ScriptType] {
        &[ScriptType::P2pkh, ScriptType::P2shP2wpkh, ScriptType::P2wpkh]
    }

    /// The BIP44/49/84 purpose field. Legacy wallets have none — their
    /// base account path omits the purpose/coin-type levels entirely.
    pub fn purpose(&self) -> Option<u32> {
        match self {
            ScriptType::P2pkh => None,
            ScriptType::P2shP2wpkh => Some(49),
            ScriptType::P2wpkh => Some(84),
        }
    }
}

/// `0'` on mainnet, `1'` on every other network, per BIP44.
pub fn bip44_coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// The account-level derivation path for a mixdepth under a given script
/// type, e.g. `m/84'/0'/3'` for mixdepth 3 on a native-segwit mainnet
/// wallet, or `m/3'` for the same mixdepth on a legacy wallet (no purpose
/// or coin-type levels).
pub fn account_path(
    script_type: ScriptType,
    network: Network,
    mixdepth: u32,
) -> Result<DerivationPath, EngineError> {
    let mixdepth_cn = ChildNumber::from_hardened_idx(mixdepth)
        .map_err(|e| EngineError::InvalidPath(e.to_string()))?;
    let path = match script_type.purpose() {
        None => DerivationPath::from(vec![mixdepth_cn]),
        Some(purpose) => {
            let purpose_cn = ChildNumber::from_hardened_idx(purpose)
                .map_err(|e| EngineError::InvalidPath(e.to_string()))?;
            let coin_cn = ChildNumber::from_hardened_idx(bip44_coin_type(network))
                .map_err(|e| EngineError::InvalidPath(e.to_string()))?;
            DerivationPath::from(vec![purpose_cn, coin_cn, mixdepth_cn])
        }
    };
    Ok(path)
}

/// The full path to a script, appending `branch/index` to the account
/// path — `branch` is 0 for external addresses, 1 for internal (change).
pub fn script_path(
    script_type: ScriptType,
    network: Network,
    mixdepth: u32,
    branch: u32,
    index: u32,
) -> Result<DerivationPath, EngineError> {
    let mut levels: Vec<ChildNumber> = account_path(script_type, network, mixdepth)?
        .into_iter()
        .copied()
        .collect();
    levels.push(
        ChildNumber::from_normal_idx(branch).map_err(|e| EngineError::InvalidPath(e.to_string()))?,
    );
    levels.push(
        ChildNumber::from_normal_idx(index).map_err(|e| EngineError::InvalidPath(e.to_string()))?,
    );
    Ok(DerivationPath::from(levels))
}

/// Derive the BIP32 master extended private key from seed bytes. Shared
/// across script types — the purpose/coin-type/mixdepth levels are what
/// differ, not the root derivation itself.
pub fn derive_bip32_master_key(seed: &Seed, network: Network) -> Result<Xpriv, EngineError> {
    Xpriv::new_master(network, seed.as_bytes()).map_err(|e| EngineError::Derivation(e.to_string()))
}

/// Derive a child extended private key at an arbitrary path.
pub fn derive_bip32_privkey(
    secp: &Secp256k1<bitcoin::secp256k1::All>,
    xprv: &Xpriv,
    path: &DerivationPath,
) -> Result<Xpriv, EngineError> {
    xprv.derive_priv(secp, path)
        .map_err(|e| EngineError::Derivation(e.to_string()))
}

/// Bitcoin Core's varint length prefix, as used ahead of the message body
/// in the signed-message digest below.
fn push_compact_size(buf: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&n.to_le_bytes());
    }
}

/// The double-SHA256 digest of `"\x18Bitcoin Signed Message:\n" ||
/// compact_size(len(msg)) || msg`, computed over raw bytes rather than a
/// UTF-8 reinterpretation of them — `msg` is arbitrary application data,
/// not necessarily text.
fn signed_msg_hash_bytes(msg: &[u8]) -> bitcoin::hashes::sha256d::Hash {
    const MAGIC: &[u8] = b"\x18Bitcoin Signed Message:\n";
    let mut buf = Vec::with_capacity(MAGIC.len() + 9 + msg.len());
    buf.extend_from_slice(MAGIC);
    push_compact_size(&mut buf, msg.len() as u64);
    buf.extend_from_slice(msg);
    bitcoin::hashes::sha256d::Hash::hash(&buf)
}

/// Behavior that differs by script type: scriptPubKey construction,
/// addressing, the BIP-143 scriptCode, and sighash-flavored signing.
pub trait ScriptEngine {
    fn script_type(&self) -> ScriptType;

    fn privkey_to_pubkey(&self, secp: &Secp256k1<bitcoin::secp256k1::All>, privkey: &SecretKey) -> PublicKey {
        PublicKey::new(secp256k1::PublicKey::from_secret_key(secp, privkey))
    }

    fn pubkey_to_script(&self, pubkey: &PublicKey) -> Result<ScriptBuf, EngineError>;

    fn pubkey_to_address(&self, pubkey: &PublicKey, network: Network) -> Result<Address, EngineError>;

    fn script_to_address(&self, script: &ScriptBuf, network: Network) -> Result<Address, EngineError> {
        Address::from_script(script, network).map_err(|e| EngineError::InvalidScript(e.to_string()))
    }

    fn privkey_to_script(
        &self,
        secp: &Secp256k1<bitcoin::secp256k1::All>,
        privkey: &SecretKey,
    ) -> Result<ScriptBuf, EngineError> {
        self.pubkey_to_script(&self.privkey_to_pubkey(secp, privkey))
    }

    fn privkey_to_wif(&self, privkey: &SecretKey, network: Network) -> String {
        PrivateKey {
            compressed: true,
            network: network.into(),
            inner: *privkey,
        }
        .to_wif()
    }

    /// The BIP-143 scriptCode used in segwit sighash computation. Legacy
    /// has no scriptCode concept.
    fn pubkey_to_script_code(&self, pubkey: &PublicKey) -> Result<ScriptBuf, EngineError> {
        let _ = pubkey;
        Err(EngineError::UnsupportedOperation)
    }

    /// Sign one input of `tx` in place, writing the appropriate scriptSig
    /// or witness. Returns `(true, "ok")` on success.
    fn sign_transaction(
        &self,
        secp: &Secp256k1<bitcoin::secp256k1::All>,
        tx: &mut Transaction,
        input_index: usize,
        privkey: &SecretKey,
        amount: Amount,
    ) -> Result<(bool, String), EngineError>;

    /// Sign an arbitrary message using Bitcoin's message-magic hash,
    /// returning a base64-encoded DER signature.
    fn sign_message(&self, secp: &Secp256k1<bitcoin::secp256k1::All>, privkey: &SecretKey, msg: &[u8]) -> String {
        let digest = signed_msg_hash_bytes(msg);
        let message = Message::from_digest(digest.to_byte_array());
        let signature = secp.sign_ecdsa(&message, privkey);
        base64::engine::general_purpose::STANDARD.encode(signature.serialize_der())
    }
}

fn ecdsa_sign_der(
    secp: &Secp256k1<bitcoin::secp256k1::All>,
    sighash_bytes: [u8; 32],
    privkey: &SecretKey,
) -> Vec<u8> {
    let message = Message::from_digest(sighash_bytes);
    let signature = secp.sign_ecdsa(&message, privkey);
    let mut sig_with_hashtype = signature.serialize_der().to_vec();
    sig_with_hashtype.push(EcdsaSighashType::All.to_u32() as u8);
    sig_with_hashtype
}

/// Legacy P2PKH engine: `OP_DUP OP_HASH160 <hash160(pubkey)> OP_EQUALVERIFY OP_CHECKSIG`.
pub struct P2pkhEngine;

impl ScriptEngine for P2pkhEngine {
    fn script_type(&self) -> ScriptType {
        ScriptType::P2pkh
    }

    fn pubkey_to_script(&self, pubkey: &PublicKey) -> Result<ScriptBuf, EngineError> {
        Ok(ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()))
    }

    fn pubkey_to_address(&self, pubkey: &PublicKey, network: Network) -> Result<Address, EngineError> {
        Ok(Address::p2pkh(pubkey, network))
    }

    fn sign_transaction(
        &self,
        secp: &Secp256k1<bitcoin::secp256k1::All>,
        tx: &mut Transaction,
        input_index: usize,
        privkey: &SecretKey,
        _amount: Amount,
    ) -> Result<(bool, String), EngineError> {
        let pubkey = self.privkey_to_pubkey(secp, privkey);
        let script_pubkey = self.pubkey_to_script(&pubkey)?;

        let sighash = {
            let cache = SighashCache::new(&*tx);
            cache
                .legacy_signature_hash(input_index, &script_pubkey, EcdsaSighashType::All.to_u32())
                .map_err(|e| EngineError::SigningFailed(e.to_string()))?
        };

        let sig_with_hashtype = ecdsa_sign_der(secp, sighash.to_byte_array(), privkey);

        let script_sig = Builder::new()
            .push_slice(PushBytesBuf::try_from(sig_with_hashtype).expect("der sig fits push"))
            .push_key(&pubkey)
            .into_script();

        tx.input
            .get_mut(input_index)
            .ok_or_else(|| EngineError::SigningFailed("input index out of range".into()))?
            .script_sig = script_sig;

        Ok((true, "ok".to_string()))
    }
}

/// Native-segwit P2WPKH engine.
pub struct P2wpkhEngine;

impl P2wpkhEngine {
    fn compressed(pubkey: &PublicKey) -> Result<CompressedPublicKey, EngineError> {
        CompressedPublicKey::try_from(*pubkey)
            .map_err(|_| EngineError::InvalidScript("segwit requires a compressed pubkey".into()))
    }
}

impl ScriptEngine for P2wpkhEngine {
    fn script_type(&self) -> ScriptType {
        ScriptType::P2wpkh
    }

    fn pubkey_to_script(&self, pubkey: &PublicKey) -> Result<ScriptBuf, EngineError> {
        let compressed = Self::compressed(pubkey)?;
        Ok(ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()))
    }

    fn pubkey_to_address(&self, pubkey: &PublicKey, network: Network) -> Result<Address, EngineError> {
        let compressed = Self::compressed(pubkey)?;
        Ok(Address::p2wpkh(&compressed, network))
    }

    fn pubkey_to_script_code(&self, pubkey: &PublicKey) -> Result<ScriptBuf, EngineError> {
        let compressed = Self::compressed(pubkey)?;
        Ok(ScriptBuf::new_p2pkh(&compressed.pubkey_hash()))
    }

    fn sign_transaction(
        &self,
        secp: &Secp256k1<bitcoin::secp256k1::All>,
        tx: &mut Transaction,
        input_index: usize,
        privkey: &SecretKey,
        amount: Amount,
    ) -> Result<(bool, String), EngineError> {
        let pubkey = self.privkey_to_pubkey(secp, privkey);
        let compressed = Self::compressed(&pubkey)?;
        let script_pubkey = self.pubkey_to_script(&pubkey)?;

        let sighash = {
            let mut cache = SighashCache::new(&*tx);
            cache
                .p2wpkh_signature_hash(input_index, &script_pubkey, amount, EcdsaSighashType::All)
                .map_err(|e| EngineError::SigningFailed(e.to_string()))?
        };

        let sig_with_hashtype = ecdsa_sign_der(secp, sighash.to_byte_array(), privkey);

        let mut signature = bitcoin::ecdsa::Signature::sighash_all(
            bitcoin::secp256k1::ecdsa::Signature::from_der(
                &sig_with_hashtype[..sig_with_hashtype.len() - 1],
            )
            .map_err(|e| EngineError::SigningFailed(e.to_string()))?,
        );
        signature.sighash_type = EcdsaSighashType::All;

        let input = tx
            .input
            .get_mut(input_index)
            .ok_or_else(|| EngineError::SigningFailed("input index out of range".into()))?;
        input.witness = Witness::p2wpkh(&signature, &compressed.0);

        Ok((true, "ok".to_string()))
    }
}

/// Wrapped-segwit P2SH-P2WPKH engine: the scriptPubKey is a P2SH wrapper
/// around the P2WPKH witness program; the scriptSig pushes the redeem
/// script (the witness program itself) and the witness is identical to
/// native segwit.
pub struct P2shP2wpkhEngine;

impl P2shP2wpkhEngine {
    fn redeem_script(pubkey: &PublicKey) -> Result<ScriptBuf, EngineError> {
        let compressed = P2wpkhEngine::compressed(pubkey)?;
        Ok(ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()))
    }
}

impl ScriptEngine for P2shP2wpkhEngine {
    fn script_type(&self) -> ScriptType {
        ScriptType::P2shP2wpkh
    }

    fn pubkey_to_script(&self, pubkey: &PublicKey) -> Result<ScriptBuf, EngineError> {
        let redeem = Self::redeem_script(pubkey)?;
        Ok(ScriptBuf::new_p2sh(&redeem.script_hash()))
    }

    fn pubkey_to_address(&self, pubkey: &PublicKey, network: Network) -> Result<Address, EngineError> {
        let compressed = P2wpkhEngine::compressed(pubkey)?;
        Ok(Address::p2shwpkh(&compressed, network))
    }

    fn pubkey_to_script_code(&self, pubkey: &PublicKey) -> Result<ScriptBuf, EngineError> {
        let compressed = P2wpkhEngine::compressed(pubkey)?;
        Ok(ScriptBuf::new_p2pkh(&compressed.pubkey_hash()))
    }

    fn sign_transaction(
        &self,
        secp: &Secp256k1<bitcoin::secp256k1::All>,
        tx: &mut Transaction,
        input_index: usize,
        privkey: &SecretKey,
        amount: Amount,
    ) -> Result<(bool, String), EngineError> {
        let pubkey = self.privkey_to_pubkey(secp, privkey);
        let compressed = P2wpkhEngine::compressed(&pubkey)?;
        let redeem_script = Self::redeem_script(&pubkey)?;

        let sighash = {
            let mut cache = SighashCache::new(&*tx);
            cache
                .p2wpkh_signature_hash(input_index, &redeem_script, amount, EcdsaSighashType::All)
                .map_err(|e| EngineError::SigningFailed(e.to_string()))?
        };

        let sig_with_hashtype = ecdsa_sign_der(secp, sighash.to_byte_array(), privkey);

        let mut signature = bitcoin::ecdsa::Signature::sighash_all(
            bitcoin::secp256k1::ecdsa::Signature::from_der(
                &sig_with_hashtype[..sig_with_hashtype.len() - 1],
            )
            .map_err(|e| EngineError::SigningFailed(e.to_string()))?,
        );
        signature.sighash_type = EcdsaSighashType::All;

        let input = tx
            .input
            .get_mut(input_index)
            .ok_or_else(|| EngineError::SigningFailed("input index out of range".into()))?;
        input.script_sig = Builder::new()
            .push_slice(PushBytesBuf::try_from(redeem_script.to_bytes()).expect("redeem script fits push"))
            .into_script();
        input.witness = Witness::p2wpkh(&signature, &compressed.0);

        Ok((true, "ok".to_string()))
    }
}

/// Parse a WIF-encoded private key, inferring a key type from the
/// compression flag: compressed keys default to native-segwit,
/// uncompressed keys can only be legacy (segwit addresses require a
/// compressed pubkey). A free function rather than a trait method since
/// it needs no particular engine instance to run.
pub fn wif_to_privkey(wif: &str) -> Result<(SecretKey, ScriptType), EngineError> {
    let privkey = PrivateKey::from_wif(wif).map_err(|e| EngineError::InvalidWif(e.to_string()))?;
    let inferred = if privkey.compressed {
        ScriptType::P2wpkh
    } else {
        ScriptType::P2pkh
    };
    Ok((privkey.inner, inferred))
}

/// Construct the engine for a given script type.
pub fn engine_for(script_type: ScriptType) -> Box<dyn ScriptEngine + Send + Sync> {
    match script_type {
        ScriptType::P2pkh => Box::new(P2pkhEngine),
        ScriptType::P2shP2wpkh => Box::new(P2shP2wpkhEngine),
        ScriptType::P2wpkh => Box::new(P2wpkhEngine),
    }
}

/// Parse a derivation path string (e.g. `"m/84'/0'/0'/0/0"`).
pub fn parse_path(s: &str) -> Result<DerivationPath, EngineError> {
    DerivationPath::from_str(s).map_err(|e| EngineError::InvalidPath(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::Seed;

    fn test_master(network: Network) -> Xpriv {
        let mnemonic = Seed::parse_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon \
             abandon abandon abandon about",
        )
        .unwrap();
        let seed = Seed::from_mnemonic(&mnemonic, "");
        derive_bip32_master_key(&seed, network).unwrap()
    }

    #[test]
    fn bip84_first_receive_address_matches_known_vector() {
        let secp = Secp256k1::new();
        let master = test_master(Network::Bitcoin);
        let path = script_path(ScriptType::P2wpkh, Network::Bitcoin, 0, 0, 0).unwrap();
        let xprv = derive_bip32_privkey(&secp, &master, &path).unwrap();
        let engine = P2wpkhEngine;
        let pubkey = engine.privkey_to_pubkey(&secp, &xprv.private_key);
        let address = engine.pubkey_to_address(&pubkey, Network::Bitcoin).unwrap();
        assert_eq!(address.to_string(), "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
    }

    #[test]
    fn legacy_has_no_purpose_level() {
        assert_eq!(ScriptType::P2pkh.purpose(), None);
        let path = account_path(ScriptType::P2pkh, Network::Bitcoin, 2).unwrap();
        assert_eq!(path.to_string(), "2'");
    }

    #[test]
    fn segwit_account_path_is_bip44_shaped() {
        let path = account_path(ScriptType::P2wpkh, Network::Bitcoin, 2).unwrap();
        assert_eq!(path.to_string(), "84'/0'/2'");
        let path = account_path(ScriptType::P2shP2wpkh, Network::Testnet, 1).unwrap();
        assert_eq!(path.to_string(), "49'/1'/1'");
    }

    #[test]
    fn script_code_unsupported_for_legacy() {
        let secp = Secp256k1::new();
        let master = test_master(Network::Bitcoin);
        let path = script_path(ScriptType::P2pkh, Network::Bitcoin, 0, 0, 0).unwrap();
        let xprv = derive_bip32_privkey(&secp, &master, &path).unwrap();
        let engine = P2pkhEngine;
        let pubkey = engine.privkey_to_pubkey(&secp, &xprv.private_key);
        assert!(matches!(
            engine.pubkey_to_script_code(&pubkey),
            Err(EngineError::UnsupportedOperation)
        ));
    }

    #[test]
    fn wif_roundtrip_infers_segwit_for_compressed() {
        let secp = Secp256k1::new();
        let master = test_master(Network::Bitcoin);
        let engine = P2wpkhEngine;
        let wif = engine.privkey_to_wif(&master.private_key, Network::Bitcoin);
        let (privkey, inferred) = wif_to_privkey(&wif).unwrap();
        assert_eq!(privkey, master.private_key);
        assert_eq!(inferred, ScriptType::P2wpkh);
    }

    #[test]
    fn sign_message_distinguishes_non_utf8_byte_strings() {
        let secp = Secp256k1::new();
        let privkey = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let engine = P2wpkhEngine;

        // Both slices are invalid UTF-8 (a lone continuation byte 0x80), so a
        // lossy-UTF8 reinterpretation would collapse them to the same
        // replacement-character string and sign identically.
        let a = [0x80, 0x01];
        let b = [0x80, 0x02];

        let sig_a = engine.sign_message(&secp, &privkey, &a);
        let sig_b = engine.sign_message(&secp, &privkey, &b);
        assert_ne!(sig_a, sig_b);
    }
}
