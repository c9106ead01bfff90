//! Master seed handling.
//!
//! The wallet's Master Seed is opaque entropy (at least 16 bytes, a
//! multiple of 4), optionally BIP-39-flavored with a mnemonic and
//! passphrase extension. Both flavors derive the same way once reduced to
//! raw seed bytes.

use bip39::{Language, Mnemonic};

use crate::error::EngineError;
use crate::memory::LockedBuffer;

fn locked_copy(src: &[u8]) -> LockedBuffer {
    let mut buf = LockedBuffer::new(src.len());
    buf.as_mut_slice().copy_from_slice(src);
    buf
}

/// Raw seed material. Held in a memory-locked, zeroize-on-drop buffer
/// since it is equivalent to a master private key.
pub struct Seed {
    bytes: LockedBuffer,
}

impl Seed {
    /// Build a seed directly from entropy bytes (non-BIP-39 wallets).
    ///
    /// Per the data model, entropy must be at least 16 bytes and a
    /// multiple of 4.
    pub fn from_entropy(entropy: &[u8]) -> Result<Self, EngineError> {
        if entropy.len() < 16 || entropy.len() % 4 != 0 {
            return Err(EngineError::InvalidEntropy(format!(
                "entropy must be >= 16 bytes and a multiple of 4, got {}",
                entropy.len()
            )));
        }
        Ok(Self {
            bytes: locked_copy(entropy),
        })
    }

    /// Build a seed from raw wallet-blob entropy and its optional
    /// passphrase extension: with an extension, `entropy` is treated as
    /// BIP-39 entropy and expanded via the mnemonic it encodes; without
    /// one, `entropy` is used directly as seed bytes.
    pub fn from_entropy_and_extension(
        entropy: &[u8],
        seed_extension: Option<&str>,
    ) -> Result<Self, EngineError> {
        match seed_extension {
            Some(passphrase) => {
                let mnemonic = Mnemonic::from_entropy_in(Language::English, entropy)
                    .map_err(|e| EngineError::InvalidMnemonic(e.to_string()))?;
                Ok(Self::from_mnemonic(&mnemonic, passphrase))
            }
            None => Self::from_entropy(entropy),
        }
    }

    /// Generate a new 24-word BIP-39 mnemonic.
    pub fn generate_mnemonic() -> Result<Mnemonic, EngineError> {
        Mnemonic::generate_in(Language::English, 24)
            .map_err(|e| EngineError::InvalidMnemonic(e.to_string()))
    }

    /// Parse a BIP-39 mnemonic from its word string.
    pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, EngineError> {
        Mnemonic::parse_in(Language::English, words)
            .map_err(|e| EngineError::InvalidMnemonic(e.to_string()))
    }

    /// Derive seed bytes from a BIP-39 mnemonic and optional passphrase
    /// extension (the wallet blob's `seed_extension` field).
    pub fn from_mnemonic(mnemonic: &Mnemonic, passphrase: &str) -> Self {
        let seed = mnemonic.to_seed(passphrase);
        Self {
            bytes: locked_copy(&seed),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_entropy() {
        assert!(Seed::from_entropy(&[0u8; 12]).is_err());
    }

    #[test]
    fn rejects_non_multiple_of_four() {
        assert!(Seed::from_entropy(&[0u8; 17]).is_err());
    }

    #[test]
    fn accepts_16_bytes() {
        assert!(Seed::from_entropy(&[0u8; 16]).is_ok());
    }

    #[test]
    fn mnemonic_roundtrip_is_deterministic() {
        let mnemonic = Seed::parse_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon \
             abandon abandon abandon about",
        )
        .unwrap();
        let a = Seed::from_mnemonic(&mnemonic, "");
        let b = Seed::from_mnemonic(&mnemonic, "");
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn passphrase_changes_seed() {
        let mnemonic = Seed::parse_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon \
             abandon abandon abandon about",
        )
        .unwrap();
        let a = Seed::from_mnemonic(&mnemonic, "");
        let b = Seed::from_mnemonic(&mnemonic, "extension");
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
