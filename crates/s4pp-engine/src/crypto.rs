//! Hash, HMAC and block-cipher capability tables.
//!
//! Algorithms are negotiated by name on the wire and resolved here into
//! tagged variants holding concrete RustCrypto state. `SHA256` is mandatory;
//! `AES-128-CBC` is mandatory whenever hiding is advertised. Unknown names
//! surface as `None` from the lookups and become rejects in the engines.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

// ---------------------------------------------------------------------------
// Hash algorithms
// ---------------------------------------------------------------------------

/// A negotiable HMAC hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha256,
}

impl HashAlg {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SHA256" => Some(HashAlg::Sha256),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlg::Sha256 => "SHA256",
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
        }
    }
}

/// An incremental HMAC context for a negotiated [`HashAlg`].
#[derive(Clone)]
pub enum MacState {
    Sha256(Hmac<Sha256>),
}

impl MacState {
    pub fn new(alg: HashAlg, key: &[u8]) -> Self {
        match alg {
            HashAlg::Sha256 => MacState::Sha256(
                <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC can take key of any size"),
            ),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            MacState::Sha256(mac) => mac.update(bytes),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            MacState::Sha256(mac) => mac.finalize().into_bytes().to_vec(),
        }
    }
}

/// One-shot HMAC convenience used for the `AUTH` proof.
pub fn hmac_once(alg: HashAlg, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = MacState::new(alg, key);
    for part in parts {
        mac.update(part);
    }
    mac.finalize()
}

/// Constant-time digest comparison. Differing lengths compare unequal.
pub fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

// ---------------------------------------------------------------------------
// Hide (block cipher) algorithms
// ---------------------------------------------------------------------------

/// A negotiable confidentiality cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HideAlg {
    Aes128Cbc,
}

impl HideAlg {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AES-128-CBC" => Some(HideAlg::Aes128Cbc),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HideAlg::Aes128Cbc => "AES-128-CBC",
        }
    }

    pub fn block_size(self) -> usize {
        match self {
            HideAlg::Aes128Cbc => 16,
        }
    }

    pub fn key_size(self) -> usize {
        match self {
            HideAlg::Aes128Cbc => 16,
        }
    }
}

/// A keyed block cipher handle for a negotiated [`HideAlg`].
pub enum BlockCipher {
    Aes128(Aes128),
}

impl BlockCipher {
    /// Keys the cipher from shared key material of any length: the material
    /// is truncated, or zero-padded on the right, to the cipher key size.
    pub fn new(alg: HideAlg, key_material: &[u8]) -> Self {
        match alg {
            HideAlg::Aes128Cbc => {
                let mut key = [0u8; 16];
                let n = key_material.len().min(16);
                key[..n].copy_from_slice(&key_material[..n]);
                BlockCipher::Aes128(Aes128::new(GenericArray::from_slice(&key)))
            }
        }
    }

    pub fn encrypt_block(&self, block: &mut [u8]) {
        match self {
            BlockCipher::Aes128(aes) => aes.encrypt_block(GenericArray::from_mut_slice(block)),
        }
    }

    pub fn decrypt_block(&self, block: &mut [u8]) {
        match self {
            BlockCipher::Aes128(aes) => aes.decrypt_block(GenericArray::from_mut_slice(block)),
        }
    }
}

/// Derives the hide session key: the first block of the raw challenge token,
/// right-padded with LF if short, encrypted once with the shared key.
pub fn derive_session_key(alg: HideAlg, shared_key: &[u8], token_raw: &[u8]) -> Vec<u8> {
    let block_size = alg.block_size();
    let mut block = vec![b'\n'; block_size];
    let n = token_raw.len().min(block_size);
    block[..n].copy_from_slice(&token_raw[..n]);
    BlockCipher::new(alg, shared_key).encrypt_block(&mut block);
    block
}
