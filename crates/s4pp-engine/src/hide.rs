//! The HIDE confidentiality framer.
//!
//! Client->server only. CBC chaining with an all-zero IV (acceptable because
//! the first encrypted line is random salt), ciphertext feeding the chain.
//! Whole lines including their LFs form the plaintext stream; when a block
//! must be produced from a short tail, the tail is padded with LF bytes,
//! which decode at the peer as empty no-op lines.

use crate::crypto::{BlockCipher, HideAlg};

/// Outbound (client side) encryptor. Holds at most `block_size - 1` pending
/// plaintext bytes between calls.
pub struct HideEncrypt {
    cipher: BlockCipher,
    chain: Vec<u8>,
    pending: Vec<u8>,
    block_size: usize,
}

impl HideEncrypt {
    pub fn new(alg: HideAlg, session_key: &[u8]) -> Self {
        HideEncrypt {
            cipher: BlockCipher::new(alg, session_key),
            chain: vec![0; alg.block_size()],
            pending: Vec::new(),
            block_size: alg.block_size(),
        }
    }

    /// Encrypts as many whole blocks as `plaintext` completes, appending
    /// ciphertext to `out` and holding the remainder.
    pub fn feed(&mut self, plaintext: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(plaintext);
        while self.pending.len() >= self.block_size {
            let mut block: Vec<u8> = self.pending.drain(..self.block_size).collect();
            self.encrypt_chained(&mut block, out);
        }
    }

    /// Flushes a short tail by padding it with LF to the block boundary.
    /// A no-op when nothing is pending.
    pub fn flush(&mut self, out: &mut Vec<u8>) {
        if self.pending.is_empty() {
            return;
        }
        let mut block = std::mem::take(&mut self.pending);
        block.resize(self.block_size, b'\n');
        self.encrypt_chained(&mut block, out);
    }

    /// Whether a flush would emit padding.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn encrypt_chained(&mut self, block: &mut [u8], out: &mut Vec<u8>) {
        for (b, c) in block.iter_mut().zip(&self.chain) {
            *b ^= c;
        }
        self.cipher.encrypt_block(block);
        self.chain.copy_from_slice(block);
        out.extend_from_slice(block);
    }
}

/// Inbound (server side) decryptor. Partial blocks are held until the rest
/// of the block arrives.
pub struct HideDecrypt {
    cipher: BlockCipher,
    chain: Vec<u8>,
    pending: Vec<u8>,
    block_size: usize,
}

impl HideDecrypt {
    pub fn new(alg: HideAlg, session_key: &[u8]) -> Self {
        HideDecrypt {
            cipher: BlockCipher::new(alg, session_key),
            chain: vec![0; alg.block_size()],
            pending: Vec::new(),
            block_size: alg.block_size(),
        }
    }

    /// Decrypts every whole block in `ciphertext`, appending plaintext to
    /// `out` and holding any partial block.
    pub fn feed(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(ciphertext);
        while self.pending.len() >= self.block_size {
            let block: Vec<u8> = self.pending.drain(..self.block_size).collect();
            let mut plain = block.clone();
            self.cipher.decrypt_block(&mut plain);
            for (p, c) in plain.iter_mut().zip(&self.chain) {
                *p ^= c;
            }
            self.chain.copy_from_slice(&block);
            out.extend_from_slice(&plain);
        }
    }
}
