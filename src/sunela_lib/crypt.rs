/// Database encryption
///
/// One flash block holds a 24-byte nonce followed by the XChaCha20-Poly1305
/// ciphertext (including the 16-byte tag) of a fixed-size content cleartext.
/// Every write draws a fresh random nonce, so key reuse across blocks is
/// safe; nonces are never derived from block index or sequence.
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use super::error::{Error, Result};
use super::{BLOCK_SIZE, CONTENT_SIZE, MASTER_SECRET_BYTES, NONCE_SIZE};

pub struct DbCrypt {
    cipher: XChaCha20Poly1305,
}

impl DbCrypt {
    pub fn new(master_key: &[u8; MASTER_SECRET_BYTES]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(master_key)),
        }
    }

    /// Encrypt `content` (exactly CONTENT_SIZE bytes) into `block`
    /// (exactly BLOCK_SIZE bytes), prepending a fresh nonce.
    pub fn encrypt(&self, block: &mut [u8], content: &[u8]) -> Result<()> {
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(content.len(), CONTENT_SIZE);
        let mut nonce = [0u8; NONCE_SIZE];
        loop {
            OsRng.fill_bytes(&mut nonce);
            // all-zero marks a deleted block, all-0xff an erased one
            if nonce.iter().any(|b| *b != 0) && nonce.iter().any(|b| *b != 0xff) {
                break;
            }
        }
        let ct = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), content)
            .map_err(|_| Error::Crypto)?;
        debug_assert_eq!(ct.len(), BLOCK_SIZE - NONCE_SIZE);
        block[..NONCE_SIZE].copy_from_slice(&nonce);
        block[NONCE_SIZE..].copy_from_slice(&ct);
        Ok(())
    }

    /// Decrypt a raw block; returns the CONTENT_SIZE cleartext, wiped on drop.
    pub fn decrypt(&self, block: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        assert_eq!(block.len(), BLOCK_SIZE);
        let content = self
            .cipher
            .decrypt(XNonce::from_slice(&block[..NONCE_SIZE]), &block[NONCE_SIZE..])
            .map_err(|_| Error::Crypto)?;
        debug_assert_eq!(content.len(), CONTENT_SIZE);
        Ok(Zeroizing::new(content))
    }
}
