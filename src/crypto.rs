//! Encryption envelope for volumes mounted with a password.
//!
//! A 128-bit AES key is derived from the password via SHA-256 (first 16
//! bytes of the digest); every data cell is CBC-encrypted as a whole
//! `block_size`-byte unit with the row index byte-replicated into the IV.
//! This reproduces the original implementation's envelope exactly —
//! including its weak, low-entropy IV — for interoperability with
//! already-stored ciphertext; see the design notes for why this is
//! preserved rather than redesigned.

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type Encryptor = cbc::Encryptor<Aes128>;
type Decryptor = cbc::Decryptor<Aes128>;

pub const KEY_SIZE: usize = 16;
pub const IV_SIZE: usize = 16;

/// Derives the 128-bit volume key from a password: `SHA256(password)[..16]`.
pub fn derive_key(password: &str) -> [u8; KEY_SIZE] {
    let digest = Sha256::digest(password.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest[..KEY_SIZE]);
    key
}

/// `iv[i] = row & 0xFF` for all 16 bytes — the source's row-derived IV.
pub fn row_iv(row: u64) -> [u8; IV_SIZE] {
    [(row & 0xFF) as u8; IV_SIZE]
}

/// CBC-encrypts exactly one `block_size`-byte cell. `plaintext.len()` must
/// be a multiple of the AES block size (it always is: `block_size` is
/// required to be a power of two no smaller than 64 bytes).
pub fn encrypt_cell(key: &[u8; KEY_SIZE], row: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() % 16 != 0 {
        return Err(Error::BadParams(
            "cell length must be a multiple of the AES block size".into(),
        ));
    }
    let iv = row_iv(row);
    let mut buf = plaintext.to_vec();
    let ct_len = buf.len();
    let enc = Encryptor::new(key.into(), &iv.into());
    enc.encrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf, ct_len)
        .map_err(|e| Error::BadParams(format!("encryption failed: {e}")))?;
    Ok(buf)
}

/// CBC-decrypts exactly one `block_size`-byte cell.
pub fn decrypt_cell(key: &[u8; KEY_SIZE], row: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % 16 != 0 {
        return Err(Error::BadParams(
            "cell length must be a multiple of the AES block size".into(),
        ));
    }
    let iv = row_iv(row);
    let mut buf = ciphertext.to_vec();
    let pt_len = buf.len();
    let dec = Decryptor::new(key.into(), &iv.into());
    dec.decrypt_padded_mut::<cbc::cipher::block_padding::NoPadding>(&mut buf)
        .map_err(|e| Error::BadParams(format!("decryption failed: {e}")))?;
    buf.truncate(pt_len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_cell() {
        let key = derive_key("HelloWorld");
        let plaintext = vec![0x42u8; 64];
        let ct = encrypt_cell(&key, 3, &plaintext).unwrap();
        assert_ne!(ct, plaintext);
        let pt = decrypt_cell(&key, 3, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn iv_is_row_byte_replicated() {
        assert_eq!(row_iv(0x1FF), [0xFFu8; 16]);
        assert_eq!(row_iv(1), [1u8; 16]);
    }

    #[test]
    fn different_rows_yield_different_ciphertext() {
        let key = derive_key("pw");
        let plaintext = vec![0xABu8; 32];
        let ct0 = encrypt_cell(&key, 0, &plaintext).unwrap();
        let ct1 = encrypt_cell(&key, 1, &plaintext).unwrap();
        assert_ne!(ct0, ct1);
    }
}
