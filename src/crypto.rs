//! Symmetric encryption of shoot state payloads.
//!
//! Payloads are encrypted with AES-256 in CFB128 mode. A random IV is
//! generated per payload and prepended to the ciphertext.

use openssl::rand::rand_bytes;
use openssl::symm::{Cipher, decrypt as symm_decrypt, encrypt as symm_encrypt};
use std::fmt;
use std::path::Path;

use crate::error::Error;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

/// A 256 bit key provided by whoever manages credentials. It is never
/// generated or rotated here.
#[derive(Clone, PartialEq, Eq)]
pub struct StateKey([u8; KEY_SIZE]);

impl StateKey {
    pub fn new(bytes: &[u8]) -> Result<Self, Error> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            Error::Crypto(format!(
                "state key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Reads the raw key bytes from `path`. A single trailing newline is
    /// tolerated.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read(path)?;
        let trimmed = raw.strip_suffix(b"\n").unwrap_or(&raw);
        Self::new(trimmed)
    }
}

impl fmt::Debug for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StateKey(..)")
    }
}

pub fn encrypt(key: &StateKey, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let mut iv = [0u8; IV_SIZE];
    rand_bytes(&mut iv).map_err(|e| Error::Crypto(format!("failed generating IV: {e}")))?;

    let ciphertext = symm_encrypt(Cipher::aes_256_cfb128(), &key.0, Some(&iv), plaintext)
        .map_err(|e| Error::Crypto(format!("failed encrypting payload: {e}")))?;

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(key: &StateKey, data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.len() < IV_SIZE {
        return Err(Error::Crypto(format!(
            "ciphertext of {} bytes is shorter than the IV",
            data.len()
        )));
    }
    let (iv, ciphertext) = data.split_at(IV_SIZE);
    symm_decrypt(Cipher::aes_256_cfb128(), &key.0, Some(iv), ciphertext)
        .map_err(|e| Error::Crypto(format!("failed decrypting payload: {e}")))
}
