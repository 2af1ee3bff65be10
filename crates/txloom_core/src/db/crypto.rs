//! Field encryption exposed to SQL as scalar functions.
//!
//! # Invariants
//! - Ciphertext layout is `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! - The AES-256 key is the SHA-256 digest of the session key text.
//! - NULL in, NULL out for both functions.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// SQL function name: `txloom_encrypt(text, key) -> blob`.
pub const ENCRYPT_FN: &str = "txloom_encrypt";
/// SQL function name: `txloom_decrypt(blob, key) -> text`.
pub const DECRYPT_FN: &str = "txloom_decrypt";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("field encryption failed")]
    Encrypt,
    #[error("ciphertext too short")]
    Truncated,
    #[error("field decryption failed (wrong key or corrupted data)")]
    Decrypt,
    #[error("decrypted field is not valid utf-8")]
    NotUtf8,
}

fn cipher_for(key: &str) -> Aes256Gcm {
    let digest = Sha256::digest(key.as_bytes());
    Aes256Gcm::new(GenericArray::from_slice(&digest))
}

pub fn encrypt_text(plaintext: &str, key: &str) -> Result<Vec<u8>, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher_for(key)
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend(ciphertext);
    Ok(sealed)
}

pub fn decrypt_text(sealed: &[u8], key: &str) -> Result<String, CryptoError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let plaintext = cipher_for(key)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
}

fn user_error(err: CryptoError) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(err))
}

/// Registers the encrypt/decrypt scalar functions on `conn`.
pub(crate) fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    // Encryption draws a fresh nonce per call, so it is not deterministic.
    conn.create_scalar_function(ENCRYPT_FN, 2, FunctionFlags::SQLITE_UTF8, |ctx| {
        let plaintext: Option<String> = ctx.get(0)?;
        let key: String = ctx.get(1)?;
        plaintext
            .map(|text| encrypt_text(&text, &key).map_err(user_error))
            .transpose()
    })?;
    conn.create_scalar_function(
        DECRYPT_FN,
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let sealed: Option<Vec<u8>> = ctx.get(0)?;
            let key: String = ctx.get(1)?;
            sealed
                .map(|bytes| decrypt_text(&bytes, &key).map_err(user_error))
                .transpose()
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{decrypt_text, encrypt_text, CryptoError};

    #[test]
    fn encrypt_then_decrypt_restores_text() {
        let sealed = encrypt_text("secret", "key-1").unwrap();
        assert_ne!(&sealed[12..], b"secret");
        assert_eq!(decrypt_text(&sealed, "key-1").unwrap(), "secret");
    }

    #[test]
    fn nonces_differ_between_calls() {
        let first = encrypt_text("same", "key").unwrap();
        let second = encrypt_text("same", "key").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn wrong_key_and_truncated_input_are_rejected() {
        let sealed = encrypt_text("secret", "key-1").unwrap();
        assert_eq!(decrypt_text(&sealed, "key-2"), Err(CryptoError::Decrypt));
        assert_eq!(decrypt_text(&sealed[..10], "key-1"), Err(CryptoError::Truncated));
    }
}
