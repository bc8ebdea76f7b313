//! Token-derived payload cryptography (AES-128-CBC, MD5 key schedule).

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cbc::cipher::block_padding::Pkcs7;
use thiserror::Error;

use crate::protocol::keyed_digest;

/// Length of the derived AES key in bytes.
pub const KEY_LEN: usize = 16;
/// AES block length in bytes.
pub const BLOCK_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Error type for cryptographic operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Ciphertext is empty or not a whole number of blocks.
    #[error("ciphertext length {len} is not a positive multiple of 16")]
    InvalidLength {
        /// Ciphertext length in bytes
        len: usize,
    },
    /// PKCS#7 padding did not check out after decryption (usually a wrong token).
    #[error("bad padding after decryption")]
    BadPadding,
}

/// AES key: `md5(token)`.
#[must_use]
pub fn derive_key(token: &[u8]) -> [u8; KEY_LEN] {
    keyed_digest(&[token])
}

/// AES IV: `md5(md5(token) ‖ 16 zero bytes)`.
///
/// The second half of the digest input stays zero; the token itself is not
/// folded in a second time.
#[must_use]
pub fn derive_iv(token: &[u8]) -> [u8; BLOCK_LEN] {
    let mut buf = [0u8; KEY_LEN * 2];
    buf[..KEY_LEN].copy_from_slice(&derive_key(token));
    keyed_digest(&[buf.as_slice()])
}

/// Encrypt `plaintext` with the key and IV derived from `token`.
#[must_use]
pub fn encrypt(plaintext: &[u8], token: &[u8]) -> Vec<u8> {
    TokenCipher::new(token).encrypt(plaintext)
}

/// Decrypt `ciphertext` with the key and IV derived from `token`.
pub fn decrypt(ciphertext: &[u8], token: &[u8]) -> Result<Vec<u8>, CryptoError> {
    TokenCipher::new(token).decrypt(ciphertext)
}

/// Unwrap a vendor-obfuscated token (96 hex characters, AES-128-ECB under an
/// all-zero key) into the plain 32-character hex token.
///
/// Any failure yields an empty string.
#[must_use]
pub fn unlock_vendor_token(cipher_hex: &str) -> String {
    let Ok(mut data) = hex::decode(cipher_hex.trim()) else {
        return String::new();
    };
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return String::new();
    }

    let cipher = Aes128::new(&[0u8; KEY_LEN].into());
    for chunk in data.chunks_exact_mut(BLOCK_LEN) {
        cipher.decrypt_block(chunk.into());
    }

    String::from_utf8_lossy(&data)
        .trim_matches(|c: char| c <= ' ')
        .to_owned()
}

/// Key and IV derived once from a token.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_LEN],
    iv: [u8; BLOCK_LEN],
}

impl TokenCipher {
    /// Derive key material from the token bytes.
    #[must_use]
    pub fn new(token: &[u8]) -> Self {
        Self {
            key: derive_key(token),
            iv: derive_iv(token),
        }
    }

    /// Derived AES key
    #[must_use]
    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Derived IV
    #[must_use]
    pub fn iv(&self) -> &[u8; BLOCK_LEN] {
        &self.iv
    }

    /// AES-128-CBC with PKCS#7 padding.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// Inverse of [`TokenCipher::encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(CryptoError::InvalidLength {
                len: ciphertext.len(),
            });
        }
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::BadPadding)
    }
}

impl core::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}
