use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Password-encrypted mnemonic envelope (Argon2 key derivation + AES-256-GCM).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMnemonic {
    salt: String,
    nonce: String,
    ciphertext: String,
}

fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut *key_bytes)
        .map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(key_bytes)
}

impl EncryptedMnemonic {
    pub fn encrypt(mnemonic: &str, password: &str) -> Result<Self> {
        let salt: [u8; 16] = rand::random();
        let key_bytes = derive_key(password, &salt)?;

        let cipher = Aes256Gcm::new_from_slice(key_bytes.as_slice())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, mnemonic.as_bytes())
            .map_err(|e| Error::Crypto(e.to_string()))?;

        Ok(Self {
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Decrypt with `password`; a failed authentication tag is `InvalidPassword`.
    pub fn decrypt(&self, password: &str) -> Result<Zeroizing<String>> {
        let salt = BASE64
            .decode(&self.salt)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let key_bytes = derive_key(password, &salt)?;

        let cipher = Aes256Gcm::new_from_slice(key_bytes.as_slice())
            .map_err(|e| Error::Crypto(e.to_string()))?;
        let nonce_bytes = BASE64
            .decode(&self.nonce)
            .map_err(|e| Error::Crypto(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(Error::Crypto("nonce must be 12 bytes".into()));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|e| Error::Crypto(e.to_string()))?;

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| Error::InvalidPassword)?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|e| Error::Crypto(e.to_string()))
    }
}

/// Validate a BIP39 phrase, normalising whitespace.
pub fn parse_mnemonic(phrase: &str) -> Result<bip39::Mnemonic> {
    phrase
        .parse::<bip39::Mnemonic>()
        .map_err(|e| Error::Mnemonic(e.to_string()))
}
