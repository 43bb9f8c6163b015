use openssl::symm::{Cipher, decrypt, encrypt as symm_encrypt};
use rand::Rng;
use thiserror::Error;

pub const KEY_SIZE: usize = 32; // 256 bits
pub const IV_SIZE: usize = 16; // one AES block

#[derive(Debug, Error)]
pub enum AesError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid IV: expected {expected} bytes, got {actual}")]
    InvalidIv { expected: usize, actual: usize },

    #[error("Invalid key: expected {expected} bytes, got {actual}")]
    InvalidKey { expected: usize, actual: usize },
}

/// Ciphertext plus the IV it was produced with. Both are needed to decrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_SIZE],
}

fn check_key(key: &[u8]) -> Result<(), AesError> {
    if key.len() != KEY_SIZE {
        return Err(AesError::InvalidKey {
            expected: KEY_SIZE,
            actual: key.len(),
        });
    }
    Ok(())
}

/// Encrypt plaintext using AES-256-CBC (PKCS#7 padding) under a fresh random IV.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Sealed, AesError> {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill(&mut iv);

    encrypt_with_iv(key, &iv, plaintext)
}

/// Encrypt with a caller-chosen IV. Only [`encrypt`] should be used for
/// stored secrets; IVs must never repeat under the same key.
pub fn encrypt_with_iv(
    key: &[u8],
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
) -> Result<Sealed, AesError> {
    check_key(key)?;

    let ciphertext = symm_encrypt(Cipher::aes_256_cbc(), key, Some(iv), plaintext)
        .map_err(|e| AesError::EncryptionFailed(e.to_string()))?;

    Ok(Sealed {
        ciphertext,
        iv: *iv,
    })
}

/// Decrypt AES-256-CBC ciphertext. A wrong key or IV almost always shows up
/// as a padding failure.
pub fn decrypt_with_iv(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, AesError> {
    check_key(key)?;

    if iv.len() != IV_SIZE {
        return Err(AesError::InvalidIv {
            expected: IV_SIZE,
            actual: iv.len(),
        });
    }

    decrypt(Cipher::aes_256_cbc(), key, Some(iv), ciphertext)
        .map_err(|e| AesError::DecryptionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [0x42; 32]
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let plaintext = b"correct horse battery staple";

        let sealed = encrypt(&key, plaintext).expect("encryption failed");
        let decrypted =
            decrypt_with_iv(&key, &sealed.iv, &sealed.ciphertext).expect("decryption failed");

        assert_eq!(plaintext, decrypted.as_slice());
    }

    #[test]
    fn test_iv_uniqueness() {
        let key = test_key();
        let plaintext = b"same data";

        let a = encrypt(&key, plaintext).unwrap();
        let b = encrypt(&key, plaintext).unwrap();

        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let sealed = encrypt(&test_key(), b"secret").unwrap();
        let other = [0x24; 32];

        let result = decrypt_with_iv(&other, &sealed.iv, &sealed.ciphertext);
        // CBC with a wrong key can, rarely, produce valid padding; it never
        // yields the original plaintext.
        assert!(result.map(|p| p != b"secret").unwrap_or(true));
    }

    #[test]
    fn test_invalid_key_size() {
        let short_key = [0u8; 16];
        assert!(matches!(
            encrypt(&short_key, b"data"),
            Err(AesError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_invalid_iv_size() {
        let key = test_key();
        assert!(matches!(
            decrypt_with_iv(&key, &[0u8; 8], &[0u8; 16]),
            Err(AesError::InvalidIv { .. })
        ));
    }

    #[test]
    fn test_fixed_iv_is_deterministic() {
        let key = test_key();
        let iv = [7u8; IV_SIZE];
        let a = encrypt_with_iv(&key, &iv, b"passphrase").unwrap();
        let b = encrypt_with_iv(&key, &iv, b"passphrase").unwrap();
        assert_eq!(a, b);
    }
}
