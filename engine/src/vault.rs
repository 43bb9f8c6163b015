//! CA passphrases sealed with AES-256-CBC under a process-local key file.
//!
//! The key lives at `<configDir>/.encryption-key` (mode 0600). It is created
//! once and never rewritten; without it the sealed passphrases in the config
//! document are unreadable.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use rand::Rng;
use tracing::info;

use crate::{
    crypto::aes::{self, IV_SIZE, KEY_SIZE},
    error::{EngineError, EngineResult},
    files,
    store::CertConfig,
};

pub struct PassphraseVault {
    key_path: PathBuf,
    key: [u8; KEY_SIZE],
    /// Decrypted passphrases by normalized fingerprint, for this run only.
    cache: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for PassphraseVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseVault")
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl PassphraseVault {
    /// Load the key file, creating it on first use. A key file that exists
    /// but cannot be read is an error: silently replacing it would orphan
    /// every stored passphrase.
    pub fn open(key_path: impl Into<PathBuf>) -> EngineResult<Self> {
        let key_path = key_path.into();

        let key = match files::read_optional(&key_path)? {
            Some(bytes) => <[u8; KEY_SIZE]>::try_from(bytes.as_slice()).map_err(|_| {
                EngineError::PassphraseUnavailable(format!(
                    "{} holds {} bytes, expected {}",
                    key_path.display(),
                    bytes.len(),
                    KEY_SIZE
                ))
            })?,
            None => {
                let mut key = [0u8; KEY_SIZE];
                rand::rng().fill(&mut key);
                files::write_atomic(&key_path, &key, files::SECRET_MODE)?;
                info!(path = %key_path.display(), "Created passphrase encryption key");
                key
            }
        };

        Ok(Self {
            key_path,
            key,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encrypt `passphrase` under a fresh IV into the config entry's fields.
    pub fn seal_into(&self, config: &mut CertConfig, passphrase: &str) -> EngineResult<()> {
        let sealed = aes::encrypt(&self.key, passphrase.as_bytes())?;
        config.encrypted_passphrase = Some(hex::encode(&sealed.ciphertext));
        config.passphrase_iv = Some(hex::encode(sealed.iv));
        config.has_stored_passphrase = true;
        Ok(())
    }

    /// Decrypt the passphrase stored in a config entry.
    pub fn unseal(&self, config: &CertConfig) -> EngineResult<Option<String>> {
        if !config.has_stored_passphrase {
            return Ok(None);
        }

        let (Some(ciphertext), Some(iv)) = (&config.encrypted_passphrase, &config.passphrase_iv)
        else {
            return Err(EngineError::PassphraseUnavailable(
                "stored passphrase is incomplete".into(),
            ));
        };

        let ciphertext = hex::decode(ciphertext)
            .map_err(|e| EngineError::PassphraseUnavailable(format!("ciphertext: {e}")))?;
        let iv = hex::decode(iv)
            .map_err(|e| EngineError::PassphraseUnavailable(format!("IV: {e}")))?;
        if iv.len() != IV_SIZE {
            return Err(EngineError::PassphraseUnavailable(format!(
                "IV has {} bytes, expected {IV_SIZE}",
                iv.len()
            )));
        }

        let plain = aes::decrypt_with_iv(&self.key, &iv, &ciphertext)?;
        let passphrase = String::from_utf8(plain).map_err(|_| {
            EngineError::PassphraseUnavailable("stored passphrase does not decrypt".into())
        })?;
        Ok(Some(passphrase))
    }

    /// Cached passphrase for `fingerprint`, decrypting from `config` on the
    /// first call.
    pub fn passphrase(
        &self,
        fingerprint: &str,
        config: Option<&CertConfig>,
    ) -> EngineResult<Option<String>> {
        if let Some(cached) = self.cache().get(fingerprint) {
            return Ok(Some(cached.clone()));
        }

        let Some(config) = config else {
            return Ok(None);
        };
        let passphrase = self.unseal(config)?;
        if let Some(p) = &passphrase {
            self.cache().insert(fingerprint.to_string(), p.clone());
        }
        Ok(passphrase)
    }

    /// Remember a passphrase for this run without persisting it.
    pub fn remember(&self, fingerprint: &str, passphrase: &str) {
        self.cache()
            .insert(fingerprint.to_string(), passphrase.to_string());
    }

    /// Forget the cached passphrase and wipe the sealed fields of `config`.
    pub fn clear(&self, fingerprint: &str, config: Option<&mut CertConfig>) {
        self.cache().remove(fingerprint);
        if let Some(config) = config {
            config.has_stored_passphrase = false;
            config.encrypted_passphrase = None;
            config.passphrase_iv = None;
        }
    }

    pub fn forget(&self, fingerprint: &str) {
        self.cache().remove(fingerprint);
    }
}
