//! Persistent configuration: global defaults plus per-certificate policy,
//! deploy actions and sealed passphrases, kept in one JSON document.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use certkeeper_common::{
    normalize_fingerprint,
    views::{DeployAction, GlobalDefaults},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{error::EngineResult, files};

/// Stored settings for one certificate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertConfig {
    #[serde(default)]
    pub auto_renew: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_days_before_expiry: Option<i64>,
    #[serde(default)]
    pub deploy_actions: Vec<DeployAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p12_path: Option<PathBuf>,

    #[serde(default)]
    pub has_stored_passphrase: bool,
    /// Hex AES-256-CBC ciphertext, see [`crate::vault`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_passphrase: Option<String>,
    #[serde(
        default,
        rename = "passphraseIV",
        skip_serializing_if = "Option::is_none"
    )]
    pub passphrase_iv: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub global_defaults: GlobalDefaults,
    /// Keyed by normalized fingerprint.
    #[serde(default)]
    pub certificates: BTreeMap<String, CertConfig>,
}

impl ConfigDocument {
    /// Rewrite every key into normalized form. Entries whose keys collide
    /// after normalization keep the first one seen.
    fn normalize_keys(&mut self) {
        let entries = std::mem::take(&mut self.certificates);
        for (key, config) in entries {
            let normalized = normalize_fingerprint(&key);
            if self.certificates.contains_key(&normalized) {
                warn!(key = %key, "Dropping duplicate certificate config entry");
                continue;
            }
            self.certificates.insert(normalized, config);
        }
    }

    /// Key under which `fingerprint` is stored, tolerating un-normalized
    /// spellings on either side.
    fn find_key(&self, fingerprint: &str) -> Option<String> {
        let normalized = normalize_fingerprint(fingerprint);
        if self.certificates.contains_key(&normalized) {
            return Some(normalized);
        }
        self.certificates
            .keys()
            .find(|k| normalize_fingerprint(k) == normalized)
            .cloned()
    }

    pub fn get(&self, fingerprint: &str) -> Option<&CertConfig> {
        let key = self.find_key(fingerprint)?;
        self.certificates.get(&key)
    }

    pub fn get_mut(&mut self, fingerprint: &str) -> Option<&mut CertConfig> {
        let key = self.find_key(fingerprint)?;
        self.certificates.get_mut(&key)
    }

    /// Entry for `fingerprint`, created with defaults if missing. A stray
    /// un-normalized key is moved under the normalized one.
    pub fn entry(&mut self, fingerprint: &str) -> &mut CertConfig {
        let normalized = normalize_fingerprint(fingerprint);
        if let Some(key) = self.find_key(&normalized) {
            if key != normalized {
                if let Some(config) = self.certificates.remove(&key) {
                    self.certificates.insert(normalized.clone(), config);
                }
            }
        }
        self.certificates.entry(normalized).or_default()
    }

    /// Remove every entry whose key normalizes to `fingerprint`.
    pub fn remove(&mut self, fingerprint: &str) -> Option<CertConfig> {
        let normalized = normalize_fingerprint(fingerprint);
        let mut removed = None;
        self.certificates.retain(|key, config| {
            if normalize_fingerprint(key) == normalized {
                removed.get_or_insert_with(|| config.clone());
                false
            } else {
                true
            }
        });
        removed
    }
}

/// The config document plus the lock that serializes reads and writes of it.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    doc: Mutex<ConfigDocument>,
}

impl ConfigStore {
    /// Load the document, or start an empty one when the file is missing.
    pub fn load(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let mut doc = match files::read_optional(&path)? {
            Some(bytes) => serde_json::from_slice::<ConfigDocument>(&bytes)?,
            None => {
                debug!(path = %path.display(), "No certificate config yet, starting empty");
                ConfigDocument::default()
            }
        };
        doc.normalize_keys();

        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(path: &Path, doc: &ConfigDocument) -> EngineResult<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        files::write_atomic_via(path, ".tmp", &bytes, files::SECRET_MODE)
    }

    pub async fn snapshot(&self) -> ConfigDocument {
        self.doc.lock().await.clone()
    }

    pub async fn get(&self, fingerprint: &str) -> Option<CertConfig> {
        self.doc.lock().await.get(fingerprint).cloned()
    }

    pub async fn global_defaults(&self) -> GlobalDefaults {
        self.doc.lock().await.global_defaults.clone()
    }

    /// Apply `f` to a copy of the document and persist it. The in-memory
    /// document only changes once the save succeeded.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut ConfigDocument) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        let result = f(&mut next)?;

        if next != *doc {
            Self::save(&self.path, &next)?;
            *doc = next;
        }
        Ok(result)
    }
}
