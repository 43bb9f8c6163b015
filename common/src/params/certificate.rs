use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unsupported key spec {0:?}, expected one of rsa-2048, rsa-3072, rsa-4096, ec-p256, ec-p384, ec-p521")]
pub struct KeySpecError(pub String);

/// Algorithm and size of a key to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySpec {
    Rsa2048,
    Rsa3072,
    Rsa4096,
    EcP256,
    EcP384,
    EcP521,
}

impl KeySpec {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeySpec::Rsa2048 => "rsa-2048",
            KeySpec::Rsa3072 => "rsa-3072",
            KeySpec::Rsa4096 => "rsa-4096",
            KeySpec::EcP256 => "ec-p256",
            KeySpec::EcP384 => "ec-p384",
            KeySpec::EcP521 => "ec-p521",
        }
    }

    pub fn is_rsa(&self) -> bool {
        matches!(self, KeySpec::Rsa2048 | KeySpec::Rsa3072 | KeySpec::Rsa4096)
    }

    pub fn bits(&self) -> u32 {
        match self {
            KeySpec::Rsa2048 => 2048,
            KeySpec::Rsa3072 => 3072,
            KeySpec::Rsa4096 => 4096,
            KeySpec::EcP256 => 256,
            KeySpec::EcP384 => 384,
            KeySpec::EcP521 => 521,
        }
    }
}

impl Default for KeySpec {
    fn default() -> Self {
        KeySpec::Rsa2048
    }
}

impl FromStr for KeySpec {
    type Err = KeySpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa-2048" | "rsa2048" => Ok(KeySpec::Rsa2048),
            "rsa-3072" | "rsa3072" => Ok(KeySpec::Rsa3072),
            "rsa-4096" | "rsa4096" => Ok(KeySpec::Rsa4096),
            "ec-p256" | "p-256" | "p256" | "prime256v1" => Ok(KeySpec::EcP256),
            "ec-p384" | "p-384" | "p384" | "secp384r1" => Ok(KeySpec::EcP384),
            "ec-p521" | "p-521" | "p521" | "secp521r1" => Ok(KeySpec::EcP521),
            _ => Err(KeySpecError(s.to_string())),
        }
    }
}

impl TryFrom<String> for KeySpec {
    type Error = KeySpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeySpec> for String {
    fn from(value: KeySpec) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for creating a CA. Without an `issuer` the CA is a self-signed
/// root; with one it is an intermediate signed by that CA.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCaParams {
    /// Distinguished name, e.g. `CN=Test Root,O=Acme`
    pub subject: String,
    #[serde(default)]
    pub key: KeySpec,
    /// Falls back to the configured CA validity period.
    pub days: Option<u32>,
    pub issuer: Option<Fingerprint>,
    pub path_len: Option<u32>,
    /// Encrypts the new private key (PKCS#8, AES-256).
    pub passphrase: Option<String>,
    /// Keep the passphrase in the vault so renewals can run unattended.
    #[serde(default)]
    pub store_passphrase: bool,
    #[serde(default)]
    pub auto_renew: bool,
    pub renew_days_before_expiry: Option<i64>,
}

/// Parameters for issuing an end-entity certificate with a fresh key.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCertificateParams {
    pub subject: String,
    /// DNS names and IP addresses, mixed.
    #[serde(default)]
    pub sans: Vec<String>,
    #[serde(default)]
    pub key: KeySpec,
    pub days: Option<u32>,
    pub issuer: Fingerprint,
    #[serde(default)]
    pub auto_renew: bool,
    pub renew_days_before_expiry: Option<i64>,
    pub key_passphrase: Option<String>,
}

/// Parameters for signing an externally generated CSR.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignCsrParams {
    pub csr_pem: String,
    pub issuer: Fingerprint,
    pub days: Option<u32>,
    /// Base file name for the issued certificate. Defaults to the CSR's CN.
    pub name: Option<String>,
}

/// Existing certificate (and optionally its key) to copy under management.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportPemParams {
    pub cert: Vec<u8>,
    pub key: Option<Vec<u8>>,
    pub key_passphrase: Option<String>,
    pub name: Option<String>,
}

/// Policy edits. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCertificateParams {
    pub auto_renew: Option<bool>,
    pub renew_days_before_expiry: Option<i64>,
    pub key_path: Option<PathBuf>,
    pub chain_path: Option<PathBuf>,
    pub p12_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    /// Also remove every certificate issued (transitively) by this one.
    #[serde(default)]
    pub cascade: bool,
    /// Remove certificate and key files from disk, not only from tracking.
    #[serde(default)]
    pub delete_files: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    #[serde(default)]
    pub ca_only: bool,
    pub expiring_within_days: Option<i64>,
}

/// Cipher protecting the SafeBags of an exported PKCS#12 bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum P12Cipher {
    TripleDes,
    #[default]
    Aes256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_spec_parse_aliases() {
        assert_eq!("RSA-4096".parse::<KeySpec>().unwrap(), KeySpec::Rsa4096);
        assert_eq!("p-384".parse::<KeySpec>().unwrap(), KeySpec::EcP384);
        assert!("dsa-1024".parse::<KeySpec>().is_err());
    }

    #[test]
    fn test_key_spec_serde_uses_string_form() {
        let json = serde_json::to_string(&KeySpec::EcP521).unwrap();
        assert_eq!(json, "\"ec-p521\"");
        let back: KeySpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, KeySpec::EcP521);
    }
}
