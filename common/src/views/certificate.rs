use std::{
    collections::BTreeSet,
    fmt,
    net::IpAddr,
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{fingerprint::Fingerprint, views::DeployAction};

/// Public key algorithm family of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    Rsa,
    Ec,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Rsa => f.write_str("RSA"),
            KeyType::Ec => f.write_str("EC"),
        }
    }
}

/// On-disk encoding of a certificate file. Preserved across renewals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Encoding {
    #[default]
    Pem,
    Der,
}

/// Subject alternative names carried by a certificate.
///
/// When a common name is present it is always the first DNS entry, lowercased,
/// and the DNS list carries no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sans {
    pub domains: Vec<String>,
    pub ips: Vec<IpAddr>,
}

impl Sans {
    /// Build a SAN set with `common_name` forced into the first slot.
    pub fn with_common_name<I, J>(common_name: Option<&str>, domains: I, ips: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = IpAddr>,
    {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();

        // A CN that is really an IP address belongs in the IP list instead.
        let cn = common_name
            .map(|cn| cn.trim().to_ascii_lowercase())
            .filter(|cn| !cn.is_empty() && cn.parse::<IpAddr>().is_err());

        for name in cn.into_iter().chain(
            domains
                .into_iter()
                .map(|d| d.trim().to_ascii_lowercase()),
        ) {
            if !name.is_empty() && seen.insert(name.clone()) {
                ordered.push(name);
            }
        }

        let mut ip_seen = BTreeSet::new();
        let ips = ips.into_iter().filter(|ip| ip_seen.insert(*ip)).collect();

        Self {
            domains: ordered,
            ips,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.ips.is_empty()
    }
}

/// A certificate tracked by the engine: what was parsed from disk merged with
/// the stored policy for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub fingerprint: Fingerprint,
    pub common_name: Option<String>,
    /// Subject distinguished name, e.g. `CN=api.example.com, O=Acme`
    pub subject: String,
    pub issuer: String,
    pub issuer_cn: Option<String>,

    /// Serial number, uppercase hex
    pub serial_number: String,
    pub signature_algorithm: String,
    pub subject_key_identifier: Option<String>,
    pub authority_key_identifier: Option<String>,

    pub key_type: Option<KeyType>,
    /// Modulus size for RSA keys, curve order bits for EC keys.
    pub key_size: Option<u32>,

    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,

    pub sans: Sans,

    pub is_ca: bool,
    pub path_len_constraint: Option<u32>,
    pub is_self_signed: bool,
    pub is_root_ca: bool,
    /// keyUsage.keyCertSign
    pub key_cert_sign: bool,

    pub original_encoding: Encoding,

    pub cert_path: PathBuf,
    pub key_path: Option<PathBuf>,
    pub chain_path: Option<PathBuf>,
    pub p12_path: Option<PathBuf>,

    pub auto_renew: bool,
    pub renew_days_before_expiry: Option<i64>,
    pub deploy_actions: Vec<DeployAction>,
    pub has_stored_passphrase: bool,

    /// Fingerprint of the issuing certificate, when the issuer is tracked.
    pub signed_by: Option<Fingerprint>,
    /// Fingerprints of certificates this one has issued.
    pub signs: BTreeSet<Fingerprint>,
}

impl Certificate {
    /// Effective renewal threshold, falling back to the global default.
    pub fn renewal_threshold(&self, global_default: i64) -> i64 {
        self.renew_days_before_expiry.unwrap_or(global_default)
    }

    /// Whole days of validity remaining at `now`. Negative once expired.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.valid_to - now).num_days()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_to <= now
    }

    /// Friendly label for log lines and activity messages.
    pub fn display_name(&self) -> &str {
        self.common_name.as_deref().unwrap_or(&self.subject)
    }
}
