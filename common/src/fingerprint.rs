use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Fingerprint is empty")]
    Empty,

    #[error("Fingerprint contains a non-hex character: {0:?}")]
    InvalidCharacter(char),
}

/// Normalize a fingerprint string into its canonical form: uppercase hex with
/// no separators.
///
/// Accepts the common spellings seen in the wild: `AB:CD:..`, `ab cd ..`,
/// and the `sha256:<hex>` prefix form. Applying it twice is the same as
/// applying it once.
pub fn normalize_fingerprint(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    match cleaned.strip_prefix("SHA256") {
        Some(rest) => rest.to_string(),
        None => cleaned,
    }
}

/// Canonical identity of a certificate: uppercase hex SHA-256 of the DER body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Build a fingerprint from raw digest bytes.
    pub fn from_digest(digest: &[u8]) -> Self {
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            out.push_str(&format!("{:02X}", b));
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex characters, handy for log lines and file names.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(16)]
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize_fingerprint(s);
        if normalized.is_empty() {
            return Err(FingerprintError::Empty);
        }
        if let Some(c) = normalized.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(FingerprintError::InvalidCharacter(c));
        }
        Ok(Self(normalized))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_separators_and_uppercases() {
        assert_eq!(normalize_fingerprint("ab:cd:ef"), "ABCDEF");
        assert_eq!(normalize_fingerprint(" ab cd\tef\n"), "ABCDEF");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let inputs = ["ab:CD:01", "sha256:abcd", "AbCd 0102", "", "ABCDEF"];
        for input in inputs {
            let once = normalize_fingerprint(input);
            assert_eq!(normalize_fingerprint(&once), once, "input {input:?}");
        }
    }

    #[test]
    fn test_normalize_equal_modulo_separators() {
        assert_eq!(
            normalize_fingerprint("aa:bb:cc"),
            normalize_fingerprint("AABBCC")
        );
        assert_eq!(
            normalize_fingerprint("sha256:aa:bb"),
            normalize_fingerprint("AA BB")
        );
    }

    #[test]
    fn test_normalize_prefix_with_or_without_colon() {
        assert_eq!(normalize_fingerprint("sha256:ab:cd"), "ABCD");
        assert_eq!(normalize_fingerprint("sha256abcd"), "ABCD");
        assert_eq!(normalize_fingerprint("SHA256 AB CD"), "ABCD");
    }

    #[test]
    fn test_from_digest_is_uppercase_hex() {
        let fp = Fingerprint::from_digest(&[0x0a, 0xff, 0x10]);
        assert_eq!(fp.as_str(), "0AFF10");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("".parse::<Fingerprint>(), Err(FingerprintError::Empty));
        assert_eq!(
            "zz".parse::<Fingerprint>(),
            Err(FingerprintError::InvalidCharacter('Z'))
        );
    }

    #[test]
    fn test_serde_normalizes_on_read() {
        let fp: Fingerprint = serde_json::from_str("\"aa:bb\"").unwrap();
        assert_eq!(fp.as_str(), "AABB");
        assert_eq!(serde_json::to_string(&fp).unwrap(), "\"AABB\"");
    }
}
