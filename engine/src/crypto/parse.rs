use std::net::IpAddr;

use certkeeper_common::{
    Fingerprint,
    views::{Encoding, KeyType, Sans},
};
use chrono::{DateTime, Utc};
use openssl::{pkey::Id, x509::X509};
use sha2::{Digest, Sha256};
use x509_parser::{extensions::GeneralName, prelude::*};

use crate::{
    crypto::der,
    error::{EngineError, EngineResult},
};

const PEM_CERTIFICATE: &str = "CERTIFICATE";

const OID_SUBJECT_KEY_IDENTIFIER: &str = "2.5.29.14";
const OID_AUTHORITY_KEY_IDENTIFIER: &str = "2.5.29.35";

/// Everything the registry needs to know about a certificate body.
#[derive(Debug, Clone)]
pub struct CertInfo {
    pub fingerprint: Fingerprint,
    pub common_name: Option<String>,
    pub subject: String,
    pub issuer: String,
    pub issuer_cn: Option<String>,
    pub serial_number: String,
    pub signature_algorithm: String,
    pub subject_key_identifier: Option<String>,
    pub authority_key_identifier: Option<String>,
    pub key_type: Option<KeyType>,
    pub key_size: Option<u32>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub sans: Sans,
    pub is_ca: bool,
    pub path_len_constraint: Option<u32>,
    pub is_self_signed: bool,
    pub is_root_ca: bool,
    pub key_cert_sign: bool,
    pub encoding: Encoding,
    /// DER body the fingerprint was computed over.
    pub der: Vec<u8>,
}

impl CertInfo {
    /// Validity span in whole days, never less than one.
    pub fn validity_days(&self) -> u32 {
        (self.valid_to - self.valid_from).num_days().max(1) as u32
    }
}

/// Uppercase hex SHA-256 of a DER certificate body.
pub fn fingerprint_der(der: &[u8]) -> Fingerprint {
    Fingerprint::from_digest(&Sha256::digest(der))
}

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes
        .windows(b"-----BEGIN ".len())
        .any(|w| w == b"-----BEGIN ")
}

/// Decode every PEM block with the given label, in file order. Text around
/// the blocks is ignored.
pub fn pem_blocks(input: &[u8], label: &str) -> Vec<Vec<u8>> {
    let Ok(text) = std::str::from_utf8(input) else {
        return Vec::new();
    };

    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");

    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&begin) {
        let tail = &rest[start..];
        let Some(stop) = tail.find(&end) else {
            break;
        };
        let block = &tail[..stop + end.len()];
        if let Ok((_, der)) = pem_rfc7468::decode_vec(block.as_bytes()) {
            blocks.push(der);
        }
        rest = &tail[stop + end.len()..];
    }

    blocks
}

/// Split certificate file contents into DER bodies, PEM first, DER second.
pub fn decode_certificates(bytes: &[u8]) -> EngineResult<(Vec<Vec<u8>>, Encoding)> {
    if looks_like_pem(bytes) {
        let blocks = pem_blocks(bytes, PEM_CERTIFICATE);
        if blocks.is_empty() {
            return Err(EngineError::Parse("no CERTIFICATE block in PEM input".into()));
        }
        return Ok((blocks, Encoding::Pem));
    }

    if X509Certificate::from_der(bytes).is_ok() {
        return Ok((vec![bytes.to_vec()], Encoding::Der));
    }

    Err(EngineError::Parse("input is neither PEM nor DER".into()))
}

/// Load the first certificate of a PEM or DER input into OpenSSL.
pub fn load_x509(bytes: &[u8]) -> EngineResult<X509> {
    let (ders, _) = decode_certificates(bytes)?;
    let der = ders
        .first()
        .ok_or_else(|| EngineError::Parse("empty certificate input".into()))?;
    X509::from_der(der).map_err(|e| EngineError::Parse(e.to_string()))
}

/// Parse the first certificate of a PEM or DER input.
pub fn parse_certificate(bytes: &[u8]) -> EngineResult<CertInfo> {
    let (ders, encoding) = decode_certificates(bytes)?;
    let der = ders
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Parse("empty certificate input".into()))?;
    parse_der(der, encoding)
}

pub fn parse_der(der: Vec<u8>, encoding: Encoding) -> EngineResult<CertInfo> {
    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|e| EngineError::Parse(e.to_string()))?;

    let subject = cert.subject().to_string();
    let issuer = cert.issuer().to_string();
    let common_name = first_common_name(cert.subject());
    let issuer_cn = first_common_name(cert.issuer());
    let is_self_signed = cert.subject().as_raw() == cert.issuer().as_raw() || subject == issuer;

    let (is_ca, path_len_constraint) = match cert.basic_constraints() {
        Ok(Some(bc)) => (bc.value.ca, bc.value.path_len_constraint),
        _ => (false, None),
    };

    let key_cert_sign = matches!(cert.key_usage(), Ok(Some(ku)) if ku.value.key_cert_sign());

    let mut domains = Vec::new();
    let mut ips = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => domains.push(dns.to_string()),
                GeneralName::IPAddress(raw) => {
                    if let Some(ip) = ip_from_bytes(raw) {
                        ips.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    let (subject_key_identifier, authority_key_identifier) = key_identifiers(&cert);

    let valid_from = timestamp(cert.validity().not_before.timestamp())?;
    let valid_to = timestamp(cert.validity().not_after.timestamp())?;

    let signature_algorithm =
        signature_algorithm_name(&cert.signature_algorithm.algorithm.to_id_string());

    let (key_type, key_size) = public_key_details(&der);

    Ok(CertInfo {
        fingerprint: fingerprint_der(&der),
        sans: Sans::with_common_name(common_name.as_deref(), domains, ips),
        common_name,
        subject,
        issuer,
        issuer_cn,
        serial_number: hex::encode_upper(cert.raw_serial()),
        signature_algorithm,
        subject_key_identifier,
        authority_key_identifier,
        key_type,
        key_size,
        valid_from,
        valid_to,
        is_ca,
        path_len_constraint,
        is_self_signed,
        is_root_ca: is_ca && is_self_signed,
        key_cert_sign,
        encoding,
        der,
    })
}

fn first_common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

pub(crate) fn ip_from_bytes(raw: &[u8]) -> Option<IpAddr> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(raw).ok().map(IpAddr::from),
        _ => None,
    }
}

fn timestamp(secs: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| EngineError::Parse(format!("validity timestamp {secs} out of range")))
}

/// SKI and AKI as uppercase hex. Falls back to reading the raw extension
/// value when the parser does not expose a key identifier.
fn key_identifiers(cert: &X509Certificate<'_>) -> (Option<String>, Option<String>) {
    let mut ski = None;
    let mut aki = None;

    for ext in cert.extensions() {
        match ext.oid.to_id_string().as_str() {
            OID_SUBJECT_KEY_IDENTIFIER => {
                ski = match ext.parsed_extension() {
                    ParsedExtension::SubjectKeyIdentifier(id) => Some(id.0.to_vec()),
                    _ => der::subject_key_identifier(ext.value),
                };
            }
            OID_AUTHORITY_KEY_IDENTIFIER => {
                aki = match ext.parsed_extension() {
                    ParsedExtension::AuthorityKeyIdentifier(id) => id
                        .key_identifier
                        .as_ref()
                        .map(|k| k.0.to_vec())
                        .or_else(|| der::authority_key_identifier(ext.value)),
                    _ => der::authority_key_identifier(ext.value),
                };
            }
            _ => {}
        }
    }

    (ski.map(hex::encode_upper), aki.map(hex::encode_upper))
}

fn public_key_details(der: &[u8]) -> (Option<KeyType>, Option<u32>) {
    let Ok(pkey) = X509::from_der(der).and_then(|x| x.public_key()) else {
        return (None, None);
    };

    match pkey.id() {
        Id::RSA => (Some(KeyType::Rsa), Some(pkey.bits())),
        Id::EC => (Some(KeyType::Ec), Some(pkey.bits())),
        _ => (None, Some(pkey.bits())),
    }
}

fn signature_algorithm_name(oid: &str) -> String {
    let name = match oid {
        "1.2.840.113549.1.1.5" => "sha1WithRSAEncryption",
        "1.2.840.113549.1.1.11" => "sha256WithRSAEncryption",
        "1.2.840.113549.1.1.12" => "sha384WithRSAEncryption",
        "1.2.840.113549.1.1.13" => "sha512WithRSAEncryption",
        "1.2.840.113549.1.1.10" => "rsassaPss",
        "1.2.840.10045.4.3.2" => "ecdsa-with-SHA256",
        "1.2.840.10045.4.3.3" => "ecdsa-with-SHA384",
        "1.2.840.10045.4.3.4" => "ecdsa-with-SHA512",
        "1.3.101.112" => "ED25519",
        other => return other.to_string(),
    };
    name.to_string()
}
