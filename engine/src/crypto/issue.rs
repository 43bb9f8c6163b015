use std::net::IpAddr;

use chrono::{DateTime, Utc};
use openssl::{
    asn1::{Asn1Integer, Asn1Object, Asn1OctetString, Asn1Time},
    bn::BigNum,
    hash::MessageDigest,
    pkey::{HasPublic, PKeyRef, Private},
    stack::Stack,
    x509::{
        X509, X509Builder, X509Extension, X509NameRef, X509Ref, X509Req, X509ReqBuilder,
        X509ReqRef,
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectAlternativeName,
            SubjectKeyIdentifier,
        },
    },
};
use rand::Rng;
use x509_parser::{
    certification_request::X509CertificationRequest,
    extensions::{GeneralName, ParsedExtension},
    prelude::{FromDer, X509Certificate},
};

use crate::{
    crypto::{keys, parse},
    error::{EngineError, EngineResult},
};

const SECONDS_PER_DAY: i64 = 86_400;

const OID_SUBJECT_KEY_IDENTIFIER: &str = "2.5.29.14";
const OID_AUTHORITY_KEY_IDENTIFIER: &str = "2.5.29.35";

/// Which default extension set a new certificate gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertProfile {
    /// `basicConstraints{cA:true}` and `keyUsage{keyCertSign, cRLSign}`, both
    /// critical.
    Ca { path_len: Option<u32> },
    /// `basicConstraints{cA:false}` and
    /// `keyUsage{digitalSignature, keyEncipherment}`, both critical.
    Leaf,
}

impl CertProfile {
    pub fn ca(path_len: Option<u32>) -> Self {
        CertProfile::Ca { path_len }
    }
}

/// Subject alternative names split into DNS names and IP addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanList {
    pub dns: Vec<String>,
    pub ips: Vec<IpAddr>,
}

impl SanList {
    /// Split mixed input into DNS names and IP addresses. Entries may also be
    /// comma separated.
    pub fn parse<I, S>(entries: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = SanList::default();
        for entry in entries {
            for raw in entry.as_ref().split(',') {
                let raw = raw.trim();
                if raw.is_empty() {
                    continue;
                }
                if let Ok(ip) = raw.parse::<IpAddr>() {
                    list.push_ip(ip);
                    continue;
                }
                if !raw
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '*' | '_'))
                {
                    return Err(EngineError::invalid(format!("invalid SAN entry {raw:?}")));
                }
                list.push_dns(raw);
            }
        }
        Ok(list)
    }

    fn push_dns(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        if !self.dns.contains(&name) {
            self.dns.push(name);
        }
    }

    fn push_ip(&mut self, ip: IpAddr) {
        if !self.ips.contains(&ip) {
            self.ips.push(ip);
        }
    }

    /// Put the common name first (or into the IP list when it is an address).
    pub fn with_common_name(mut self, common_name: Option<&str>) -> Self {
        let Some(cn) = common_name.map(str::trim).filter(|cn| !cn.is_empty()) else {
            return self;
        };

        if let Ok(ip) = cn.parse::<IpAddr>() {
            self.push_ip(ip);
            return self;
        }

        let cn = cn.to_ascii_lowercase();
        self.dns.retain(|d| *d != cn);
        self.dns.insert(0, cn);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dns.is_empty() && self.ips.is_empty()
    }
}

/// Positive serial: `0x01` followed by 19 random bytes.
fn random_serial() -> EngineResult<Asn1Integer> {
    let mut bytes = [0u8; 20];
    bytes[0] = 0x01;
    rand::rng().fill(&mut bytes[1..]);
    Ok(BigNum::from_slice(&bytes)?.to_asn1_integer()?)
}

fn base_builder<T: HasPublic>(
    now: DateTime<Utc>,
    days: u32,
    subject: &X509NameRef,
    issuer: &X509NameRef,
    public_key: &PKeyRef<T>,
) -> EngineResult<X509Builder> {
    if days == 0 {
        return Err(EngineError::invalid("validity must be at least one day"));
    }

    let not_before = Asn1Time::from_unix(now.timestamp())?;
    let not_after = Asn1Time::from_unix(now.timestamp() + i64::from(days) * SECONDS_PER_DAY)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&*random_serial()?)?;
    builder.set_subject_name(subject)?;
    builder.set_issuer_name(issuer)?;
    builder.set_pubkey(public_key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    Ok(builder)
}

fn append_profile(builder: &mut X509Builder, profile: &CertProfile) -> EngineResult<()> {
    match profile {
        CertProfile::Ca { path_len } => {
            let mut bc = BasicConstraints::new();
            bc.critical().ca();
            if let Some(len) = path_len {
                bc.pathlen(*len);
            }
            builder.append_extension(bc.build()?)?;
            builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
        }
        CertProfile::Leaf => {
            builder.append_extension(BasicConstraints::new().critical().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_encipherment()
                    .build()?,
            )?;
        }
    }
    Ok(())
}

fn append_sans(builder: &mut X509Builder, sans: &SanList, issuer: Option<&X509Ref>) -> EngineResult<()> {
    if sans.is_empty() {
        return Ok(());
    }

    let mut san = SubjectAlternativeName::new();
    for name in &sans.dns {
        san.dns(name);
    }
    for ip in &sans.ips {
        san.ip(&ip.to_string());
    }
    let ext = san.build(&builder.x509v3_context(issuer, None))?;
    builder.append_extension(ext)?;
    Ok(())
}

fn append_key_identifiers(builder: &mut X509Builder, issuer: Option<&X509Ref>) -> EngineResult<()> {
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;

    if let Some(issuer) = issuer {
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(issuer), None))?;
        builder.append_extension(aki)?;
    }
    Ok(())
}

/// Self-signed certificate over `key`, SHA-256.
pub fn create_self_signed(
    now: DateTime<Utc>,
    subject: &X509NameRef,
    key: &PKeyRef<Private>,
    days: u32,
    profile: &CertProfile,
) -> EngineResult<X509> {
    let mut builder = base_builder(now, days, subject, subject, key)?;
    append_profile(&mut builder, profile)?;
    append_key_identifiers(&mut builder, None)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Certificate signing request carrying the requested SANs in an
/// `extensionRequest` attribute.
pub fn create_csr(
    subject: &X509NameRef,
    key: &PKeyRef<Private>,
    sans: &SanList,
) -> EngineResult<X509Req> {
    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;
    builder.set_subject_name(subject)?;
    builder.set_pubkey(key)?;

    if !sans.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for name in &sans.dns {
            san.dns(name);
        }
        for ip in &sans.ips {
            san.ip(&ip.to_string());
        }

        let mut extensions = Stack::new()?;
        extensions.push(san.build(&builder.x509v3_context(None))?)?;
        builder.add_extensions(&extensions)?;
    }

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Load a CSR from PEM or DER.
pub fn load_csr(bytes: &[u8]) -> EngineResult<X509Req> {
    if let Some(der) = parse::pem_blocks(bytes, "CERTIFICATE REQUEST").into_iter().next() {
        return X509Req::from_der(&der).map_err(|e| EngineError::Parse(format!("CSR: {e}")));
    }
    X509Req::from_der(bytes).map_err(|e| EngineError::Parse(format!("CSR: {e}")))
}

/// SANs requested by a CSR.
pub fn csr_sans(csr: &X509ReqRef) -> EngineResult<SanList> {
    let der = csr.to_der()?;
    let (_, request) = X509CertificationRequest::from_der(&der)
        .map_err(|e| EngineError::Parse(format!("CSR: {e}")))?;

    let mut list = SanList::default();
    if let Some(extensions) = request.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => list.push_dns(dns),
                        GeneralName::IPAddress(raw) => {
                            if let Some(ip) = parse::ip_from_bytes(raw) {
                                list.push_ip(ip);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    Ok(list)
}

/// Issue a certificate for a CSR. The CSR's own signature must verify; the
/// new certificate takes the CSR's subject, public key and requested SANs.
pub fn sign_with_ca(
    now: DateTime<Utc>,
    csr: &X509ReqRef,
    ca_cert: &X509Ref,
    ca_key: &PKeyRef<Private>,
    days: u32,
    profile: &CertProfile,
) -> EngineResult<X509> {
    let csr_key = csr.public_key()?;
    let verified = csr
        .verify(&csr_key)
        .map_err(|e| EngineError::VerifyFailed(format!("CSR signature: {e}")))?;
    if !verified {
        return Err(EngineError::VerifyFailed(
            "CSR signature does not verify".into(),
        ));
    }
    if !keys::key_matches(ca_cert, ca_key)? {
        return Err(EngineError::KeyMismatch);
    }

    let sans = csr_sans(csr)?;

    let mut builder = base_builder(now, days, csr.subject_name(), ca_cert.subject_name(), &csr_key)?;
    append_profile(&mut builder, profile)?;
    append_sans(&mut builder, &sans, Some(ca_cert))?;
    append_key_identifiers(&mut builder, Some(ca_cert))?;
    builder.sign(ca_key, MessageDigest::sha256())?;

    Ok(builder.build())
}

/// Re-issue `existing` with a fresh serial and validity window.
///
/// Subject, public key and every extension are carried over, except the key
/// identifiers which are recomputed. `issuer` is `None` for a self-signed
/// certificate, in which case `signing_key` must be its own key.
pub fn renew(
    now: DateTime<Utc>,
    existing: &X509Ref,
    issuer: Option<&X509Ref>,
    signing_key: &PKeyRef<Private>,
    days: u32,
) -> EngineResult<X509> {
    let signer = issuer.unwrap_or(existing);
    if !keys::key_matches(signer, signing_key)? {
        return Err(EngineError::KeyMismatch);
    }

    let public_key = existing.public_key()?;
    let mut builder = base_builder(
        now,
        days,
        existing.subject_name(),
        signer.subject_name(),
        &public_key,
    )?;

    let der = existing.to_der()?;
    let (_, parsed) =
        X509Certificate::from_der(&der).map_err(|e| EngineError::Parse(e.to_string()))?;

    let mut had_aki = false;
    for ext in parsed.extensions() {
        let oid = ext.oid.to_id_string();
        match oid.as_str() {
            OID_SUBJECT_KEY_IDENTIFIER => continue,
            OID_AUTHORITY_KEY_IDENTIFIER => {
                had_aki = true;
                continue;
            }
            _ => {}
        }

        let object = Asn1Object::from_str(&oid)?;
        let value = Asn1OctetString::new_from_bytes(ext.value)?;
        builder.append_extension(X509Extension::new_from_der(&object, ext.critical, &value)?)?;
    }

    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;
    if issuer.is_some() || had_aki {
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(issuer, None))?;
        builder.append_extension(aki)?;
    }

    builder.sign(signing_key, MessageDigest::sha256())?;
    Ok(builder.build())
}
