use certkeeper_common::{params::P12Cipher, views::Encoding};
use openssl::{
    nid::Nid,
    pkcs12::Pkcs12,
    pkcs7::Pkcs7,
    pkey::{PKey, PKeyRef, Private},
    stack::Stack,
    x509::{X509, X509Ref},
};
use pem_rfc7468::LineEnding;

use crate::{
    crypto::{der, keys, parse},
    error::{EngineError, EngineResult},
};

/// A certificate with its optional private key and issuing chain.
#[derive(Debug)]
pub struct Bundle {
    pub cert: X509,
    pub key: Option<PKey<Private>>,
    pub chain: Vec<X509>,
}

/// Serialize a certificate in the requested encoding.
pub fn encode_certificate(cert: &X509Ref, encoding: Encoding) -> EngineResult<Vec<u8>> {
    let bytes = match encoding {
        Encoding::Pem => cert.to_pem()?,
        Encoding::Der => cert.to_der()?,
    };
    Ok(bytes)
}

/// Swap the first certificate of a certificate file for `cert`. In a PEM
/// file every other block, and any text around them, is kept as it was.
pub fn replace_leaf(existing: &[u8], cert: &X509Ref, encoding: Encoding) -> EngineResult<Vec<u8>> {
    if encoding == Encoding::Der {
        return encode_certificate(cert, encoding);
    }

    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";

    let text = std::str::from_utf8(existing)
        .map_err(|_| EngineError::Parse("PEM input is not valid UTF-8".into()))?;
    let (start, stop) = text
        .find(BEGIN)
        .and_then(|start| text[start..].find(END).map(|end| (start, start + end + END.len())))
        .ok_or_else(|| EngineError::Parse("no CERTIFICATE block in PEM input".into()))?;

    let pem = cert.to_pem()?;
    let pem = std::str::from_utf8(&pem)
        .map_err(|_| EngineError::Parse("PEM output is not valid UTF-8".into()))?;

    let mut out = String::with_capacity(text.len() + pem.len());
    out.push_str(&text[..start]);
    out.push_str(pem.trim_end());
    out.push_str(&text[stop..]);
    Ok(out.into_bytes())
}

/// Concatenated PEM of a list of certificates.
pub fn chain_to_pem(certs: &[X509]) -> EngineResult<Vec<u8>> {
    let mut out = Vec::new();
    for cert in certs {
        out.extend_from_slice(&cert.to_pem()?);
    }
    Ok(out)
}

/// Every certificate in a PEM bundle, or the single certificate of a DER file.
pub fn load_certificates(bytes: &[u8]) -> EngineResult<Vec<X509>> {
    let (ders, _) = parse::decode_certificates(bytes)?;
    ders.iter()
        .map(|der| X509::from_der(der).map_err(|e| EngineError::Parse(e.to_string())))
        .collect()
}

pub fn convert_pem_to_der(pem: &[u8]) -> EngineResult<Vec<u8>> {
    parse::pem_blocks(pem, "CERTIFICATE")
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Parse("no CERTIFICATE block in PEM input".into()))
}

pub fn convert_der_to_pem(der: &[u8]) -> EngineResult<String> {
    // Reject anything that is not a certificate before framing it.
    X509::from_der(der).map_err(|e| EngineError::Parse(e.to_string()))?;
    pem_rfc7468::encode_string("CERTIFICATE", LineEnding::LF, der)
        .map_err(|e| EngineError::Parse(e.to_string()))
}

/// PKCS#12 archive holding `cert`, `key` and `chain`, with `friendly_name`
/// attached to the end-entity bag.
pub fn export_p12(
    cert: &X509Ref,
    key: &PKeyRef<Private>,
    chain: &[X509],
    passphrase: &str,
    friendly_name: &str,
    cipher: P12Cipher,
) -> EngineResult<Vec<u8>> {
    if !keys::key_matches(cert, key)? {
        return Err(EngineError::KeyMismatch);
    }

    let algorithm = match cipher {
        P12Cipher::Aes256 => Nid::AES_256_CBC,
        P12Cipher::TripleDes => Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC,
    };

    let mut builder = Pkcs12::builder();
    builder
        .name(friendly_name)
        .pkey(key)
        .cert(cert)
        .key_algorithm(algorithm)
        .cert_algorithm(algorithm);

    if !chain.is_empty() {
        let mut ca = Stack::new()?;
        for c in chain {
            ca.push(c.clone())?;
        }
        builder.ca(ca);
    }

    Ok(builder.build2(passphrase)?.to_der()?)
}

/// Open a PKCS#12 archive. The certificate whose public key matches the
/// private key is the end-entity; the rest form the chain.
pub fn import_p12(der: &[u8], passphrase: &str) -> EngineResult<Bundle> {
    let archive =
        Pkcs12::from_der(der).map_err(|e| EngineError::Parse(format!("PKCS#12: {e}")))?;
    let parsed = archive.parse2(passphrase).map_err(|_| {
        EngineError::PassphraseUnavailable("passphrase does not open the PKCS#12 archive".into())
    })?;

    let mut certs: Vec<X509> = parsed.cert.into_iter().collect();
    if let Some(ca) = parsed.ca {
        certs.extend(ca);
    }
    if certs.is_empty() {
        return Err(EngineError::Parse("PKCS#12 archive holds no certificate".into()));
    }

    let leaf_index = match &parsed.pkey {
        Some(key) => {
            let mut found = None;
            for (i, cert) in certs.iter().enumerate() {
                if keys::key_matches(cert, key)? {
                    found = Some(i);
                    break;
                }
            }
            found.ok_or(EngineError::KeyMismatch)?
        }
        None => 0,
    };

    let cert = certs.remove(leaf_index);
    Ok(Bundle {
        cert,
        key: parsed.pkey,
        chain: certs,
    })
}

/// Certificates-only PKCS#7 `signed-data`, DER encoded.
pub fn export_p7(certs: &[X509]) -> EngineResult<Vec<u8>> {
    let ders = certs
        .iter()
        .map(|c| c.to_der())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(der::encode_certs_only_pkcs7(&ders))
}

/// Certificates out of a PKCS#7 bundle, PEM (`PKCS7`) or DER.
pub fn import_p7(bytes: &[u8]) -> EngineResult<Vec<X509>> {
    let der = parse::pem_blocks(bytes, "PKCS7")
        .into_iter()
        .next()
        .unwrap_or_else(|| bytes.to_vec());

    let bundle = Pkcs7::from_der(&der).map_err(|e| EngineError::Parse(format!("PKCS#7: {e}")))?;
    let certs = bundle
        .signed()
        .ok_or_else(|| EngineError::Parse("not a PKCS#7 signed-data bundle".into()))?
        .certificates()
        .map(|stack| stack.iter().map(X509Ref::to_owned).collect::<Vec<_>>())
        .unwrap_or_default();

    if certs.is_empty() {
        return Err(EngineError::Parse("PKCS#7 bundle holds no certificate".into()));
    }
    Ok(certs)
}

/// Order a loose set of certificates leaf first: the first certificate that
/// issued no other in the set leads, then each issuer in turn.
pub fn order_leaf_first(mut certs: Vec<X509>) -> Vec<X509> {
    let issues_another = |candidate: &X509, all: &[X509]| {
        all.iter().any(|other| {
            !std::ptr::eq(other, candidate)
                && other.issuer_name().to_der().ok() == candidate.subject_name().to_der().ok()
        })
    };

    let Some(start) = certs.iter().position(|c| !issues_another(c, &certs)) else {
        return certs;
    };

    let mut ordered = vec![certs.remove(start)];
    while let Some(next) = ordered.last().and_then(|last| {
        certs
            .iter()
            .position(|c| c.subject_name().to_der().ok() == last.issuer_name().to_der().ok())
    }) {
        ordered.push(certs.remove(next));
    }
    ordered.extend(certs);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{
        dn,
        issue::{self, CertProfile, SanList},
        parse::fingerprint_der,
    };
    use certkeeper_common::params::KeySpec;
    use chrono::Utc;

    struct Chain {
        root: X509,
        leaf: X509,
        leaf_key: PKey<Private>,
    }

    fn chain() -> Chain {
        let now = Utc::now();
        let root_key = keys::generate_key(KeySpec::EcP256).unwrap();
        let root = issue::create_self_signed(
            now,
            &dn::parse_name("CN=Bundle Root").unwrap(),
            &root_key,
            365,
            &CertProfile::ca(None),
        )
        .unwrap();

        let leaf_key = keys::generate_key(KeySpec::EcP256).unwrap();
        let csr = issue::create_csr(
            &dn::parse_name("CN=leaf.example.com").unwrap(),
            &leaf_key,
            &SanList::default(),
        )
        .unwrap();
        let leaf = issue::sign_with_ca(now, &csr, &root, &root_key, 90, &CertProfile::Leaf).unwrap();

        Chain {
            root,
            leaf,
            leaf_key,
        }
    }

    fn fp(cert: &X509) -> String {
        fingerprint_der(&cert.to_der().unwrap()).to_string()
    }

    #[test]
    fn test_p12_roundtrip_and_wrong_passphrase() {
        let c = chain();
        for cipher in [P12Cipher::Aes256, P12Cipher::TripleDes] {
            let p12 = export_p12(
                &c.leaf,
                &c.leaf_key,
                &[c.root.clone()],
                "s3cret",
                "leaf",
                cipher,
            )
            .unwrap();

            let bundle = import_p12(&p12, "s3cret").unwrap();
            assert_eq!(fp(&bundle.cert), fp(&c.leaf));
            assert_eq!(bundle.chain.len(), 1);
            assert_eq!(fp(&bundle.chain[0]), fp(&c.root));
            assert!(bundle.key.is_some());

            assert!(matches!(
                import_p12(&p12, "nope"),
                Err(EngineError::PassphraseUnavailable(_))
            ));
        }
    }

    #[test]
    fn test_p7_roundtrip() {
        let c = chain();
        let p7 = export_p7(&[c.leaf.clone(), c.root.clone()]).unwrap();
        let certs = import_p7(&p7).unwrap();

        assert_eq!(certs.len(), 2);
        assert_eq!(fp(&certs[0]), fp(&c.leaf));
        assert_eq!(fp(&certs[1]), fp(&c.root));
    }

    #[test]
    fn test_replace_leaf_keeps_other_blocks() {
        let c = chain();
        let mut existing = b"# served by nginx\n".to_vec();
        existing.extend(chain_to_pem(&[c.leaf.clone(), c.root.clone()]).unwrap());

        let other = chain();
        let replaced = replace_leaf(&existing, &other.leaf, Encoding::Pem).unwrap();

        assert!(replaced.starts_with(b"# served by nginx\n"));
        let certs = load_certificates(&replaced).unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(fp(&certs[0]), fp(&other.leaf));
        assert_eq!(fp(&certs[1]), fp(&c.root));
    }

    #[test]
    fn test_replace_leaf_der_is_whole_file() {
        let c = chain();
        let existing = c.leaf.to_der().unwrap();
        let other = chain();

        let replaced = replace_leaf(&existing, &other.leaf, Encoding::Der).unwrap();
        assert_eq!(replaced, other.leaf.to_der().unwrap());
    }

    #[test]
    fn test_p7_rejects_garbage() {
        assert!(matches!(import_p7(b"not pkcs7"), Err(EngineError::Parse(_))));
    }

    #[test]
    fn test_p7_is_readable_by_openssl() {
        let c = chain();
        let p7 = export_p7(&[c.leaf.clone()]).unwrap();
        assert!(openssl::pkcs7::Pkcs7::from_der(&p7).is_ok());
    }

    #[test]
    fn test_pem_der_conversion() {
        let c = chain();
        let pem = c.leaf.to_pem().unwrap();
        let der = convert_pem_to_der(&pem).unwrap();
        assert_eq!(der, c.leaf.to_der().unwrap());

        let back = convert_der_to_pem(&der).unwrap();
        assert_eq!(convert_pem_to_der(back.as_bytes()).unwrap(), der);
        assert!(convert_der_to_pem(b"junk").is_err());
    }

    #[test]
    fn test_order_leaf_first() {
        let c = chain();
        let ordered = order_leaf_first(vec![c.root.clone(), c.leaf.clone()]);
        assert_eq!(fp(&ordered[0]), fp(&c.leaf));
        assert_eq!(fp(&ordered[1]), fp(&c.root));
    }
}
