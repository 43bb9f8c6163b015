use certkeeper_common::params::KeySpec;
use openssl::{
    ec::{EcGroup, EcKey},
    nid::Nid,
    pkey::{PKey, PKeyRef, Private},
    rsa::Rsa,
    symm::Cipher,
    x509::X509Ref,
};

use crate::{
    crypto::{der, parse},
    error::{EngineError, EngineResult},
};

/// Generate a fresh private key.
pub fn generate_key(spec: KeySpec) -> EngineResult<PKey<Private>> {
    let key = match spec {
        KeySpec::Rsa2048 | KeySpec::Rsa3072 | KeySpec::Rsa4096 => {
            PKey::from_rsa(Rsa::generate(spec.bits())?)?
        }
        KeySpec::EcP256 => ec_key(Nid::X9_62_PRIME256V1)?,
        KeySpec::EcP384 => ec_key(Nid::SECP384R1)?,
        KeySpec::EcP521 => ec_key(Nid::SECP521R1)?,
    };
    Ok(key)
}

fn ec_key(curve: Nid) -> EngineResult<PKey<Private>> {
    let group = EcGroup::from_curve_name(curve)?;
    Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
}

/// PKCS#8 PEM, encrypted with AES-256-CBC when a passphrase is given.
pub fn private_key_to_pem(key: &PKeyRef<Private>, passphrase: Option<&str>) -> EngineResult<Vec<u8>> {
    let pem = match passphrase {
        Some(pass) => {
            key.private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), pass.as_bytes())?
        }
        None => key.private_key_to_pem_pkcs8()?,
    };
    Ok(pem)
}

/// Whether the bytes hold an encrypted private key, either PEM
/// (`ENCRYPTED PRIVATE KEY` or a legacy `Proc-Type: 4,ENCRYPTED` header) or a
/// DER `EncryptedPrivateKeyInfo`.
pub fn is_encrypted(bytes: &[u8]) -> bool {
    if let Ok(text) = std::str::from_utf8(bytes) {
        if text.contains("-----BEGIN") {
            return text.contains("ENCRYPTED");
        }
    }

    // EncryptedPrivateKeyInfo ::= SEQUENCE { AlgorithmIdentifier, OCTET STRING }
    // while a plain PrivateKeyInfo starts with an INTEGER version.
    let Some((outer, _)) = der::read_tlv(bytes) else {
        return false;
    };
    let mut children = der::children(outer.contents);
    matches!(
        (children.next(), children.next()),
        (Some(alg), Some(data)) if alg.tag == der::TAG_SEQUENCE && data.tag == der::TAG_OCTET_STRING
    )
}

/// Load a private key from PEM or DER, plain or encrypted.
///
/// An encrypted key without a passphrase fails with `PassphraseRequired`, a
/// passphrase that does not open it with `PassphraseUnavailable`.
pub fn load_private_key(bytes: &[u8], passphrase: Option<&str>) -> EngineResult<PKey<Private>> {
    let encrypted = is_encrypted(bytes);
    let pem = std::str::from_utf8(bytes)
        .map(|t| t.contains("-----BEGIN"))
        .unwrap_or(false);

    match (encrypted, passphrase) {
        (true, None) => Err(EngineError::PassphraseRequired(
            "private key is encrypted".into(),
        )),
        (true, Some(pass)) => {
            let result = if pem {
                PKey::private_key_from_pem_passphrase(bytes, pass.as_bytes())
            } else {
                PKey::private_key_from_pkcs8_passphrase(bytes, pass.as_bytes())
            };
            result.map_err(|_| {
                EngineError::PassphraseUnavailable("passphrase does not decrypt the private key".into())
            })
        }
        (false, _) => {
            let result = if pem {
                PKey::private_key_from_pem(bytes)
            } else {
                PKey::private_key_from_der(bytes)
            };
            result.map_err(|e| EngineError::Parse(format!("private key: {e}")))
        }
    }
}

/// True iff the key's public half equals the certificate's
/// SubjectPublicKeyInfo.
pub fn key_matches(cert: &X509Ref, key: &PKeyRef<Private>) -> EngineResult<bool> {
    let from_cert = cert.public_key()?.public_key_to_pem()?;
    let from_key = key.public_key_to_pem()?;
    Ok(from_cert == from_key)
}

/// Check that a certificate and a private key belong together.
pub fn validate_key_pair(
    cert_bytes: &[u8],
    key_bytes: &[u8],
    passphrase: Option<&str>,
) -> EngineResult<bool> {
    let cert = parse::load_x509(cert_bytes)?;
    let key = load_private_key(key_bytes, passphrase)?;
    key_matches(&cert, &key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{
        dn,
        issue::{self, CertProfile},
    };
    use chrono::Utc;

    fn self_signed(key: &PKey<Private>) -> Vec<u8> {
        let name = dn::parse_name("CN=keys.test").unwrap();
        issue::create_self_signed(Utc::now(), &name, key, 1, &CertProfile::Leaf)
            .unwrap()
            .to_pem()
            .unwrap()
    }

    #[test]
    fn test_generate_ec_curves() {
        for (spec, bits) in [
            (KeySpec::EcP256, 256),
            (KeySpec::EcP384, 384),
            (KeySpec::EcP521, 521),
        ] {
            let key = generate_key(spec).unwrap();
            assert_eq!(key.bits(), bits, "{spec}");
        }
    }

    #[test]
    fn test_generate_rsa_2048() {
        let key = generate_key(KeySpec::Rsa2048).unwrap();
        assert_eq!(key.bits(), 2048);
    }

    #[test]
    fn test_encrypted_key_needs_passphrase() {
        let key = generate_key(KeySpec::EcP256).unwrap();
        let pem = private_key_to_pem(&key, Some("hunter2")).unwrap();
        assert!(is_encrypted(&pem));

        assert!(matches!(
            load_private_key(&pem, None),
            Err(EngineError::PassphraseRequired(_))
        ));
        assert!(matches!(
            load_private_key(&pem, Some("wrong")),
            Err(EngineError::PassphraseUnavailable(_))
        ));

        let loaded = load_private_key(&pem, Some("hunter2")).unwrap();
        assert_eq!(
            loaded.public_key_to_pem().unwrap(),
            key.public_key_to_pem().unwrap()
        );
    }

    #[test]
    fn test_plain_key_loads_from_pem_and_der() {
        let key = generate_key(KeySpec::EcP256).unwrap();
        let pem = private_key_to_pem(&key, None).unwrap();
        let der = key.private_key_to_pkcs8().unwrap();

        assert!(!is_encrypted(&pem));
        assert!(!is_encrypted(&der));
        assert!(load_private_key(&pem, None).is_ok());
        assert!(load_private_key(&der, None).is_ok());
    }

    #[test]
    fn test_encrypted_der_is_detected() {
        let key = generate_key(KeySpec::EcP256).unwrap();
        let der = key
            .private_key_to_pkcs8_passphrase(Cipher::aes_256_cbc(), b"pw")
            .unwrap();

        assert!(is_encrypted(&der));
        assert!(load_private_key(&der, Some("pw")).is_ok());
    }

    #[test]
    fn test_validate_key_pair() {
        let key = generate_key(KeySpec::EcP256).unwrap();
        let other = generate_key(KeySpec::EcP256).unwrap();
        let cert = self_signed(&key);

        let key_pem = private_key_to_pem(&key, None).unwrap();
        let other_pem = private_key_to_pem(&other, None).unwrap();

        assert!(validate_key_pair(&cert, &key_pem, None).unwrap());
        assert!(!validate_key_pair(&cert, &other_pem, None).unwrap());
    }
}
