//! Just enough DER to pull key identifiers out of raw extension values and to
//! write certificate-only PKCS#7 bundles.

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_OID: u8 = 0x06;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;
pub const TAG_CONTEXT_0: u8 = 0x80;
pub const TAG_CONTEXT_0_CONSTRUCTED: u8 = 0xA0;

/// 1.2.840.113549.1.7.1
const OID_PKCS7_DATA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x01];
/// 1.2.840.113549.1.7.2
const OID_PKCS7_SIGNED_DATA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02];

/// A single tag-length-value element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub contents: &'a [u8],
    /// The full encoding, header included.
    pub raw: &'a [u8],
}

/// Read one element off the front of `input`, returning it and the rest.
pub fn read_tlv(input: &[u8]) -> Option<(Tlv<'_>, &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;

    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7F) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return None;
        }
        let len = rest[..n]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[n..])
    };

    if rest.len() < len {
        return None;
    }

    let header_len = input.len() - rest.len();
    let tlv = Tlv {
        tag,
        contents: &rest[..len],
        raw: &input[..header_len + len],
    };
    Some((tlv, &rest[len..]))
}

/// Iterate the children of a constructed element.
pub fn children(contents: &[u8]) -> impl Iterator<Item = Tlv<'_>> {
    let mut rest = contents;
    std::iter::from_fn(move || {
        let (tlv, next) = read_tlv(rest)?;
        rest = next;
        Some(tlv)
    })
}

pub fn encode_tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contents.len() + 6);
    out.push(tag);

    let len = contents.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }

    out.extend_from_slice(contents);
    out
}

/// Key identifier bytes from a raw SubjectKeyIdentifier extension value
/// (`OCTET STRING`).
pub fn subject_key_identifier(ext_value: &[u8]) -> Option<Vec<u8>> {
    let (tlv, _) = read_tlv(ext_value)?;
    (tlv.tag == TAG_OCTET_STRING).then(|| tlv.contents.to_vec())
}

/// Key identifier bytes from a raw AuthorityKeyIdentifier extension value.
///
/// `keyIdentifier` is `[0] IMPLICIT OCTET STRING`; some encoders wrap it as an
/// explicit `[0]` around an `OCTET STRING`, which is accepted too.
pub fn authority_key_identifier(ext_value: &[u8]) -> Option<Vec<u8>> {
    let (seq, _) = read_tlv(ext_value)?;
    if seq.tag != TAG_SEQUENCE {
        return None;
    }

    children(seq.contents).find_map(|child| match child.tag {
        TAG_CONTEXT_0 => Some(child.contents.to_vec()),
        TAG_CONTEXT_0_CONSTRUCTED => read_tlv(child.contents)
            .filter(|(inner, _)| inner.tag == TAG_OCTET_STRING)
            .map(|(inner, _)| inner.contents.to_vec()),
        _ => None,
    })
}

/// Encode a PKCS#7 `signed-data` with no signers and the given certificates.
pub fn encode_certs_only_pkcs7(certs_der: &[Vec<u8>]) -> Vec<u8> {
    let version = encode_tlv(TAG_INTEGER, &[0x01]);
    let digest_algorithms = encode_tlv(TAG_SET, &[]);
    let encap_content_info = encode_tlv(TAG_SEQUENCE, &encode_tlv(TAG_OID, OID_PKCS7_DATA));
    let certificates = encode_tlv(TAG_CONTEXT_0_CONSTRUCTED, &certs_der.concat());
    let signer_infos = encode_tlv(TAG_SET, &[]);

    let signed_data = encode_tlv(
        TAG_SEQUENCE,
        &[
            version,
            digest_algorithms,
            encap_content_info,
            certificates,
            signer_infos,
        ]
        .concat(),
    );

    encode_tlv(
        TAG_SEQUENCE,
        &[
            encode_tlv(TAG_OID, OID_PKCS7_SIGNED_DATA),
            encode_tlv(TAG_CONTEXT_0_CONSTRUCTED, &signed_data),
        ]
        .concat(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_form_length_roundtrip() {
        let contents = vec![0xAB; 300];
        let encoded = encode_tlv(TAG_OCTET_STRING, &contents);
        assert_eq!(&encoded[..4], &[0x04, 0x82, 0x01, 0x2C]);

        let (tlv, rest) = read_tlv(&encoded).unwrap();
        assert!(rest.is_empty());
        assert_eq!(tlv.contents, contents.as_slice());
        assert_eq!(tlv.raw, encoded.as_slice());
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        assert!(read_tlv(&[0x04, 0x05, 0x01]).is_none());
        assert!(read_tlv(&[0x04]).is_none());
    }

    #[test]
    fn test_authority_key_identifier_implicit() {
        let aki = encode_tlv(TAG_SEQUENCE, &encode_tlv(TAG_CONTEXT_0, &[1, 2, 3]));
        assert_eq!(authority_key_identifier(&aki), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_authority_key_identifier_wrapped_octet_string() {
        let inner = encode_tlv(TAG_OCTET_STRING, &[9, 8, 7]);
        let aki = encode_tlv(
            TAG_SEQUENCE,
            &encode_tlv(TAG_CONTEXT_0_CONSTRUCTED, &inner),
        );
        assert_eq!(authority_key_identifier(&aki), Some(vec![9, 8, 7]));
    }
}
