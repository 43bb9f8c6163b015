//! X.509 primitives: parsing, key handling, issuance, renewal and bundle
//! formats.
//!
//! Parsing goes through `x509-parser`, everything that produces key material
//! or signatures goes through OpenSSL.

pub mod aes;
pub mod bundle;
pub mod der;
pub mod dn;
pub mod issue;
pub mod keys;
pub mod parse;

pub use bundle::{Bundle, convert_der_to_pem, convert_pem_to_der};
pub use issue::{CertProfile, SanList};
pub use keys::{generate_key, load_private_key, private_key_to_pem, validate_key_pair};
pub use parse::{CertInfo, fingerprint_der, load_x509, parse_certificate};
