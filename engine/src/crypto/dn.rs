//! Distinguished-name strings.
//!
//! Two spellings are accepted: `CN=Test Root,O=Acme` (comma separated, `\,`
//! escapes a literal comma) and the OpenSSL one-line form `/CN=Test Root/O=Acme`.
//! A bare value without any `=` is taken as a common name.

use openssl::x509::{X509Name, X509NameBuilder};

use crate::error::{EngineError, EngineResult};

/// Parse a DN string into ordered `(attribute, value)` pairs.
pub fn parse(input: &str) -> EngineResult<Vec<(String, String)>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(EngineError::invalid("subject must not be empty"));
    }

    if !input.contains('=') {
        return Ok(vec![("CN".to_string(), input.to_string())]);
    }

    let (separator, body) = match input.strip_prefix('/') {
        Some(rest) => ('/', rest),
        None => (',', input),
    };

    let mut pairs = Vec::new();
    for part in split_escaped(body, separator) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (attr, value) = part
            .split_once('=')
            .ok_or_else(|| EngineError::invalid(format!("malformed DN component {part:?}")))?;

        let attr = attr.trim().to_ascii_uppercase();
        let value = value.trim();
        if attr.is_empty() || value.is_empty() {
            return Err(EngineError::invalid(format!(
                "malformed DN component {part:?}"
            )));
        }
        pairs.push((attr, value.to_string()));
    }

    if pairs.is_empty() {
        return Err(EngineError::invalid("subject must not be empty"));
    }
    Ok(pairs)
}

fn split_escaped(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c == separator => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Build an OpenSSL name from parsed pairs.
pub fn to_x509_name(pairs: &[(String, String)]) -> EngineResult<X509Name> {
    let mut builder = X509NameBuilder::new()?;
    for (attr, value) in pairs {
        builder
            .append_entry_by_text(attr, value)
            .map_err(|e| EngineError::invalid(format!("DN attribute {attr}: {e}")))?;
    }
    Ok(builder.build())
}

pub fn parse_name(input: &str) -> EngineResult<X509Name> {
    to_x509_name(&parse(input)?)
}

/// The first `CN` value, if any.
pub fn common_name(pairs: &[(String, String)]) -> Option<&str> {
    pairs
        .iter()
        .find(|(attr, _)| attr == "CN")
        .map(|(_, v)| v.as_str())
}
