//! OpenSSH key material handling.
//!
//! Keys travel through the fabric in OpenSSH authorized-key text form
//! (`[options] type base64-blob [comment]`). The canonical identifier for a
//! key everywhere in the system is its `SHA256:` fingerprint.

use ssh_key::{HashAlg, PublicKey};

use crate::error::KeyError;

/// An authorized-key entry: the public key plus any leading options.
pub struct ParsedKey {
    pub key: PublicKey,
    pub options: Vec<String>,
}

/// Compute the OpenSSH SHA256 fingerprint of a public key
/// (`SHA256:` + unpadded base64 of the wire-form key hash).
pub fn fingerprint_sha256(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Marshal a public key into its authorized-key text form.
pub fn marshal_public_key(key: &PublicKey) -> Result<Vec<u8>, KeyError> {
    Ok(key.to_openssh()?.into_bytes())
}

/// Parse a single authorized-key line, accepting an optional leading
/// option list (`command="...",no-pty type blob comment`).
pub fn parse_authorized_key(data: &[u8]) -> Result<ParsedKey, KeyError> {
    let text = std::str::from_utf8(data).map_err(|_| KeyError::InvalidEncoding)?;
    let line = text.trim();
    if line.is_empty() || line.starts_with('#') {
        return Err(KeyError::Empty);
    }

    if let Ok(key) = PublicKey::from_openssh(line) {
        return Ok(ParsedKey {
            key,
            options: Vec::new(),
        });
    }

    // First field was not a key type, so it must be the option list.
    let (options, rest) = split_first_field(line);
    let key = PublicKey::from_openssh(rest.trim_start())?;
    Ok(ParsedKey {
        key,
        options: split_option_list(options),
    })
}

/// Split off the first whitespace-delimited field, honoring double quotes
/// (whitespace inside a quoted option value does not end the field).
fn split_first_field(line: &str) -> (&str, &str) {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => return (&line[..i], &line[i..]),
            _ => {}
        }
    }
    (line, "")
}

/// Split a comma-separated option list, honoring quoted values.
fn split_option_list(options: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for c in options.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ',' if !in_quotes => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
