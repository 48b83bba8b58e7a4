use crate::crypto::{sha256_hex, AddressScheme};
use crate::error::{ChainError, Result};
use serde_json::Value;

use super::chain::SHORT_HASH_LENGTH;

/// Caller-supplied bytes mixed into a block attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce(Vec<u8>);

impl Nonce {
    pub fn from_text(text: &str) -> Self {
        Nonce(text.as_bytes().to_vec())
    }

    /// Accepts a string, a number, or an array of byte values.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(Nonce::from_text(s)),
            Value::Number(n) => Ok(Nonce::from_text(&n.to_string())),
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_u64()
                        .and_then(|b| u8::try_from(b).ok())
                        .ok_or(ChainError::InvalidParameter("nonce"))
                })
                .collect::<Result<Vec<u8>>>()
                .map(Nonce),
            _ => Err(ChainError::InvalidParameter("nonce")),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Text form used by the legacy plaintext endpoint.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

pub fn validate_address(scheme: &AddressScheme, address: Option<&str>) -> Result<String> {
    let address = address
        .filter(|a| !a.is_empty())
        .ok_or(ChainError::MissingParameter("address"))?;
    if !scheme.is_valid(address) {
        return Err(ChainError::InvalidParameter("address"));
    }
    Ok(address.to_string())
}

pub fn validate_nonce(nonce: Option<Nonce>, max_size: usize) -> Result<Nonce> {
    let nonce = nonce.ok_or(ChainError::MissingParameter("nonce"))?;
    if nonce.is_empty() || nonce.len() > max_size {
        return Err(ChainError::InvalidParameter("nonce"));
    }
    Ok(nonce)
}

/// `sha256(address ++ head_prefix ++ nonce)` as lowercase hex.
pub fn block_digest(address: &str, head_prefix: &str, nonce: &Nonce) -> String {
    sha256_hex([address.as_bytes(), head_prefix.as_bytes(), nonce.as_bytes()])
}

/// The first 48 bits of a hex digest.
pub fn digest_value(digest: &str) -> Option<u64> {
    digest
        .get(..SHORT_HASH_LENGTH)
        .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
}

pub fn meets_work(digest: &str, work: u64) -> bool {
    digest_value(digest).is_some_and(|v| v <= work)
}
