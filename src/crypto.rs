//! Hash primitives and private key to address derivation

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of every address, v1 or v2.
pub const ADDRESS_LENGTH: usize = 10;

static DEFAULT_SCHEME: Lazy<AddressScheme> = Lazy::new(AddressScheme::default);

/// SHA-256 over the concatenation of `parts`, as lowercase hex.
pub fn sha256_hex<I, T>(parts: I) -> String
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    hex::encode(hasher.finalize())
}

/// `sha256(sha256(input))`, where the inner digest is rehashed as its hex text.
pub fn double_sha256_hex(input: &str) -> String {
    let inner = sha256_hex([input]);
    sha256_hex([inner])
}

/// Legacy address: the first ten hex characters of `sha256(key)`.
pub fn derive_v1(private_key: &str) -> String {
    let mut digest = sha256_hex([private_key]);
    digest.truncate(ADDRESS_LENGTH);
    digest
}

/// Map one byte onto the address alphabet in buckets of seven.
fn base36_bucket(value: u8) -> char {
    let value = value as u32;
    for top in (6..=251).step_by(7) {
        if value <= top {
            let c = if top <= 69 {
                b'0' as u32 + (top - 6) / 7
            } else {
                b'a' as u32 + (top - 76) / 7
            };
            return char::from_u32(c).unwrap_or('e');
        }
    }
    'e'
}

fn hex_byte(hex: &str, offset: usize) -> u8 {
    hex.get(offset..offset + 2)
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .unwrap_or(0)
}

/// Current address format: `prefix` followed by nine characters picked from a
/// chain of double-SHA-256 rounds over the key.
pub fn derive_v2(private_key: &str, prefix: char) -> String {
    let mut chars: [Option<u8>; 9] = [None; 9];
    let mut hash = double_sha256_hex(private_key);

    for slot in chars.iter_mut() {
        *slot = Some(hex_byte(&hash, 0));
        hash = double_sha256_hex(&hash);
    }

    let mut address = String::with_capacity(ADDRESS_LENGTH);
    address.push(prefix);

    let mut i = 0;
    while i < chars.len() {
        let index = hex_byte(&hash, 2 * i) as usize % chars.len();
        match chars[index].take() {
            Some(byte) => {
                address.push(base36_bucket(byte));
                i += 1;
            }
            None => hash = sha256_hex([hash.as_bytes()]),
        }
    }

    address
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressVersion {
    V1,
    V2,
}

impl AddressVersion {
    /// Parse the `?v=` query value used by `/login`.
    pub fn from_query(v: Option<&str>) -> Option<Self> {
        match v.map(str::trim) {
            None | Some("") | Some("2") => Some(AddressVersion::V2),
            Some("1") => Some(AddressVersion::V1),
            _ => None,
        }
    }
}

/// Address syntax and derivation for a given prefix character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressScheme {
    pub prefix: char,
}

impl Default for AddressScheme {
    fn default() -> Self {
        Self { prefix: 'k' }
    }
}

impl AddressScheme {
    pub fn new(prefix: char) -> Self {
        Self { prefix }
    }

    pub fn derive(&self, private_key: &str, version: AddressVersion) -> String {
        match version {
            AddressVersion::V1 => derive_v1(private_key),
            AddressVersion::V2 => derive_v2(private_key, self.prefix),
        }
    }

    pub fn is_v1(&self, address: &str) -> bool {
        address.len() == ADDRESS_LENGTH
            && address.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    pub fn is_v2(&self, address: &str) -> bool {
        let mut chars = address.chars();
        address.len() == ADDRESS_LENGTH
            && chars.next() == Some(self.prefix)
            && chars.all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
    }

    pub fn is_valid(&self, address: &str) -> bool {
        self.is_v1(address) || self.is_v2(address)
    }

    /// Every version whose syntax `address` satisfies. With a hex prefix
    /// character an address can be both.
    pub fn versions_of(&self, address: &str) -> Vec<AddressVersion> {
        let mut versions = Vec::with_capacity(2);
        if self.is_v2(address) {
            versions.push(AddressVersion::V2);
        }
        if self.is_v1(address) {
            versions.push(AddressVersion::V1);
        }
        versions
    }

    /// Does `private_key` derive `address` under any version the address
    /// syntax allows? Comparison is case-sensitive.
    pub fn verify(&self, address: &str, private_key: &str) -> bool {
        self.versions_of(address)
            .into_iter()
            .any(|version| self.derive(private_key, version) == address)
    }
}

/// Validate against the default `k` scheme.
pub fn is_valid_address(address: &str) -> bool {
    DEFAULT_SCHEME.is_valid(address)
}
