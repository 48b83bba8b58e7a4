//! Private key authentication
//!
//! Nothing secret is ever stored: a key authenticates an address when the
//! key derives that address.

use crate::blockchain::{AddressRecord, Ledger};
use crate::crypto::{AddressScheme, AddressVersion};
use crate::error::{ChainError, Result};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResult {
    pub authed: bool,
    pub address: Option<AddressRecord>,
}

pub struct AuthService {
    ledger: Arc<Ledger>,
    scheme: AddressScheme,
}

impl AuthService {
    pub fn new(ledger: Arc<Ledger>, scheme: AddressScheme) -> Self {
        Self { ledger, scheme }
    }

    pub fn scheme(&self) -> &AddressScheme {
        &self.scheme
    }

    pub fn derive(&self, private_key: &str, version: AddressVersion) -> String {
        self.scheme.derive(private_key, version)
    }

    /// Authed iff the address derived from `private_key` already exists.
    /// Never creates an address.
    pub fn login(&self, private_key: &str, version: AddressVersion) -> LoginResult {
        let derived = self.derive(private_key, version);
        match self.ledger.find(&derived) {
            Some(record) => LoginResult {
                authed: true,
                address: Some(record),
            },
            None => LoginResult {
                authed: false,
                address: None,
            },
        }
    }

    /// Prove ownership of `owner`. On success the owner's ledger entry is
    /// created if this is its first appearance.
    pub fn verify_owner(&self, owner: &str, private_key: &str) -> Result<AddressRecord> {
        if !self.scheme.verify(owner, private_key) {
            tracing::debug!(owner = %owner, "auth.failed");
            return Err(ChainError::AuthFailed);
        }
        self.ledger.get_or_create(owner)
    }
}
