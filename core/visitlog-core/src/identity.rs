//! Who is calling. The engine scopes every operation to the practitioner
//! returned here and does nothing when there is none.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, VisitError};
use crate::types::PractitionerId;

pub trait IdentityProvider {
    fn current_owner(&self) -> Result<PractitionerId>;
}

/// A fixed, already-authenticated practitioner.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub PractitionerId);

impl IdentityProvider for StaticIdentity {
    fn current_owner(&self) -> Result<PractitionerId> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PractitionerCredential {
    pub id: String,
    pub token: String,
}

/// Bearer-token table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    tokens: HashMap<String, PractitionerId>,
}

impl TokenRegistry {
    pub fn from_credentials(credentials: &[PractitionerCredential]) -> Self {
        let tokens = credentials
            .iter()
            .filter(|cred| !cred.token.trim().is_empty() && !cred.id.trim().is_empty())
            .map(|cred| (cred.token.clone(), PractitionerId::new(cred.id.clone())))
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Per-request identity for the credential presented with a request.
    pub fn identify(&self, token: Option<&str>) -> TokenIdentity<'_> {
        TokenIdentity {
            registry: self,
            token: token.map(str::to_string),
        }
    }
}

pub struct TokenIdentity<'a> {
    registry: &'a TokenRegistry,
    token: Option<String>,
}

impl IdentityProvider for TokenIdentity<'_> {
    fn current_owner(&self) -> Result<PractitionerId> {
        self.token
            .as_deref()
            .and_then(|token| self.registry.tokens.get(token))
            .cloned()
            .ok_or(VisitError::Unauthenticated)
    }
}
