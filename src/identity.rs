//! Caller identity verdicts.
//!
//! The gateway never authenticates users itself. An [`IdentityProvider`]
//! looks at the caller's claimed tenant and credential and either confirms
//! a tenant or denies the request before any budgeting or dispatch.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::{Caller, TenantId};

/// Outcome of an identity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Proceed, charging the given tenant.
    Allow(TenantId),
    Deny(String),
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, caller: &Caller) -> Verdict;
}

/// Trusts the caller's claimed tenant.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl IdentityProvider for AllowAll {
    async fn verify(&self, caller: &Caller) -> Verdict {
        Verdict::Allow(caller.tenant.clone())
    }
}

/// Maps static API keys to tenants. The claimed tenant is ignored; the key
/// decides.
#[derive(Debug, Default, Clone)]
pub struct StaticKeyIdentity {
    keys: HashMap<String, TenantId>,
}

impl StaticKeyIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, api_key: impl Into<String>, tenant: impl Into<TenantId>) -> Self {
        self.keys.insert(api_key.into(), tenant.into());
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<K, T> FromIterator<(K, T)> for StaticKeyIdentity
where
    K: Into<String>,
    T: Into<TenantId>,
{
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        Self {
            keys: iter
                .into_iter()
                .map(|(k, t)| (k.into(), t.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticKeyIdentity {
    async fn verify(&self, caller: &Caller) -> Verdict {
        match caller.credential.as_deref() {
            None => Verdict::Deny("missing API key".to_string()),
            Some(key) => match self.keys.get(key) {
                Some(tenant) => Verdict::Allow(tenant.clone()),
                None => Verdict::Deny("invalid API key".to_string()),
            },
        }
    }
}
