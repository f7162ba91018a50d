//! Credential lookup for agents that need per-call secrets.
//!
//! Backends (local encrypted store, Vault, ...) live outside this crate; the
//! orchestrator only sees `retrieve(secret_ref) -> {key: value}`.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Key/value credentials. `Debug` never prints values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials(HashMap<String, String>);

impl Credentials {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self(values)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.0.keys().collect();
        keys.sort();
        f.debug_map()
            .entries(keys.into_iter().map(|k| (k, "<redacted>")))
            .finish()
    }
}

impl FromIterator<(String, String)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Source of credentials.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the credentials stored under `secret_ref`.
    async fn retrieve(&self, secret_ref: &str) -> Result<Credentials>;
}

/// Reads credentials from environment variables.
///
/// `retrieve("gmail")` with prefix `AGENT_SECRET_` collects every
/// `AGENT_SECRET_GMAIL_<KEY>` variable as `<key>` (lowercased).
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    fn collect(&self, secret_ref: &str, vars: impl Iterator<Item = (String, String)>) -> Credentials {
        let scope = format!(
            "{}{}_",
            self.prefix,
            secret_ref.to_uppercase().replace('-', "_")
        );
        vars.filter_map(|(name, value)| {
            name.strip_prefix(&scope)
                .filter(|key| !key.is_empty())
                .map(|key| (key.to_lowercase(), value))
        })
        .collect()
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn retrieve(&self, secret_ref: &str) -> Result<Credentials> {
        let credentials = self.collect(secret_ref, std::env::vars());
        if credentials.is_empty() {
            return Err(Error::Secret(format!(
                "no credentials found for secret reference `{}`",
                secret_ref
            )));
        }
        Ok(credentials)
    }
}

/// In-memory store, for embedding callers and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    entries: HashMap<String, Credentials>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, secret_ref: impl Into<String>, credentials: Credentials) {
        self.entries.insert(secret_ref.into(), credentials);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn retrieve(&self, secret_ref: &str) -> Result<Credentials> {
        self.entries
            .get(secret_ref)
            .cloned()
            .ok_or_else(|| Error::Secret(format!("unknown secret reference `{}`", secret_ref)))
    }
}
