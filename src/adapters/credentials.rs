//! Credential acquisition.
//!
//! Credentials are referenced by name in configuration and resolved once per
//! run. The secret part is held in a [`SecretString`] so it never shows up in
//! `Debug` output or log fields.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::CredentialProvider;

/// Registry/cluster credentials for one run
pub struct Credentials {
    pub username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Password bytes, for piping into a login command
    pub fn password_bytes(&self) -> &[u8] {
        self.password.expose_secret().as_bytes()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `{REF}_USERNAME` / `{REF}_PASSWORD` from the environment
pub struct EnvCredentialProvider {
    lookup: Lookup,
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    /// Use a custom variable lookup (tests, alternative sources)
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

/// Environment variable prefix for a credentials reference
pub fn env_prefix(reference: &str) -> String {
    reference
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn acquire(&self, reference: &str) -> Result<Credentials> {
        let prefix = env_prefix(reference);
        if prefix.is_empty() {
            anyhow::bail!("Credentials reference is empty");
        }

        let user_key = format!("{}_USERNAME", prefix);
        let password_key = format!("{}_PASSWORD", prefix);

        let username = (self.lookup)(&user_key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Credentials '{}': {} is not set", reference, user_key))?;
        let password = (self.lookup)(&password_key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("Credentials '{}': {} is not set", reference, password_key)
            })?;

        Ok(Credentials::new(username, password))
    }
}
