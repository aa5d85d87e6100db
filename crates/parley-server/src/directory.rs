//! Locally served domains, built from configuration.

use crate::config::{ConfigError, DomainConfig};
use parley_dialback::DomainDirectory;
use parley_types::{normalize_domain, DomainError};
use std::collections::HashMap;

#[derive(Clone)]
struct DomainSettings {
    secret: String,
    tls_required: bool,
}

/// [`DomainDirectory`] over the `[[domains]]` table.
pub struct ConfigDirectory {
    domains: HashMap<String, DomainSettings>,
}

impl ConfigDirectory {
    /// Builds the directory. Domains without a configured secret get a
    /// random one that lives as long as the process.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for a malformed domain name.
    pub fn from_config(domains: &[DomainConfig]) -> Result<Self, ConfigError> {
        let mut map = HashMap::new();
        for domain in domains {
            let name = normalize_domain(&domain.name)
                .map_err(|e| ConfigError::Invalid(format!("domains: {e}")))?;
            let secret = match &domain.secret {
                Some(secret) if !secret.is_empty() => secret.clone(),
                _ => {
                    tracing::info!(domain = %name, "no dialback secret configured, generated one");
                    uuid::Uuid::new_v4().simple().to_string()
                }
            };
            map.insert(
                name,
                DomainSettings {
                    secret,
                    tls_required: domain.tls_required,
                },
            );
        }
        Ok(Self { domains: map })
    }

    /// Served domain names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.domains.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl DomainDirectory for ConfigDirectory {
    fn is_local_domain(&self, domain: &str) -> bool {
        self.domains.contains_key(&domain.to_ascii_lowercase())
    }

    fn secret_for(&self, local_domain: &str) -> Result<String, DomainError> {
        self.domains
            .get(&local_domain.to_ascii_lowercase())
            .map(|d| d.secret.clone())
            .ok_or_else(|| DomainError::NotLocalDomain(local_domain.to_string()))
    }

    fn is_tls_required(&self, local_domain: &str) -> bool {
        self.domains
            .get(&local_domain.to_ascii_lowercase())
            .is_some_and(|d| d.tls_required)
    }
}

impl std::fmt::Debug for ConfigDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigDirectory")
            .field("domains", &self.names())
            .finish()
    }
}
