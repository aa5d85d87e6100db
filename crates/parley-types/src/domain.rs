//! Domain-pair identifiers and domain-name validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length of a domain part, in bytes.
const MAX_DOMAIN_LEN: usize = 1023;

/// Maximum length of a single DNS label, in bytes.
const MAX_LABEL_LEN: usize = 63;

/// Errors raised when a domain pair cannot be formed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// The "local" side of the pair is not served by this node.
    #[error("not a local domain: {0}")]
    NotLocalDomain(String),

    /// The "remote" side of the pair is one of our own domains.
    #[error("not a remote domain: {0}")]
    NotRemoteDomain(String),

    /// The address is not a syntactically valid domain.
    #[error("invalid domain: {0:?}")]
    InvalidDomain(String),
}

/// Identifier of a (local domain, remote domain) trust relationship.
///
/// Both sides are stored normalised to ASCII lowercase. Two identifiers are
/// equal iff both domains match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainPairId {
    local: String,
    remote: String,
}

impl DomainPairId {
    /// Builds a pair without checking which side is served locally.
    ///
    /// Use [`DomainPairId::checked`] when the pair comes from the network.
    pub fn new(local: impl AsRef<str>, remote: impl AsRef<str>) -> Self {
        Self {
            local: local.as_ref().to_ascii_lowercase(),
            remote: remote.as_ref().to_ascii_lowercase(),
        }
    }

    /// Builds a pair from the `to`/`from` attributes of an inbound stanza.
    ///
    /// `to` names our side, `from` names the peer. Node and resource parts
    /// are stripped from both addresses.
    pub fn from_stanza(to: &str, from: &str) -> Self {
        Self::new(domain_of(to), domain_of(from))
    }

    /// Builds a validated pair.
    ///
    /// # Errors
    ///
    /// - `InvalidDomain` if either side is not a syntactically valid domain.
    /// - `NotLocalDomain` if `is_local(local)` is false.
    /// - `NotRemoteDomain` if `is_local(remote)` is true.
    pub fn checked(
        local: &str,
        remote: &str,
        is_local: impl Fn(&str) -> bool,
    ) -> Result<Self, DomainError> {
        let local = normalize_domain(local)?;
        let remote = normalize_domain(remote)?;
        if !is_local(&local) {
            return Err(DomainError::NotLocalDomain(local));
        }
        if is_local(&remote) {
            return Err(DomainError::NotRemoteDomain(remote));
        }
        Ok(Self { local, remote })
    }

    /// Re-validates an existing pair against the set of local domains.
    ///
    /// # Errors
    ///
    /// Same as [`DomainPairId::checked`].
    pub fn validate(&self, is_local: impl Fn(&str) -> bool) -> Result<(), DomainError> {
        Self::checked(&self.local, &self.remote, is_local).map(|_| ())
    }

    /// The locally served domain.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The peer domain.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Returns the pair as seen from the other server.
    pub fn reversed(&self) -> Self {
        Self {
            local: self.remote.clone(),
            remote: self.local.clone(),
        }
    }
}

impl fmt::Display for DomainPairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.remote)
    }
}

/// Extracts the domain part of an address (`node@domain/resource`).
pub fn domain_of(address: &str) -> &str {
    let without_resource = address.split('/').next().unwrap_or(address);
    match without_resource.rsplit_once('@') {
        Some((_, domain)) => domain,
        None => without_resource,
    }
}

/// Validates a domain name and returns its lowercase form.
///
/// Accepts DNS-style names (including internationalised labels) and
/// bracketed IP literals such as `[::1]`.
///
/// # Errors
///
/// Returns `DomainError::InvalidDomain` when the name is empty, too long,
/// has an empty or oversized label, or contains characters that may not
/// appear in a domain part.
pub fn normalize_domain(domain: &str) -> Result<String, DomainError> {
    let invalid = || DomainError::InvalidDomain(domain.to_string());

    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid());
    }

    if let Some(literal) = domain.strip_prefix('[') {
        let inner = literal.strip_suffix(']').ok_or_else(invalid)?;
        if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.') {
            return Err(invalid());
        }
        return Ok(domain.to_ascii_lowercase());
    }

    // A single trailing dot denotes the root and is tolerated.
    let trimmed = domain.strip_suffix('.').unwrap_or(domain);
    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        let forbidden = label.chars().any(|c| {
            c.is_whitespace()
                || c.is_control()
                || matches!(c, '@' | '/' | ':' | '"' | '\'' | '&' | '<' | '>' | '[' | ']')
        });
        if forbidden {
            return Err(invalid());
        }
    }

    Ok(trimmed.to_ascii_lowercase())
}
