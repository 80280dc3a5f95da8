//! Client registry for subdomain-based routing
//!
//! Maps each claimed name to the live control connection that owns it.
//! A name exists in the registry exactly as long as its connection does;
//! the only way to give a name up is to disconnect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use burrow_mux::ControlConnection;

/// Claim failures, both of which disconnect the offending client
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("bad subdomain: {0}")]
    BadName(String),

    #[error("name already claimed")]
    Taken,
}

/// A normalized subdomain name: lowercase ASCII letters and digits,
/// 1 to 63 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientName(String);

impl ClientName {
    /// Normalize and validate a requested name.
    pub fn parse(raw: &str) -> Result<Self, ClaimError> {
        let normalized = raw.to_ascii_lowercase();

        if normalized.is_empty() {
            return Err(ClaimError::BadName("name is empty".to_string()));
        }
        if normalized.len() > 63 {
            return Err(ClaimError::BadName(format!(
                "name is too long ({} characters, max 63)",
                normalized.len()
            )));
        }
        if !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ClaimError::BadName(
                "name may only contain ASCII letters and digits".to_string(),
            ));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered tunnel client
#[derive(Clone)]
pub struct RegisteredClient {
    pub connection: Arc<ControlConnection>,
    pub connected_at: DateTime<Utc>,
}

/// Registry of live tunnel clients keyed by claimed name.
///
/// Lookup sits on the hot path (once per public request); claims and
/// releases are rare. The map's entry API makes concurrent claims on the
/// same name resolve as if serialized.
pub struct ClientRegistry {
    clients: DashMap<String, RegisteredClient>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Claim `requested` for `connection`.
    ///
    /// Exactly one of any set of concurrent claims for the same name
    /// succeeds; the rest see `Taken`.
    pub fn claim(
        &self,
        requested: &str,
        connection: Arc<ControlConnection>,
    ) -> Result<ClientName, ClaimError> {
        let name = ClientName::parse(requested)?;

        match self.clients.entry(name.as_str().to_string()) {
            Entry::Occupied(_) => Err(ClaimError::Taken),
            Entry::Vacant(slot) => {
                slot.insert(RegisteredClient {
                    connection,
                    connected_at: Utc::now(),
                });
                Ok(name)
            }
        }
    }

    /// Find the connection serving `name`.
    pub fn lookup(&self, name: &str) -> Option<Arc<ControlConnection>> {
        self.clients.get(name).map(|entry| entry.connection.clone())
    }

    /// Remove `name`, but only if it is still held by `connection_id`.
    /// Idempotent; returns whether an entry was removed.
    pub fn release(&self, name: &ClientName, connection_id: &str) -> bool {
        let removed = self
            .clients
            .remove_if(name.as_str(), |_, client| {
                client.connection.connection_id() == connection_id
            })
            .is_some();
        if removed {
            debug!("released registry entry for {}", name);
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
