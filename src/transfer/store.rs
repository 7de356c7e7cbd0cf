//! Remote collection store abstraction.
//!
//! A `StoreConnector` opens `StoreSession`s; a session exposes the handful of
//! collection/object primitives the tree copy needs. Implementations map
//! their transport failures onto `StoreError` so that callers can tell
//! transient errors (reconnect and retry) from permanent ones.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::StoreConfig;
use crate::error::StoreError;

/// Metadata of a stored data object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub path: String,
    pub size: u64,
}

/// Access level granted by a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketPermission {
    Read,
    Write,
}

impl TicketPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Parameters of a ticket to issue on a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketRequest {
    pub permission: TicketPermission,
    pub expires_at: Option<DateTime<Utc>>,
    pub uses_limit: Option<u32>,
}

impl TicketRequest {
    /// Read-only ticket scoped by the store's configured lifetime and use count.
    pub fn read_only(config: &StoreConfig) -> Self {
        Self {
            permission: TicketPermission::Read,
            expires_at: config
                .ticket_lifetime_days
                .map(|days| Utc::now() + chrono::Duration::days(i64::from(days))),
            uses_limit: config.ticket_uses,
        }
    }
}

/// Principals whose default access is revoked on fresh collections.
pub const DEFAULT_PUBLIC_PRINCIPALS: [&str; 2] = ["anonymous", "public"];

/// One authenticated connection to the store.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Succeeds if the collection exists; `StoreError::NotFound` otherwise.
    async fn get_collection(&self, path: &str) -> Result<(), StoreError>;

    /// Create a collection, including missing parents.
    async fn create_collection(&self, path: &str) -> Result<(), StoreError>;

    /// Stat a data object; `StoreError::NotFound` if absent.
    async fn stat_object(&self, path: &str) -> Result<ObjectStat, StoreError>;

    /// Upload a local file, replacing any existing object.
    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), StoreError>;

    /// Remove every permission `principal` holds on `path`.
    async fn revoke_access(
        &self,
        path: &str,
        principal: &str,
        recursive: bool,
    ) -> Result<(), StoreError>;

    /// Issue a ticket on `path` and return its identifier.
    async fn issue_ticket(&self, path: &str, request: &TicketRequest)
    -> Result<String, StoreError>;

    /// Release the session. Must be safe to call on a broken session.
    async fn close(&self);
}

/// Opens sessions with fixed credentials.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Host name reported in transfer results and retrieval scripts.
    fn host(&self) -> &str;

    async fn connect(&self) -> Result<Arc<dyn StoreSession>, StoreError>;
}

/// Builds connectors from a store configuration section.
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self, config: &StoreConfig) -> Result<Arc<dyn StoreConnector>, StoreError>;
}
