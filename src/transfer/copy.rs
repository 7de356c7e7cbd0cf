//! Idempotent, retrying copy of a local tree into a remote collection.
//!
//! Files already present remotely with the same size are skipped, so a
//! repeated copy of an unchanged tree uploads nothing. Per-file failures are
//! recorded in the report and never abort the walk; nothing is rolled back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, TransferError};
use crate::transfer::retry::{ReconnectingSession, RetryBudget};
use crate::transfer::scripts::RetrievalScripts;
use crate::transfer::store::{DEFAULT_PUBLIC_PRINCIPALS, StoreConnector, TicketRequest};
use crate::transfer::walk::{EntryKind, TreeWalker};

/// What happened to the entries of one copied tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub uploaded: usize,
    /// Local paths already stored remotely with the same size.
    pub skipped_unchanged: Vec<PathBuf>,
    pub skipped_broken_links: Vec<PathBuf>,
    /// Local paths whose upload failed definitively.
    pub failed: Vec<PathBuf>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of a successful `copy_tree`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferInfo {
    pub host: String,
    pub remote_location: String,
    /// Set only when a ticket was requested and issued.
    pub ticket_id: Option<String>,
    pub retrieval: Option<RetrievalScripts>,
    pub report: TransferReport,
}

/// Client moving local trees into the configured store.
pub struct TransferStore {
    config: StoreConfig,
    connector: Arc<dyn StoreConnector>,
    budget: RetryBudget,
}

impl TransferStore {
    pub fn new(config: StoreConfig, connector: Arc<dyn StoreConnector>) -> Self {
        let budget = RetryBudget::from_config(&config);
        Self {
            config,
            connector,
            budget,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Open a session with this store's retry budget.
    pub async fn open_session(&self) -> Result<ReconnectingSession, StoreError> {
        ReconnectingSession::open(Arc::clone(&self.connector), self.budget).await
    }

    /// Create the collection if absent. `false` on any definitive failure.
    pub async fn ensure_collection_exists(
        &self,
        session: &mut ReconnectingSession,
        path: &str,
    ) -> bool {
        match try_ensure_collection(session, path).await {
            Ok(()) => true,
            Err(e) => {
                warn!(collection = path, error = %e, "Could not ensure collection");
                false
            }
        }
    }

    /// Whether a data object exists. Absence is a plain `false`.
    pub async fn file_exists(&self, session: &mut ReconnectingSession, remote: &str) -> bool {
        match session.session().stat_object(remote).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                warn!(path = remote, error = %e, "Error checking existence");
                false
            }
        }
    }

    /// Whether the remote object has the local file's size.
    pub async fn same_size(
        &self,
        session: &mut ReconnectingSession,
        local: &Path,
        remote: &str,
    ) -> bool {
        let local_size = match tokio::fs::metadata(local).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %local.display(), error = %e, "Cannot stat local file");
                return false;
            }
        };
        match session.session().stat_object(remote).await {
            Ok(stat) => stat.size == local_size,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                debug!(path = remote, error = %e, "Cannot stat remote object");
                false
            }
        }
    }

    /// Upload one file, reconnecting on transient failures.
    pub async fn upload_with_reconnect(
        &self,
        session: &mut ReconnectingSession,
        local: &Path,
        remote: &str,
    ) -> bool {
        let operation = format!("upload {}", local.display());
        match session
            .run(&operation, |s| async move { s.put_file(local, remote).await })
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %local.display(), error = %e, "Failed to upload, skipping");
                false
            }
        }
    }

    /// Mirror `local_root` into `parent_collection/name`.
    ///
    /// Anonymous and public access to the destination is always revoked
    /// recursively. With `create_ticket`, a read-only ticket plus retrieval
    /// scripts are produced; otherwise the ticket step is skipped so repeated
    /// archives do not reissue one.
    pub async fn copy_tree(
        &self,
        name: &str,
        local_root: &Path,
        create_ticket: bool,
    ) -> Result<TransferInfo, TransferError> {
        let destination = self.config.collection_path(name);
        info!(
            collection = %destination,
            local = %local_root.display(),
            "Creating collection from local data"
        );

        if !local_root.is_dir() {
            return Err(TransferError::LocalRootMissing(
                local_root.display().to_string(),
            ));
        }

        let mut session = self
            .open_session()
            .await
            .map_err(|source| TransferError::Store {
                collection: destination.clone(),
                source,
            })?;

        let result = self
            .copy_with_session(&mut session, &destination, local_root, create_ticket)
            .await;
        session.close().await;
        result
    }

    async fn copy_with_session(
        &self,
        session: &mut ReconnectingSession,
        destination: &str,
        local_root: &Path,
        create_ticket: bool,
    ) -> Result<TransferInfo, TransferError> {
        if !self.ensure_collection_exists(session, destination).await {
            return Err(TransferError::CollectionUnavailable(destination.to_string()));
        }

        let mut report = TransferReport::default();

        for entry in TreeWalker::new(local_root, destination) {
            match entry.kind {
                EntryKind::BrokenLink => {
                    info!(path = %entry.local.display(), "Skipping broken symlink");
                    report.skipped_broken_links.push(entry.local);
                }
                EntryKind::Collection => {
                    self.ensure_collection_exists(session, &entry.remote).await;
                }
                EntryKind::File => {
                    if self.file_exists(session, &entry.remote).await
                        && self.same_size(session, &entry.local, &entry.remote).await
                    {
                        debug!(
                            path = %entry.local.display(),
                            remote = %entry.remote,
                            "Skipping, already stored with same size"
                        );
                        report.skipped_unchanged.push(entry.local);
                        continue;
                    }

                    if self
                        .upload_with_reconnect(session, &entry.local, &entry.remote)
                        .await
                    {
                        debug!(remote = %entry.remote, "Copied");
                        report.uploaded += 1;
                    } else {
                        report.failed.push(entry.local);
                    }
                }
            }
        }

        let store_err = |source: StoreError| TransferError::Store {
            collection: destination.to_string(),
            source,
        };

        for principal in DEFAULT_PUBLIC_PRINCIPALS {
            session
                .run("revoke public access", |s| async move {
                    s.revoke_access(destination, principal, true).await
                })
                .await
                .map_err(store_err)?;
        }

        let (ticket_id, retrieval) = if create_ticket {
            let request = TicketRequest::read_only(&self.config);
            let request = &request;
            let ticket = session
                .run("issue ticket", |s| async move {
                    s.issue_ticket(destination, request).await
                })
                .await
                .map_err(store_err)?;
            info!(collection = destination, ticket = %ticket, "Ticket generated");
            let scripts = RetrievalScripts::render(&self.config, destination, &ticket);
            (Some(ticket), Some(scripts))
        } else {
            (None, None)
        };

        info!(
            collection = destination,
            uploaded = report.uploaded,
            unchanged = report.skipped_unchanged.len(),
            failed = report.failed.len(),
            "Collection copy finished"
        );

        Ok(TransferInfo {
            host: self.connector.host().to_string(),
            remote_location: destination.to_string(),
            ticket_id,
            retrieval,
            report,
        })
    }
}

async fn try_ensure_collection(
    session: &mut ReconnectingSession,
    path: &str,
) -> Result<(), StoreError> {
    session
        .run("ensure collection", |s| async move {
            match s.get_collection(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => s.create_collection(path).await,
                Err(e) => Err(e),
            }
        })
        .await
}
