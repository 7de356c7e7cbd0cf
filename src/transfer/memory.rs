//! In-memory collection store.
//!
//! Behaves like a real store for the primitives the tree copy uses and lets
//! callers inject failures: a number of transient errors per operation,
//! permanent errors per operation, or permanent errors on chosen paths.
//! Every call is counted and every side effect can be inspected.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::transfer::store::{
    ConnectorFactory, ObjectStat, StoreConnector, StoreSession, TicketRequest,
};

/// Store operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Connect,
    GetCollection,
    CreateCollection,
    StatObject,
    PutFile,
    RevokeAccess,
    IssueTicket,
}

/// A revoked permission, as recorded by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revocation {
    pub path: String,
    pub principal: String,
    pub recursive: bool,
}

/// An issued ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTicket {
    pub id: String,
    pub path: String,
    pub request: TicketRequest,
}

#[derive(Default)]
struct State {
    collections: BTreeSet<String>,
    objects: BTreeMap<String, u64>,
    uploads: Vec<String>,
    revocations: Vec<Revocation>,
    tickets: Vec<IssuedTicket>,
    calls: HashMap<StoreOp, u32>,
    transient: HashMap<StoreOp, u32>,
    permanent: HashSet<StoreOp>,
    failing_paths: HashSet<String>,
    open_sessions: usize,
}

impl State {
    /// Count the call and apply injected failures.
    fn enter(&mut self, op: StoreOp, path: Option<&str>) -> Result<(), StoreError> {
        *self.calls.entry(op).or_default() += 1;

        if let Some(left) = self.transient.get_mut(&op) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Network(format!("injected failure in {op:?}")));
            }
        }
        if self.permanent.contains(&op) {
            return Err(StoreError::PermissionDenied(format!("{op:?} refused")));
        }
        if let Some(path) = path {
            if self.failing_paths.contains(path) {
                return Err(StoreError::PermissionDenied(path.to_string()));
            }
        }
        Ok(())
    }
}

/// Shared handle on an in-memory store.
#[derive(Clone)]
pub struct MemoryStore {
    host: String,
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connector(&self) -> Arc<dyn StoreConnector> {
        Arc::new(self.clone())
    }

    /// Fail the next `times` calls of `op` with a network error.
    pub fn fail_transiently(&self, op: StoreOp, times: u32) {
        self.state().transient.insert(op, times);
    }

    /// Refuse every call of `op`.
    pub fn fail_permanently(&self, op: StoreOp) {
        self.state().permanent.insert(op);
    }

    /// Refuse every operation on exactly `path`.
    pub fn fail_path(&self, path: impl Into<String>) {
        self.state().failing_paths.insert(path.into());
    }

    pub fn insert_collection(&self, path: impl Into<String>) {
        self.state().collections.insert(path.into());
    }

    pub fn insert_object(&self, path: impl Into<String>, size: u64) {
        self.state().objects.insert(path.into(), size);
    }

    pub fn has_collection(&self, path: &str) -> bool {
        self.state().collections.contains(path)
    }

    pub fn object_size(&self, path: &str) -> Option<u64> {
        self.state().objects.get(path).copied()
    }

    pub fn objects(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Remote paths written by `put_file`, in call order.
    pub fn uploads(&self) -> Vec<String> {
        self.state().uploads.clone()
    }

    pub fn revocations(&self) -> Vec<Revocation> {
        self.state().revocations.clone()
    }

    pub fn tickets(&self) -> Vec<IssuedTicket> {
        self.state().tickets.clone()
    }

    pub fn calls(&self, op: StoreOp) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Sessions connected and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    fn host(&self) -> &str {
        &self.host
    }

    async fn connect(&self) -> Result<Arc<dyn StoreSession>, StoreError> {
        let mut state = self.state();
        state.enter(StoreOp::Connect, None)?;
        state.open_sessions += 1;
        Ok(Arc::new(MemorySession {
            store: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

impl ConnectorFactory for MemoryStore {
    fn connector(&self, _config: &StoreConfig) -> Result<Arc<dyn StoreConnector>, StoreError> {
        Ok(MemoryStore::connector(self))
    }
}

struct MemorySession {
    store: MemoryStore,
    closed: AtomicBool,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn get_collection(&self, path: &str) -> Result<(), StoreError> {
        let mut state = self.store.state();
        state.enter(StoreOp::GetCollection, Some(path))?;
        if state.collections.contains(path) {
            Ok(())
        } else {
            Err(StoreError::NotFound(path.to_string()))
        }
    }

    async fn create_collection(&self, path: &str) -> Result<(), StoreError> {
        let mut state = self.store.state();
        state.enter(StoreOp::CreateCollection, Some(path))?;
        state.collections.insert(path.to_string());
        Ok(())
    }

    async fn stat_object(&self, path: &str) -> Result<ObjectStat, StoreError> {
        let mut state = self.store.state();
        state.enter(StoreOp::StatObject, Some(path))?;
        match state.objects.get(path) {
            Some(size) => Ok(ObjectStat {
                path: path.to_string(),
                size: *size,
            }),
            None => Err(StoreError::NotFound(path.to_string())),
        }
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), StoreError> {
        self.store.state().enter(StoreOp::PutFile, Some(remote))?;

        let size = tokio::fs::metadata(local)
            .await
            .map_err(|source| StoreError::LocalIo {
                path: local.display().to_string(),
                source,
            })?
            .len();

        let mut state = self.store.state();
        state.objects.insert(remote.to_string(), size);
        state.uploads.push(remote.to_string());
        Ok(())
    }

    async fn revoke_access(
        &self,
        path: &str,
        principal: &str,
        recursive: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.store.state();
        state.enter(StoreOp::RevokeAccess, Some(path))?;
        state.revocations.push(Revocation {
            path: path.to_string(),
            principal: principal.to_string(),
            recursive,
        });
        Ok(())
    }

    async fn issue_ticket(
        &self,
        path: &str,
        request: &TicketRequest,
    ) -> Result<String, StoreError> {
        let mut state = self.store.state();
        state.enter(StoreOp::IssueTicket, Some(path))?;
        let id = format!("ticket-{}", state.tickets.len() + 1);
        state.tickets.push(IssuedTicket {
            id: id.clone(),
            path: path.to_string(),
            request: request.clone(),
        });
        Ok(id)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.store.state();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}
