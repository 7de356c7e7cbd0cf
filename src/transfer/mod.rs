//! Resilient bulk transfer of local trees into a remote collection store.
//!
//! - `store`: session/connector traits the copy is written against
//! - `retry`: bounded retry with reconnection, shared by every primitive
//! - `walk`: lazy local tree walker
//! - `copy`: `TransferStore`, the idempotent tree copy
//! - `scripts`: retrieval commands embedded in the session record
//! - `http`: adapter for the iRODS HTTP API
//! - `memory`: in-memory store with failure injection

pub mod copy;
pub mod http;
pub mod memory;
pub mod retry;
pub mod scripts;
pub mod store;
pub mod walk;

pub use copy::{TransferInfo, TransferReport, TransferStore};
pub use http::{HttpConnector, HttpConnectorFactory};
pub use memory::{MemoryStore, StoreOp};
pub use retry::{ReconnectingSession, RetryBudget};
pub use scripts::RetrievalScripts;
pub use store::{
    ConnectorFactory, ObjectStat, StoreConnector, StoreSession, TicketPermission, TicketRequest,
};
pub use walk::{EntryKind, TreeWalker, WalkEntry};
