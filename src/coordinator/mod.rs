//! Coordinator access: task queue and session records.
//!
//! - `types`: Task, TaskUpdate, SessionRecord and its `extra` sub-sections
//! - `traits`: `RecordClient`, the single async interface the worker uses
//! - `http`: `HttpRecordClient`, the HTTP implementation
//! - `memory`: `MemoryRecordClient`, an in-process coordinator

pub mod http;
pub mod memory;
pub mod traits;
pub mod types;

pub use http::HttpRecordClient;
pub use memory::MemoryRecordClient;
pub use traits::RecordClient;
pub use types::{
    Acquisition, JsonMap, OtfWorkflow, Section, SectionName, SessionExtra, SessionRecord, Task,
    TaskUpdate,
};
