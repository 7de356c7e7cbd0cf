//! Session worker: polls a coordinator for tasks and archives acquisition
//! sessions into a remote collection store.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod scan;
pub mod transfer;
pub mod worker;
