//! RAID-5 stripe cache and parity reconstruction engine.
#![allow(clippy::cargo_common_metadata)]

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod layout;
pub mod metrics;
pub mod retention;

#[cfg(test)]
mod testing;

pub use config::ArrayConfig;
pub use engine::{HostRequest, Raid5, Submit, SyncKind, SyncRequest};
pub use error::{IoError, RequestError};
pub use layout::block::Block;
pub use layout::mapper::Algorithm;
pub use retention::disk::IoOp;
