//! Self-maintaining views over well-known system documents, wrapping
//! [`crate::Document`] and the watch registry (spec §4.6).

pub mod folder;
pub mod fstab;
pub mod registry;
pub mod syncrules;

pub use fstab::FsTab;
pub use registry::Registry;
pub use syncrules::{SyncMode, SyncRules};
