//! The FolderModel prefetch engine: an observable, lazily-populated tree
//! over folder-shaped documents, backed by a background worker and
//! invalidated by watch events (spec §4.5).
//!
//! Grounded on the original client's `FolderModel`/`FolderModelPrivate`
//! (`foldermodel.cpp`, `foldermodel_internal.h`): a Qt item-model wrapping
//! a `Node*` tree and a `FolderGatherer` worker thread. This crate exposes
//! the same tree/worker/watch architecture without any Qt model-index
//! machinery — consumers own the widget binding.

mod columns;
mod model;
mod node;
mod worker;

pub use columns::{default_columns, BuiltinColumn, ColumnSpec};
pub use model::{FolderModel, NodeSnapshot};
pub use node::NodeId;
pub use worker::{root_link, FolderInfo};
