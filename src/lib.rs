#![doc = include_str!("../README.md")]
//! Client RPC library for the PeerDrive content-addressed document
//! filesystem daemon.
//!
//! The crate speaks one length-prefixed, `postcard`-encoded request/
//! confirm/indication protocol over a single TCP connection to a running
//! `peerdrive-daemon`. [`Client`] is the entry point: it performs the
//! version handshake, then exposes typed RPCs plus the reference-counted
//! watch and progress subscriptions the daemon multiplexes over that same
//! connection.
//!
//! On top of the raw RPCs, [`Document`] provides the peek/update/resume
//! session state machine for reading and writing a single revision, and
//! [`domain`] provides the small self-maintaining views (`sys:fstab`,
//! `sys:registry`, `sys:syncrules`) that keep themselves current against
//! daemon watch events. [`foldermodel`] builds an observable, lazily
//! fetched tree on top of both, for browsing folder-shaped documents.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod config;
mod client;
pub mod document;
pub mod domain;
mod error;
pub mod foldermodel;
mod ids;
mod info;
mod link;
pub mod metrics;
mod progress;
mod proto;
mod transport;
mod value;
mod watch;
mod wire;

pub use client::Client;
pub use config::{ConfigError, Endpoint};
pub use document::{Document, Mode};
pub use error::{DaemonError, DaemonErrorCode, Error};
pub use ids::{DocId, IdParseError, PartId, RevId};
pub use info::{mounts, DocInfo, LinkInfo, RevInfo, StoreRefs};
pub use link::{Link, LinkParseError};
pub use progress::{
    AttachAction, DetachAction, ProgressEntry, ProgressEvent, ProgressKind, ProgressRunState,
    ProgressSubscriber, ProgressSubscriptionId, ProgressTracker,
};
pub use proto::{AttachmentStat, MountEntry};
pub use transport::Transport;
pub use value::{Value, ValueError};
pub use watch::{Subscriber, SubscriptionId, WatchEvent, WatchEventKind};
