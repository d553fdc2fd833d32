//! The folder prefetch worker: a dedicated OS thread that drains a LIFO
//! queue of links, fetches their metadata/children/columns, and batches
//! the results out to [`super::model::FolderModel`] (spec §4.5).
//!
//! Grounded on the original client's `FolderGatherer` (a `QThread`
//! subclass using a `QMutex`/`QWaitCondition`-guarded `QStack`). The
//! worker here owns a single-threaded tokio runtime so it can issue the
//! async `Client`/`Document` RPCs without running on, or blocking, the
//! application's own runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::client::Client;
use crate::document::Document;
use crate::domain::registry::Registry;
use crate::info::RevInfo;
use crate::ids::DocId;
use crate::link::Link;
use crate::value::Value;

use super::columns::ColumnSpec;

/// The maximum time a batch of fetched infos waits before being flushed
/// even if more items are still queued (spec §4.5).
const DISPATCH_INTERVAL: Duration = Duration::from_millis(100);

/// One fetched item: its existence, type, declared children, and the
/// currently-configured columns' extracted values.
///
/// Mirrors the original client's `FolderInfo{link, exists, columns, childs, type}`.
#[derive(Debug, Clone)]
pub struct FolderInfo {
    pub link: Link,
    pub exists: bool,
    pub type_code: String,
    pub columns: Vec<Value>,
    pub children: Vec<Link>,
}

impl FolderInfo {
    fn missing(link: Link) -> Self {
        FolderInfo { link, exists: false, type_code: String::new(), columns: Vec::new(), children: Vec::new() }
    }
}

/// The reserved link whose children are synthesized from the current
/// regular mounts rather than fetched from a document (spec §4.5 "Root").
pub fn root_link() -> Link {
    Link::to_doc(DocId::zero(), DocId::zero())
}

/// Whether `link` is the reserved root sentinel.
pub(crate) fn is_root(link: &Link) -> bool {
    matches!(link.store(), Some(s) if s.is_zero()) && matches!(link.doc(), Some(d) if d.is_zero())
}

struct Queue {
    items: Mutex<VecDeque<Link>>,
    condvar: Condvar,
    abort: AtomicBool,
}

/// A lightweight, cloneable handle for queuing links onto a [`FolderWorker`]'s
/// work queue. Kept separate from [`FolderWorker`] itself so [`super::model::FolderModel`]
/// can share it with its watch-event callbacks and applier thread without
/// also sharing ownership of the worker thread's lifetime.
#[derive(Clone)]
pub struct FetchHandle(Arc<Queue>);

impl FetchHandle {
    /// Queue a link for (re-)evaluation. Matches the original's `fetch`:
    /// pushed unconditionally, even if already queued or in flight.
    pub fn fetch(&self, link: Link) {
        self.0.items.lock().push_back(link);
        self.0.condvar.notify_all();
    }
}

/// A running prefetch worker. Dropping it stops the thread.
pub struct FolderWorker {
    queue: Arc<Queue>,
    columns: Arc<RwLock<Vec<ColumnSpec>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FolderWorker {
    /// Start the worker thread, with an initial column set resolved against
    /// `registry` right away (so the first batch already carries real data).
    /// Returns the worker (whose `Drop` stops the thread) and a cloneable
    /// [`FetchHandle`] for queuing links from elsewhere.
    pub fn spawn(
        client: Client,
        registry: Arc<Registry>,
        column_keys: &[String],
        sender: SyncSender<Vec<FolderInfo>>,
    ) -> (Self, FetchHandle) {
        let columns: Vec<ColumnSpec> = column_keys.iter().map(|key| ColumnSpec::parse(key, &registry)).collect();
        let columns = Arc::new(RwLock::new(columns));
        let queue = Arc::new(Queue { items: Mutex::new(VecDeque::new()), condvar: Condvar::new(), abort: AtomicBool::new(false) });

        let thread_queue = queue.clone();
        let thread_columns = columns.clone();
        let handle = thread::Builder::new()
            .name("peerdrive-folder-worker".to_string())
            .spawn(move || run(client, registry, thread_queue, thread_columns, sender))
            .expect("spawning folder worker thread");

        let fetch_handle = FetchHandle(queue.clone());
        (FolderWorker { queue, columns, handle: Some(handle) }, fetch_handle)
    }

    /// Replace the configured columns. Callers are responsible for
    /// re-queuing every known node afterwards so it picks up new values.
    pub fn set_columns(&self, column_keys: &[String], registry: &Registry) {
        let columns: Vec<ColumnSpec> = column_keys.iter().map(|key| ColumnSpec::parse(key, registry)).collect();
        *self.columns.write() = columns;
    }

    /// The display name of each currently configured column, in order.
    pub fn column_headers(&self) -> Vec<String> {
        self.columns.read().iter().map(|c| c.name().to_string()).collect()
    }
}

impl Drop for FolderWorker {
    fn drop(&mut self) {
        self.queue.abort.store(true, Ordering::Release);
        self.queue.condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    client: Client,
    registry: Arc<Registry>,
    queue: Arc<Queue>,
    columns: Arc<RwLock<Vec<ColumnSpec>>>,
    sender: SyncSender<Vec<FolderInfo>>,
) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building folder worker runtime");

    let mut pending: Vec<FolderInfo> = Vec::new();
    let mut last_dispatch = Instant::now();

    loop {
        let item = {
            let mut guard = queue.items.lock();
            loop {
                if queue.abort.load(Ordering::Acquire) {
                    return;
                }
                if let Some(link) = guard.pop_back() {
                    dispatch(&sender, &mut pending, &mut last_dispatch, false);
                    break Some(link);
                }
                dispatch(&sender, &mut pending, &mut last_dispatch, true);
                queue.condvar.wait_for(&mut guard, DISPATCH_INTERVAL);
                if queue.abort.load(Ordering::Acquire) {
                    return;
                }
            }
        };
        let Some(link) = item else { continue };
        let info = rt.block_on(fetch_one(&client, &registry, &columns, link));
        pending.push(info);
    }
}

fn dispatch(sender: &SyncSender<Vec<FolderInfo>>, pending: &mut Vec<FolderInfo>, last: &mut Instant, force: bool) {
    if pending.is_empty() {
        return;
    }
    if force || last.elapsed() >= DISPATCH_INTERVAL {
        let batch = std::mem::take(pending);
        let _ = sender.send(batch);
        *last = Instant::now();
    }
}

async fn fetch_one(client: &Client, registry: &Registry, columns: &RwLock<Vec<ColumnSpec>>, link: Link) -> FolderInfo {
    if is_root(&link) {
        return fetch_root(client).await;
    }
    fetch_item(client, registry, columns, &link).await.unwrap_or_else(|| FolderInfo::missing(link))
}

async fn fetch_root(client: &Client) -> FolderInfo {
    match client.enum_mounts().await {
        Ok(mounts) => FolderInfo {
            link: root_link(),
            exists: true,
            type_code: "org.peerdrive.store".to_string(),
            columns: Vec::new(),
            children: mounts.into_iter().map(|m| Link::to_doc(m.sid.clone(), m.sid)).collect(),
        },
        Err(_) => FolderInfo::missing(root_link()),
    }
}

/// `None` means "ask the caller to mark the node un-fetchable": the client
/// library never retries, and worker components swallow per-item errors
/// rather than aborting the tree (spec §7).
async fn fetch_item(client: &Client, registry: &Registry, columns: &RwLock<Vec<ColumnSpec>>, link: &Link) -> Option<FolderInfo> {
    let store = link.store()?.clone();
    let doc = link.doc()?.clone();
    let mut peek_link = link.clone();
    peek_link.resolve(client).await.ok()?;
    let rev = peek_link.rev()?.clone();
    let stat = RevInfo::fetch(client, store.clone(), rev.clone()).await.ok()?;

    let mut session = Document::peek(client.clone(), store.clone(), peek_link).await.ok()?;
    let meta = session.get("/").await.unwrap_or(Value::Null);

    let children = if registry.conformes(&stat.type_code, "org.peerdrive.folder") {
        session
            .links()
            .await
            .map(|(doc_links, _)| doc_links.into_iter().map(|(s, d)| Link::to_doc(s, d)).collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    let _ = session.close().await;

    let extracted = columns.read().iter().map(|c| c.extract(&stat, &meta)).collect();
    Some(FolderInfo {
        link: Link::to_doc_at(store, doc, rev),
        exists: true,
        type_code: stat.type_code,
        columns: extracted,
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_link_is_all_zero_doc_head() {
        let link = root_link();
        assert!(is_root(&link));
        assert!(!is_root(&Link::to_doc(DocId::new(vec![1]), DocId::new(vec![1]))));
    }

    #[test]
    fn dispatch_holds_batch_until_forced_or_interval_elapsed() {
        let (tx, rx) = std::sync::mpsc::sync_channel(4);
        let mut pending = vec![FolderInfo::missing(root_link())];
        let mut last = Instant::now();

        dispatch(&tx, &mut pending, &mut last, false);
        assert!(rx.try_recv().is_err(), "should not dispatch before the interval elapses");

        pending.push(FolderInfo::missing(root_link()));
        dispatch(&tx, &mut pending, &mut last, true);
        let batch = rx.try_recv().expect("forced dispatch sends immediately");
        assert_eq!(batch.len(), 2);
        assert!(pending.is_empty());
    }
}
