//! The progress tracker: a server-initiated stream of in-flight
//! replication/sync tasks, with late-join catch-up (spec §4.2, §3, §8).

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::ids::DocId;

/// Sync or replication, mirroring [`crate::proto::ProgressKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    /// A sync operation between two stores.
    Sync,
    /// A document replication operation.
    Replication,
}

/// Task run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressRunState {
    /// Actively making progress.
    Running,
    /// Temporarily paused.
    Paused,
    /// Failed.
    Error,
}

/// A tracked progress task (spec §3's Progress entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    /// Daemon-assigned task tag.
    pub tag: u32,
    /// Sync or replication.
    pub kind: ProgressKind,
    /// Source store.
    pub src_store: DocId,
    /// Destination store.
    pub dst_store: DocId,
    /// Document the task concerns, if scoped to one.
    pub item: Option<DocId>,
    /// Current run state.
    pub state: ProgressRunState,
    /// Daemon error code, meaningful only when `state == Error`.
    pub error_code: u16,
    /// The item that failed, meaningful only when `state == Error`.
    pub error_item: Option<DocId>,
    /// Completion estimate, parts per thousand.
    pub progress_permille: u16,
}

/// An event delivered to a progress subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A new task began (or, for a catch-up subscriber, was already running).
    Started(ProgressEntry),
    /// An existing task's state changed.
    Changed(ProgressEntry),
    /// A task finished and was removed from the table.
    Finished {
        /// The tag of the task that finished.
        tag: u32,
    },
}

/// A shared subscriber callback, invoked on every progress event for as
/// long as it remains registered.
pub type ProgressSubscriber = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

struct Inner {
    tasks: HashMap<u32, ProgressEntry>,
    subscribers: Vec<(u64, ProgressSubscriber)>,
    next_id: u64,
}

/// Whether attaching or detaching a subscriber crossed the 0↔1 boundary,
/// telling the caller whether to tell the daemon to start/stop the
/// `WatchProgress` indication stream and whether to run the catch-up query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachAction {
    /// No daemon-facing action needed; other subscribers are already attached.
    None,
    /// This was the first subscriber: enable `WatchProgress` and run `ProgressQuery`.
    EnableAndCatchUp,
}

/// Whether detaching a subscriber crossed back down to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachAction {
    /// Other subscribers remain attached.
    None,
    /// This was the last subscriber: disable `WatchProgress` and clear the table.
    Disable,
}

/// A subscription handle, used to detach later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSubscriptionId(u64);

/// Tracks in-flight progress tasks and fans out start/change/finish events.
///
/// Uses a reentrant mutex for the same reason as [`crate::watch::WatchRegistry`]:
/// dispatch invokes subscriber callbacks, which may attach or detach other
/// subscribers.
pub struct ProgressTracker {
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker").finish_non_exhaustive()
    }
}

impl ProgressTracker {
    /// A fresh, empty tracker.
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                tasks: HashMap::new(),
                subscribers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Attach a subscriber. Returns the subscription id and whether the
    /// caller must now enable the wire stream and perform catch-up.
    pub fn attach(&self, subscriber: ProgressSubscriber) -> (ProgressSubscriptionId, AttachAction) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let is_first = inner.subscribers.is_empty();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, subscriber));
        let action = if is_first { AttachAction::EnableAndCatchUp } else { AttachAction::None };
        (ProgressSubscriptionId(id), action)
    }

    /// Detach a subscriber. Returns whether the caller must now disable
    /// the wire stream and clear the table.
    pub fn detach(&self, id: ProgressSubscriptionId) -> DetachAction {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.subscribers.retain(|(eid, _)| *eid != id.0);
        if inner.subscribers.is_empty() {
            inner.tasks.clear();
            DetachAction::Disable
        } else {
            DetachAction::None
        }
    }

    /// Seed the table from a `ProgressQuery` reply, delivering a
    /// synthetic `Started` followed by `Changed` to `only_to` — the
    /// subscriber that just attached — without broadcasting `Started` to
    /// anyone else (spec §4.2: "not broadcast as started to others since
    /// it's a catch-up").
    pub fn catch_up(&self, entries: Vec<ProgressEntry>, only_to: ProgressSubscriptionId) {
        let guard = self.inner.lock();
        let callback = {
            let mut inner = guard.borrow_mut();
            for entry in &entries {
                inner.tasks.insert(entry.tag, entry.clone());
            }
            inner.subscribers.iter().find(|(id, _)| *id == only_to.0).map(|(_, cb)| cb.clone())
        };
        let Some(callback) = callback else { return };
        for entry in entries {
            callback(&ProgressEvent::Started(entry.clone()));
            callback(&ProgressEvent::Changed(entry));
        }
    }

    /// Handle a `ProgressStart` indication: insert the task and broadcast
    /// `Started` to every current subscriber.
    pub fn on_start(&self, entry: ProgressEntry) {
        let guard = self.inner.lock();
        let callbacks: Vec<ProgressSubscriber> = {
            let mut inner = guard.borrow_mut();
            inner.tasks.insert(entry.tag, entry.clone());
            inner.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb(&ProgressEvent::Started(entry.clone()));
        }
    }

    /// Handle a `Progress` indication: the wire message only carries the
    /// run-state fields (spec §3), so this merges them onto the entry's
    /// last-known routing fields (`kind`/`src_store`/`dst_store`/`item`,
    /// seeded by `on_start` or a catch-up query) rather than replacing it
    /// wholesale, then broadcasts the merged entry as `Changed`.
    pub fn on_progress(
        &self,
        tag: u32,
        state: ProgressRunState,
        error_code: u16,
        error_item: Option<DocId>,
        progress_permille: u16,
    ) {
        let guard = self.inner.lock();
        let result: Option<(ProgressEntry, Vec<ProgressSubscriber>)> = {
            let mut inner = guard.borrow_mut();
            let Some(existing) = inner.tasks.get_mut(&tag) else { return };
            existing.state = state;
            existing.error_code = error_code;
            existing.error_item = error_item;
            existing.progress_permille = progress_permille;
            let entry = existing.clone();
            let callbacks = inner.subscribers.iter().map(|(_, cb)| cb.clone()).collect();
            Some((entry, callbacks))
        };
        let Some((entry, callbacks)) = result else { return };
        for cb in callbacks {
            cb(&ProgressEvent::Changed(entry.clone()));
        }
    }

    /// Handle a `ProgressEnd` indication: remove the task and broadcast `Finished`.
    pub fn on_end(&self, tag: u32) {
        let guard = self.inner.lock();
        let callbacks: Vec<ProgressSubscriber> = {
            let mut inner = guard.borrow_mut();
            inner.tasks.remove(&tag);
            inner.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for cb in callbacks {
            cb(&ProgressEvent::Finished { tag });
        }
    }

    /// Current number of tracked tasks.
    pub fn table_size(&self) -> usize {
        self.inner.lock().borrow().tasks.len()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sample_entry(tag: u32) -> ProgressEntry {
        ProgressEntry {
            tag,
            kind: ProgressKind::Sync,
            src_store: DocId::new(vec![1]),
            dst_store: DocId::new(vec![2]),
            item: None,
            state: ProgressRunState::Running,
            error_code: 0,
            error_item: None,
            progress_permille: 0,
        }
    }

    #[test]
    fn first_attach_requests_catch_up() {
        let tracker = ProgressTracker::new();
        let (_id, action) = tracker.attach(Arc::new(|_| {}));
        assert_eq!(action, AttachAction::EnableAndCatchUp);
        let (_id2, action2) = tracker.attach(Arc::new(|_| {}));
        assert_eq!(action2, AttachAction::None);
    }

    #[test]
    fn last_detach_disables_and_clears() {
        let tracker = ProgressTracker::new();
        let (id1, _) = tracker.attach(Arc::new(|_| {}));
        let (id2, _) = tracker.attach(Arc::new(|_| {}));
        tracker.on_start(sample_entry(1));
        assert_eq!(tracker.detach(id1), DetachAction::None);
        assert_eq!(tracker.table_size(), 1);
        assert_eq!(tracker.detach(id2), DetachAction::Disable);
        assert_eq!(tracker.table_size(), 0);
    }

    #[test]
    fn catch_up_delivers_started_then_changed_only_to_new_subscriber() {
        let tracker = ProgressTracker::new();
        let events_a: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let ea = events_a.clone();
        let (_id_a, _) = tracker.attach(Arc::new(move |e| ea.lock().unwrap().push(e.clone())));

        // Task already in flight before subscriber B attaches.
        tracker.on_start(sample_entry(1));
        events_a.lock().unwrap().clear();

        let events_b: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let eb = events_b.clone();
        let (id_b, action) = tracker.attach(Arc::new(move |e| eb.lock().unwrap().push(e.clone())));
        assert_eq!(action, AttachAction::None); // not the first subscriber
        tracker.catch_up(vec![sample_entry(1)], id_b);

        let b_events = events_b.lock().unwrap();
        assert_eq!(b_events.len(), 2);
        assert!(matches!(b_events[0], ProgressEvent::Started(_)));
        assert!(matches!(b_events[1], ProgressEvent::Changed(_)));
        // A did not get a duplicate Started from B's catch-up.
        assert!(events_a.lock().unwrap().is_empty());
    }

    #[test]
    fn live_events_broadcast_to_all() {
        let tracker = ProgressTracker::new();
        let events_a: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let events_b: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let ea = events_a.clone();
        let eb = events_b.clone();
        tracker.attach(Arc::new(move |e| ea.lock().unwrap().push(e.clone())));
        tracker.attach(Arc::new(move |e| eb.lock().unwrap().push(e.clone())));

        tracker.on_start(sample_entry(5));
        tracker.on_progress(5, ProgressRunState::Running, 0, None, 500);
        tracker.on_end(5);

        assert_eq!(events_a.lock().unwrap().len(), 3);
        assert_eq!(events_b.lock().unwrap().len(), 3);
    }
}
