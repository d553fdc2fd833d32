//! The watch registry: reference-counted subscriptions for document and
//! revision events (spec §4.2, §3).

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::ids::{DocId, RevId};

/// What changed about a watched target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// The target's content changed.
    Modified,
    /// The target came into existence on a store.
    Appeared,
    /// The target was replicated to an additional store.
    Replicated,
    /// The target is no longer present on one store but exists elsewhere.
    Diminished,
    /// The target no longer exists anywhere.
    Disappeared,
}

/// A single fan-out delivery: what happened, to which store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What kind of change.
    pub kind: WatchEventKind,
    /// The store the event pertains to.
    pub store: DocId,
}

/// Which table a watch target belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    /// Watching a document id (all its revisions / heads).
    Doc(u64),
    /// Watching a specific revision id.
    Rev(u64),
}

/// A shared callback invoked on every matching indication.
///
/// Using a plain callback (rather than a channel) keeps the registry
/// reentrant-lock friendly: dispatch calls directly into subscriber code,
/// which may itself call back into [`WatchRegistry::add`]/`remove` (spec
/// §5's documented reentrancy requirement). `Arc` (not `Box`) lets dispatch
/// clone the callback list out of the table before invoking any of them,
/// so a reentrant call never needs to re-borrow a `RefCell` already
/// borrowed by its caller.
pub type Subscriber = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

struct Subscribers {
    next_id: u64,
    entries: Vec<(u64, Subscriber)>,
}

impl Subscribers {
    fn new() -> Self {
        Self { next_id: 0, entries: Vec::new() }
    }
}

/// Commands the registry asks the caller's transport layer to perform —
/// kept decoupled from any concrete transport type so this module has no
/// dependency on `Client`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    /// Send `WatchAdd` to the daemon for this doc id.
    AddDoc(DocId),
    /// Send `WatchRem` to the daemon for this doc id.
    RemDoc(DocId),
    /// Send `WatchAdd` to the daemon for this rev id.
    AddRev(RevId),
    /// Send `WatchRem` to the daemon for this rev id.
    RemRev(RevId),
}

/// Reference-counted subscriptions for [`DocId`] and [`RevId`] targets.
///
/// Uses a reentrant mutex because dispatch (`on_watch_doc`/`on_watch_rev`)
/// invokes subscriber callbacks, and a subscriber may register or
/// deregister a watch from within its own callback (spec §5).
pub struct WatchRegistry {
    docs: ReentrantMutex<RefCell<HashMap<DocId, Subscribers>>>,
    revs: ReentrantMutex<RefCell<HashMap<RevId, Subscribers>>>,
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistry").finish_non_exhaustive()
    }
}

/// A token identifying one subscription, used to remove it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl WatchRegistry {
    /// A fresh, empty registry.
    pub fn new() -> Self {
        Self {
            docs: ReentrantMutex::new(RefCell::new(HashMap::new())),
            revs: ReentrantMutex::new(RefCell::new(HashMap::new())),
        }
    }

    /// Register a subscriber for a document's events.
    ///
    /// Returns the subscription id plus `Some(WireCommand::AddDoc)` iff
    /// this is the first subscriber for `doc` (the daemon is only told
    /// once per target, spec §3).
    pub fn add_doc(&self, doc: DocId, subscriber: Subscriber) -> (SubscriptionId, Option<WireCommand>) {
        let guard = self.docs.lock();
        let mut map = guard.borrow_mut();
        let entry = map.entry(doc.clone()).or_insert_with(Subscribers::new);
        let is_first = entry.entries.is_empty();
        let id = entry.next_id;
        entry.next_id += 1;
        entry.entries.push((id, subscriber));
        (SubscriptionId(id), is_first.then_some(WireCommand::AddDoc(doc)))
    }

    /// Remove a previously registered document subscription.
    ///
    /// Returns `Some(WireCommand::RemDoc)` iff this was the last
    /// subscriber for `doc`.
    pub fn remove_doc(&self, doc: &DocId, id: SubscriptionId) -> Option<WireCommand> {
        let guard = self.docs.lock();
        let mut map = guard.borrow_mut();
        let Some(entry) = map.get_mut(doc) else { return None };
        entry.entries.retain(|(eid, _)| *eid != id.0);
        if entry.entries.is_empty() {
            map.remove(doc);
            Some(WireCommand::RemDoc(doc.clone()))
        } else {
            None
        }
    }

    /// Register a subscriber for a revision's events. See [`Self::add_doc`].
    pub fn add_rev(&self, rev: RevId, subscriber: Subscriber) -> (SubscriptionId, Option<WireCommand>) {
        let guard = self.revs.lock();
        let mut map = guard.borrow_mut();
        let entry = map.entry(rev.clone()).or_insert_with(Subscribers::new);
        let is_first = entry.entries.is_empty();
        let id = entry.next_id;
        entry.next_id += 1;
        entry.entries.push((id, subscriber));
        (SubscriptionId(id), is_first.then_some(WireCommand::AddRev(rev)))
    }

    /// Remove a previously registered revision subscription. See [`Self::remove_doc`].
    pub fn remove_rev(&self, rev: &RevId, id: SubscriptionId) -> Option<WireCommand> {
        let guard = self.revs.lock();
        let mut map = guard.borrow_mut();
        let Some(entry) = map.get_mut(rev) else { return None };
        entry.entries.retain(|(eid, _)| *eid != id.0);
        if entry.entries.is_empty() {
            map.remove(rev);
            Some(WireCommand::RemRev(rev.clone()))
        } else {
            None
        }
    }

    /// Dispatch a `Watch` indication for a document id to every subscriber.
    pub fn dispatch_doc(&self, doc: &DocId, event: &WatchEvent) {
        let guard = self.docs.lock();
        // Clone the Arc callbacks out before invoking: a callback may
        // re-enter this registry and mutate the same map, which would
        // conflict with an outstanding `RefCell` borrow.
        let callbacks: Vec<Subscriber> = {
            let map = guard.borrow();
            match map.get(doc) {
                Some(entry) => entry.entries.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };
        for cb in callbacks {
            cb(event);
        }
    }

    /// Dispatch a `Watch` indication for a revision id to every subscriber.
    pub fn dispatch_rev(&self, rev: &RevId, event: &WatchEvent) {
        let guard = self.revs.lock();
        let callbacks: Vec<Subscriber> = {
            let map = guard.borrow();
            match map.get(rev) {
                Some(entry) => entry.entries.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };
        for cb in callbacks {
            cb(event);
        }
    }

    /// Number of distinct doc+rev targets with at least one subscriber.
    pub fn table_size(&self) -> usize {
        let docs = self.docs.lock().borrow().len();
        let revs = self.revs.lock().borrow().len();
        docs + revs
    }
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn doc(n: u8) -> DocId {
        DocId::new(vec![n])
    }

    #[test]
    fn first_add_sends_wire_command_subsequent_do_not() {
        let reg = WatchRegistry::new();
        let (_id1, cmd1) = reg.add_doc(doc(1), Arc::new(|_| {}));
        let (_id2, cmd2) = reg.add_doc(doc(1), Arc::new(|_| {}));
        assert!(cmd1.is_some());
        assert!(cmd2.is_none());
    }

    #[test]
    fn last_remove_sends_wire_command() {
        let reg = WatchRegistry::new();
        let (id1, _) = reg.add_doc(doc(1), Arc::new(|_| {}));
        let (id2, _) = reg.add_doc(doc(1), Arc::new(|_| {}));
        assert!(reg.remove_doc(&doc(1), id1).is_none());
        assert!(reg.remove_doc(&doc(1), id2).is_some());
    }

    #[test]
    fn both_subscribers_receive_each_indication_once() {
        let reg = WatchRegistry::new();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        let ca = count_a.clone();
        let cb = count_b.clone();
        reg.add_doc(doc(1), Arc::new(move |_| { ca.fetch_add(1, Ordering::SeqCst); }));
        reg.add_doc(doc(1), Arc::new(move |_| { cb.fetch_add(1, Ordering::SeqCst); }));
        reg.dispatch_doc(&doc(1), &WatchEvent { kind: WatchEventKind::Modified, store: doc(9) });
        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_dispatch_can_register_new_watch() {
        let reg = Arc::new(WatchRegistry::new());
        let reg2 = reg.clone();
        reg.add_doc(doc(1), Arc::new(move |_| {
            // Reentrant: registering from inside dispatch must not deadlock.
            let _ = reg2.add_doc(doc(2), Arc::new(|_| {}));
        }));
        reg.dispatch_doc(&doc(1), &WatchEvent { kind: WatchEventKind::Modified, store: doc(9) });
        assert_eq!(reg.table_size(), 2);
    }
}
