//! [`FolderModel`]: the observable tree itself.
//!
//! Grounded on the original client's `FolderModelPrivate`: a `Node*` tree
//! kept current by a `FolderGatherer` worker and a per-link watch table,
//! with `updateNode` reconciling a freshly-fetched [`FolderInfo`] against
//! the node it describes. This module owns the same reconciliation logic,
//! plus a second background thread (the "applier") that runs it against
//! batches coming off the worker's channel and installs/removes daemon
//! watches as nodes are created and destroyed.

use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::client::Client;
use crate::domain::registry::Registry;
use crate::error::Error;
use crate::link::Link;
use crate::value::Value;
use crate::watch::{Subscriber, SubscriptionId, WatchEvent};

use super::columns::default_columns;
use super::node::{Arena, Node, NodeId};
use super::worker::{is_root, root_link, FetchHandle, FolderInfo, FolderWorker};

/// An owned, point-in-time view of a node, returned by [`FolderModel::node`]
/// so callers never hold a reference into the arena's lock.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub link: Link,
    pub type_code: String,
    pub columns: Vec<Value>,
    pub visible_children: Vec<NodeId>,
    pub unknown_children: u32,
    pub fetching_children: bool,
    pub fetched: bool,
    pub visible: bool,
}

/// What a tree reconciliation needs done outside the arena lock: these
/// touch the daemon (watch subscriptions) or the worker's queue, neither
/// of which should run while the arena mutex is held.
enum TreeEvent {
    Watch(Link),
    Unwatch(Link),
    Fetch(Link),
}

fn create_node(
    arena: &mut Arena,
    node_lookup: &mut HashMap<Link, Vec<NodeId>>,
    parent: NodeId,
    link: Link,
    events: &mut Vec<TreeEvent>,
) -> NodeId {
    let id = arena.insert(Node::new(link.clone(), Some(parent)));
    let refs = node_lookup.entry(link.clone()).or_default();
    refs.push(id);
    if refs.len() == 1 && !is_root(&link) {
        events.push(TreeEvent::Watch(link));
    }
    id
}

fn collect_subtree(arena: &Arena, id: NodeId, out: &mut Vec<NodeId>) {
    out.push(id);
    for &child in arena.get(id).children.values() {
        collect_subtree(arena, child, out);
    }
}

/// Destroy `id` and everything still parented under it, dropping each
/// node's `node_lookup` entry and emitting an `Unwatch` the moment a link's
/// last reference goes away (mirrors the original's `destroyNode`).
fn destroy_node(arena: &mut Arena, node_lookup: &mut HashMap<Link, Vec<NodeId>>, id: NodeId, events: &mut Vec<TreeEvent>) {
    let mut subtree = Vec::new();
    collect_subtree(arena, id, &mut subtree);

    for node_id in &subtree {
        let link = arena.get(*node_id).link.clone();
        if let Some(refs) = node_lookup.get_mut(&link) {
            refs.retain(|r| r != node_id);
            if refs.is_empty() {
                node_lookup.remove(&link);
                if !is_root(&link) {
                    events.push(TreeEvent::Unwatch(link));
                }
            }
        }
    }
    arena.remove_subtree(id);
}

fn remove_child(
    arena: &mut Arena,
    node_lookup: &mut HashMap<Link, Vec<NodeId>>,
    parent_id: NodeId,
    link: &Link,
    events: &mut Vec<TreeEvent>,
) {
    let Some(child_id) = arena.get_mut(parent_id).children.remove(link) else { return };
    let child_fetched = arena.get(child_id).fetched;
    if !child_fetched {
        let parent = arena.get_mut(parent_id);
        if parent.unknown_children > 0 {
            parent.unknown_children -= 1;
        }
    }
    if arena.get(child_id).visible {
        arena.get_mut(parent_id).visible_children.retain(|l| l != link);
    }
    destroy_node(arena, node_lookup, child_id, events);
}

/// Reconcile one fetched [`FolderInfo`] against the node it describes.
/// Mirrors `FolderModelPrivate::updateNode`: first-fetch bookkeeping,
/// children set-diffing, column/type refresh, and the visibility
/// transition (a node only becomes visible once its own fetch succeeds;
/// the root is never visible).
fn update_node(arena: &mut Arena, node_lookup: &mut HashMap<Link, Vec<NodeId>>, id: NodeId, info: &FolderInfo, events: &mut Vec<TreeEvent>) {
    let parent = arena.get(id).parent;

    if !arena.get(id).fetched {
        arena.get_mut(id).fetched = true;
        if let Some(parent_id) = parent {
            let p = arena.get_mut(parent_id);
            if p.unknown_children > 0 {
                p.unknown_children -= 1;
            }
        }
    }

    if !info.exists {
        if arena.get(id).visible {
            if let Some(parent_id) = parent {
                let link = arena.get(id).link.clone();
                arena.get_mut(parent_id).visible_children.retain(|l| l != &link);
            }
            arena.get_mut(id).visible = false;
        }
        return;
    }

    let existing: Vec<Link> = arena.get(id).children.keys().cloned().collect();
    for link in &info.children {
        if !arena.get(id).children.contains_key(link) {
            let child_id = create_node(arena, node_lookup, id, link.clone(), events);
            arena.get_mut(id).children.insert(link.clone(), child_id);
            arena.get_mut(id).unknown_children += 1;
            if arena.get(id).fetching_children {
                events.push(TreeEvent::Fetch(link.clone()));
            }
        }
    }
    for link in &existing {
        if !info.children.contains(link) {
            remove_child(arena, node_lookup, id, link, events);
        }
    }

    let node = arena.get_mut(id);
    node.type_code = info.type_code.clone();
    node.columns = info.columns.clone();

    if parent.is_some() && !arena.get(id).visible {
        arena.get_mut(id).visible = true;
        let parent_id = parent.unwrap();
        let link = arena.get(id).link.clone();
        arena.get_mut(parent_id).visible_children.push(link);
    }

    // Re-sort the parent's visible children whenever this node's columns
    // changed while it was (or just became) visible, so the active sort
    // column's new value takes effect immediately.
    if let Some(parent_id) = parent {
        if arena.get(id).visible {
            resort_visible_children(arena, parent_id);
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return x.cmp(y);
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    std::cmp::Ordering::Equal
}

/// Re-order `parent_id`'s `visible_children` by the arena's configured sort
/// column, if any. A stable sort, so children tied on that column keep
/// their prior relative order.
fn resort_visible_children(arena: &mut Arena, parent_id: NodeId) {
    let Some(col) = arena.sort_column else { return };
    let children = arena.get(parent_id).children.clone();
    let mut ordered = arena.get(parent_id).visible_children.clone();
    ordered.sort_by(|a, b| {
        let a_val = children.get(a).and_then(|id| arena.get(*id).columns.get(col));
        let b_val = children.get(b).and_then(|id| arena.get(*id).columns.get(col));
        match (a_val, b_val) {
            (Some(x), Some(y)) => compare_values(x, y),
            _ => std::cmp::Ordering::Equal,
        }
    });
    arena.get_mut(parent_id).visible_children = ordered;
}

/// The observable, lazily-populated tree itself.
///
/// Construction spawns two background threads: the [`FolderWorker`], which
/// fetches queued links, and an "applier" thread that drains the worker's
/// batches, reconciles them into the tree, and installs/removes the
/// corresponding daemon watches. Both stop when the `FolderModel` is dropped.
pub struct FolderModel {
    registry: Arc<Registry>,
    arena: Arc<Mutex<Arena>>,
    node_lookup: Arc<Mutex<HashMap<Link, Vec<NodeId>>>>,
    root: NodeId,
    worker: Option<FolderWorker>,
    fetch: FetchHandle,
    changed: Arc<Notify>,
    applier: Option<thread::JoinHandle<()>>,
    column_keys: Mutex<Vec<String>>,
}

impl FolderModel {
    /// Open a tree rooted at the synthetic mounts node ([`root_link`]) and
    /// kick off its first fetch.
    pub async fn open(client: Client) -> Result<Self, Error> {
        let registry = Registry::instance(&client).await?;
        let column_keys = default_columns();

        let (sender, receiver) = std::sync::mpsc::sync_channel(32);
        let (worker, fetch) = FolderWorker::spawn(client.clone(), registry.clone(), &column_keys, sender);

        let mut arena = Arena::new();
        let mut node_lookup: HashMap<Link, Vec<NodeId>> = HashMap::new();
        let root_link_value = root_link();
        let root = arena.insert(Node::new(root_link_value.clone(), None));
        arena.get_mut(root).fetching_children = true;
        node_lookup.entry(root_link_value.clone()).or_default().push(root);

        let arena = Arc::new(Mutex::new(arena));
        let node_lookup = Arc::new(Mutex::new(node_lookup));
        let watch_ids = Arc::new(Mutex::new(HashMap::<Link, SubscriptionId>::new()));
        let changed = Arc::new(Notify::new());

        let applier = {
            let arena = arena.clone();
            let node_lookup = node_lookup.clone();
            let client = client.clone();
            let fetch = fetch.clone();
            let changed = changed.clone();
            thread::Builder::new()
                .name("peerdrive-folder-model-applier".to_string())
                .spawn(move || run_applier(receiver, arena, node_lookup, watch_ids, client, fetch, changed))
                .expect("spawning folder model applier thread")
        };

        fetch.fetch(root_link_value);

        Ok(FolderModel {
            registry,
            arena,
            node_lookup,
            root,
            worker: Some(worker),
            fetch,
            changed,
            applier: Some(applier),
            column_keys: Mutex::new(column_keys),
        })
    }

    /// The root node, representing the synthetic list of mounts.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// A handle that resolves every time a fetched batch has been applied,
    /// for consumers that want to re-render after each change.
    pub fn changed(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    /// The current column headers, in configured order.
    pub fn column_headers(&self) -> Vec<String> {
        self.worker.as_ref().map(|w| w.column_headers()).unwrap_or_default()
    }

    /// An owned snapshot of `id`'s current state.
    pub fn node(&self, id: NodeId) -> NodeSnapshot {
        let arena = self.arena.lock();
        let node = arena.get(id);
        let visible_children = node.visible_children.iter().filter_map(|l| node.children.get(l).copied()).collect();
        NodeSnapshot {
            link: node.link.clone(),
            type_code: node.type_code.clone(),
            columns: node.columns.clone(),
            visible_children,
            unknown_children: node.unknown_children,
            fetching_children: node.fetching_children,
            fetched: node.fetched,
            visible: node.visible,
        }
    }

    /// Whether `id` has any children known or yet to be confirmed.
    pub fn has_children(&self, id: NodeId) -> bool {
        let arena = self.arena.lock();
        let node = arena.get(id);
        node.unknown_children > 0 || !node.visible_children.is_empty()
    }

    /// Whether fetching `id`'s children would likely add more.
    pub fn can_fetch_more(&self, id: NodeId) -> bool {
        self.arena.lock().get(id).unknown_children > 0
    }

    /// Mark `id` as interactively expanded and (re-)queue every currently
    /// known child for a fetch, matching the original's `fetchMore`.
    pub fn fetch_more(&self, id: NodeId) {
        let links: Vec<Link> = {
            let mut arena = self.arena.lock();
            let node = arena.get_mut(id);
            node.fetching_children = true;
            node.children.keys().cloned().collect()
        };
        for link in links {
            self.fetch.fetch(link);
        }
    }

    /// Set (or clear) which column index drives `visible_children` order,
    /// and immediately re-sort every currently visible node's children by it.
    pub fn set_sort_column(&self, column: Option<usize>) {
        let mut arena = self.arena.lock();
        arena.sort_column = column;
        for id in arena.ids() {
            if !arena.get(id).visible_children.is_empty() {
                resort_visible_children(&mut arena, id);
            }
        }
    }

    /// Reconfigure the displayed columns and re-queue every known node so
    /// they pick up the new values.
    pub fn set_columns(&self, column_keys: Vec<String>) {
        if let Some(worker) = &self.worker {
            worker.set_columns(&column_keys, &self.registry);
        }
        *self.column_keys.lock() = column_keys;
        let links: Vec<Link> = self.node_lookup.lock().keys().cloned().collect();
        for link in links {
            self.fetch.fetch(link);
        }
    }
}

impl Drop for FolderModel {
    fn drop(&mut self) {
        // Dropping the worker first stops its thread and, with it, the
        // sender half of the applier's channel — only then can the applier
        // thread's `recv()` loop observe the channel closing and return.
        self.worker.take();
        if let Some(handle) = self.applier.take() {
            let _ = handle.join();
        }
    }
}

fn run_applier(
    receiver: Receiver<Vec<FolderInfo>>,
    arena: Arc<Mutex<Arena>>,
    node_lookup: Arc<Mutex<HashMap<Link, Vec<NodeId>>>>,
    watch_ids: Arc<Mutex<HashMap<Link, SubscriptionId>>>,
    client: Client,
    fetch: FetchHandle,
    changed: Arc<Notify>,
) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building folder model applier runtime");

    while let Ok(batch) = receiver.recv() {
        let mut events = Vec::new();
        {
            let mut arena = arena.lock();
            let mut node_lookup = node_lookup.lock();
            for info in &batch {
                let ids = node_lookup.get(&info.link).cloned().unwrap_or_default();
                for id in ids {
                    update_node(&mut arena, &mut node_lookup, id, info, &mut events);
                }
            }
        }

        for event in events {
            match event {
                TreeEvent::Fetch(link) => fetch.fetch(link),
                TreeEvent::Watch(link) => {
                    let Some(doc) = link.doc().cloned() else { continue };
                    let sub_link = link.clone();
                    let sub_fetch = fetch.clone();
                    let subscriber: Subscriber = Arc::new(move |_event: &WatchEvent| sub_fetch.fetch(sub_link.clone()));
                    if let Ok(id) = rt.block_on(client.add_doc_watch(doc, subscriber)) {
                        watch_ids.lock().insert(link, id);
                    }
                }
                TreeEvent::Unwatch(link) => {
                    let Some(doc) = link.doc().cloned() else { continue };
                    if let Some(id) = watch_ids.lock().remove(&link) {
                        let _ = rt.block_on(client.remove_doc_watch(&doc, id));
                    }
                }
            }
        }

        changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::DocId;

    fn link(n: u8) -> Link {
        Link::to_doc(DocId::new(vec![0]), DocId::new(vec![n]))
    }

    fn sample_info(link: Link, exists: bool, children: Vec<Link>) -> FolderInfo {
        FolderInfo { link, exists, type_code: "public.folder".to_string(), columns: Vec::new(), children }
    }

    #[test]
    fn update_node_adds_and_removes_children() {
        let mut arena = Arena::new();
        let mut node_lookup: HashMap<Link, Vec<NodeId>> = HashMap::new();
        let root = arena.insert(Node::new(link(0), None));
        node_lookup.entry(link(0)).or_default().push(root);
        arena.get_mut(root).fetching_children = true;

        let mut events = Vec::new();
        let info = sample_info(link(0), true, vec![link(1), link(2)]);
        update_node(&mut arena, &mut node_lookup, root, &info, &mut events);

        assert_eq!(arena.get(root).children.len(), 2);
        assert_eq!(arena.get(root).unknown_children, 2);
        assert!(events.iter().any(|e| matches!(e, TreeEvent::Watch(l) if *l == link(1))));
        assert!(events.iter().any(|e| matches!(e, TreeEvent::Fetch(l) if *l == link(1))));

        let child = arena.get(root).children[&link(1)];
        let mut events = Vec::new();
        update_node(&mut arena, &mut node_lookup, child, &sample_info(link(1), true, vec![]), &mut events);
        assert!(arena.get(child).visible);
        assert!(arena.get(root).visible_children.contains(&link(1)));

        let mut events = Vec::new();
        let info = sample_info(link(0), true, vec![link(2)]);
        update_node(&mut arena, &mut node_lookup, root, &info, &mut events);
        assert_eq!(arena.get(root).children.len(), 1);
        assert!(!arena.get(root).visible_children.contains(&link(1)));
        assert!(events.iter().any(|e| matches!(e, TreeEvent::Unwatch(l) if *l == link(1))));
        assert!(node_lookup.get(&link(1)).is_none());
    }

    #[test]
    fn update_node_marks_missing_item_invisible() {
        let mut arena = Arena::new();
        let mut node_lookup: HashMap<Link, Vec<NodeId>> = HashMap::new();
        let root = arena.insert(Node::new(link(0), None));
        let child = arena.insert(Node::new(link(1), Some(root)));
        arena.get_mut(root).children.insert(link(1), child);
        arena.get_mut(root).visible_children.push(link(1));
        arena.get_mut(child).visible = true;
        arena.get_mut(child).fetched = true;
        node_lookup.entry(link(0)).or_default().push(root);
        node_lookup.entry(link(1)).or_default().push(child);

        let mut events = Vec::new();
        let info = sample_info(link(1), false, vec![]);
        update_node(&mut arena, &mut node_lookup, child, &info, &mut events);

        assert!(!arena.get(child).visible);
        assert!(!arena.get(root).visible_children.contains(&link(1)));
    }

    #[test]
    fn resort_reorders_visible_children_by_sort_column() {
        let mut arena = Arena::new();
        arena.sort_column = Some(0);
        let root = arena.insert(Node::new(link(0), None));
        let a = arena.insert(Node::new(link(1), Some(root)));
        let b = arena.insert(Node::new(link(2), Some(root)));
        arena.get_mut(root).children.insert(link(1), a);
        arena.get_mut(root).children.insert(link(2), b);
        arena.get_mut(root).visible_children = vec![link(1), link(2)];
        arena.get_mut(a).visible = true;
        arena.get_mut(a).columns = vec![Value::from("zzz")];
        arena.get_mut(b).visible = true;
        arena.get_mut(b).columns = vec![Value::from("aaa")];

        resort_visible_children(&mut arena, root);
        assert_eq!(arena.get(root).visible_children, vec![link(2), link(1)]);
    }

    #[test]
    fn root_is_never_marked_visible() {
        let mut arena = Arena::new();
        let mut node_lookup: HashMap<Link, Vec<NodeId>> = HashMap::new();
        let root = arena.insert(Node::new(link(0), None));
        node_lookup.entry(link(0)).or_default().push(root);

        let mut events = Vec::new();
        let info = sample_info(link(0), true, vec![]);
        update_node(&mut arena, &mut node_lookup, root, &info, &mut events);
        assert!(!arena.get(root).visible);
    }
}
