//! `FSTab`: a self-maintaining view of the daemon's mount table,
//! `sys:fstab` (spec §4.6).

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::client::Client;
use crate::document::Document;
use crate::domain::folder;
use crate::error::Error;
use crate::ids::DocId;
use crate::link::Link;
use crate::value::Value;
use crate::watch::{Subscriber, SubscriptionId, WatchEvent};

const FSTAB_PATH: &str = "/org.peerdrive.fstab";

/// The label-keyed dict stored at [`FSTAB_PATH`], plus the accessors over
/// it. Kept separate from [`FsTab`] so the dict logic is testable without a
/// daemon connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FsTabData(BTreeMap<String, Value>);

impl FsTabData {
    fn entry(&self, label: &str) -> Option<&Value> {
        self.0.get(label)
    }

    /// Labels currently known, in lexicographic order.
    pub fn known_labels(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    /// Add a new mount entry. Returns `false` (no-op) if `label` already exists.
    pub fn add(&mut self, label: &str, src: &str, fs_type: &str, options: &str, credentials: &str) -> bool {
        if self.0.contains_key(label) {
            return false;
        }
        let mut entry = BTreeMap::new();
        entry.insert("src".to_string(), Value::from(src));
        if fs_type != "file" {
            entry.insert("type".to_string(), Value::from(fs_type));
        }
        if !options.is_empty() {
            entry.insert("options".to_string(), Value::from(options));
        }
        if !credentials.is_empty() {
            entry.insert("credentials".to_string(), Value::from(credentials));
        }
        self.0.insert(label.to_string(), Value::Dict(entry));
        true
    }

    /// Remove a label's entry. Returns whether the label existed.
    ///
    /// The original C++ client's `remove()` has its existence check
    /// inverted (`if (fstab.contains(label)) return false;`), which would
    /// make removal always fail whenever the label is actually present.
    /// That is reproduced nowhere here: removing an existing label succeeds.
    pub fn remove(&mut self, label: &str) -> bool {
        self.0.remove(label).is_some()
    }

    /// The mount source for a label.
    pub fn src(&self, label: &str) -> Option<String> {
        self.entry(label).map(|e| e.get_or("src", Value::from("")).as_str().unwrap_or("").to_string())
    }

    /// The filesystem type for a label, defaulting to `"file"`.
    pub fn fs_type(&self, label: &str) -> Option<String> {
        self.entry(label)
            .map(|e| e.get_or("type", Value::from("file")).as_str().unwrap_or("file").to_string())
    }

    /// Mount options for a label, defaulting to empty.
    pub fn options(&self, label: &str) -> Option<String> {
        self.entry(label).map(|e| e.get_or("options", Value::from("")).as_str().unwrap_or("").to_string())
    }

    /// Mount credentials for a label, defaulting to empty.
    pub fn credentials(&self, label: &str) -> Option<String> {
        self.entry(label)
            .map(|e| e.get_or("credentials", Value::from("")).as_str().unwrap_or("").to_string())
    }

    /// Whether a label is mounted automatically at startup.
    pub fn auto_mounted(&self, label: &str) -> bool {
        self.entry(label)
            .map(|e| e.get_or("auto", Value::Bool(false)).as_bool().unwrap_or(false))
            .unwrap_or(false)
    }

    /// Set a label's auto-mount flag. Returns whether the label existed.
    pub fn set_auto_mounted(&mut self, label: &str, enable: bool) -> bool {
        match self.0.get_mut(label) {
            Some(Value::Dict(entry)) => {
                entry.insert("auto".to_string(), Value::Bool(enable));
                true
            }
            _ => false,
        }
    }

    fn to_value(&self) -> Value {
        Value::Dict(self.0.clone())
    }

    fn from_value(value: Value) -> Self {
        match value {
            Value::Dict(map) => FsTabData(map),
            _ => FsTabData::default(),
        }
    }
}

/// A self-maintaining view of the daemon's mount table.
///
/// Watches `sys:fstab` for changes. Call [`FsTab::modified`] for a handle
/// that resolves whenever the watched document fires, and [`FsTab::reload`]
/// to re-fetch the dict afterwards — mirroring the original client's
/// `modified` signal, with the reload decision left to the caller.
pub struct FsTab {
    client: Client,
    link: Link,
    watch_id: Option<SubscriptionId>,
    modified: Arc<Notify>,
    data: FsTabData,
}

impl std::fmt::Debug for FsTab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsTab")
            .field("link", &self.link)
            .field("labels", &self.data.known_labels())
            .finish()
    }
}

impl FsTab {
    /// Locate and load `sys:fstab`, installing a watch on it.
    pub async fn open(client: Client) -> Result<Self, Error> {
        let link = folder::lookup_single(&client, "sys:fstab").await?.ok_or_else(|| Error::InvalidLinkState {
            operation: "open fstab",
            detail: "sys:fstab did not resolve to exactly one link".to_string(),
        })?;
        let doc = link.doc().cloned().ok_or_else(|| Error::InvalidLinkState {
            operation: "open fstab",
            detail: "sys:fstab is not a document link".to_string(),
        })?;

        let notify = Arc::new(Notify::new());
        let watch_id = {
            let notify = notify.clone();
            let subscriber: Subscriber = Arc::new(move |_event: &WatchEvent| notify.notify_waiters());
            Some(client.add_doc_watch(doc, subscriber).await?)
        };

        let mut tab = FsTab { client, link, watch_id, modified: notify, data: FsTabData::default() };
        tab.reload().await?;
        Ok(tab)
    }

    /// A handle that resolves whenever the watched document changes.
    pub fn modified(&self) -> Arc<Notify> {
        self.modified.clone()
    }

    fn store(&self) -> Result<DocId, Error> {
        self.link.store().cloned().ok_or_else(|| Error::InvalidLinkState {
            operation: "use fstab",
            detail: "link has no store".to_string(),
        })
    }

    fn doc(&self) -> Result<DocId, Error> {
        self.link.doc().cloned().ok_or_else(|| Error::InvalidLinkState {
            operation: "use fstab",
            detail: "link is not a document link".to_string(),
        })
    }

    /// Re-fetch the table from the daemon.
    pub async fn reload(&mut self) -> Result<(), Error> {
        let store = self.store()?;
        let mut peek_link = self.link.clone();
        peek_link.resolve(&self.client).await?;
        let mut session = Document::peek(self.client.clone(), store, peek_link).await?;
        let value = session.get(FSTAB_PATH).await?;
        session.close().await?;
        self.data = FsTabData::from_value(value);
        Ok(())
    }

    /// Persist the current table back to the daemon.
    pub async fn save(&mut self) -> Result<(), Error> {
        let store = self.store()?;
        let doc = self.doc()?;
        let mut session = Document::update(self.client.clone(), store.clone(), self.link.clone()).await?;
        session.set(FSTAB_PATH, &self.data.to_value()).await?;
        let rev = session.commit("update fstab").await?;
        session.close().await?;
        self.link = Link::to_doc_at(store, doc, rev);
        Ok(())
    }

    /// Labels currently known, in lexicographic order.
    pub fn known_labels(&self) -> Vec<&str> {
        self.data.known_labels()
    }

    /// Add a new mount entry. Returns `false` if `label` already exists.
    pub fn add(&mut self, label: &str, src: &str, fs_type: &str, options: &str, credentials: &str) -> bool {
        self.data.add(label, src, fs_type, options, credentials)
    }

    /// Remove a label's entry. Returns whether the label existed.
    pub fn remove(&mut self, label: &str) -> bool {
        self.data.remove(label)
    }

    /// The mount source for a label.
    pub fn src(&self, label: &str) -> Option<String> {
        self.data.src(label)
    }

    /// The filesystem type for a label, defaulting to `"file"`.
    pub fn fs_type(&self, label: &str) -> Option<String> {
        self.data.fs_type(label)
    }

    /// Mount options for a label, defaulting to empty.
    pub fn options(&self, label: &str) -> Option<String> {
        self.data.options(label)
    }

    /// Mount credentials for a label, defaulting to empty.
    pub fn credentials(&self, label: &str) -> Option<String> {
        self.data.credentials(label)
    }

    /// Whether a label is mounted automatically at startup.
    pub fn auto_mounted(&self, label: &str) -> bool {
        self.data.auto_mounted(label)
    }

    /// Set a label's auto-mount flag. Returns whether the label existed.
    pub fn set_auto_mounted(&mut self, label: &str, enable: bool) -> bool {
        self.data.set_auto_mounted(label, enable)
    }
}

impl Drop for FsTab {
    fn drop(&mut self) {
        if let (Some(id), Ok(doc)) = (self.watch_id.take(), self.doc()) {
            let client = self.client.clone();
            tokio::spawn(async move {
                let _ = client.remove_doc_watch(&doc, id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_duplicate_label() {
        let mut data = FsTabData::default();
        assert!(data.add("home", "/srv/home", "file", "", ""));
        assert!(!data.add("home", "/srv/other", "file", "", ""));
        assert_eq!(data.src("home").unwrap(), "/srv/home");
    }

    #[test]
    fn defaults_apply_when_fields_are_absent() {
        let mut data = FsTabData::default();
        data.add("home", "/srv/home", "file", "", "");
        assert_eq!(data.fs_type("home").unwrap(), "file");
        assert_eq!(data.options("home").unwrap(), "");
        assert_eq!(data.credentials("home").unwrap(), "");
        assert!(!data.auto_mounted("home"));
        assert_eq!(data.src("missing"), None);
    }

    #[test]
    fn non_default_type_is_stored() {
        let mut data = FsTabData::default();
        data.add("remote", "peer://x", "webdav", "ro", "user:pass");
        assert_eq!(data.fs_type("remote").unwrap(), "webdav");
        assert_eq!(data.options("remote").unwrap(), "ro");
        assert_eq!(data.credentials("remote").unwrap(), "user:pass");
    }

    #[test]
    fn remove_succeeds_for_existing_label_and_fails_otherwise() {
        let mut data = FsTabData::default();
        data.add("home", "/srv/home", "file", "", "");
        assert!(data.remove("home"));
        assert!(!data.remove("home"));
        assert_eq!(data.known_labels(), Vec::<&str>::new());
    }

    #[test]
    fn set_auto_mounted_requires_existing_label() {
        let mut data = FsTabData::default();
        assert!(!data.set_auto_mounted("home", true));
        data.add("home", "/srv/home", "file", "", "");
        assert!(data.set_auto_mounted("home", true));
        assert!(data.auto_mounted("home"));
    }

    #[test]
    fn value_round_trip_preserves_entries() {
        let mut data = FsTabData::default();
        data.add("home", "/srv/home", "file", "", "");
        data.add("remote", "peer://x", "webdav", "ro", "");
        let value = data.to_value();
        let restored = FsTabData::from_value(value);
        assert_eq!(restored, data);
    }
}
