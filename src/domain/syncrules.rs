//! `SyncRules`: a self-maintaining view of `sys:syncrules`, the table of
//! per-store-pair synchronization policies (spec §4.6).

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use strum::{AsRefStr, EnumString};
use tokio::sync::Notify;

use crate::client::Client;
use crate::document::Document;
use crate::domain::folder;
use crate::error::Error;
use crate::ids::DocId;
use crate::link::Link;
use crate::value::Value;
use crate::watch::{Subscriber, SubscriptionId, WatchEvent};

const SYNCRULES_PATH: &str = "/org.peerdrive.syncrules";

/// How two stores should be kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr, EnumString)]
pub enum SyncMode {
    /// No rule; the pair is not synchronized.
    #[default]
    #[strum(serialize = "none")]
    None,
    /// Only advance when the result is a pure fast-forward.
    #[strum(serialize = "ff")]
    FastForward,
    /// Always let the more recent side win.
    #[strum(serialize = "latest")]
    Latest,
    /// Merge divergent history.
    #[strum(serialize = "merge")]
    Merge,
}

impl SyncMode {
    fn as_wire(&self) -> Option<&str> {
        match self {
            SyncMode::None => None,
            other => Some(other.as_ref()),
        }
    }

    fn from_wire(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// The ordered list of `{from, to, mode, descr}` entries, plus the lookups
/// over it. Kept separate from [`SyncRules`] so it is testable without a
/// daemon connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncRulesData(Vec<BTreeMap<String, Value>>);

impl SyncRulesData {
    fn entry_ids(entry: &BTreeMap<String, Value>) -> Option<(DocId, DocId)> {
        let from = entry.get("from")?.as_str()?;
        let to = entry.get("to")?.as_str()?;
        Some((DocId::from_str(from).ok()?, DocId::from_str(to).ok()?))
    }

    /// The number of rules currently defined.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no rules defined.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The index of the rule for `(from, to)`, if one exists.
    pub fn index(&self, from: &DocId, to: &DocId) -> Option<usize> {
        self.0.iter().position(|entry| Self::entry_ids(entry).as_ref() == Some(&(from.clone(), to.clone())))
    }

    /// The mode of the rule at `index`.
    pub fn mode_at(&self, index: usize) -> SyncMode {
        self.0
            .get(index)
            .and_then(|entry| entry.get("mode"))
            .and_then(Value::as_str)
            .map(SyncMode::from_wire)
            .unwrap_or_default()
    }

    /// The mode for `(from, to)`, or [`SyncMode::None`] if no rule exists.
    pub fn mode(&self, from: &DocId, to: &DocId) -> SyncMode {
        self.index(from, to).map(|i| self.mode_at(i)).unwrap_or_default()
    }

    /// Set the mode for `(from, to)`. Setting [`SyncMode::None`] removes the
    /// rule entirely; any other mode creates or updates it in place.
    pub fn set_mode(&mut self, from: &DocId, to: &DocId, mode: SyncMode) {
        match (self.index(from, to), mode.as_wire()) {
            (Some(i), None) => {
                self.0.remove(i);
            }
            (Some(i), Some(wire)) => {
                self.0[i].insert("mode".to_string(), Value::from(wire));
            }
            (None, None) => {}
            (None, Some(wire)) => {
                let mut entry = BTreeMap::new();
                entry.insert("from".to_string(), Value::from(from.to_string()));
                entry.insert("to".to_string(), Value::from(to.to_string()));
                entry.insert("mode".to_string(), Value::from(wire));
                self.0.push(entry);
            }
        }
    }

    /// The free-text description of the rule at `index`.
    pub fn description_at(&self, index: usize) -> String {
        self.0
            .get(index)
            .map(|entry| entry.get("descr").cloned().unwrap_or(Value::from("")))
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// The description for `(from, to)`, or empty if no rule exists.
    pub fn description(&self, from: &DocId, to: &DocId) -> String {
        self.index(from, to).map(|i| self.description_at(i)).unwrap_or_default()
    }

    /// Set the description for `(from, to)`. No-op if no rule exists.
    pub fn set_description(&mut self, from: &DocId, to: &DocId, descr: &str) -> bool {
        match self.index(from, to) {
            Some(i) => {
                self.0[i].insert("descr".to_string(), Value::from(descr));
                true
            }
            None => false,
        }
    }

    fn to_value(&self) -> Value {
        Value::List(self.0.iter().cloned().map(Value::Dict).collect())
    }

    fn from_value(value: Value) -> Self {
        match value {
            Value::List(items) => SyncRulesData(
                items
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Dict(map) => Some(map),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => SyncRulesData::default(),
        }
    }
}

/// A self-maintaining view of the daemon's synchronization rule table.
pub struct SyncRules {
    client: Client,
    link: Link,
    watch_id: Option<SubscriptionId>,
    modified: Arc<Notify>,
    data: SyncRulesData,
    dirty: bool,
}

impl std::fmt::Debug for SyncRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRules").field("link", &self.link).field("rules", &self.data.len()).finish()
    }
}

impl SyncRules {
    /// Locate and load `sys:syncrules`, installing a watch on it.
    pub async fn open(client: Client) -> Result<Self, Error> {
        let link = folder::lookup_single(&client, "sys:syncrules").await?.ok_or_else(|| Error::InvalidLinkState {
            operation: "open syncrules",
            detail: "sys:syncrules did not resolve to exactly one link".to_string(),
        })?;
        let doc = link.doc().cloned().ok_or_else(|| Error::InvalidLinkState {
            operation: "open syncrules",
            detail: "sys:syncrules is not a document link".to_string(),
        })?;

        let notify = Arc::new(Notify::new());
        let watch_id = {
            let notify = notify.clone();
            let subscriber: Subscriber = Arc::new(move |_event: &WatchEvent| notify.notify_waiters());
            Some(client.add_doc_watch(doc, subscriber).await?)
        };

        let mut rules =
            SyncRules { client, link, watch_id, modified: notify, data: SyncRulesData::default(), dirty: false };
        rules.reload().await?;
        Ok(rules)
    }

    /// A handle that resolves whenever the watched document changes.
    pub fn modified(&self) -> Arc<Notify> {
        self.modified.clone()
    }

    /// Re-fetch the rule table from the daemon, discarding unsaved changes.
    pub async fn reload(&mut self) -> Result<(), Error> {
        let store = self.link.store().cloned().ok_or_else(|| Error::InvalidLinkState {
            operation: "reload syncrules",
            detail: "link has no store".to_string(),
        })?;
        let mut peek_link = self.link.clone();
        peek_link.resolve(&self.client).await?;
        let mut session = Document::peek(self.client.clone(), store, peek_link).await?;
        let value = session.get(SYNCRULES_PATH).await?;
        session.close().await?;
        self.data = SyncRulesData::from_value(value);
        self.dirty = false;
        Ok(())
    }

    /// Persist pending changes back to the daemon. A no-op (reporting
    /// success) if nothing has changed since the last load or save.
    pub async fn save(&mut self) -> Result<(), Error> {
        if !self.dirty {
            return Ok(());
        }
        let store = self.link.store().cloned().ok_or_else(|| Error::InvalidLinkState {
            operation: "save syncrules",
            detail: "link has no store".to_string(),
        })?;
        let doc = self.link.doc().cloned().ok_or_else(|| Error::InvalidLinkState {
            operation: "save syncrules",
            detail: "link is not a document link".to_string(),
        })?;
        let mut session = Document::update(self.client.clone(), store.clone(), self.link.clone()).await?;
        session.set(SYNCRULES_PATH, &self.data.to_value()).await?;
        let rev = session.commit("update sync rules").await?;
        session.close().await?;
        self.link = Link::to_doc_at(store, doc, rev);
        self.dirty = false;
        Ok(())
    }

    /// The number of rules currently defined.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether there are no rules defined.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The mode for `(from, to)`, or [`SyncMode::None`] if no rule exists.
    pub fn mode(&self, from: &DocId, to: &DocId) -> SyncMode {
        self.data.mode(from, to)
    }

    /// Set the mode for `(from, to)`. Setting [`SyncMode::None`] removes the
    /// rule; any other mode creates or updates it.
    pub fn set_mode(&mut self, from: &DocId, to: &DocId, mode: SyncMode) {
        self.data.set_mode(from, to, mode);
        self.dirty = true;
    }

    /// The description for `(from, to)`.
    pub fn description(&self, from: &DocId, to: &DocId) -> String {
        self.data.description(from, to)
    }

    /// Set the description for `(from, to)`. No-op if no rule exists.
    pub fn set_description(&mut self, from: &DocId, to: &DocId, descr: &str) {
        if self.data.set_description(from, to, descr) {
            self.dirty = true;
        }
    }
}

impl Drop for SyncRules {
    fn drop(&mut self) {
        if let (Some(id), Some(doc)) = (self.watch_id.take(), self.link.doc().cloned()) {
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

    fn store_a() -> DocId {
        DocId::new(vec![0xA1])
    }
    fn store_b() -> DocId {
        DocId::new(vec![0xB2])
    }

    #[test]
    fn set_mode_none_removes_existing_rule() {
        let mut data = SyncRulesData::default();
        data.set_mode(&store_a(), &store_b(), SyncMode::Latest);
        assert_eq!(data.len(), 1);
        assert_eq!(data.mode(&store_a(), &store_b()), SyncMode::Latest);

        data.set_mode(&store_a(), &store_b(), SyncMode::None);
        assert!(data.is_empty());
        assert_eq!(data.mode(&store_a(), &store_b()), SyncMode::None);
    }

    #[test]
    fn set_mode_updates_existing_rule_in_place() {
        let mut data = SyncRulesData::default();
        data.set_mode(&store_a(), &store_b(), SyncMode::FastForward);
        data.set_mode(&store_a(), &store_b(), SyncMode::Merge);
        assert_eq!(data.len(), 1);
        assert_eq!(data.mode(&store_a(), &store_b()), SyncMode::Merge);
    }

    #[test]
    fn description_requires_existing_rule() {
        let mut data = SyncRulesData::default();
        assert!(!data.set_description(&store_a(), &store_b(), "hello"));
        data.set_mode(&store_a(), &store_b(), SyncMode::Latest);
        assert!(data.set_description(&store_a(), &store_b(), "hello"));
        assert_eq!(data.description(&store_a(), &store_b()), "hello");
    }

    #[test]
    fn value_round_trip_preserves_rules() {
        let mut data = SyncRulesData::default();
        data.set_mode(&store_a(), &store_b(), SyncMode::Merge);
        data.set_description(&store_a(), &store_b(), "nightly merge");
        let restored = SyncRulesData::from_value(data.to_value());
        assert_eq!(restored, data);
    }
}
