//! `Registry`: the process-wide singleton view of `sys:registry`, the
//! UTI conformance/metadata table (spec §4.6).

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, OnceCell};

use crate::client::Client;
use crate::document::Document;
use crate::domain::folder;
use crate::error::Error;
use crate::link::Link;
use crate::value::Value;
use crate::watch::{Subscriber, SubscriptionId, WatchEvent};

const REGISTRY_PATH: &str = "/org.peerdrive.registry";

/// Default icon for a UTI with no entry or no `icon` anywhere in its
/// conformance chain, matching the original client.
const DEFAULT_ICON: &str = "uti/unknown.png";
/// Default display title, same rationale.
const DEFAULT_TITLE: &str = "unknown";

/// The `uti -> {conforming, exec, icon, display, ...}` dict, plus the
/// recursive conformance queries over it. Kept separate from [`Registry`]
/// so the tree-walking logic is testable without a daemon connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryData(Value);

impl Default for RegistryData {
    fn default() -> Self {
        RegistryData(Value::empty_dict())
    }
}

impl RegistryData {
    fn item(&self, uti: &str) -> Option<&Value> {
        match &self.0 {
            Value::Dict(map) => map.get(uti),
            _ => None,
        }
    }

    fn conforming_list(&self, uti: &str) -> Vec<String> {
        match self.item(uti) {
            Some(item) => match item.get_or("conforming", Value::empty_list()) {
                Value::List(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// Look up `key` for `uti`, walking the `conforming` chain if `recursive`
    /// and the direct lookup misses.
    pub fn search(&self, uti: &str, key: &str, recursive: bool, default: Value) -> Value {
        let Some(item) = self.item(uti) else { return default };
        if item.contains_key(key) {
            return item.get_or(key, Value::Null);
        }
        if !recursive {
            return default;
        }
        for parent in self.conforming_list(uti) {
            let result = self.search(&parent, key, true, Value::Null);
            if !result.is_null() {
                return result;
            }
        }
        default
    }

    /// Whether `uti` conforms to `super_class`, directly or transitively.
    pub fn conformes(&self, uti: &str, super_class: &str) -> bool {
        if uti == super_class {
            return true;
        }
        self.conforming_list(uti).iter().any(|parent| self.conformes(parent, super_class))
    }

    /// `uti`'s direct superclasses, in declaration order.
    pub fn conforming(&self, uti: &str) -> Vec<String> {
        self.conforming_list(uti)
    }

    /// Executables registered for `uti`, extended with every superclass's,
    /// deduplicated keeping first occurrence.
    pub fn executables(&self, uti: &str) -> Vec<String> {
        let mut result: Vec<String> = match self.item(uti) {
            Some(item) => match item.get_or("exec", Value::empty_list()) {
                Value::List(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        for parent in self.conforming_list(uti) {
            result.extend(self.executables(&parent));
        }
        dedup_preserve_order(&mut result);
        result
    }

    /// The icon path for `uti`, falling back to [`DEFAULT_ICON`].
    pub fn icon(&self, uti: &str) -> String {
        self.search(uti, "icon", true, Value::from(DEFAULT_ICON))
            .as_str()
            .unwrap_or(DEFAULT_ICON)
            .to_string()
    }

    /// The display title for `uti`, falling back to [`DEFAULT_TITLE`].
    pub fn title(&self, uti: &str) -> String {
        self.search(uti, "display", true, Value::from(DEFAULT_TITLE))
            .as_str()
            .unwrap_or(DEFAULT_TITLE)
            .to_string()
    }
}

fn dedup_preserve_order(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

/// The process-wide view of `sys:registry`.
///
/// Obtain the singleton via [`Registry::instance`]; it is initialized
/// lazily on first use and lives for the rest of the process, matching the
/// original client's double-checked-locking singleton.
pub struct Registry {
    client: Client,
    link: Link,
    watch_id: Option<SubscriptionId>,
    modified: Arc<Notify>,
    data: Mutex<RegistryData>,
}

static INSTANCE: OnceCell<Arc<Registry>> = OnceCell::const_new();

impl Registry {
    /// The process-wide singleton, initialized on first call.
    ///
    /// `client` is only consulted the first time this is called; later
    /// calls return the already-initialized instance regardless of `client`.
    pub async fn instance(client: &Client) -> Result<Arc<Registry>, Error> {
        let client = client.clone();
        INSTANCE
            .get_or_try_init(|| async move { Registry::open(client).await.map(Arc::new) })
            .await
            .cloned()
    }

    async fn open(client: Client) -> Result<Self, Error> {
        let link = folder::lookup_single(&client, "sys:registry").await?.ok_or_else(|| Error::InvalidLinkState {
            operation: "open registry",
            detail: "sys:registry did not resolve to exactly one link".to_string(),
        })?;
        let doc = link.doc().cloned().ok_or_else(|| Error::InvalidLinkState {
            operation: "open registry",
            detail: "sys:registry is not a document link".to_string(),
        })?;

        let notify = Arc::new(Notify::new());
        let watch_id = {
            let notify = notify.clone();
            let subscriber: Subscriber = Arc::new(move |_event: &WatchEvent| notify.notify_waiters());
            Some(client.add_doc_watch(doc, subscriber).await?)
        };

        let registry = Registry { client, link, watch_id, modified: notify, data: Mutex::new(RegistryData::default()) };
        registry.reload().await?;
        Ok(registry)
    }

    /// A handle that resolves whenever the watched document changes.
    pub fn modified(&self) -> Arc<Notify> {
        self.modified.clone()
    }

    /// Re-fetch the registry document and atomically replace the in-memory table.
    pub async fn reload(&self) -> Result<(), Error> {
        let store = self.link.store().cloned().ok_or_else(|| Error::InvalidLinkState {
            operation: "reload registry",
            detail: "link has no store".to_string(),
        })?;
        let mut peek_link = self.link.clone();
        peek_link.resolve(&self.client).await?;
        let mut session = Document::peek(self.client.clone(), store, peek_link).await?;
        let value = session.get(REGISTRY_PATH).await?;
        session.close().await?;
        *self.data.lock() = RegistryData(value);
        Ok(())
    }

    /// Look up `key` for `uti`, walking the `conforming` chain if `recursive`.
    pub fn search(&self, uti: &str, key: &str, recursive: bool, default: Value) -> Value {
        self.data.lock().search(uti, key, recursive, default)
    }

    /// Whether `uti` conforms to `super_class`, directly or transitively.
    pub fn conformes(&self, uti: &str, super_class: &str) -> bool {
        self.data.lock().conformes(uti, super_class)
    }

    /// `uti`'s direct superclasses.
    pub fn conforming(&self, uti: &str) -> Vec<String> {
        self.data.lock().conforming(uti)
    }

    /// Executables registered for `uti` and its superclasses.
    pub fn executables(&self, uti: &str) -> Vec<String> {
        self.data.lock().executables(uti)
    }

    /// The icon path for `uti`.
    pub fn icon(&self, uti: &str) -> String {
        self.data.lock().icon(uti)
    }

    /// The display title for `uti`.
    pub fn title(&self, uti: &str) -> String {
        self.data.lock().title(uti)
    }
}

impl Drop for Registry {
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
    use std::collections::BTreeMap;

    fn entry(conforming: &[&str], exec: &[&str], extra: &[(&str, Value)]) -> Value {
        let mut map = BTreeMap::new();
        map.insert(
            "conforming".to_string(),
            Value::List(conforming.iter().map(|s| Value::from(*s)).collect()),
        );
        map.insert("exec".to_string(), Value::List(exec.iter().map(|s| Value::from(*s)).collect()));
        for (key, value) in extra {
            map.insert(key.to_string(), value.clone());
        }
        Value::Dict(map)
    }

    fn sample() -> RegistryData {
        let mut root = BTreeMap::new();
        root.insert(
            "public.image".to_string(),
            entry(&[], &["viewer"], &[("icon", Value::from("image.png")), ("display", Value::from("Image"))]),
        );
        root.insert("public.png".to_string(), entry(&["public.image"], &["png-tool"], &[]));
        root.insert("public.orphan".to_string(), entry(&[], &[], &[]));
        RegistryData(Value::Dict(root))
    }

    #[test]
    fn search_falls_back_through_conforming_chain() {
        let data = sample();
        assert_eq!(data.search("public.png", "display", true, Value::Null), Value::from("Image"));
        assert_eq!(data.search("public.png", "display", false, Value::from("default")), Value::from("default"));
    }

    #[test]
    fn conformes_is_transitive() {
        let data = sample();
        assert!(data.conformes("public.png", "public.png"));
        assert!(data.conformes("public.png", "public.image"));
        assert!(!data.conformes("public.orphan", "public.image"));
    }

    #[test]
    fn executables_combines_and_dedups_across_chain() {
        let mut root = BTreeMap::new();
        root.insert("base".to_string(), entry(&[], &["shared-tool"], &[]));
        root.insert("mid".to_string(), entry(&["base"], &["shared-tool", "mid-tool"], &[]));
        let data = RegistryData(Value::Dict(root));
        assert_eq!(
            data.executables("mid"),
            vec!["shared-tool".to_string(), "mid-tool".to_string()]
        );
    }

    #[test]
    fn icon_and_title_use_defaults_when_absent() {
        let data = sample();
        assert_eq!(data.icon("public.orphan"), DEFAULT_ICON);
        assert_eq!(data.title("public.orphan"), DEFAULT_TITLE);
        assert_eq!(data.icon("public.png"), "image.png");
    }
}
