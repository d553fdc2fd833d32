//! Column definitions: what a [`super::model::FolderModel`] extracts from a
//! fetched revision's stat info and metadata into each displayable column.
//!
//! Mirrors the original client's `StatColumnInfo` (builtin, stat-derived
//! columns) and `MetaColumnInfo` (registry-declared metadata columns).

use std::str::FromStr;

use strum::EnumString;

use crate::domain::registry::Registry;
use crate::info::RevInfo;
use crate::value::Value;

/// One of the fixed, always-available columns derived from `Stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BuiltinColumn {
    Size,
    Mtime,
    Type,
    Creator,
    Comment,
}

impl BuiltinColumn {
    fn parse(name: &str) -> Option<Self> {
        BuiltinColumn::from_str(name).ok()
    }

    fn extract(self, stat: &RevInfo) -> Value {
        match self {
            BuiltinColumn::Size => match stat.file_stat() {
                Some(s) => Value::from(s.size),
                None => Value::Null,
            },
            BuiltinColumn::Mtime => Value::from(stat.mtime),
            BuiltinColumn::Type => Value::from(stat.type_code.as_str()),
            BuiltinColumn::Creator => Value::from(stat.creator_code.as_str()),
            BuiltinColumn::Comment => Value::from(stat.comment.as_str()),
        }
    }
}

/// A single configured column: either a builtin stat field, or a
/// registry-declared `typeCode:dotted/path` metadata key.
#[derive(Debug, Clone)]
pub enum ColumnSpec {
    Builtin(BuiltinColumn),
    /// No matching registry entry, or one with an unsupported type (the
    /// original client only supports `string`-typed meta columns). Always
    /// extracts to `Value::Null`.
    Unsupported { key: String },
    Meta { display: String, path: Vec<String> },
}

impl ColumnSpec {
    /// Parse a column key (`":size"` or `"typeCode:dotted/path"`) against
    /// the registry's declared metadata columns for that type.
    pub fn parse(key: &str, registry: &Registry) -> Self {
        if let Some(builtin) = key.strip_prefix(':').and_then(BuiltinColumn::parse) {
            return ColumnSpec::Builtin(builtin);
        }
        let Some((uti, dotted)) = key.split_once(':') else {
            return ColumnSpec::Unsupported { key: key.to_string() };
        };
        let path: Vec<String> = dotted.split('/').map(str::to_string).collect();
        let meta_list = registry.search(uti, "meta", false, Value::empty_list());
        match resolve_meta_entry(&meta_list, &path) {
            Some((display, true)) => ColumnSpec::Meta { display, path },
            _ => ColumnSpec::Unsupported { key: key.to_string() },
        }
    }

    /// The column header to display.
    pub fn name(&self) -> &str {
        match self {
            ColumnSpec::Builtin(BuiltinColumn::Size) => "Size",
            ColumnSpec::Builtin(BuiltinColumn::Mtime) => "Modified",
            ColumnSpec::Builtin(BuiltinColumn::Type) => "Type",
            ColumnSpec::Builtin(BuiltinColumn::Creator) => "Creator",
            ColumnSpec::Builtin(BuiltinColumn::Comment) => "Comment",
            ColumnSpec::Meta { display, .. } => display,
            ColumnSpec::Unsupported { key } => key,
        }
    }

    /// Whether this column's value may be edited back into the document.
    /// Only the `:comment` builtin is, matching the original client.
    pub fn editable(&self) -> bool {
        matches!(self, ColumnSpec::Builtin(BuiltinColumn::Comment))
    }

    /// Extract this column's displayable value from a fetched item.
    pub fn extract(&self, stat: &RevInfo, meta: &Value) -> Value {
        match self {
            ColumnSpec::Builtin(builtin) => builtin.extract(stat),
            ColumnSpec::Meta { path, .. } => {
                let dotted = path.join("/");
                let value = meta.at_path(&dotted);
                match value.as_str() {
                    Some(_) => value,
                    None => Value::Null,
                }
            }
            ColumnSpec::Unsupported { .. } => Value::Null,
        }
    }
}

/// Find the `{key: [...], display, type}` entry in a registry `"meta"`
/// list whose `key` path matches `path`, returning its display name and
/// whether its declared type is supported (`"string"` only).
///
/// Pure and daemon-free so it is directly unit-testable; [`ColumnSpec::parse`]
/// is the only caller that needs a live [`Registry`].
fn resolve_meta_entry(meta_list: &Value, path: &[String]) -> Option<(String, bool)> {
    let Value::List(entries) = meta_list else { return None };
    for entry in entries {
        let Value::List(key_parts) = entry.get_or("key", Value::empty_list()) else { continue };
        let key_path: Vec<String> = key_parts.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        if key_path != path {
            continue;
        }
        let display = entry.get_or("display", Value::Null).as_str().unwrap_or_default().to_string();
        let supported = entry.get_or("type", Value::Null).as_str() == Some("string");
        return Some((display, supported));
    }
    None
}

/// The default single column shown before any are configured, matching the
/// original client's default (`public.item:org.peerdrive.annotation/title`).
pub fn default_columns() -> Vec<String> {
    vec!["public.item:org.peerdrive.annotation/title".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn meta_list_with_title() -> Value {
        let mut entry = BTreeMap::new();
        entry.insert(
            "key".to_string(),
            Value::List(vec![Value::from("org.peerdrive.annotation"), Value::from("title")]),
        );
        entry.insert("display".to_string(), Value::from("Title"));
        entry.insert("type".to_string(), Value::from("string"));
        Value::List(vec![Value::Dict(entry)])
    }

    #[test]
    fn resolve_meta_entry_matches_on_path() {
        let list = meta_list_with_title();
        let path = vec!["org.peerdrive.annotation".to_string(), "title".to_string()];
        let (display, supported) = resolve_meta_entry(&list, &path).unwrap();
        assert_eq!(display, "Title");
        assert!(supported);

        let missing = vec!["other".to_string()];
        assert!(resolve_meta_entry(&list, &missing).is_none());
    }

    #[test]
    fn resolve_meta_entry_flags_unsupported_type() {
        let mut entry = BTreeMap::new();
        entry.insert("key".to_string(), Value::List(vec![Value::from("a")]));
        entry.insert("display".to_string(), Value::from("A"));
        entry.insert("type".to_string(), Value::from("int"));
        let list = Value::List(vec![Value::Dict(entry)]);

        let (_, supported) = resolve_meta_entry(&list, &["a".to_string()]).unwrap();
        assert!(!supported);
    }

    #[test]
    fn extract_meta_column_reads_nested_path() {
        let column = ColumnSpec::Meta { display: "Title".to_string(), path: vec!["ann".to_string(), "title".to_string()] };
        let mut ann = BTreeMap::new();
        ann.insert("title".to_string(), Value::from("My Doc"));
        let mut meta = BTreeMap::new();
        meta.insert("ann".to_string(), Value::Dict(ann));
        let stat = sample_stat();
        assert_eq!(column.extract(&stat, &Value::Dict(meta)), Value::from("My Doc"));
    }

    #[test]
    fn extract_builtin_columns_read_stat_fields() {
        let stat = sample_stat();
        assert_eq!(ColumnSpec::Builtin(BuiltinColumn::Type).extract(&stat, &Value::Null), Value::from("public.folder"));
        assert_eq!(ColumnSpec::Builtin(BuiltinColumn::Comment).extract(&stat, &Value::Null), Value::from("a note"));
    }

    fn sample_stat() -> RevInfo {
        RevInfo {
            flags: 0,
            mtime: 1_700_000_000,
            type_code: "public.folder".to_string(),
            creator_code: "app.test".to_string(),
            comment: "a note".to_string(),
            parents: Vec::new(),
            attachments: Default::default(),
        }
    }
}
