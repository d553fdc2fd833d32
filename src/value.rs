//! The structured value model: a self-describing tagged binary encoding
//! used as the daemon's wire payload for document metadata, the registry,
//! the fstab, and sync rules (spec §4.4).

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ids::DocId;
use crate::link::Link;

const TAG_DICT: u8 = 0x00;
const TAG_LIST: u8 = 0x10;
const TAG_STRING: u8 = 0x20;
const TAG_BOOL: u8 = 0x30;
const TAG_REV_LINK: u8 = 0x40;
const TAG_DOC_LINK: u8 = 0x41;
const TAG_F32: u8 = 0x50;
const TAG_F64: u8 = 0x51;
const TAG_U8: u8 = 0x60;
const TAG_U16: u8 = 0x61;
const TAG_U32: u8 = 0x62;
const TAG_U64: u8 = 0x63;
const TAG_I8: u8 = 0x64;
const TAG_I16: u8 = 0x65;
const TAG_I32: u8 = 0x66;
const TAG_I64: u8 = 0x67;

/// Tag for [`Value::Null`].
///
/// Not part of the daemon's wire table in spec §4.4 (whose round-trip
/// property explicitly excludes `Null`), but the in-memory tree needs some
/// representation for "absent" values returned by [`Value::get`]. Chosen
/// to not collide with any tag in the table above.
const TAG_NULL: u8 = 0x01;

/// Errors raised while decoding a [`Value`] from its binary form.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValueError {
    /// The input ended before a complete value could be decoded.
    #[error("truncated value data")]
    Truncated,
    /// A tag byte did not match any known variant.
    #[error("invalid value tag: {0:#04x}")]
    InvalidTag(u8),
    /// A string's declared length did not leave enough bytes in the buffer.
    #[error("string length {len} exceeds remaining buffer")]
    StringLengthExceedsBuffer {
        /// The declared length, in bytes.
        len: u32,
    },
    /// A string's bytes were not valid UTF-8.
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    /// A dict had a duplicate... (kept for forward compatibility; dicts
    /// resolve duplicates by "last wins" per spec §3, so this is unused
    /// today but documents the rule it would otherwise violate).
    #[error("trailing bytes after a complete value")]
    TrailingData,
}

/// A tagged variant tree: the daemon's structured-value wire format.
///
/// Dicts are represented with [`BTreeMap`] so iteration order is always
/// lexicographic by key, satisfying spec §4.4's determinism invariant
/// regardless of the order keys were inserted or decoded in.
#[derive(Debug, Clone)]
pub enum Value {
    /// The absent value, returned by lookups that find nothing.
    Null,
    /// A signed integer.
    Int(i64),
    /// An unsigned integer.
    UInt(u64),
    /// A 32-bit float.
    Float(f32),
    /// A 64-bit float.
    Double(f64),
    /// A boolean.
    Bool(bool),
    /// A UTF-8 string.
    String(String),
    /// An ordered sequence of values.
    List(Vec<Value>),
    /// A string-keyed mapping with no duplicate keys.
    Dict(BTreeMap<String, Value>),
    /// A reference to a document or revision, store id supplied by context.
    Link(Link),
}

impl PartialEq for Value {
    /// Round-trip equality is defined "by value, not by byte identity"
    /// (spec §4.4): a non-negative [`Value::Int`] compares equal to the
    /// [`Value::UInt`] it may decode back as after going through the
    /// narrowest-unsigned-tag encoding rule.
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Int(a), Int(b)) => a == b,
            (UInt(a), UInt(b)) => a == b,
            (Int(a), UInt(b)) | (UInt(b), Int(a)) => *a >= 0 && (*a as u64) == *b,
            (Float(a), Float(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (String(a), String(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Dict(a), Dict(b)) => a == b,
            (Link(a), Link(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<Link> for Value {
    fn from(l: Link) -> Self {
        Value::Link(l)
    }
}

impl Value {
    /// An empty dict, the conventional starting point for structured documents.
    pub fn empty_dict() -> Self {
        Value::Dict(BTreeMap::new())
    }

    /// An empty list.
    pub fn empty_list() -> Self {
        Value::List(Vec::new())
    }

    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Best-effort string extraction.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Best-effort bool extraction.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Best-effort signed-integer extraction (widening from any numeric tag).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Best-effort unsigned-integer extraction.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// Look up a key in a [`Value::Dict`], returning `default` if the key is
    /// absent or `self` is not a dict.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        match self {
            Value::Dict(map) => map.get(key).cloned().unwrap_or(default),
            _ => default,
        }
    }

    /// Whether a [`Value::Dict`] contains `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        matches!(self, Value::Dict(map) if map.contains_key(key))
    }

    /// Keys of a [`Value::Dict`], in lexicographic order. Empty for
    /// non-dict values.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Value::Dict(map) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Extract a subtree at a slash-separated path (e.g. `/a/b/0`), used by
    /// [`crate::Document::get`]. List indices are decimal. Returns `Value::Null`
    /// if any path segment does not resolve.
    pub fn at_path(&self, path: &str) -> Value {
        let mut cur = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            cur = match cur {
                Value::Dict(map) => match map.get(segment) {
                    Some(v) => v,
                    None => return Value::Null,
                },
                Value::List(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                    Some(v) => v,
                    None => return Value::Null,
                },
                _ => return Value::Null,
            };
        }
        cur.clone()
    }

    /// Replace the subtree at a slash-separated path with `value`,
    /// creating intermediate dicts as needed. Returns `false` (and leaves
    /// `self` unchanged) if an intermediate segment addresses a non-dict,
    /// non-list value, or a list index is out of bounds.
    pub fn set_path(&mut self, path: &str, value: Value) -> bool {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        Self::set_path_rec(self, &segments, value)
    }

    fn set_path_rec(cur: &mut Value, segments: &[&str], value: Value) -> bool {
        match segments.split_first() {
            None => {
                *cur = value;
                true
            }
            Some((head, rest)) => {
                if matches!(cur, Value::Null) {
                    *cur = Value::empty_dict();
                }
                match cur {
                    Value::Dict(map) => {
                        let entry = map.entry(head.to_string()).or_insert(Value::Null);
                        Self::set_path_rec(entry, rest, value)
                    }
                    Value::List(items) => match head.parse::<usize>() {
                        Ok(idx) if idx < items.len() => {
                            Self::set_path_rec(&mut items[idx], rest, value)
                        }
                        _ => false,
                    },
                    _ => false,
                }
            }
        }
    }

    /// Encode to the daemon's binary wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => buf.put_u8(TAG_NULL),
            Value::Bool(b) => {
                buf.put_u8(TAG_BOOL);
                buf.put_u8(if *b { 1 } else { 0 });
            }
            Value::Float(f) => {
                buf.put_u8(TAG_F32);
                buf.put_f32_le(*f);
            }
            Value::Double(d) => {
                buf.put_u8(TAG_F64);
                buf.put_f64_le(*d);
            }
            Value::String(s) => {
                buf.put_u8(TAG_STRING);
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::List(items) => {
                buf.put_u8(TAG_LIST);
                buf.put_u32_le(items.len() as u32);
                for item in items {
                    item.encode_into(buf);
                }
            }
            Value::Dict(map) => {
                buf.put_u8(TAG_DICT);
                buf.put_u32_le(map.len() as u32);
                // BTreeMap iterates in lexicographic key order already.
                for (key, value) in map {
                    buf.put_u32_le(key.len() as u32);
                    buf.put_slice(key.as_bytes());
                    value.encode_into(buf);
                }
            }
            Value::Link(link) => encode_link(link, buf),
            Value::UInt(v) => encode_uint(*v, buf),
            Value::Int(v) => {
                if *v >= 0 {
                    encode_uint(*v as u64, buf)
                } else {
                    encode_int(*v, buf)
                }
            }
        }
    }

    /// Decode a [`Value`] from its binary wire form.
    ///
    /// `store` supplies the store id that any decoded [`Link`] is scoped
    /// to, since the wire form itself only carries a bare rev/doc id
    /// (spec §3, §4.4).
    pub fn decode(data: &[u8], store: &DocId) -> Result<Value, ValueError> {
        let mut cursor = data;
        let value = decode_one(&mut cursor, store)?;
        if !cursor.is_empty() {
            return Err(ValueError::TrailingData);
        }
        Ok(value)
    }
}

fn encode_uint(v: u64, buf: &mut BytesMut) {
    if v <= u8::MAX as u64 {
        buf.put_u8(TAG_U8);
        buf.put_u8(v as u8);
    } else if v <= u16::MAX as u64 {
        buf.put_u8(TAG_U16);
        buf.put_u16_le(v as u16);
    } else if v <= u32::MAX as u64 {
        buf.put_u8(TAG_U32);
        buf.put_u32_le(v as u32);
    } else {
        buf.put_u8(TAG_U64);
        buf.put_u64_le(v);
    }
}

fn encode_int(v: i64, buf: &mut BytesMut) {
    debug_assert!(v < 0, "non-negative ints are encoded as unsigned");
    if v >= i8::MIN as i64 {
        buf.put_u8(TAG_I8);
        buf.put_i8(v as i8);
    } else if v >= i16::MIN as i64 {
        buf.put_u8(TAG_I16);
        buf.put_i16_le(v as i16);
    } else if v >= i32::MIN as i64 {
        buf.put_u8(TAG_I32);
        buf.put_i32_le(v as i32);
    } else {
        buf.put_u8(TAG_I64);
        buf.put_i64_le(v);
    }
}

fn encode_link(link: &Link, buf: &mut BytesMut) {
    match link {
        Link::RevLink { rev, .. } => {
            let bytes = rev.as_bytes();
            buf.put_u8(TAG_REV_LINK);
            buf.put_u8(bytes.len() as u8);
            buf.put_slice(bytes);
        }
        Link::DocHead { doc, .. } => {
            let bytes = doc.as_bytes();
            buf.put_u8(TAG_DOC_LINK);
            buf.put_u8(bytes.len() as u8);
            buf.put_slice(bytes);
        }
        // Pre-revision and invalid links have no wire representation; encode
        // as Null rather than silently losing information as a doc-link.
        Link::DocPreRev { .. } | Link::Invalid => buf.put_u8(TAG_NULL),
    }
}

fn take<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8], ValueError> {
    if cursor.len() < n {
        return Err(ValueError::Truncated);
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

fn decode_one(cursor: &mut &[u8], store: &DocId) -> Result<Value, ValueError> {
    if cursor.is_empty() {
        return Err(ValueError::Truncated);
    }
    let tag = cursor.get_u8();
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => {
            let b = take(cursor, 1)?[0];
            Ok(Value::Bool(b != 0))
        }
        TAG_F32 => Ok(Value::Float(f32::from_le_bytes(
            take(cursor, 4)?.try_into().unwrap(),
        ))),
        TAG_F64 => Ok(Value::Double(f64::from_le_bytes(
            take(cursor, 8)?.try_into().unwrap(),
        ))),
        TAG_STRING => {
            if cursor.len() < 4 {
                return Err(ValueError::Truncated);
            }
            let len = cursor.get_u32_le();
            let bytes = take(cursor, len as usize).map_err(|_| {
                ValueError::StringLengthExceedsBuffer { len }
            })?;
            String::from_utf8(bytes.to_vec())
                .map(Value::String)
                .map_err(|_| ValueError::InvalidUtf8)
        }
        TAG_LIST => {
            if cursor.len() < 4 {
                return Err(ValueError::Truncated);
            }
            let count = cursor.get_u32_le();
            let mut items = Vec::with_capacity(count.min(1 << 20) as usize);
            for _ in 0..count {
                items.push(decode_one(cursor, store)?);
            }
            Ok(Value::List(items))
        }
        TAG_DICT => {
            if cursor.len() < 4 {
                return Err(ValueError::Truncated);
            }
            let count = cursor.get_u32_le();
            let mut map = BTreeMap::new();
            for _ in 0..count {
                if cursor.len() < 4 {
                    return Err(ValueError::Truncated);
                }
                let key_len = cursor.get_u32_le();
                let key_bytes = take(cursor, key_len as usize).map_err(|_| {
                    ValueError::StringLengthExceedsBuffer { len: key_len }
                })?;
                let key = String::from_utf8(key_bytes.to_vec())
                    .map_err(|_| ValueError::InvalidUtf8)?;
                let value = decode_one(cursor, store)?;
                // "last wins on insert" (spec §3): BTreeMap::insert overwrites.
                map.insert(key, value);
            }
            Ok(Value::Dict(map))
        }
        TAG_REV_LINK | TAG_DOC_LINK => {
            let len = take(cursor, 1)?[0] as usize;
            let id_bytes = take(cursor, len)?;
            let link = if tag == TAG_REV_LINK {
                Link::RevLink {
                    store: store.clone(),
                    rev: crate::ids::RevId::new(id_bytes.to_vec()),
                }
            } else {
                Link::DocHead {
                    store: store.clone(),
                    doc: DocId::new(id_bytes.to_vec()),
                    rev: None,
                }
            };
            Ok(Value::Link(link))
        }
        TAG_U8 => Ok(Value::UInt(take(cursor, 1)?[0] as u64)),
        TAG_U16 => Ok(Value::UInt(cursor_get_u16(cursor)?)),
        TAG_U32 => Ok(Value::UInt(cursor_get_u32(cursor)?)),
        TAG_U64 => Ok(Value::UInt(cursor_get_u64(cursor)?)),
        TAG_I8 => Ok(Value::Int(take(cursor, 1)?[0] as i8 as i64)),
        TAG_I16 => Ok(Value::Int(cursor_get_u16(cursor)? as i16 as i64)),
        TAG_I32 => Ok(Value::Int(cursor_get_u32(cursor)? as i32 as i64)),
        TAG_I64 => Ok(Value::Int(cursor_get_u64(cursor)? as i64)),
        other => Err(ValueError::InvalidTag(other)),
    }
}

fn cursor_get_u16(cursor: &mut &[u8]) -> Result<u64, ValueError> {
    Ok(u16::from_le_bytes(take(cursor, 2)?.try_into().unwrap()) as u64)
}
fn cursor_get_u32(cursor: &mut &[u8]) -> Result<u64, ValueError> {
    Ok(u32::from_le_bytes(take(cursor, 4)?.try_into().unwrap()) as u64)
}
fn cursor_get_u64(cursor: &mut &[u8]) -> Result<u64, ValueError> {
    Ok(u64::from_le_bytes(take(cursor, 8)?.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DocId {
        DocId::new(vec![0x11, 0x22])
    }

    #[test]
    fn spec_example_encode() {
        // encode({ "k": 42 }) == 00 01 00 00 00  01 00 00 00  6B  60 2A
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::UInt(42));
        let v = Value::Dict(map);
        let bytes = v.encode();
        assert_eq!(
            bytes.as_ref(),
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x6B, 0x60, 0x2A]
        );
        let decoded = Value::decode(&bytes, &store()).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn non_negative_int_round_trips_as_uint() {
        let v = Value::Int(42);
        let decoded = Value::decode(&v.encode(), &store()).unwrap();
        assert_eq!(decoded, Value::UInt(42));
        assert_eq!(decoded, v); // cross-variant equality by value
    }

    #[test]
    fn negative_int_picks_minimal_signed_tag() {
        for (v, expect_tag) in [
            (-1i64, TAG_I8),
            (-200i64, TAG_I16),
            (-40000i64, TAG_I32),
            (-3000000000i64, TAG_I64),
            (i64::MIN, TAG_I64),
        ] {
            let bytes = Value::Int(v).encode();
            assert_eq!(bytes[0], expect_tag, "value {v}");
            let decoded = Value::decode(&bytes, &store()).unwrap();
            assert_eq!(decoded, Value::Int(v));
        }
    }

    #[test]
    fn unsigned_widths_pick_minimal_tag() {
        for (v, expect_tag) in [
            (0u64, TAG_U8),
            (255u64, TAG_U8),
            (256u64, TAG_U16),
            (65535u64, TAG_U16),
            (65536u64, TAG_U32),
            (u32::MAX as u64, TAG_U32),
            (u32::MAX as u64 + 1, TAG_U64),
            (u64::MAX, TAG_U64),
        ] {
            let bytes = Value::UInt(v).encode();
            assert_eq!(bytes[0], expect_tag, "value {v}");
            let decoded = Value::decode(&bytes, &store()).unwrap();
            assert_eq!(decoded, Value::UInt(v));
        }
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert_eq!(Value::decode(&[TAG_BOOL], &store()), Err(ValueError::Truncated));
        assert_eq!(Value::decode(&[], &store()), Err(ValueError::Truncated));
    }

    #[test]
    fn invalid_tag_is_rejected() {
        assert_eq!(Value::decode(&[0xEE], &store()), Err(ValueError::InvalidTag(0xEE)));
    }

    #[test]
    fn bad_utf8_string_is_rejected() {
        let mut raw = vec![TAG_STRING];
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(Value::decode(&raw, &store()), Err(ValueError::InvalidUtf8));
    }

    #[test]
    fn string_length_exceeding_buffer_is_rejected() {
        let mut raw = vec![TAG_STRING];
        raw.extend_from_slice(&100u32.to_le_bytes());
        raw.extend_from_slice(b"short");
        assert!(matches!(
            Value::decode(&raw, &store()),
            Err(ValueError::StringLengthExceedsBuffer { len: 100 })
        ));
    }

    #[test]
    fn truncated_string_length_prefix_is_rejected() {
        // Only one byte follows the tag, short of the 4-byte length prefix.
        let raw = vec![TAG_STRING, 0x01];
        assert_eq!(Value::decode(&raw, &store()), Err(ValueError::Truncated));
    }

    #[test]
    fn dict_last_wins_on_duplicate_keys() {
        let mut raw = vec![TAG_DICT];
        raw.extend_from_slice(&2u32.to_le_bytes());
        for val in [1u8, 2u8] {
            raw.extend_from_slice(&1u32.to_le_bytes());
            raw.push(b'a');
            raw.push(TAG_U8);
            raw.push(val);
        }
        let decoded = Value::decode(&raw, &store()).unwrap();
        match decoded {
            Value::Dict(map) => {
                assert_eq!(map.len(), 1);
                assert_eq!(map["a"], Value::UInt(2));
            }
            _ => panic!("expected dict"),
        }
    }

    #[test]
    fn link_round_trips_with_store_context() {
        let rev = crate::ids::RevId::new(vec![9, 9]);
        let link = Link::RevLink { store: store(), rev: rev.clone() };
        let value = Value::Link(link.clone());
        let decoded = Value::decode(&value.encode(), &store()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn at_path_and_set_path() {
        let mut doc = Value::empty_dict();
        doc.set_path("a/b", Value::from("hi"));
        assert_eq!(doc.at_path("a/b"), Value::from("hi"));
        assert_eq!(doc.at_path("a/missing"), Value::Null);
    }

    proptest::proptest! {
        #[test]
        fn prop_uint_round_trips(v: u64) {
            let value = Value::UInt(v);
            let decoded = Value::decode(&value.encode(), &store()).unwrap();
            proptest::prop_assert_eq!(decoded, value);
        }

        #[test]
        fn prop_int_round_trips(v: i64) {
            let value = Value::Int(v);
            let decoded = Value::decode(&value.encode(), &store()).unwrap();
            proptest::prop_assert_eq!(decoded, value);
        }

        #[test]
        fn prop_string_round_trips(s: String) {
            let value = Value::String(s);
            let decoded = Value::decode(&value.encode(), &store()).unwrap();
            proptest::prop_assert_eq!(decoded, value);
        }
    }
}
