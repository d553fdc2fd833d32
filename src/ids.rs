//! Opaque fixed-length identifiers used throughout the store protocol.
//!
//! [`DocId`], [`RevId`] and [`PartId`] wrap the raw byte strings the daemon
//! hands out for documents, revisions and attachment parts. The daemon
//! treats these as opaque; we only need equality, ordering (for use as map
//! keys) and a stable textual form for URIs and logging.

use std::fmt;
use std::str::FromStr;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Error returned when parsing an identifier from a hex string fails.
#[derive(Debug, thiserror::Error)]
#[error("invalid identifier: {0}")]
pub struct IdParseError(#[from] hex::FromHexError);

macro_rules! opaque_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From)]
        pub struct $name(Vec<u8>);

        impl $name {
            /// Wrap a raw byte string as received from the daemon.
            pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
                Self(bytes.into())
            }

            /// The all-zero sentinel used as the root document id.
            pub fn zero() -> Self {
                Self(Vec::new())
            }

            /// Whether this is the all-zero sentinel.
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            /// Raw bytes as handed to/from the wire protocol.
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// Consume and return the raw bytes.
            pub fn into_bytes(self) -> Vec<u8> {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0))
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(hex::decode(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::zero()
            }
        }
    };
}

opaque_id!(DocId, "A document identifier, stable across all of a document's revisions.");
opaque_id!(RevId, "A revision identifier: the content hash of an immutable snapshot.");
opaque_id!(PartId, "The name of an attachment part within a revision (e.g. `FILE`, `META`).");

impl PartId {
    /// The conventional main content attachment.
    pub fn file() -> Self {
        Self(b"FILE".to_vec())
    }

    /// The conventional metadata attachment.
    pub fn meta() -> Self {
        Self(b"META".to_vec())
    }

    /// The conventional structured-value attachment.
    pub fn pdsd() -> Self {
        Self(b"PDSD".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_root_sentinel() {
        let root = DocId::zero();
        assert!(root.is_zero());
        assert_eq!(root.as_bytes(), &[] as &[u8]);
    }

    #[test]
    fn hex_round_trip() {
        let id = DocId::new(vec![0xAA, 0xBB, 0xCC]);
        let s = id.to_string();
        assert_eq!(s, "aabbcc");
        let parsed: DocId = s.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn ordering_is_lexicographic_on_bytes() {
        let a = DocId::new(vec![0x01]);
        let b = DocId::new(vec![0x02]);
        assert!(a < b);
    }

    #[test]
    fn bad_hex_is_rejected() {
        assert!("zz".parse::<DocId>().is_err());
    }
}
