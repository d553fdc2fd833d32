//! The [`Link`] abstraction: a reference to a revision, a document head, or
//! a document's preliminary (suspended) revision, always scoped to a store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::error::Error;
use crate::ids::{DocId, IdParseError, RevId};

/// Error returned when a link URI cannot be parsed.
#[derive(Debug, thiserror::Error)]
pub enum LinkParseError {
    /// The URI did not start with a recognized scheme (`doc:` or `rev:`).
    #[error("unrecognized link URI scheme: {0:?}")]
    UnknownScheme(String),
    /// The URI was missing the store or id component.
    #[error("malformed link URI: {0:?}")]
    Malformed(String),
    /// One of the hex-encoded components was invalid.
    #[error(transparent)]
    Id(#[from] IdParseError),
}

/// A reference to a document or revision within a specific store.
///
/// See spec §3: a link is always in exactly one of these four states.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Link {
    /// No reference at all.
    Invalid,
    /// A concrete, immutable revision on a specific store.
    RevLink {
        /// The store the revision lives on.
        store: DocId,
        /// The revision.
        rev: RevId,
    },
    /// The current head of a document on a store.
    ///
    /// `rev` may be absent if this link has not yet been resolved against
    /// the daemon (see [`Link::is_resolved`]).
    DocHead {
        /// The store the document is mounted on.
        store: DocId,
        /// The document.
        doc: DocId,
        /// The last known head revision, if resolved.
        rev: Option<RevId>,
    },
    /// A named, uncommitted (suspended) revision of a document.
    DocPreRev {
        /// The store the document is mounted on.
        store: DocId,
        /// The document.
        doc: DocId,
        /// The preliminary revision.
        rev: RevId,
    },
}

impl Default for Link {
    fn default() -> Self {
        Link::Invalid
    }
}

impl Link {
    /// Build a link to a concrete revision.
    pub fn to_rev(store: DocId, rev: RevId) -> Self {
        Link::RevLink { store, rev }
    }

    /// Build an unresolved link to a document's current head.
    pub fn to_doc(store: DocId, doc: DocId) -> Self {
        Link::DocHead { store, doc, rev: None }
    }

    /// Build a link to a document's head, already knowing the current revision.
    pub fn to_doc_at(store: DocId, doc: DocId, rev: RevId) -> Self {
        Link::DocHead { store, doc, rev: Some(rev) }
    }

    /// Build a link to a preliminary (suspended) revision.
    pub fn to_pre_rev(store: DocId, doc: DocId, rev: RevId) -> Self {
        Link::DocPreRev { store, doc, rev }
    }

    /// Whether this link refers to a document (head or preliminary revision)
    /// as opposed to a bare immutable revision.
    pub fn is_doc_link(&self) -> bool {
        matches!(self, Link::DocHead { .. } | Link::DocPreRev { .. })
    }

    /// Whether this link is anything other than [`Link::Invalid`].
    pub fn is_valid(&self) -> bool {
        !matches!(self, Link::Invalid)
    }

    /// Whether a [`Link::DocHead`] already carries a resolved revision.
    /// Always `true` for [`Link::RevLink`] and [`Link::DocPreRev`].
    pub fn is_resolved(&self) -> bool {
        match self {
            Link::Invalid => false,
            Link::RevLink { .. } | Link::DocPreRev { .. } => true,
            Link::DocHead { rev, .. } => rev.is_some(),
        }
    }

    /// The store this link is scoped to, if valid.
    pub fn store(&self) -> Option<&DocId> {
        match self {
            Link::Invalid => None,
            Link::RevLink { store, .. } => Some(store),
            Link::DocHead { store, .. } => Some(store),
            Link::DocPreRev { store, .. } => Some(store),
        }
    }

    /// The document id, if this is a doc link.
    pub fn doc(&self) -> Option<&DocId> {
        match self {
            Link::DocHead { doc, .. } => Some(doc),
            Link::DocPreRev { doc, .. } => Some(doc),
            _ => None,
        }
    }

    /// The revision id, if known.
    pub fn rev(&self) -> Option<&RevId> {
        match self {
            Link::RevLink { rev, .. } => Some(rev),
            Link::DocPreRev { rev, .. } => Some(rev),
            Link::DocHead { rev, .. } => rev.as_ref(),
            Link::Invalid => None,
        }
    }

    /// Replace the resolved revision of a [`Link::DocHead`] in place.
    ///
    /// Only valid on [`Link::DocHead`]; used by [`crate::Client::resolve`]
    /// after a successful lookup. Does nothing on any other variant.
    pub(crate) fn set_resolved_rev(&mut self, rev: RevId) {
        if let Link::DocHead { rev: slot, .. } = self {
            *slot = Some(rev);
        }
    }

    /// Resolve a [`Link::DocHead`] against the daemon's current head for its
    /// document, replacing its `rev` field in place.
    ///
    /// A no-op on [`Link::RevLink`] and [`Link::DocPreRev`] (already
    /// resolved) and on [`Link::Invalid`]. On failure, the link is left
    /// untouched: its kind, and any revision it already carried, are never
    /// mutated.
    pub async fn resolve(&mut self, client: &Client) -> Result<(), Error> {
        let (store, doc) = match self {
            Link::DocHead { store, doc, .. } => (store.clone(), doc.clone()),
            _ => return Ok(()),
        };
        let cnf = client.lookup_doc(doc.clone(), Some(store.clone())).await?;
        let rev = cnf
            .heads
            .into_iter()
            .find(|(s, _)| *s == store)
            .map(|(_, rev)| rev)
            .ok_or_else(|| Error::InvalidLinkState {
                operation: "resolve head",
                detail: format!("store {store} has no head for document {doc}"),
            })?;
        self.set_resolved_rev(rev);
        Ok(())
    }

    /// Format as a `doc:<store>:<doc>` or `rev:<store>:<rev>` URI.
    ///
    /// [`Link::DocPreRev`] has no URI form (it exists only as a transient
    /// session-tracking value); formatting one returns an empty string, the
    /// way the original C++ client returns an empty `QString` for it.
    pub fn uri(&self) -> String {
        match self {
            Link::Invalid => String::new(),
            Link::RevLink { store, rev } => format!("rev:{store}:{rev}"),
            Link::DocHead { store, doc, .. } => format!("doc:{store}:{doc}"),
            Link::DocPreRev { .. } => String::new(),
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

impl FromStr for Link {
    type Err = LinkParseError;

    /// Parse a `doc:<storeHex>:<docHex>` or `rev:<storeHex>:<revHex>` URI.
    ///
    /// Malformed or non-hex input is rejected rather than silently producing
    /// [`Link::Invalid`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| LinkParseError::Malformed(s.to_string()))?;
        let mut parts = rest.splitn(2, ':');
        let store_hex = parts
            .next()
            .ok_or_else(|| LinkParseError::Malformed(s.to_string()))?;
        let id_hex = parts
            .next()
            .ok_or_else(|| LinkParseError::Malformed(s.to_string()))?;
        if store_hex.is_empty() || id_hex.is_empty() {
            return Err(LinkParseError::Malformed(s.to_string()));
        }
        let store: DocId = store_hex.parse()?;
        match scheme {
            "doc" => {
                let doc: DocId = id_hex.parse()?;
                Ok(Link::DocHead { store, doc, rev: None })
            }
            "rev" => {
                let rev: RevId = id_hex.parse()?;
                Ok(Link::RevLink { store, rev })
            }
            other => Err(LinkParseError::UnknownScheme(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DocId {
        DocId::new(vec![0xAA, 0xAA])
    }
    fn doc() -> DocId {
        DocId::new(vec![0xBB, 0xBB])
    }
    fn rev() -> RevId {
        RevId::new(vec![0xCC, 0xCC])
    }

    #[test]
    fn is_doc_link_matches_spec_invariant() {
        assert!(!Link::Invalid.is_doc_link());
        assert!(!Link::to_rev(store(), rev()).is_doc_link());
        assert!(Link::to_doc(store(), doc()).is_doc_link());
        assert!(Link::to_pre_rev(store(), doc(), rev()).is_doc_link());
    }

    #[test]
    fn is_valid_matches_spec_invariant() {
        assert!(!Link::Invalid.is_valid());
        assert!(Link::to_rev(store(), rev()).is_valid());
        assert!(Link::to_doc(store(), doc()).is_valid());
    }

    #[test]
    fn rev_link_uri_round_trips() {
        let l = Link::to_rev(store(), rev());
        let parsed: Link = l.uri().parse().unwrap();
        assert_eq!(parsed, l);
    }

    #[test]
    fn doc_head_uri_round_trips_ignoring_rev() {
        let l = Link::to_doc_at(store(), doc(), rev());
        let uri = l.uri();
        assert_eq!(uri, format!("doc:{}:{}", store(), doc()));
        let parsed: Link = uri.parse().unwrap();
        // parsing never recovers the resolved rev, matching spec §8.
        assert_eq!(parsed, Link::to_doc(store(), doc()));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!("blob:aa:bb".parse::<Link>().is_err());
    }

    #[test]
    fn malformed_uri_is_rejected() {
        assert!("doc:aa".parse::<Link>().is_err());
        assert!("doc::".parse::<Link>().is_err());
        assert!("garbage".parse::<Link>().is_err());
    }

    #[test]
    fn set_resolved_rev_only_affects_dochead() {
        let mut l = Link::to_doc(store(), doc());
        l.set_resolved_rev(rev());
        assert_eq!(l, Link::to_doc_at(store(), doc(), rev()));

        let mut r = Link::to_rev(store(), rev());
        let before = r.clone();
        r.set_resolved_rev(RevId::new(vec![1]));
        assert_eq!(r, before);
    }

    /// Mock daemon that answers the handshake, then replies to every
    /// `LookupDoc` request with a single fixed head.
    async fn connect_test_client(heads: Vec<(DocId, RevId)>) -> Client {
        use bytes::{Bytes, BytesMut};
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        use crate::metrics::Metrics;
        use crate::proto;
        use crate::transport::Transport;
        use crate::wire::{Flag, Frame, MessageType};

        async fn read_one_frame(sock: &mut TcpStream, buf: &mut BytesMut) -> Option<Frame> {
            loop {
                if let Some(total) = Frame::peek_total_len(buf) {
                    if buf.len() >= total {
                        let raw = buf.split_to(total);
                        return Frame::decode(&raw).ok();
                    }
                }
                let mut chunk = [0u8; 4096];
                let n = sock.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();

            let init = read_one_frame(&mut sock, &mut buf).await.unwrap();
            let cnf_body = proto::encode(&proto::InitCnf { major: 1, minor: 0, max_packet_size: 16384 }).unwrap();
            let cnf = Frame { reference: init.reference, flag: Flag::Cnf, message_type: MessageType::Init, payload: Bytes::from(cnf_body) };
            sock.write_all(&cnf.encode()).await.unwrap();

            while let Some(frame) = read_one_frame(&mut sock, &mut buf).await {
                let body = match frame.message_type {
                    MessageType::LookupDoc => {
                        proto::encode(&proto::LookupDocCnf { heads: heads.clone(), pre_revs: Vec::new() }).unwrap()
                    }
                    _ => Vec::new(),
                };
                let reply = Frame { reference: frame.reference, flag: Flag::Cnf, message_type: frame.message_type, payload: Bytes::from(body) };
                if sock.write_all(&reply.encode()).await.is_err() {
                    break;
                }
            }
        });

        let metrics = Arc::new(Metrics::new());
        let (transport, indications) =
            Transport::connect((addr.ip().to_string(), addr.port()), metrics.clone()).await.unwrap();
        Client::from_transport(transport, indications, vec![0xAB], metrics).await.unwrap()
    }

    #[tokio::test]
    async fn resolve_fills_in_dochead_revision() {
        let client = connect_test_client(vec![(store(), rev())]).await;
        let mut l = Link::to_doc(store(), doc());
        l.resolve(&client).await.unwrap();
        assert_eq!(l, Link::to_doc_at(store(), doc(), rev()));
    }

    #[tokio::test]
    async fn resolve_is_a_no_op_on_already_resolved_links() {
        let client = connect_test_client(vec![]).await;
        let mut l = Link::to_rev(store(), rev());
        let before = l.clone();
        l.resolve(&client).await.unwrap();
        assert_eq!(l, before);
    }

    #[tokio::test]
    async fn resolve_leaves_link_untouched_on_failure() {
        // No matching store in the daemon's reply: resolution fails, and the
        // link keeps its prior (unresolved) state rather than being mutated.
        let client = connect_test_client(vec![]).await;
        let mut l = Link::to_doc(store(), doc());
        let before = l.clone();
        assert!(l.resolve(&client).await.is_err());
        assert_eq!(l, before);
    }
}
