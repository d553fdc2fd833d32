//! Read-only metadata queries: `RevInfo`, `DocInfo`, `LinkInfo`, and the
//! mount table (spec §4.6's "Info queries" row, spec §3).

use std::collections::HashMap;

use crate::client::Client;
use crate::error::{DaemonError, DaemonErrorCode, Error};
use crate::ids::{DocId, RevId};
use crate::link::Link;
use crate::proto::{self, AttachmentStat, MountEntry};
use crate::wire::MessageType;

/// Immutable metadata about a single revision (spec §3, `Stat` RPC).
#[derive(Debug, Clone, PartialEq)]
pub struct RevInfo {
    /// Daemon-defined revision flags.
    pub flags: u32,
    /// Modification time (seconds since epoch, daemon clock).
    pub mtime: i64,
    /// UTI / type code.
    pub type_code: String,
    /// Creator application code.
    pub creator_code: String,
    /// Free-text comment.
    pub comment: String,
    /// Parent revisions.
    pub parents: Vec<RevId>,
    /// Per-attachment hash and size, keyed by attachment name.
    pub attachments: HashMap<String, AttachmentStat>,
}

impl RevInfo {
    /// Fetch metadata for a revision on a store.
    pub async fn fetch(client: &Client, store: DocId, rev: RevId) -> Result<Self, Error> {
        let cnf: proto::StatCnf = client.call(MessageType::Stat, &proto::StatReq { store, rev }).await?;
        Ok(RevInfo {
            flags: cnf.flags,
            mtime: cnf.mtime,
            type_code: cnf.type_code,
            creator_code: cnf.creator_code,
            comment: cnf.comment,
            parents: cnf.parents,
            attachments: cnf.attachments.into_iter().collect(),
        })
    }

    /// The hash/size of the conventional main attachment, if present.
    pub fn file_stat(&self) -> Option<&AttachmentStat> {
        self.attachments.get("FILE")
    }
}

/// What a single store knows about a document: its current head (if any)
/// and any preliminary (suspended) revisions (spec §3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreRefs {
    /// The document's current head revision on this store, if it has one.
    pub head: Option<RevId>,
    /// Preliminary revisions suspended on this store.
    pub pre_revs: Vec<RevId>,
}

/// Every store's knowledge of a document, plus the inverse rev→stores
/// index (spec §4.6: "store → {head-link?, pre-rev-links[]}, and the
/// inverse rev → stores[] for both heads and pre-revs").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocInfo {
    /// The document this describes.
    pub doc: Option<DocId>,
    /// Forward index: store -> what it has.
    pub by_store: HashMap<DocId, StoreRefs>,
    /// Inverse index: head revision -> stores carrying it as head.
    pub heads_by_rev: HashMap<RevId, Vec<DocId>>,
    /// Inverse index: preliminary revision -> stores carrying it.
    pub pre_revs_by_rev: HashMap<RevId, Vec<DocId>>,
}

impl DocInfo {
    /// Resolve a document, optionally restricted to a single store.
    pub async fn fetch(client: &Client, doc: DocId, store: Option<DocId>) -> Result<Self, Error> {
        let cnf: proto::LookupDocCnf = client
            .call(MessageType::LookupDoc, &proto::LookupDocReq { doc: doc.clone(), store })
            .await?;
        let mut info = DocInfo { doc: Some(doc), ..Default::default() };
        for (store, rev) in cnf.heads {
            info.by_store.entry(store.clone()).or_default().head = Some(rev.clone());
            info.heads_by_rev.entry(rev).or_default().push(store);
        }
        for (store, rev) in cnf.pre_revs {
            info.by_store.entry(store.clone()).or_default().pre_revs.push(rev.clone());
            info.pre_revs_by_rev.entry(rev).or_default().push(store);
        }
        Ok(info)
    }

    /// Whether the document has a head anywhere.
    pub fn has_head(&self) -> bool {
        !self.heads_by_rev.is_empty()
    }
}

/// Whether the target a [`Link`] names currently exists, as reported by
/// the daemon (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// The link that was checked.
    pub link: Link,
    /// Whether the daemon confirms the target exists.
    pub exists: bool,
}

impl LinkInfo {
    /// Resolve whether `link` currently points at something real.
    pub async fn fetch(client: &Client, link: &Link) -> Result<Self, Error> {
        let exists = match link {
            Link::Invalid => false,
            Link::RevLink { store, rev } => match RevInfo::fetch(client, store.clone(), rev.clone()).await {
                Ok(_) => true,
                Err(Error::Daemon(DaemonError::Known(DaemonErrorCode::NoEnt))) => false,
                Err(err) => return Err(err),
            },
            Link::DocHead { store, doc, .. } => {
                let info = DocInfo::fetch(client, doc.clone(), Some(store.clone())).await?;
                info.by_store.get(store).is_some_and(|refs| refs.head.is_some())
            }
            Link::DocPreRev { store, doc, rev } => {
                let info = DocInfo::fetch(client, doc.clone(), Some(store.clone())).await?;
                info.by_store.get(store).is_some_and(|refs| refs.pre_revs.contains(rev))
            }
        };
        Ok(LinkInfo { link: link.clone(), exists })
    }
}

/// List the daemon's currently mounted stores (spec §4.6).
pub async fn mounts(client: &Client) -> Result<Vec<MountEntry>, Error> {
    client.enum_mounts().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_info_builds_forward_and_inverse_indices() {
        let mut info = DocInfo { doc: Some(DocId::new(vec![1])), ..Default::default() };
        let store_a = DocId::new(vec![0xAA]);
        let store_b = DocId::new(vec![0xBB]);
        let rev = RevId::new(vec![0xCC]);
        info.by_store.entry(store_a.clone()).or_default().head = Some(rev.clone());
        info.heads_by_rev.entry(rev.clone()).or_default().push(store_a.clone());
        info.by_store.entry(store_b.clone()).or_default().head = Some(rev.clone());
        info.heads_by_rev.entry(rev.clone()).or_default().push(store_b.clone());

        assert!(info.has_head());
        assert_eq!(info.heads_by_rev.get(&rev).unwrap().len(), 2);
        assert_eq!(info.by_store.get(&store_a).unwrap().head, Some(rev.clone()));
    }

    #[test]
    fn link_info_round_trips_through_struct() {
        let link = Link::Invalid;
        let info = LinkInfo { link: link.clone(), exists: false };
        assert_eq!(info.link, link);
        assert!(!info.exists);
    }
}
