//! Typed request/response bodies, one `serde`-derived struct pair per
//! message in the catalog (`src/wire.rs`). Bodies are encoded with
//! `postcard` (spec.md §6 leaves the exact on-wire schema opaque/external;
//! this crate only has to agree with itself, so a compact self-describing
//! `serde` wire format stands in for it).

use serde::{Deserialize, Serialize};

use crate::ids::{DocId, PartId, RevId};

/// Encode a request body.
pub fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(body)
}

/// Decode a response body.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(bytes)
}

/// `Init` request: version + cookie handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitReq {
    /// Client-supported major version. Must be 1.
    pub major: u8,
    /// Client-supported minor version. Must be 0.
    pub minor: u8,
    /// Cookie bytes read verbatim from the endpoint discovery file.
    pub cookie: Vec<u8>,
}

/// `Init` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitCnf {
    /// Daemon-reported major version.
    pub major: u8,
    /// Daemon-reported minor version.
    pub minor: u8,
    /// Largest attachment fragment the daemon accepts per read/write RPC.
    pub max_packet_size: u32,
}

/// `Enum` request: list mounted stores.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnumReq;

/// A single mount as reported by `Enum`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountEntry {
    /// The store id.
    pub sid: DocId,
    /// Backend-specific source descriptor (e.g. a filesystem path).
    pub src: String,
    /// Backend type name.
    pub store_type: String,
    /// Human-readable label.
    pub label: String,
    /// Backend-specific option string.
    pub options: String,
    /// Whether this is one of the daemon's own system stores.
    pub is_system: bool,
}

/// `Enum` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnumCnf {
    /// Currently mounted stores.
    pub mounts: Vec<MountEntry>,
}

/// `LookupDoc` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupDocReq {
    /// The document to resolve.
    pub doc: DocId,
    /// Restrict the search to this store, if set.
    pub store: Option<DocId>,
}

/// `LookupDoc` confirmation: stores carrying a head and/or pre-revisions
/// for the document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LookupDocCnf {
    /// `(store, head rev)` pairs.
    pub heads: Vec<(DocId, RevId)>,
    /// `(store, pre-rev)` pairs.
    pub pre_revs: Vec<(DocId, RevId)>,
}

/// `Stat` request: read immutable revision metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatReq {
    /// The store the revision is on.
    pub store: DocId,
    /// The revision.
    pub rev: RevId,
}

/// A `(hash, size)` pair describing one attachment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentStat {
    /// Content hash of the attachment body.
    pub hash: Vec<u8>,
    /// Size in bytes.
    pub size: u64,
}

/// `Stat` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatCnf {
    /// Revision flags, daemon-defined bit field.
    pub flags: u32,
    /// Modification time, daemon clock, opaque units (seconds since epoch).
    pub mtime: i64,
    /// UTI / type code.
    pub type_code: String,
    /// Creator code (application identifier that wrote this revision).
    pub creator_code: String,
    /// Free-text comment.
    pub comment: String,
    /// Parent revisions this one was derived from.
    pub parents: Vec<RevId>,
    /// Per-attachment metadata, keyed by attachment name.
    pub attachments: Vec<(String, AttachmentStat)>,
}

/// `Peek` / `Update` / `Resume` request: open a session on a revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenReq {
    /// Store the document/revision lives on.
    pub store: DocId,
    /// The revision (peek) or document (update/resume) being opened.
    pub target: Vec<u8>,
}

/// `Peek` / `Update` / `Resume` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenCnf {
    /// Opaque session handle, scoped to the connection.
    pub handle: u32,
    /// The revision's type code, cached for the session's lifetime.
    pub type_code: String,
}

/// `Read` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReq {
    /// Session handle.
    pub handle: u32,
    /// Attachment name.
    pub part: PartId,
    /// Byte offset to read from.
    pub offset: u64,
    /// Maximum bytes to return; bounded by the negotiated packet size.
    pub length: u32,
}

/// `Read` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadCnf {
    /// The bytes read. Shorter than requested indicates EOF.
    pub data: Vec<u8>,
}

/// `Trunc` request: resize an attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncReq {
    /// Session handle.
    pub handle: u32,
    /// Attachment name.
    pub part: PartId,
    /// New size in bytes.
    pub size: u64,
}

/// `Trunc` confirmation (empty body).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TruncCnf;

/// `WriteBuffer` request: a non-final chunk of attachment data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBufferReq {
    /// Session handle.
    pub handle: u32,
    /// Attachment name.
    pub part: PartId,
    /// Byte offset this chunk starts at.
    pub offset: u64,
    /// The chunk's bytes, at most `max_packet_size` long.
    pub data: Vec<u8>,
}

/// `WriteBuffer` confirmation (empty body).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WriteBufferCnf;

/// `WriteCommit` request: the final chunk of a write, committing the
/// attachment at the given offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteCommitReq {
    /// Session handle.
    pub handle: u32,
    /// Attachment name.
    pub part: PartId,
    /// Byte offset this chunk starts at.
    pub offset: u64,
    /// The final chunk's bytes.
    pub data: Vec<u8>,
}

/// `WriteCommit` confirmation (empty body).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WriteCommitCnf;

/// `GetType` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTypeReq {
    /// Session handle.
    pub handle: u32,
}

/// `GetType` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTypeCnf {
    /// The session's type code.
    pub type_code: String,
}

/// `Commit` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReq {
    /// Session handle.
    pub handle: u32,
    /// Commit comment.
    pub comment: String,
}

/// `Commit` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitCnf {
    /// The newly created revision.
    pub rev: RevId,
}

/// `Suspend` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendReq {
    /// Session handle.
    pub handle: u32,
    /// Comment describing the suspended work.
    pub comment: String,
}

/// `Suspend` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendCnf {
    /// The newly created pre-revision.
    pub rev: RevId,
}

/// `Close` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseReq {
    /// Session handle.
    pub handle: u32,
}

/// `Close` confirmation (empty body).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CloseCnf;

/// What a watch target addresses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchKind {
    /// A document id.
    Doc,
    /// A revision id.
    Rev,
}

/// `WatchAdd` / `WatchRem` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchReq {
    /// Whether `id` is a doc or rev id.
    pub kind: WatchKind,
    /// The target id's raw bytes.
    pub id: Vec<u8>,
}

/// `WatchAdd` / `WatchRem` confirmation (empty body).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WatchCnf;

/// `WatchProgress` request: enable or disable the progress indication stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchProgressReq {
    /// `true` to start receiving progress indications, `false` to stop.
    pub enable: bool,
}

/// `WatchProgress` confirmation (empty body).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WatchProgressCnf;

/// `ReplicateDoc` request: ask the daemon to replicate a document between stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateDocReq {
    /// The document.
    pub doc: DocId,
    /// Source store.
    pub src_store: DocId,
    /// Destination store.
    pub dst_store: DocId,
    /// Daemon-defined replication mode/depth flags.
    pub mode: u32,
}

/// `ReplicateDoc` confirmation (empty body; progress is reported via indications).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicateDocCnf;

/// `Mount` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountReq {
    /// Backend-specific source descriptor.
    pub src: String,
    /// Backend type name.
    pub store_type: String,
    /// Human-readable label.
    pub label: String,
    /// Backend-specific option string.
    pub options: String,
}

/// `Mount` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountCnf {
    /// The newly mounted store's id.
    pub sid: DocId,
}

/// `Unmount` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmountReq {
    /// The store to unmount.
    pub sid: DocId,
}

/// `Unmount` confirmation (empty body).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UnmountCnf;

/// `GetPath` request: resolve a store-relative filesystem path, where supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPathReq {
    /// Session handle.
    pub handle: u32,
}

/// `GetPath` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPathCnf {
    /// The resolved path, if the backing store exposes one.
    pub path: Option<String>,
}

/// Watch event kinds delivered by a `Watch` indication.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEvent {
    /// An existing target's content changed.
    Modified,
    /// A target came into existence on a store.
    Appeared,
    /// A target was replicated to an additional store.
    Replicated,
    /// A target is no longer present on a store it was on (but exists elsewhere).
    Diminished,
    /// A target no longer exists anywhere.
    Disappeared,
}

/// `Watch` indication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchInd {
    /// Whether `element` is a doc or rev id.
    pub kind: WatchKind,
    /// The target id's raw bytes.
    pub element: Vec<u8>,
    /// What happened.
    pub event: WatchEvent,
    /// The store the event pertains to.
    pub store: DocId,
}

/// Progress task kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProgressKind {
    /// A sync operation between two stores.
    Sync,
    /// A document replication operation.
    Replication,
}

/// Progress task run state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProgressState {
    /// Actively making progress.
    Running,
    /// Temporarily paused.
    Paused,
    /// Failed; `error_code`/`error_item` are populated.
    Error,
}

/// `ProgressStart` request/indication: daemon announces a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressStartInd {
    /// Tag identifying this task for subsequent `Progress`/`ProgressEnd`.
    pub tag: u32,
    /// Sync or replication.
    pub kind: ProgressKind,
    /// Source store.
    pub src_store: DocId,
    /// Destination store.
    pub dst_store: DocId,
    /// The document being worked on, if task-scoped to one.
    pub item: Option<DocId>,
}

/// `Progress` indication: an update to a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressInd {
    /// The task being updated.
    pub tag: u32,
    /// Current run state.
    pub state: ProgressState,
    /// Daemon error code, meaningful only when `state == Error`.
    pub error_code: u16,
    /// The item that failed, meaningful only when `state == Error`.
    pub error_item: Option<DocId>,
    /// Completion estimate, parts per thousand.
    pub progress_permille: u16,
}

/// `ProgressEnd` request/indication: daemon announces task completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEndInd {
    /// The task that finished.
    pub tag: u32,
}

/// `ProgressQuery` request (empty body).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProgressQueryReq;

/// A single in-flight task as reported by the catch-up query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressQueryEntry {
    /// Matches [`ProgressStartInd::tag`] / [`ProgressInd::tag`].
    pub tag: u32,
    /// Sync or replication.
    pub kind: ProgressKind,
    /// Source store.
    pub src_store: DocId,
    /// Destination store.
    pub dst_store: DocId,
    /// The document being worked on, if task-scoped to one.
    pub item: Option<DocId>,
    /// Current run state.
    pub state: ProgressState,
    /// Daemon error code, meaningful only when `state == Error`.
    pub error_code: u16,
    /// The item that failed, meaningful only when `state == Error`.
    pub error_item: Option<DocId>,
    /// Completion estimate, parts per thousand.
    pub progress_permille: u16,
}

/// `ProgressQuery` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProgressQueryCnf {
    /// All tasks in flight at the moment of the query.
    pub tasks: Vec<ProgressQueryEntry>,
}

/// `WalkPath` request: resolve a `"store-label:dotted/path"` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkPathReq {
    /// The path to resolve.
    pub path: String,
}

/// `WalkPath` confirmation: every link the path resolved to (zero, one, or many).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WalkPathCnf {
    /// `(store, doc)` pairs, one per resolved link.
    pub links: Vec<(DocId, DocId)>,
}

/// `GetData` request: read the structured payload at a path inside the
/// session's open revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDataReq {
    /// Session handle.
    pub handle: u32,
    /// Slash-separated path into the structured payload.
    pub path: String,
}

/// `GetData` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDataCnf {
    /// The encoded `Value` bytes at `path` (spec §4.4 wire form).
    pub value: Vec<u8>,
}

/// `SetData` request: replace the structured payload at a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDataReq {
    /// Session handle.
    pub handle: u32,
    /// Slash-separated path into the structured payload.
    pub path: String,
    /// The encoded `Value` bytes to store at `path`.
    pub value: Vec<u8>,
}

/// `SetData` confirmation (empty body).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SetDataCnf;

/// `GetLinks` request: read the set of links embedded in the session's
/// open revision (used by the folder model to discover children).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLinksReq {
    /// Session handle.
    pub handle: u32,
}

/// `GetLinks` confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GetLinksCnf {
    /// `(store, doc)` pairs for every doc-link found in the payload.
    pub doc_links: Vec<(DocId, DocId)>,
    /// `(store, rev)` pairs for every rev-link found in the payload.
    pub rev_links: Vec<(DocId, RevId)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_req_round_trips() {
        let req = InitReq { major: 1, minor: 0, cookie: vec![0xAB, 0xCD] };
        let bytes = encode(&req).unwrap();
        let decoded: InitReq = decode(&bytes).unwrap();
        assert_eq!(decoded.major, 1);
        assert_eq!(decoded.cookie, vec![0xAB, 0xCD]);
    }

    #[test]
    fn watch_ind_round_trips() {
        let ind = WatchInd {
            kind: WatchKind::Doc,
            element: vec![1, 2, 3],
            event: WatchEvent::Modified,
            store: DocId::new(vec![9]),
        };
        let bytes = encode(&ind).unwrap();
        let decoded: WatchInd = decode(&bytes).unwrap();
        assert_eq!(decoded.event, WatchEvent::Modified);
        assert_eq!(decoded.store, DocId::new(vec![9]));
    }
}
