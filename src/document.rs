//! The document session state machine: `Closed -> Open(Peek|Update|Resume)`,
//! structured data access, and chunked attachment I/O (spec §4.3).

use crate::client::Client;
use crate::error::Error;
use crate::ids::{DocId, PartId, RevId};
use crate::link::Link;
use crate::proto;
use crate::value::Value;
use crate::wire::MessageType;

/// Which of the three ways a session was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read-only view of an immutable revision.
    Peek,
    /// Read/write view of a document's current head, opened for editing.
    Update,
    /// Read/write view of a previously suspended (preliminary) revision.
    Resume,
}

struct OpenState {
    handle: u32,
    mode: Mode,
    type_code: String,
}

/// A session on a document or revision. Holds an opaque daemon-assigned
/// handle while open; [`Document::commit`]/[`Document::suspend`]/
/// [`Document::close`] transition it back to closed.
///
/// On drop, if still open, issues a best-effort `Close` (spec §5's resource
/// discipline: errors from this fire-and-forget close are not observable).
pub struct Document {
    client: Client,
    store: DocId,
    link: Link,
    state: Option<OpenState>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("store", &self.store)
            .field("link", &self.link)
            .field("mode", &self.state.as_ref().map(|s| s.mode))
            .finish()
    }
}

impl Document {
    /// Open a read-only session on a concrete revision. `link` must carry a
    /// resolved revision (any of the three link kinds, as long as it knows
    /// its rev).
    pub async fn peek(client: Client, store: DocId, link: Link) -> Result<Self, Error> {
        let rev = link.rev().cloned().ok_or_else(|| invalid_state("peek", "link has no resolved revision"))?;
        let cnf: proto::OpenCnf = client
            .call(MessageType::Peek, &proto::OpenReq { store: store.clone(), target: rev.into_bytes() })
            .await?;
        Ok(Document { client, store, link, state: Some(OpenState { handle: cnf.handle, mode: Mode::Peek, type_code: cnf.type_code }) })
    }

    /// Open a read/write session on a document's current head. `link` must
    /// be a [`Link::DocHead`].
    pub async fn update(client: Client, store: DocId, link: Link) -> Result<Self, Error> {
        let doc = match &link {
            Link::DocHead { doc, .. } => doc.clone(),
            _ => return Err(invalid_state("update", "link is not a DocHead")),
        };
        let cnf: proto::OpenCnf = client
            .call(MessageType::Update, &proto::OpenReq { store: store.clone(), target: doc.into_bytes() })
            .await?;
        Ok(Document { client, store, link, state: Some(OpenState { handle: cnf.handle, mode: Mode::Update, type_code: cnf.type_code }) })
    }

    /// Resume a previously suspended revision. `link` must be a [`Link::DocPreRev`].
    pub async fn resume(client: Client, store: DocId, link: Link) -> Result<Self, Error> {
        let rev = match &link {
            Link::DocPreRev { rev, .. } => rev.clone(),
            _ => return Err(invalid_state("resume", "link is not a DocPreRev")),
        };
        let cnf: proto::OpenCnf = client
            .call(MessageType::Resume, &proto::OpenReq { store: store.clone(), target: rev.into_bytes() })
            .await?;
        Ok(Document { client, store, link, state: Some(OpenState { handle: cnf.handle, mode: Mode::Resume, type_code: cnf.type_code }) })
    }

    /// The link this session currently tracks. Updated in place by
    /// [`Self::commit`]/[`Self::suspend`].
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Whether the session still holds an open daemon handle.
    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// The mode the session was opened with, if still open.
    pub fn mode(&self) -> Option<Mode> {
        self.state.as_ref().map(|s| s.mode)
    }

    /// The type code cached at open time (or last refreshed by [`Self::refresh_type`]).
    pub fn type_code(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.type_code.as_str())
    }

    fn require_open(&self, op: &'static str) -> Result<u32, Error> {
        self.state.as_ref().map(|s| s.handle).ok_or_else(|| invalid_state(op, "session is closed"))
    }

    fn require_writable(&self, op: &'static str) -> Result<u32, Error> {
        match &self.state {
            Some(s) if s.mode != Mode::Peek => Ok(s.handle),
            Some(_) => Err(invalid_state(op, "session is peek-only")),
            None => Err(invalid_state(op, "session is closed")),
        }
    }

    /// Read the structured `Value` at `path` inside the open revision.
    pub async fn get(&self, path: &str) -> Result<Value, Error> {
        let handle = self.require_open("get")?;
        let cnf: proto::GetDataCnf = self
            .client
            .call(MessageType::GetData, &proto::GetDataReq { handle, path: path.to_string() })
            .await?;
        Ok(Value::decode(&cnf.value, &self.store)?)
    }

    /// Replace the structured payload subtree at `path`.
    pub async fn set(&self, path: &str, value: &Value) -> Result<(), Error> {
        let handle = self.require_writable("set")?;
        let encoded = value.encode().to_vec();
        let _: proto::SetDataCnf = self
            .client
            .call(MessageType::SetData, &proto::SetDataReq { handle, path: path.to_string(), value: encoded })
            .await?;
        Ok(())
    }

    /// Read up to `max_size` bytes of an attachment starting at offset 0,
    /// issuing `Read` RPCs of at most `max_packet_size` bytes each until a
    /// short read (EOF) or `max_size` is reached.
    pub async fn read(&self, part: PartId, max_size: u64) -> Result<Vec<u8>, Error> {
        let handle = self.require_open("read")?;
        let mps = self.client.max_packet_size().max(1) as u64;
        let mut buf = Vec::new();
        let mut offset: u64 = 0;
        loop {
            let remaining = max_size.saturating_sub(buf.len() as u64);
            if remaining == 0 {
                break;
            }
            let want = remaining.min(mps) as u32;
            let cnf: proto::ReadCnf = self
                .client
                .call(MessageType::Read, &proto::ReadReq { handle, part: part.clone(), offset, length: want })
                .await?;
            let n = cnf.data.len() as u32;
            offset += n as u64;
            buf.extend_from_slice(&cnf.data);
            if n < want {
                break;
            }
        }
        Ok(buf)
    }

    /// Resize an attachment (`Trunc`).
    pub async fn resize(&self, part: PartId, size: u64) -> Result<(), Error> {
        let handle = self.require_writable("resize")?;
        let _: proto::TruncCnf = self
            .client
            .call(MessageType::Trunc, &proto::TruncReq { handle, part, size })
            .await?;
        Ok(())
    }

    /// Write `data` to an attachment starting at offset 0: every chunk but
    /// the last goes out as `WriteBuffer`, the last (possibly empty) chunk
    /// as `WriteCommit` (spec §4.3).
    pub async fn write(&self, part: PartId, data: &[u8]) -> Result<(), Error> {
        let handle = self.require_writable("write")?;
        let mps = self.client.max_packet_size().max(1) as usize;
        let mut offset: u64 = 0;
        let mut remaining = data;
        while remaining.len() > mps {
            let (chunk, rest) = remaining.split_at(mps);
            let _: proto::WriteBufferCnf = self
                .client
                .call(
                    MessageType::WriteBuffer,
                    &proto::WriteBufferReq { handle, part: part.clone(), offset, data: chunk.to_vec() },
                )
                .await?;
            offset += chunk.len() as u64;
            remaining = rest;
        }
        let _: proto::WriteCommitCnf = self
            .client
            .call(
                MessageType::WriteCommit,
                &proto::WriteCommitReq { handle, part, offset, data: remaining.to_vec() },
            )
            .await?;
        Ok(())
    }

    /// `resize(0); resize(len); write(data)` — the leading zero-resize makes
    /// the subsequent grow copy-on-write cheap at the store backend (spec §4.3).
    pub async fn write_all(&self, part: PartId, data: &[u8]) -> Result<(), Error> {
        self.resize(part.clone(), 0).await?;
        self.resize(part.clone(), data.len() as u64).await?;
        self.write(part, data).await
    }

    /// Re-query the session's type code from the daemon, updating the cached value.
    pub async fn refresh_type(&mut self) -> Result<&str, Error> {
        let handle = self.require_open("get_type")?;
        let cnf: proto::GetTypeCnf = self.client.call(MessageType::GetType, &proto::GetTypeReq { handle }).await?;
        let state = self.state.as_mut().expect("require_open verified Some");
        state.type_code = cnf.type_code;
        Ok(state.type_code.as_str())
    }

    /// Doc-links and rev-links embedded in the open revision's payload,
    /// used by the folder prefetcher to discover children.
    pub async fn links(&self) -> Result<(Vec<(DocId, DocId)>, Vec<(DocId, RevId)>), Error> {
        let handle = self.require_open("get_links")?;
        let cnf: proto::GetLinksCnf = self.client.call(MessageType::GetLinks, &proto::GetLinksReq { handle }).await?;
        Ok((cnf.doc_links, cnf.rev_links))
    }

    /// The filesystem path backing this revision, if the store exposes one.
    pub async fn path(&self) -> Result<Option<String>, Error> {
        let handle = self.require_open("get_path")?;
        let cnf: proto::GetPathCnf = self.client.call(MessageType::GetPath, &proto::GetPathReq { handle }).await?;
        Ok(cnf.path)
    }

    /// Commit pending changes as a new revision, updating the tracked link
    /// to the new [`Link::DocHead`]. Not valid on a `Peek` session.
    pub async fn commit(&mut self, comment: impl Into<String>) -> Result<RevId, Error> {
        let handle = self.require_writable("commit")?;
        let cnf: proto::CommitCnf = self
            .client
            .call(MessageType::Commit, &proto::CommitReq { handle, comment: comment.into() })
            .await?;
        let doc = self.link.doc().cloned().expect("writable session link always names a document");
        self.link = Link::to_doc_at(self.store.clone(), doc, cnf.rev.clone());
        self.state = None;
        Ok(cnf.rev)
    }

    /// Suspend pending changes as a preliminary revision, updating the
    /// tracked link to the new [`Link::DocPreRev`]. Not valid on a `Peek` session.
    pub async fn suspend(&mut self, comment: impl Into<String>) -> Result<RevId, Error> {
        let handle = self.require_writable("suspend")?;
        let cnf: proto::SuspendCnf = self
            .client
            .call(MessageType::Suspend, &proto::SuspendReq { handle, comment: comment.into() })
            .await?;
        let doc = self.link.doc().cloned().expect("writable session link always names a document");
        self.link = Link::to_pre_rev(self.store.clone(), doc, cnf.rev.clone());
        self.state = None;
        Ok(cnf.rev)
    }

    /// Close the session, abandoning any uncommitted changes. Idempotent.
    pub async fn close(&mut self) -> Result<(), Error> {
        let Some(state) = self.state.take() else { return Ok(()) };
        let _: proto::CloseCnf = self.client.call(MessageType::Close, &proto::CloseReq { handle: state.handle }).await?;
        Ok(())
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let client = self.client.clone();
            tokio::spawn(async move {
                let _: Result<proto::CloseCnf, Error> =
                    client.call(MessageType::Close, &proto::CloseReq { handle: state.handle }).await;
            });
        }
    }
}

fn invalid_state(operation: &'static str, detail: &str) -> Error {
    Error::InvalidLinkState { operation, detail: detail.to_string() }
}
