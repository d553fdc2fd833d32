//! The typed RPC façade: handshake, endpoint discovery, and the watch /
//! progress registries tied to a live [`Transport`] (spec §4.2).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::Endpoint;
use crate::error::Error;
use crate::ids::{DocId, RevId};
use crate::metrics::Metrics;
use crate::progress::{
    AttachAction, DetachAction, ProgressEntry, ProgressKind, ProgressRunState,
    ProgressSubscriber, ProgressSubscriptionId, ProgressTracker,
};
use crate::proto;
use crate::transport::Transport;
use crate::watch::{
    Subscriber, SubscriptionId, WatchEvent, WatchEventKind, WatchRegistry, WireCommand,
};
use crate::wire::MessageType;

/// The client-required protocol version (spec §4.2: "version must be (1,0);
/// mismatch is fatal").
const REQUIRED_MAJOR: u8 = 1;
const REQUIRED_MINOR: u8 = 0;

/// A live connection to the daemon: typed RPC calls, watch/progress
/// subscription management, and the negotiated packet-size budget.
#[derive(Clone)]
pub struct Client {
    transport: Transport,
    watches: Arc<WatchRegistry>,
    progress: Arc<ProgressTracker>,
    metrics: Arc<Metrics>,
    max_packet_size: Arc<AtomicU32>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("max_packet_size", &self.max_packet_size())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Discover the daemon endpoint (spec §4.2/§6) and connect.
    pub async fn connect_default() -> Result<Self, Error> {
        let endpoint = Endpoint::discover()?;
        Self::connect(endpoint).await
    }

    /// Connect to an explicit endpoint, performing the version handshake.
    pub async fn connect(endpoint: Endpoint) -> Result<Self, Error> {
        let metrics = Arc::new(Metrics::new());
        let (transport, indications) =
            Transport::connect((endpoint.host, endpoint.port), metrics.clone())
                .await
                .map_err(|_| Error::ConnReset)?;
        Self::handshake(transport, indications, endpoint.cookie, metrics).await
    }

    /// Wrap an already-connected transport (used by tests against a mock daemon).
    pub async fn from_transport(
        transport: Transport,
        indications: async_channel::Receiver<(MessageType, Bytes)>,
        cookie: Vec<u8>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        Self::handshake(transport, indications, cookie, metrics).await
    }

    async fn handshake(
        transport: Transport,
        indications: async_channel::Receiver<(MessageType, Bytes)>,
        cookie: Vec<u8>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, Error> {
        let req = proto::InitReq { major: REQUIRED_MAJOR, minor: REQUIRED_MINOR, cookie };
        let payload = Bytes::from(proto::encode(&req).map_err(|_| Error::BadRpc(MessageType::Init))?);
        let (ty, body) = transport.send_request(MessageType::Init, payload).await?;
        if ty != MessageType::Init {
            return Err(Error::BadRpc(ty));
        }
        let cnf: proto::InitCnf = proto::decode(&body).map_err(|_| Error::BadRpc(MessageType::Init))?;
        if cnf.major != REQUIRED_MAJOR || cnf.minor != REQUIRED_MINOR {
            return Err(Error::RpcMismatch { major: cnf.major, minor: cnf.minor });
        }
        debug!(max_packet_size = cnf.max_packet_size, "handshake complete");

        let client = Client {
            transport,
            watches: Arc::new(WatchRegistry::new()),
            progress: Arc::new(ProgressTracker::new()),
            metrics,
            max_packet_size: Arc::new(AtomicU32::new(cnf.max_packet_size)),
        };
        client.spawn_indication_pump(indications);
        Ok(client)
    }

    /// The negotiated maximum attachment-body fragment size, the unit
    /// [`crate::document::Document`] uses for chunked read/write.
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size.load(Ordering::Relaxed)
    }

    /// Access to request counters, table sizes, etc.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    fn spawn_indication_pump(&self, indications: async_channel::Receiver<(MessageType, Bytes)>) {
        let watches = self.watches.clone();
        let progress = self.progress.clone();
        tokio::spawn(async move {
            while let Ok((ty, body)) = indications.recv().await {
                match ty {
                    MessageType::Watch => {
                        if let Ok(ind) = proto::decode::<proto::WatchInd>(&body) {
                            dispatch_watch_ind(&watches, ind);
                        }
                    }
                    MessageType::ProgressStart => {
                        if let Ok(ind) = proto::decode::<proto::ProgressStartInd>(&body) {
                            progress.on_start(progress_entry_from_start(ind));
                        }
                    }
                    MessageType::Progress => {
                        if let Ok(ind) = proto::decode::<proto::ProgressInd>(&body) {
                            progress.on_progress(
                                ind.tag,
                                progress_state_from_wire(ind.state),
                                ind.error_code,
                                ind.error_item,
                                ind.progress_permille,
                            );
                        }
                    }
                    MessageType::ProgressEnd => {
                        if let Ok(ind) = proto::decode::<proto::ProgressEndInd>(&body) {
                            progress.on_end(ind.tag);
                        }
                    }
                    other => {
                        trace!(?other, "unhandled indication type");
                    }
                }
            }
            debug!("indication pump exiting: channel closed");
        });
    }

    /// Issue a typed RPC: encode `req`, send it as `message_type`, and
    /// decode the confirmation as `Resp`. A daemon `Error` confirmation or
    /// a reply of the wrong type surfaces as [`Error`].
    pub(crate) async fn call<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        message_type: MessageType,
        req: &Req,
    ) -> Result<Resp, Error> {
        let payload =
            Bytes::from(proto::encode(req).map_err(|_| Error::BadRpc(message_type))?);
        let (ty, body) = self.transport.send_request(message_type, payload).await?;
        if ty != message_type {
            return Err(Error::BadRpc(ty));
        }
        proto::decode(&body).map_err(|_| Error::BadRpc(message_type))
    }

    /// List currently mounted stores.
    pub async fn enum_mounts(&self) -> Result<Vec<proto::MountEntry>, Error> {
        let cnf: proto::EnumCnf = self.call(MessageType::Enum, &proto::EnumReq).await?;
        Ok(cnf.mounts)
    }

    /// Resolve a document id to the stores carrying it.
    pub async fn lookup_doc(&self, doc: DocId, store: Option<DocId>) -> Result<proto::LookupDocCnf, Error> {
        self.call(MessageType::LookupDoc, &proto::LookupDocReq { doc, store }).await
    }

    /// Resolve a `"store-label:dotted/path"` string to zero, one, or many links.
    pub async fn walk_path(&self, path: impl Into<String>) -> Result<Vec<(DocId, DocId)>, Error> {
        let cnf: proto::WalkPathCnf = self
            .call(MessageType::WalkPath, &proto::WalkPathReq { path: path.into() })
            .await?;
        Ok(cnf.links)
    }

    // -- Watch registry -----------------------------------------------

    /// Subscribe to change events on a document. The daemon is told once
    /// per first subscriber (spec §4.2).
    pub async fn add_doc_watch(&self, doc: DocId, subscriber: Subscriber) -> Result<SubscriptionId, Error> {
        let (id, cmd) = self.watches.add_doc(doc, subscriber);
        self.apply_watch_command(cmd).await?;
        self.metrics.set_watch_table_size(self.watches.table_size());
        Ok(id)
    }

    /// Unsubscribe a document watch. The daemon is told once per last subscriber.
    pub async fn remove_doc_watch(&self, doc: &DocId, id: SubscriptionId) -> Result<(), Error> {
        let cmd = self.watches.remove_doc(doc, id);
        self.apply_watch_command(cmd).await?;
        self.metrics.set_watch_table_size(self.watches.table_size());
        Ok(())
    }

    /// Subscribe to change events on a revision. See [`Self::add_doc_watch`].
    pub async fn add_rev_watch(&self, rev: RevId, subscriber: Subscriber) -> Result<SubscriptionId, Error> {
        let (id, cmd) = self.watches.add_rev(rev, subscriber);
        self.apply_watch_command(cmd).await?;
        self.metrics.set_watch_table_size(self.watches.table_size());
        Ok(id)
    }

    /// Unsubscribe a revision watch. See [`Self::remove_doc_watch`].
    pub async fn remove_rev_watch(&self, rev: &RevId, id: SubscriptionId) -> Result<(), Error> {
        let cmd = self.watches.remove_rev(rev, id);
        self.apply_watch_command(cmd).await?;
        self.metrics.set_watch_table_size(self.watches.table_size());
        Ok(())
    }

    async fn apply_watch_command(&self, cmd: Option<WireCommand>) -> Result<(), Error> {
        let Some(cmd) = cmd else { return Ok(()) };
        let (message_type, req) = match cmd {
            WireCommand::AddDoc(doc) => (
                MessageType::WatchAdd,
                proto::WatchReq { kind: proto::WatchKind::Doc, id: doc.into_bytes() },
            ),
            WireCommand::RemDoc(doc) => (
                MessageType::WatchRem,
                proto::WatchReq { kind: proto::WatchKind::Doc, id: doc.into_bytes() },
            ),
            WireCommand::AddRev(rev) => (
                MessageType::WatchAdd,
                proto::WatchReq { kind: proto::WatchKind::Rev, id: rev.into_bytes() },
            ),
            WireCommand::RemRev(rev) => (
                MessageType::WatchRem,
                proto::WatchReq { kind: proto::WatchKind::Rev, id: rev.into_bytes() },
            ),
        };
        let _: proto::WatchCnf = self.call(message_type, &req).await?;
        Ok(())
    }

    // -- Progress tracker -----------------------------------------------

    /// Attach a progress subscriber. On first attach, enables the wire
    /// stream and performs the catch-up query (spec §4.2).
    pub async fn attach_progress(&self, subscriber: ProgressSubscriber) -> Result<ProgressSubscriptionId, Error> {
        let (id, action) = self.progress.attach(subscriber);
        if action == AttachAction::EnableAndCatchUp {
            let _: proto::WatchProgressCnf = self
                .call(MessageType::WatchProgress, &proto::WatchProgressReq { enable: true })
                .await?;
        }
        let cnf: proto::ProgressQueryCnf =
            self.call(MessageType::ProgressQuery, &proto::ProgressQueryReq).await?;
        let entries = cnf.tasks.into_iter().map(progress_entry_from_query).collect();
        self.progress.catch_up(entries, id);
        self.metrics.set_progress_table_size(self.progress.table_size());
        Ok(id)
    }

    /// Detach a progress subscriber. On last detach, disables the wire stream.
    pub async fn detach_progress(&self, id: ProgressSubscriptionId) -> Result<(), Error> {
        if self.progress.detach(id) == DetachAction::Disable {
            let _: proto::WatchProgressCnf = self
                .call(MessageType::WatchProgress, &proto::WatchProgressReq { enable: false })
                .await?;
        }
        self.metrics.set_progress_table_size(self.progress.table_size());
        Ok(())
    }
}

fn dispatch_watch_ind(watches: &WatchRegistry, ind: proto::WatchInd) {
    let kind = match ind.event {
        proto::WatchEvent::Modified => WatchEventKind::Modified,
        proto::WatchEvent::Appeared => WatchEventKind::Appeared,
        proto::WatchEvent::Replicated => WatchEventKind::Replicated,
        proto::WatchEvent::Diminished => WatchEventKind::Diminished,
        proto::WatchEvent::Disappeared => WatchEventKind::Disappeared,
    };
    let event = WatchEvent { kind, store: ind.store };
    match ind.kind {
        proto::WatchKind::Doc => watches.dispatch_doc(&DocId::new(ind.element), &event),
        proto::WatchKind::Rev => watches.dispatch_rev(&RevId::new(ind.element), &event),
    }
}

fn progress_kind_from_wire(kind: proto::ProgressKind) -> ProgressKind {
    match kind {
        proto::ProgressKind::Sync => ProgressKind::Sync,
        proto::ProgressKind::Replication => ProgressKind::Replication,
    }
}

fn progress_state_from_wire(state: proto::ProgressState) -> ProgressRunState {
    match state {
        proto::ProgressState::Running => ProgressRunState::Running,
        proto::ProgressState::Paused => ProgressRunState::Paused,
        proto::ProgressState::Error => ProgressRunState::Error,
    }
}

fn progress_entry_from_start(ind: proto::ProgressStartInd) -> ProgressEntry {
    ProgressEntry {
        tag: ind.tag,
        kind: progress_kind_from_wire(ind.kind),
        src_store: ind.src_store,
        dst_store: ind.dst_store,
        item: ind.item,
        state: ProgressRunState::Running,
        error_code: 0,
        error_item: None,
        progress_permille: 0,
    }
}

fn progress_entry_from_query(entry: proto::ProgressQueryEntry) -> ProgressEntry {
    ProgressEntry {
        tag: entry.tag,
        kind: progress_kind_from_wire(entry.kind),
        src_store: entry.src_store,
        dst_store: entry.dst_store,
        item: entry.item,
        state: progress_state_from_wire(entry.state),
        error_code: entry.error_code,
        error_item: entry.error_item,
        progress_permille: entry.progress_permille,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use bytes::BytesMut;
    use crate::wire::{Flag, Frame};

    async fn mock_daemon_handshake(max_packet_size: u32) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let frame = loop {
                if let Some(total) = Frame::peek_total_len(&buf) {
                    if buf.len() >= total {
                        let raw = buf.split_to(total);
                        break Frame::decode(&raw).unwrap();
                    }
                }
                let mut chunk = [0u8; 1024];
                let n = sock.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            };
            let cnf_body = proto::encode(&proto::InitCnf { major: 1, minor: 0, max_packet_size }).unwrap();
            let cnf = Frame { reference: frame.reference, flag: Flag::Cnf, message_type: MessageType::Init, payload: Bytes::from(cnf_body) };
            sock.write_all(&cnf.encode()).await.unwrap();
            // Keep the connection open so the indication pump doesn't exit.
            let mut idle = [0u8; 1];
            let _ = sock.read(&mut idle).await;
        });
        addr
    }

    #[tokio::test]
    async fn handshake_exposes_max_packet_size() {
        let addr = mock_daemon_handshake(16384).await;
        let endpoint = Endpoint { host: addr.ip().to_string(), port: addr.port(), cookie: vec![0xAB] };
        let client = Client::connect(endpoint).await.unwrap();
        assert_eq!(client.max_packet_size(), 16384);
    }
}
