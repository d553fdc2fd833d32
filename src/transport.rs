//! The connection actor: one `tokio::task` owning the `TcpStream`, a
//! pending-call table keyed by frame ref, and an indication fan-out
//! channel (spec §4.1).
//!
//! Grounded on the teacher's `actor.rs` `Action` enum + `oneshot::Sender`
//! reply pattern (one dedicated task owning a resource, callers send a
//! message and await a reply) and `engine.rs`'s `AbortOnDropHandle`
//! discipline for the owning task's handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::metrics::Metrics;
use crate::wire::{Flag, Frame, MessageType};

/// Bound on the actor's inbound command queue.
const COMMAND_CAP: usize = 256;
/// Bound on the indication fan-out channel.
const INDICATION_CAP: usize = 1024;

type PendingReply = oneshot::Sender<Result<(MessageType, Bytes), Error>>;

enum Command {
    Send {
        message_type: MessageType,
        payload: Bytes,
        reply: PendingReply,
    },
}

/// A handle to a running connection actor. Cheaply cloneable; the actor
/// task is aborted when the last clone is dropped.
#[derive(Clone)]
pub struct Transport {
    tx: mpsc::Sender<Command>,
    next_ref: Arc<AtomicU32>,
    _task: Arc<AbortOnDrop>,
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Transport {
    /// Connect to `addr` and spawn the connection actor.
    ///
    /// Returns the handle plus the indication receiver; the caller (the
    /// `Client`) is expected to drain indications on its own task.
    pub async fn connect(
        addr: (String, u16),
        metrics: Arc<Metrics>,
    ) -> std::io::Result<(Transport, async_channel::Receiver<(MessageType, Bytes)>)> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream, metrics))
    }

    /// Wrap an already-connected stream (used directly by tests against a
    /// mock daemon).
    pub fn from_stream(
        stream: TcpStream,
        metrics: Arc<Metrics>,
    ) -> (Transport, async_channel::Receiver<(MessageType, Bytes)>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAP);
        let (ind_tx, ind_rx) = async_channel::bounded(INDICATION_CAP);
        let next_ref = Arc::new(AtomicU32::new(1));
        let actor = Actor {
            stream,
            cmd_rx,
            ind_tx,
            pending: HashMap::new(),
            metrics,
            next_ref: next_ref.clone(),
        };
        let task = tokio::spawn(actor.run());
        let handle = Transport {
            tx: cmd_tx,
            next_ref,
            _task: Arc::new(AbortOnDrop(task)),
        };
        (handle, ind_rx)
    }

    /// Send a request and await the matching confirmation.
    ///
    /// The ref assigned to this request is unique and monotonically
    /// increasing across calls on this handle (spec §8's transport
    /// multiplexing property).
    pub async fn send_request(
        &self,
        message_type: MessageType,
        payload: Bytes,
    ) -> Result<(MessageType, Bytes), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Send { message_type, payload, reply })
            .await
            .map_err(|_| Error::ConnReset)?;
        rx.await.map_err(|_| Error::ConnReset)?
    }

    /// The ref that will be assigned to the next request, exposed only so
    /// deterministic tests can assert on assignment order.
    #[cfg(test)]
    pub(crate) fn peek_next_ref(&self) -> u32 {
        self.next_ref.load(Ordering::Relaxed)
    }
}

struct Actor {
    stream: TcpStream,
    cmd_rx: mpsc::Receiver<Command>,
    ind_tx: async_channel::Sender<(MessageType, Bytes)>,
    pending: HashMap<u32, PendingReply>,
    metrics: Arc<Metrics>,
    next_ref: Arc<AtomicU32>,
}

impl Actor {
    async fn run(mut self) {
        let mut read_buf = BytesMut::with_capacity(64 * 1024);
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => {
                            debug!("transport command channel closed, shutting down");
                            break;
                        }
                        Some(Command::Send { message_type, payload, reply }) => {
                            let r = self.next_ref.fetch_add(1, Ordering::Relaxed);
                            let frame = Frame::request(r, message_type, payload);
                            self.pending.insert(r, reply);
                            trace!(r, ?message_type, "sending request");
                            if let Err(err) = self.stream.write_all(&frame.encode()).await {
                                warn!(?err, "write failed, resetting connection");
                                self.fail_all(Error::ConnReset);
                                break;
                            }
                            self.metrics.record_request_sent();
                        }
                    }
                }
                frame = read_frame(&mut self.stream, &mut read_buf) => {
                    match frame {
                        Ok(Some(frame)) => self.on_frame(frame).await,
                        Ok(None) => {
                            debug!("daemon closed connection");
                            self.fail_all(Error::ConnReset);
                            break;
                        }
                        Err(err) => {
                            warn!(?err, "read failed, resetting connection");
                            self.fail_all(Error::ConnReset);
                            break;
                        }
                    }
                }
            }
        }
        self.ind_tx.close();
    }

    async fn on_frame(&mut self, frame: Frame) {
        match frame.flag {
            Flag::Cnf => {
                self.metrics.record_confirmation_received();
                if let Some(reply) = self.pending.remove(&frame.reference) {
                    let result = if frame.message_type == MessageType::Error {
                        let code = frame.payload.first().copied().unwrap_or(0) as u16
                            | ((frame.payload.get(1).copied().unwrap_or(0) as u16) << 8);
                        Err(Error::Daemon(code.into()))
                    } else {
                        Ok((frame.message_type, frame.payload))
                    };
                    let _ = reply.send(result);
                } else {
                    warn!(r = frame.reference, "confirmation for unknown ref");
                }
            }
            Flag::Ind | Flag::Rsp => {
                self.metrics.record_indication_dispatched();
                let _ = self.ind_tx.send((frame.message_type, frame.payload)).await;
            }
            Flag::Req => {
                warn!("unexpected REQ frame from daemon, ignoring");
            }
        }
    }

    fn fail_all(&mut self, err: Error) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(clone_error(&err)));
        }
    }
}

/// [`Error`] is not `Clone` (it wraps non-`Clone` sources); `ConnReset`
/// never carries a payload so reconstructing it is exact.
fn clone_error(err: &Error) -> Error {
    match err {
        Error::ConnReset => Error::ConnReset,
        _ => Error::ConnReset,
    }
}

/// Read exactly one frame from `stream`, using `buf` as a resumable
/// accumulation buffer across calls. Returns `Ok(None)` on clean EOF
/// before any bytes of a new frame arrived.
async fn read_frame(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> std::io::Result<Option<Frame>> {
    loop {
        if let Some(total) = Frame::peek_total_len(buf) {
            if buf.len() >= total {
                let frame_bytes = buf.split_to(total);
                return Ok(Frame::decode(&frame_bytes).ok());
            }
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    async fn mock_daemon_echo_reversed() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // Read three requests, then reply in order C, B, A.
            let mut frames = Vec::new();
            let mut buf = BytesMut::new();
            for _ in 0..3 {
                loop {
                    if let Some(total) = Frame::peek_total_len(&buf) {
                        if buf.len() >= total {
                            let raw = buf.split_to(total);
                            frames.push(Frame::decode(&raw).unwrap());
                            break;
                        }
                    }
                    let mut chunk = [0u8; 1024];
                    let n = sock.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
            for frame in frames.iter().rev() {
                let cnf = Frame {
                    reference: frame.reference,
                    flag: Flag::Cnf,
                    message_type: frame.message_type,
                    payload: frame.payload.clone(),
                };
                sock.write_all(&cnf.encode()).await.unwrap();
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn multiplexes_out_of_order_replies() {
        let (addr, _daemon) = mock_daemon_echo_reversed().await;
        let metrics = Arc::new(Metrics::new());
        let (transport, _inds) =
            Transport::connect((addr.ip().to_string(), addr.port()), metrics)
                .await
                .unwrap();

        let a = transport.send_request(MessageType::Read, Bytes::from_static(b"A"));
        let b = transport.send_request(MessageType::Read, Bytes::from_static(b"B"));
        let c = transport.send_request(MessageType::Read, Bytes::from_static(b"C"));
        let (ra, rb, rc) = tokio::join!(a, b, c);
        assert_eq!(ra.unwrap().1, Bytes::from_static(b"A"));
        assert_eq!(rb.unwrap().1, Bytes::from_static(b"B"));
        assert_eq!(rc.unwrap().1, Bytes::from_static(b"C"));
    }

    #[tokio::test]
    async fn refs_are_unique_and_monotonic() {
        let (addr, _daemon) = mock_daemon_echo_reversed().await;
        let metrics = Arc::new(Metrics::new());
        let (transport, _inds) =
            Transport::connect((addr.ip().to_string(), addr.port()), metrics)
                .await
                .unwrap();
        let before = transport.peek_next_ref();
        let _ = transport
            .send_request(MessageType::Read, Bytes::from_static(b"A"))
            .await;
        assert!(transport.peek_next_ref() > before);
    }

    #[tokio::test]
    async fn closed_connection_fails_pending_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });
        let metrics = Arc::new(Metrics::new());
        let (transport, _inds) =
            Transport::connect((addr.ip().to_string(), addr.port()), metrics)
                .await
                .unwrap();
        let result = transport
            .send_request(MessageType::Read, Bytes::from_static(b"A"))
            .await;
        assert!(matches!(result, Err(Error::ConnReset)));
    }
}
