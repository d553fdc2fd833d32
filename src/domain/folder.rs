//! `Folder::lookup`: resolve a `"store-label:dotted/path"` string to the
//! links it names, by one `WalkPath` RPC (spec §4.6).

use crate::client::Client;
use crate::error::Error;
use crate::link::Link;

/// Resolve every link a path names.
///
/// `WalkPath` only ever hands back unresolved `(store, doc)` pairs; callers
/// that need a revision (e.g. for [`crate::document::Document::peek`]) call
/// [`Link::resolve`] on the result.
pub async fn lookup(client: &Client, path: impl Into<String>) -> Result<Vec<Link>, Error> {
    let pairs = client.walk_path(path).await?;
    Ok(pairs.into_iter().map(|(store, doc)| Link::to_doc(store, doc)).collect())
}

/// Resolve a path expected to name exactly one link.
///
/// Returns `None` if the path resolves to zero or more than one link,
/// mirroring the original client's `lookupSingle` (an invalid link for
/// anything but a single match).
pub async fn lookup_single(client: &Client, path: impl Into<String>) -> Result<Option<Link>, Error> {
    let mut links = lookup(client, path).await?;
    if links.len() == 1 {
        Ok(links.pop())
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::ids::DocId;
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

    /// Mock daemon that answers the handshake, then replies to every
    /// `WalkPath` request with the same fixed set of links.
    async fn connect_test_client(links: Vec<(DocId, DocId)>) -> Client {
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
                    MessageType::WalkPath => {
                        proto::encode(&proto::WalkPathCnf { links: links.clone() }).unwrap()
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
    async fn lookup_single_returns_none_for_zero_or_many_matches() {
        let doc_a = DocId::new(vec![1]);
        let doc_b = DocId::new(vec![2]);
        let store = DocId::new(vec![0xAA]);

        let client = connect_test_client(vec![]).await;
        assert_eq!(lookup_single(&client, "nowhere").await.unwrap(), None);

        let client =
            connect_test_client(vec![(store.clone(), doc_a.clone()), (store.clone(), doc_b)]).await;
        assert_eq!(lookup_single(&client, "ambiguous").await.unwrap(), None);

        let client = connect_test_client(vec![(store.clone(), doc_a.clone())]).await;
        assert_eq!(
            lookup_single(&client, "sys:fstab").await.unwrap(),
            Some(Link::to_doc(store, doc_a))
        );
    }
}
