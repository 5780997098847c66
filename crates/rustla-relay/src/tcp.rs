//! TCP relay between server processes.
//!
//! One coordinator process accepts worker connections. Each worker sends a
//! `Hello`, waits for `Welcome`, then publishes `Command` frames which the
//! coordinator forwards to every other worker. The coordinator holds no
//! viewer sockets itself.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustla_protocol::codec::{decode_frame, encode_frame};
use rustla_protocol::{RelayCommand, RelayFrame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::traits::{NodeId, Relay, RelayError, RelayInbox};

/// Read buffer size for relay sockets.
const READ_BUFFER_SIZE: usize = 4096;

struct Peer {
    node: String,
    outbox: mpsc::UnboundedSender<Bytes>,
}

type Peers = Arc<RwLock<HashMap<u64, Peer>>>;

/// Read the next complete frame, or `None` once the peer closes the socket.
async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<RelayFrame>, RelayError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decode_frame(buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

/// The fan-out hub workers connect to.
pub struct Coordinator {
    listener: TcpListener,
    peers: Peers,
}

impl Coordinator {
    /// Bind the coordinator.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;

        if let Ok(addr) = listener.local_addr() {
            info!("Relay coordinator listening on {}", addr);
        }

        Ok(Self {
            listener,
            peers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Get the local address this coordinator is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept workers and relay their commands until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting a connection fails.
    pub async fn serve(self) -> Result<(), RelayError> {
        let mut next_peer = 0u64;

        loop {
            let (stream, addr) = self.listener.accept().await?;
            next_peer += 1;
            let peer_id = next_peer;
            let peers = Arc::clone(&self.peers);

            debug!(peer = peer_id, %addr, "Accepted relay connection");

            tokio::spawn(async move {
                if let Err(e) = handle_peer(peer_id, stream, Arc::clone(&peers)).await {
                    warn!(peer = peer_id, error = %e, "Relay peer failed");
                }
                peers.write().await.remove(&peer_id);
            });
        }
    }
}

async fn handle_peer(peer_id: u64, stream: TcpStream, peers: Peers) -> Result<(), RelayError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let node = match read_frame(&mut reader, &mut buf).await? {
        Some(RelayFrame::Hello { node }) => node,
        Some(other) => {
            return Err(RelayError::Handshake(format!(
                "expected hello, got {:?}",
                other
            )))
        }
        None => return Ok(()),
    };

    // Welcome is queued before the peer becomes visible to fan-out, so it is
    // always the first frame the worker reads.
    let (outbox, mut queue) = mpsc::unbounded_channel::<Bytes>();
    outbox
        .send(encode_frame(&RelayFrame::Welcome)?)
        .map_err(|_| RelayError::Closed)?;
    peers.write().await.insert(
        peer_id,
        Peer {
            node: node.clone(),
            outbox,
        },
    );

    info!(peer = peer_id, node = %node, "Worker joined relay");

    let writer_task = tokio::spawn(async move {
        while let Some(data) = queue.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                debug!(error = %e, "Relay write failed");
                break;
            }
        }
    });

    let result = loop {
        match read_frame(&mut reader, &mut buf).await {
            Ok(Some(frame @ RelayFrame::Command { .. })) => {
                fan_out(peer_id, &peers, &frame).await;
            }
            Ok(Some(other)) => {
                warn!(peer = peer_id, frame = ?other, "Unexpected relay frame");
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    peers.write().await.remove(&peer_id);
    writer_task.abort();

    info!(peer = peer_id, node = %node, "Worker left relay");

    result
}

/// Forward a frame to every peer except the one it came from.
async fn fan_out(from: u64, peers: &Peers, frame: &RelayFrame) {
    let data = match encode_frame(frame) {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "Failed to encode relay frame");
            return;
        }
    };

    let peers = peers.read().await;
    let mut delivered = 0usize;
    for (id, peer) in peers.iter() {
        if *id == from {
            continue;
        }
        if peer.outbox.send(data.clone()).is_ok() {
            delivered += 1;
        } else {
            trace!(node = %peer.node, "Dropping relay frame for departed peer");
        }
    }

    trace!(from, recipients = delivered, "Relayed command");
}

/// A worker's link to the coordinator.
pub struct WorkerRelay {
    node: NodeId,
    writer: Mutex<OwnedWriteHalf>,
    reader_task: JoinHandle<()>,
}

impl WorkerRelay {
    /// Connect to a coordinator and complete the handshake.
    ///
    /// Commands published by other workers arrive on the returned inbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        node: impl Into<NodeId>,
    ) -> Result<(Self, RelayInbox), RelayError> {
        let node = node.into();
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        writer
            .write_all(&encode_frame(&RelayFrame::hello(node.as_str()))?)
            .await?;

        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        match read_frame(&mut reader, &mut buf).await? {
            Some(RelayFrame::Welcome) => {}
            Some(other) => {
                return Err(RelayError::Handshake(format!(
                    "expected welcome, got {:?}",
                    other
                )))
            }
            None => return Err(RelayError::Closed),
        }

        info!(node = %node, "Connected to relay coordinator");

        let (tx, inbox) = mpsc::unbounded_channel();
        let me = node.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, &mut buf).await {
                    Ok(Some(RelayFrame::Command { origin, command })) => {
                        trace!(node = %me, origin = %origin, command = command.name(), "Relay command");
                        if tx.send(command).is_err() {
                            break; // Inbox dropped
                        }
                    }
                    Ok(Some(other)) => {
                        warn!(node = %me, frame = ?other, "Unexpected relay frame");
                    }
                    Ok(None) => {
                        warn!(node = %me, "Relay coordinator closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!(node = %me, error = %e, "Relay read failed");
                        break;
                    }
                }
            }
        });

        let relay = Self {
            node,
            writer: Mutex::new(writer),
            reader_task,
        };
        Ok((relay, inbox))
    }

    /// Get this worker's node ID.
    #[must_use]
    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

#[async_trait]
impl Relay for WorkerRelay {
    async fn publish(&self, command: RelayCommand) -> Result<(), RelayError> {
        let data = encode_frame(&RelayFrame::command(self.node.as_str(), command))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

impl Drop for WorkerRelay {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustla_protocol::StreamId;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start_coordinator() -> SocketAddr {
        let coordinator = Coordinator::bind("127.0.0.1:0").await.unwrap();
        let addr = coordinator.local_addr().unwrap();
        tokio::spawn(coordinator.serve());
        addr
    }

    #[tokio::test]
    async fn test_commands_reach_other_workers() {
        let addr = start_coordinator().await;

        let (worker_a, mut inbox_a) = WorkerRelay::connect(addr, "a").await.unwrap();
        let (_worker_b, mut inbox_b) = WorkerRelay::connect(addr, "b").await.unwrap();
        let (_worker_c, mut inbox_c) = WorkerRelay::connect(addr, "c").await.unwrap();

        worker_a
            .publish(RelayCommand::UpdateRustlers(StreamId::new(31)))
            .await
            .unwrap();

        for inbox in [&mut inbox_b, &mut inbox_c] {
            let received = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap();
            assert_eq!(received, Some(RelayCommand::UpdateRustlers(StreamId::new(31))));
        }

        assert!(timeout(Duration::from_millis(100), inbox_a.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_commands_keep_order() {
        let addr = start_coordinator().await;

        let (worker_a, _inbox_a) = WorkerRelay::connect(addr, "a").await.unwrap();
        let (_worker_b, mut inbox_b) = WorkerRelay::connect(addr, "b").await.unwrap();

        worker_a
            .publish(RelayCommand::UpdateRustlers(StreamId::new(1)))
            .await
            .unwrap();
        worker_a.publish(RelayCommand::UpdateLobby).await.unwrap();

        let first = timeout(Duration::from_secs(2), inbox_b.recv()).await.unwrap();
        let second = timeout(Duration::from_secs(2), inbox_b.recv()).await.unwrap();
        assert_eq!(first, Some(RelayCommand::UpdateRustlers(StreamId::new(1))));
        assert_eq!(second, Some(RelayCommand::UpdateLobby));
    }

    #[tokio::test]
    async fn test_inbox_closes_when_coordinator_goes_away() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hangup = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let hello = read_frame(&mut stream, &mut buf).await.unwrap();
            assert!(matches!(hello, Some(RelayFrame::Hello { .. })));
            stream
                .write_all(&encode_frame(&RelayFrame::Welcome).unwrap())
                .await
                .unwrap();
        });

        let (_worker, mut inbox) = WorkerRelay::connect(addr, "orphan").await.unwrap();
        hangup.await.unwrap();

        let received = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap();
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn test_handshake_requires_hello() {
        let addr = start_coordinator().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let frame = encode_frame(&RelayFrame::command("rogue", RelayCommand::UpdateLobby)).unwrap();
        stream.write_all(&frame).await.unwrap();

        // The coordinator hangs up instead of welcoming us.
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
