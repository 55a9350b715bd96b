use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::peer::{ExtensionHandshake, HandShake, MessageFramer, PeerId, PeerMessage};

/// Peer -> engine backlog. Advertised to peers as `reqq`.
pub const PEER_IN_CHANNEL_CAPACITY: usize = 1000;
/// Engine -> peer backlog.
pub const PEER_OUT_CHANNEL_CAPACITY: usize = 2000;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Channel pair handed to a peer task: messages from the wire go up, wire
/// messages produced by the engine come down.
#[derive(Debug)]
pub struct PeerIPC {
    pub engine_tx: flume::Sender<PeerMessage>,
    pub wire_rx: flume::Receiver<PeerMessage>,
}

#[derive(Debug, Clone)]
pub struct PeerError {
    pub msg: String,
    pub cause: PeerErrorCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerErrorCause {
    Timeout,
    Connection,
    /// The peer violated the protocol; close, never ban.
    PeerLogic,
    Unhandled,
}

impl PeerError {
    pub fn new(cause: PeerErrorCause, msg: impl Into<String>) -> Self {
        Self {
            cause,
            msg: msg.into(),
        }
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(PeerErrorCause::Timeout, msg)
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(PeerErrorCause::Connection, msg)
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self::new(PeerErrorCause::PeerLogic, msg)
    }
}

impl<E> From<E> for PeerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            msg: err.into().to_string(),
            cause: PeerErrorCause::Unhandled,
        }
    }
}

/// A handshaked peer connection. Owns the socket; every byte after the
/// handshakes flows through [`Peer::run`].
#[derive(Debug)]
pub struct Peer {
    pub uuid: Uuid,
    pub addr: SocketAddr,
    pub handshake: HandShake,
    stream: Framed<TcpStream, MessageFramer>,
}

impl Peer {
    /// Dial and perform the BitTorrent handshake. Our extension handshake
    /// is sent right away when both sides support BEP 10; the remote's
    /// arrives later through the normal message loop.
    pub async fn connect(addr: SocketAddr, info_hash: [u8; 20], our_id: PeerId) -> anyhow::Result<Self> {
        let socket = TcpStream::connect(addr).await.context("dial peer")?;
        Self::establish(socket, addr, info_hash, our_id, true).await
    }

    /// Handshake an accepted incoming socket. The remote speaks first.
    pub async fn accept(
        socket: TcpStream,
        info_hash: [u8; 20],
        our_id: PeerId,
    ) -> anyhow::Result<Self> {
        let addr = socket.peer_addr().context("get peer addr")?;
        Self::establish(socket, addr, info_hash, our_id, false).await
    }

    async fn establish(
        mut socket: TcpStream,
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_id: PeerId,
        we_speak_first: bool,
    ) -> anyhow::Result<Self> {
        let ours = HandShake::new(info_hash, our_id);
        let theirs = if we_speak_first {
            socket
                .write_all(&ours.as_bytes())
                .await
                .context("send handshake")?;
            read_handshake(&mut socket).await?
        } else {
            let theirs = read_handshake(&mut socket).await?;
            socket
                .write_all(&ours.as_bytes())
                .await
                .context("send handshake")?;
            theirs
        };
        ensure!(
            theirs.info_hash == info_hash,
            "info hash mismatch in handshake"
        );
        ensure!(theirs.peer_id != our_id, "connected to ourselves");

        let mut stream = Framed::new(socket, MessageFramer);
        if ours.supports_extensions() && theirs.supports_extensions() {
            let handshake = PeerMessage::ExtensionHandshake {
                payload: Box::new(ExtensionHandshake::ours(PEER_IN_CHANNEL_CAPACITY)),
            };
            handshake
                .write_to(stream.get_mut())
                .await
                .context("send extension handshake")?;
        }

        Ok(Self {
            uuid: Uuid::new_v4(),
            addr,
            handshake: theirs,
            stream,
        })
    }

    /// Shuttle messages until cancelled or the socket dies. Outgoing
    /// messages queued by the engine within one tick are staged together
    /// and written in a single flush.
    pub async fn run(mut self, ipc: PeerIPC, token: CancellationToken) -> (Uuid, Result<(), PeerError>) {
        let uuid = self.uuid;
        let result = self.shuttle(&ipc, token).await;
        (uuid, result)
    }

    async fn shuttle(&mut self, ipc: &PeerIPC, token: CancellationToken) -> Result<(), PeerError> {
        let mut staging = Vec::new();
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keep_alive.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                outgoing = ipc.wire_rx.recv_async() => {
                    let Ok(first) = outgoing else {
                        // engine dropped us
                        return Ok(());
                    };
                    staging.clear();
                    first
                        .write_to(&mut staging)
                        .await
                        .expect("writes to a vec are infallible");
                    while let Ok(next) = ipc.wire_rx.try_recv() {
                        next.write_to(&mut staging)
                            .await
                            .expect("writes to a vec are infallible");
                    }
                    self.stream
                        .get_mut()
                        .write_all(&staging)
                        .await
                        .map_err(|_| PeerError::connection("failed to send messages"))?;
                    keep_alive.reset();
                }
                incoming = self.stream.next() => {
                    match incoming {
                        Some(Ok(message)) => {
                            if ipc.engine_tx.send_async(message).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => {
                            return Err(PeerError::logic(format!("malformed frame: {e}")));
                        }
                        None => {
                            return Err(PeerError::connection("peer closed the connection"));
                        }
                    }
                }
                _ = keep_alive.tick() => {
                    PeerMessage::HeartBeat
                        .write_to(self.stream.get_mut())
                        .await
                        .map_err(|_| PeerError::connection("failed to send keep-alive"))?;
                }
            }
        }
    }
}

async fn read_handshake(socket: &mut TcpStream) -> anyhow::Result<HandShake> {
    let mut response = [0_u8; HandShake::SIZE];
    socket
        .read_exact(&mut response)
        .await
        .context("receive peer handshake")?;
    HandShake::from_bytes(&response)
}
