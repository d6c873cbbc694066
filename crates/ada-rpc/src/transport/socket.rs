//! Sockets underneath a transport: listeners, dialers and authenticated
//! connections that move multipart messages.

use crate::address::Endpoint;
use crate::auth::{Authenticator, Session};
use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::frame::{read_frame, write_frame, Frame};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

enum Readiness {
    Ready,
    Closed,
    TimedOut,
}

/// Outcome of waiting for a message on a connection.
pub(crate) enum Received {
    Message(Vec<Bytes>),
    Closed,
    TimedOut,
}

/// One authenticated peer connection.
pub(crate) struct Connection {
    stream: BufStream<BoxedStream>,
    session: Session,
    peer: String,
}

impl Connection {
    async fn establish(stream: BoxedStream, authenticator: &Authenticator, peer: String) -> Result<Self> {
        let mut stream = BufStream::new(stream);
        let session = timeout(TransportConfig::HANDSHAKE_TIMEOUT, authenticator.handshake(&mut stream))
            .await
            .map_err(|_| RpcError::auth(format!("handshake with {} timed out", peer)))??;
        Ok(Self {
            stream,
            session,
            peer,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Wait until `deadline` for the next message. Once its first byte has
    /// arrived the rest must follow within `FRAME_TIMEOUT`.
    pub async fn receive(&mut self, deadline: Option<Instant>) -> Result<Received> {
        match self.readiness(deadline).await? {
            Readiness::Ready => {}
            Readiness::Closed => return Ok(Received::Closed),
            Readiness::TimedOut => return Ok(Received::TimedOut),
        }
        match timeout(TransportConfig::FRAME_TIMEOUT, self.read_message()).await {
            Ok(Ok(Some(frames))) => Ok(Received::Message(frames)),
            Ok(Ok(None)) => Ok(Received::Closed),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::transport(format!("{} stalled mid-message", self.peer))),
        }
    }

    pub async fn send(&mut self, frames: Vec<Bytes>) -> Result<()> {
        timeout(TransportConfig::FRAME_TIMEOUT, self.write_message(frames))
            .await
            .map_err(|_| RpcError::transport(format!("{} stopped reading", self.peer)))?
    }

    async fn write_message(&mut self, frames: Vec<Bytes>) -> Result<()> {
        if frames.is_empty() {
            return Err(RpcError::protocol("cannot send a message with no frames"));
        }
        let last = frames.len() - 1;
        for (index, body) in frames.into_iter().enumerate() {
            let frame = self.session.seal(Frame::data(body, index < last))?;
            write_frame(&mut self.stream, &frame).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Wait until at least one byte is buffered, the peer hangs up, or the
    /// deadline passes. Nothing is consumed, so a timed-out wait loses no data.
    async fn readiness(&mut self, deadline: Option<Instant>) -> Result<Readiness> {
        let filled = match deadline {
            Some(deadline) => match timeout_at(deadline, self.stream.fill_buf()).await {
                Ok(filled) => filled?.len(),
                Err(_) => return Ok(Readiness::TimedOut),
            },
            None => self.stream.fill_buf().await?.len(),
        };
        Ok(if filled == 0 {
            Readiness::Closed
        } else {
            Readiness::Ready
        })
    }

    /// Read one multipart message. `None` on a clean hang-up between messages.
    async fn read_message(&mut self) -> Result<Option<Vec<Bytes>>> {
        let mut frames = Vec::new();
        loop {
            let frame = match read_frame(&mut self.stream).await? {
                Some(frame) => frame,
                None if frames.is_empty() => return Ok(None),
                None => return Err(RpcError::protocol("connection closed mid-message")),
            };
            if frame.is_command() {
                return Err(RpcError::protocol("unexpected handshake frame after authentication"));
            }
            let frame = self.session.open(frame)?;
            let more = frame.more();
            frames.push(frame.body);
            if !more {
                debug!("received {} frame(s) from {}", frames.len(), self.peer);
                return Ok(Some(frames));
            }
        }
    }
}

/// A bound server socket.
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Bind to `endpoint`. Returns the listener and the address actually bound.
    pub async fn bind(endpoint: &Endpoint) -> Result<(Self, Endpoint)> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| RpcError::Transport {
                    message: format!("cannot bind {}: {}", endpoint, e),
                    source: Some(e),
                })?;
                let bound = Endpoint::Tcp(listener.local_addr()?);
                Ok((Listener::Tcp(listener), bound))
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                let listener = UnixListener::bind(path).map_err(|e| RpcError::Transport {
                    message: format!("cannot bind {}: {}", endpoint, e),
                    source: Some(e),
                })?;
                Ok((Listener::Unix(listener, path.clone()), endpoint.clone()))
            }
        }
    }

    async fn accept_stream(&self) -> Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), format!("ipc://{}", path.display())))
            }
        }
    }
}

/// A request read from one connected peer, with the way back to it.
pub(crate) struct PeerRequest {
    peer: String,
    frames: Vec<Bytes>,
    reply: oneshot::Sender<Vec<Bytes>>,
}

/// The peer whose request is being served.
pub(crate) struct Outstanding {
    peer: String,
    reply: oneshot::Sender<Vec<Bytes>>,
}

/// Accepts and authenticates peers in the background. Every connected peer
/// gets its own task; their requests arrive on one channel in arrival order.
pub(crate) struct Acceptor {
    requests: mpsc::Receiver<PeerRequest>,
    task: JoinHandle<()>,
    #[cfg(unix)]
    socket_file: Option<PathBuf>,
}

impl Acceptor {
    pub fn spawn(listener: Listener, authenticator: Authenticator) -> Self {
        #[cfg(unix)]
        let socket_file = match &listener {
            Listener::Unix(_, path) => Some(path.clone()),
            Listener::Tcp(_) => None,
        };
        let (tx, requests) = mpsc::channel(TransportConfig::PENDING_REQUESTS);
        let task = tokio::spawn(accept_loop(listener, Arc::new(authenticator), tx));
        Self {
            requests,
            task,
            #[cfg(unix)]
            socket_file,
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Peer tasks live in the accept loop's JoinSet and are aborted with it.
        self.task.abort();
        #[cfg(unix)]
        if let Some(path) = &self.socket_file {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn accept_loop(listener: Listener, authenticator: Arc<Authenticator>, tx: mpsc::Sender<PeerRequest>) {
    let mut peers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept_stream() => match accepted {
                Ok((stream, addr)) => {
                    peers.spawn(serve_peer(stream, addr, Arc::clone(&authenticator), tx.clone()));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(TransportConfig::ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(_) = peers.join_next(), if !peers.is_empty() => {}
            _ = tx.closed() => break,
        }
    }
}

/// Authenticate one peer, then forward its requests and write back the
/// replies, one request outstanding at a time.
async fn serve_peer(
    stream: BoxedStream,
    addr: String,
    authenticator: Arc<Authenticator>,
    requests: mpsc::Sender<PeerRequest>,
) {
    let mut conn = match Connection::establish(stream, &authenticator, addr.clone()).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Rejected peer {}: {}", addr, e);
            return;
        }
    };
    debug!("Accepted peer {}", addr);

    loop {
        let frames = match conn.receive(None).await {
            Ok(Received::Message(frames)) => frames,
            Ok(Received::TimedOut) => continue,
            Ok(Received::Closed) => {
                debug!("Peer {} disconnected", addr);
                return;
            }
            Err(e) => {
                warn!("Dropping peer {}: {}", addr, e);
                return;
            }
        };

        let (reply, replied) = oneshot::channel();
        let request = PeerRequest {
            peer: addr.clone(),
            frames,
            reply,
        };
        if requests.send(request).await.is_err() {
            return;
        }
        match replied.await {
            Ok(frames) => {
                if let Err(e) = conn.send(frames).await {
                    warn!("Dropping peer {}: {}", addr, e);
                    return;
                }
            }
            Err(_) => debug!("Request from {} was not answered", addr),
        }
    }
}

/// Dial `endpoint` and authenticate.
pub(crate) async fn connect(endpoint: &Endpoint, authenticator: &Authenticator) -> Result<Connection> {
    let unreachable = |e: std::io::Error| RpcError::Transport {
        message: format!("cannot connect to {}: {}", endpoint, e),
        source: Some(e),
    };
    let elapsed = |_| RpcError::transport(format!("timed out connecting to {}", endpoint));

    let stream: BoxedStream = match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = timeout(TransportConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(elapsed)?
                .map_err(unreachable)?;
            stream.set_nodelay(true)?;
            Box::new(stream)
        }
        #[cfg(unix)]
        Endpoint::Ipc(path) => {
            let stream = timeout(TransportConfig::CONNECT_TIMEOUT, UnixStream::connect(path))
                .await
                .map_err(elapsed)?
                .map_err(unreachable)?;
            Box::new(stream)
        }
    };

    let connection = Connection::establish(stream, authenticator, endpoint.to_string()).await?;
    info!("Connected to {} ({})", endpoint, authenticator.mechanism());
    Ok(connection)
}

/// The socket owned by a transport.
pub(crate) enum Socket {
    /// Server role: requests from every connected peer, and the reply slot of
    /// the one being served.
    Bound {
        acceptor: Acceptor,
        outstanding: Option<Outstanding>,
    },
    /// Client role: one connection to the server.
    Connected(Connection),
}

impl Socket {
    pub fn bound(acceptor: Acceptor) -> Self {
        Socket::Bound {
            acceptor,
            outstanding: None,
        }
    }

    /// Wait for the next multipart message.
    ///
    /// With a deadline, returns `Ok(None)` if nothing arrived in time. A server
    /// socket takes requests from all connected peers in turn; a peer that
    /// hangs up or misbehaves is dropped by its own task.
    pub async fn next_message(&mut self, deadline: Option<Instant>) -> Result<Option<Vec<Bytes>>> {
        match self {
            Socket::Connected(conn) => match conn.receive(deadline).await? {
                Received::Message(frames) => Ok(Some(frames)),
                Received::TimedOut => Ok(None),
                Received::Closed => Err(RpcError::transport(format!(
                    "{} closed the connection",
                    conn.peer()
                ))),
            },
            Socket::Bound {
                acceptor,
                outstanding,
            } => {
                let next = match deadline {
                    Some(deadline) => match timeout_at(deadline, acceptor.requests.recv()).await {
                        Ok(next) => next,
                        Err(_) => return Ok(None),
                    },
                    None => acceptor.requests.recv().await,
                };
                let request = next.ok_or_else(|| RpcError::transport("listener stopped accepting"))?;
                let previous = outstanding.replace(Outstanding {
                    peer: request.peer,
                    reply: request.reply,
                });
                if let Some(previous) = previous {
                    warn!("Request from {} left unanswered", previous.peer);
                }
                Ok(Some(request.frames))
            }
        }
    }

    /// Send a message. A server socket replies to the peer whose request was
    /// read last.
    pub async fn send_message(&mut self, frames: Vec<Bytes>) -> Result<()> {
        match self {
            Socket::Connected(conn) => conn.send(frames).await,
            Socket::Bound { outstanding, .. } => {
                let Outstanding { peer, reply } = outstanding
                    .take()
                    .ok_or_else(|| RpcError::transport("no peer is awaiting a reply"))?;
                reply
                    .send(frames)
                    .map_err(|_| RpcError::transport(format!("{} disconnected before its reply", peer)))
            }
        }
    }
}
