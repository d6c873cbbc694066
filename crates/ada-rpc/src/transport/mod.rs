//! The single transport type every server and client is built on.
//!
//! A transport owns one socket in a fixed [`Role`], moves multipart messages
//! through an injected [`Authenticator`] and turns them into envelopes with an
//! injected [`Codec`]. Lifecycle:
//!
//! ```text
//! Unopened --open--> Open --watch--> Watching
//!                      \                 |
//!                       +----close-------+--> Closed (terminal)
//! ```
//!
//! Once watching, the watcher task owns all reads; a direct `recv` fails
//! unless the caller opts into [`ReadAccess::Concurrent`].

mod socket;
mod watcher;

pub use watcher::MessageHandler;

use crate::address::Endpoint;
use crate::auth::Authenticator;
use crate::cancel::CancellationToken;
use crate::codec::Codec;
use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::message::{CorrelationToken, Envelope};
use bytes::Bytes;
use socket::{connect, Acceptor, Listener, Socket};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Which side of the request-reply exchange a transport plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Binds and answers requests.
    Server,
    /// Connects and issues requests.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unopened,
    Open,
    Watching,
    Closed,
}

/// Whether a direct read may run alongside a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadAccess {
    /// Fail if the transport is being watched.
    #[default]
    Exclusive,
    /// Read even though a watcher is running.
    Concurrent,
}

struct Inner {
    role: Role,
    authenticator: Authenticator,
    token: CorrelationToken,
    state: Mutex<TransportState>,
    socket: tokio::sync::Mutex<Option<Socket>>,
    local: OnceLock<Endpoint>,
    stop: CancellationToken,
}

/// A request-reply transport.
///
/// Clones share the same socket, state and correlation token.
pub struct Transport<C: Codec> {
    inner: Arc<Inner>,
    codec: Arc<C>,
    poll_interval: Duration,
}

impl<C: Codec> Clone for Transport<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            codec: Arc::clone(&self.codec),
            poll_interval: self.poll_interval,
        }
    }
}

impl<C: Codec> Transport<C> {
    /// Create an unopened transport. A fresh correlation token is generated
    /// here and kept for the transport's lifetime.
    pub fn new(role: Role, codec: C, authenticator: Authenticator) -> Result<Self> {
        authenticator.check_role(role)?;
        Ok(Self {
            inner: Arc::new(Inner {
                role,
                authenticator,
                token: CorrelationToken::generate(),
                state: Mutex::new(TransportState::Unopened),
                socket: tokio::sync::Mutex::new(None),
                local: OnceLock::new(),
                stop: CancellationToken::new(),
            }),
            codec: Arc::new(codec),
            poll_interval: TransportConfig::POLL_INTERVAL,
        })
    }

    /// Bound on every internal wait, and so on how long `close` takes to be
    /// observed by a watcher.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.set_poll_interval(interval);
        self
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn token(&self) -> &CorrelationToken {
        &self.inner.token
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn state(&self) -> TransportState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TransportState) -> TransportState {
        let mut current = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, state)
    }

    /// The address bound (server) or connected to (client), once open.
    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.inner.local.get()
    }

    /// Bind (server role) or connect and authenticate (client role).
    pub async fn open(&self, path: &str) -> Result<()> {
        let mut slot = self.inner.socket.lock().await;
        match self.state() {
            TransportState::Unopened => {}
            TransportState::Closed => return Err(closed()),
            TransportState::Open | TransportState::Watching => {
                return Err(RpcError::transport("transport is already open"))
            }
        }

        let endpoint = Endpoint::parse(path)?;
        let socket = match self.inner.role {
            Role::Server => {
                let (listener, bound) = Listener::bind(&endpoint).await?;
                info!(
                    "Listening on {} ({})",
                    bound,
                    self.inner.authenticator.mechanism()
                );
                let _ = self.inner.local.set(bound);
                Socket::bound(Acceptor::spawn(listener, self.inner.authenticator.clone()))
            }
            Role::Client => {
                let connection = connect(&endpoint, &self.inner.authenticator).await?;
                let _ = self.inner.local.set(endpoint);
                Socket::Connected(connection)
            }
        };

        *slot = Some(socket);
        self.set_state(TransportState::Open);
        Ok(())
    }

    /// Encode and send one envelope.
    pub async fn send(&self, envelope: impl Into<Envelope>) -> Result<()> {
        let frames = self.codec.encode(&envelope.into(), &self.inner.token)?;
        self.send_multipart(frames).await
    }

    /// Send raw frames as one multipart message.
    pub async fn send_multipart(&self, frames: Vec<Bytes>) -> Result<()> {
        self.ensure_usable()?;
        let mut slot = self.inner.socket.lock().await;
        let socket = slot.as_mut().ok_or_else(closed)?;
        debug!("Sending {} frame(s)", frames.len());
        socket.send_message(frames).await
    }

    /// Wait for the next envelope.
    pub async fn recv(&self) -> Result<Envelope> {
        loop {
            if let Some(envelope) = self.recv_with(ReadAccess::Exclusive, None).await? {
                return Ok(envelope);
            }
        }
    }

    /// Wait up to `wait` for the next envelope; `Ok(None)` if nothing arrived.
    pub async fn recv_timeout(&self, wait: Duration) -> Result<Option<Envelope>> {
        self.recv_with(ReadAccess::Exclusive, Some(wait)).await
    }

    /// Receive with explicit read access and an optional bound on the wait.
    pub async fn recv_with(
        &self,
        access: ReadAccess,
        wait: Option<Duration>,
    ) -> Result<Option<Envelope>> {
        match self.recv_multipart(access, wait).await? {
            Some(frames) => self.decode(frames).map(Some),
            None => Ok(None),
        }
    }

    /// Receive one raw multipart message.
    ///
    /// Waits in slices of the poll interval so that a concurrent `close` is
    /// noticed even when no deadline is given.
    pub async fn recv_multipart(
        &self,
        access: ReadAccess,
        wait: Option<Duration>,
    ) -> Result<Option<Vec<Bytes>>> {
        let deadline = wait.map(|wait| Instant::now() + wait);
        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    remaining.min(self.poll_interval)
                }
                None => self.poll_interval,
            };
            if let Some(frames) = self.poll_frames(access, slice).await? {
                return Ok(Some(frames));
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }
        }
    }

    /// Start the watcher task. `handler` is invoked for every message received
    /// until the transport is closed.
    pub fn watch<H>(&self, handler: Arc<H>) -> Result<()>
    where
        H: MessageHandler<C> + ?Sized,
    {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            TransportState::Open => *state = TransportState::Watching,
            TransportState::Unopened => return Err(RpcError::transport("transport is not open")),
            TransportState::Watching => {
                return Err(RpcError::transport("transport is already being watched"))
            }
            TransportState::Closed => return Err(closed()),
        }
        drop(state);

        tokio::spawn(watcher::run(self.clone(), handler));
        Ok(())
    }

    /// Stop the watcher, if any, and release the socket. Closing twice is a
    /// no-op.
    ///
    /// Waits at most one poll interval for the socket. If a read still holds
    /// it, the reader releases it as soon as it sees the stop signal.
    pub async fn close(&self) {
        if self.signal_stop() == TransportState::Closed {
            return;
        }
        match tokio::time::timeout(self.poll_interval, self.inner.socket.lock()).await {
            Ok(mut slot) => drop(slot.take()),
            Err(_) => debug!("Socket of {} is busy, its reader will release it", self.inner.token),
        }
        info!("Closed transport {}", self.inner.token);
    }

    /// Mark the transport closed and tell the watcher to exit, without
    /// waiting for the socket. Returns the previous state.
    pub(crate) fn signal_stop(&self) -> TransportState {
        let previous = self.set_state(TransportState::Closed);
        self.inner.stop.cancel();
        previous
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            TransportState::Open | TransportState::Watching => Ok(()),
            TransportState::Unopened => Err(RpcError::transport("transport is not open")),
            TransportState::Closed => Err(closed()),
        }
    }

    fn ensure_readable(&self, access: ReadAccess) -> Result<()> {
        self.ensure_usable()?;
        if self.state() == TransportState::Watching && access == ReadAccess::Exclusive {
            return Err(RpcError::transport(
                "transport is being watched; its watcher owns all reads",
            ));
        }
        Ok(())
    }

    /// One bounded wait for a message.
    async fn poll_frames(&self, access: ReadAccess, slice: Duration) -> Result<Option<Vec<Bytes>>> {
        self.ensure_readable(access)?;
        self.inner.stop.check()?;
        let mut slot = self.inner.socket.lock().await;
        let socket = slot.as_mut().ok_or_else(closed)?;
        let received = socket.next_message(Some(Instant::now() + slice)).await;
        if self.inner.stop.is_cancelled() {
            slot.take();
            return Err(closed());
        }
        received
    }

    fn decode(&self, frames: Vec<Bytes>) -> Result<Envelope> {
        self.codec.decode(self.inner.role, frames, &self.inner.token)
    }
}

fn closed() -> RpcError {
    RpcError::transport("transport is closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::message::{Payload, Request, Response};
    use serde_json::json;

    const FAST: Duration = Duration::from_millis(50);

    async fn open_pair() -> (Transport<JsonCodec>, Transport<JsonCodec>) {
        let server = Transport::new(Role::Server, JsonCodec, Authenticator::Null)
            .unwrap()
            .with_poll_interval(FAST);
        server.open("tcp://127.0.0.1:0").await.unwrap();
        let address = server.local_endpoint().unwrap().to_string();

        let client = Transport::new(Role::Client, JsonCodec, Authenticator::Null)
            .unwrap()
            .with_poll_interval(FAST);
        client.open(&address).await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let transport = Transport::new(Role::Server, JsonCodec, Authenticator::Null).unwrap();
        assert_eq!(transport.state(), TransportState::Unopened);

        transport.open("tcp://127.0.0.1:0").await.unwrap();
        assert_eq!(transport.state(), TransportState::Open);
        assert!(transport.local_endpoint().is_some());

        transport.close().await;
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let (server, client) = open_pair().await;
        client.close().await;
        client.close().await;

        let err = client.send(Request::new("echo", json!({}))).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
        let err = client.recv_timeout(FAST).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
        let err = client.open("tcp://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));

        server.close().await;
    }

    #[tokio::test]
    async fn test_unusable_address_is_transport_error() {
        let transport = Transport::new(Role::Server, JsonCodec, Authenticator::Null).unwrap();
        let err = transport.open("carrier-pigeon://loft").await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
        assert_eq!(transport.state(), TransportState::Unopened);
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let transport = Transport::new(Role::Client, JsonCodec, Authenticator::Null).unwrap();
        let err = transport.send(Request::new("echo", json!({}))).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_request_reply_exchange() {
        let (server, client) = open_pair().await;

        client.send(Request::new("echo", json!({"text": "hi"}))).await.unwrap();
        match server.recv().await.unwrap() {
            Envelope::Request(request) => assert_eq!(request.endpoint(), Some("echo")),
            other => panic!("Expected a request, got {:?}", other),
        }

        server.send(Response::success(json!("hi"))).await.unwrap();
        match client.recv().await.unwrap() {
            Envelope::Response(response) => assert!(response.is_success()),
            other => panic!("Expected a response, got {:?}", other),
        }

        client.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_recv_timeout_returns_none_when_idle() {
        let (server, client) = open_pair().await;
        assert!(client.recv_timeout(FAST).await.unwrap().is_none());
        client.close().await;
        server.close().await;
    }

    struct Ignore;

    #[async_trait::async_trait]
    impl MessageHandler<JsonCodec> for Ignore {
        async fn handle(&self, _transport: &Transport<JsonCodec>, _message: Result<Envelope>) {}
    }

    #[tokio::test]
    async fn test_watched_transport_rejects_direct_recv() {
        let (server, client) = open_pair().await;
        server.watch(Arc::new(Ignore)).unwrap();
        assert_eq!(server.state(), TransportState::Watching);

        let err = server.recv_timeout(FAST).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
        // Opting in is allowed; nothing is pending.
        assert!(server
            .recv_with(ReadAccess::Concurrent, Some(FAST))
            .await
            .unwrap()
            .is_none());

        assert!(server.watch(Arc::new(Ignore)).is_err());

        client.close().await;
        server.close().await;
        assert_eq!(server.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_idle_peer_does_not_block_others() {
        let (server, idle) = open_pair().await;
        let address = server.local_endpoint().unwrap().to_string();

        idle.send(Request::new("ping", json!({}))).await.unwrap();
        assert!(matches!(server.recv().await.unwrap(), Envelope::Request(_)));
        server.send(Response::success(json!("pong"))).await.unwrap();
        assert!(matches!(idle.recv().await.unwrap(), Envelope::Response(_)));

        // The first peer stays connected and silent.
        let busy = Transport::new(Role::Client, JsonCodec, Authenticator::Null)
            .unwrap()
            .with_poll_interval(FAST);
        busy.open(&address).await.unwrap();
        busy.send(Request::new("echo", json!({"text": "second"}))).await.unwrap();

        let request = server
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("second peer was not served");
        match request {
            Envelope::Request(request) => assert_eq!(request.endpoint(), Some("echo")),
            other => panic!("Expected a request, got {:?}", other),
        }
        server.send(Response::success(json!("second"))).await.unwrap();
        match busy.recv_timeout(Duration::from_secs(2)).await.unwrap() {
            Some(Envelope::Response(response)) => {
                assert_eq!(response.results(), Some(&Payload::from(json!("second"))))
            }
            other => panic!("Expected a response, got {:?}", other),
        }

        busy.close().await;
        idle.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn test_stalled_half_frame_peer_does_not_block_close() {
        use crate::frame::{read_frame, write_frame, Frame};
        use tokio::io::AsyncWriteExt;

        let server = Transport::new(Role::Server, JsonCodec, Authenticator::Null)
            .unwrap()
            .with_poll_interval(FAST);
        server.open("tcp://127.0.0.1:0").await.unwrap();
        server.watch(Arc::new(Ignore)).unwrap();
        let Some(Endpoint::Tcp(addr)) = server.local_endpoint().cloned() else {
            panic!("Expected a TCP endpoint");
        };

        let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
        write_frame(&mut raw, &Frame::command(&b"ADA-RPC/1 NULL"[..]))
            .await
            .unwrap();
        let greeting = read_frame(&mut raw).await.unwrap().unwrap();
        assert!(greeting.is_command());
        // First header byte of a data frame, then nothing more.
        raw.write_all(&[0x00]).await.unwrap();
        raw.flush().await.unwrap();
        tokio::time::sleep(FAST * 4).await;

        let closed = tokio::time::timeout(Duration::from_secs(3), server.close()).await;
        assert!(closed.is_ok());
        assert_eq!(server.state(), TransportState::Closed);
    }

    #[test]
    fn test_role_mismatched_authenticator_is_rejected() {
        let auth = Authenticator::CurveServer {
            local: crate::auth::KeyPair::generate(),
        };
        assert!(matches!(
            Transport::new(Role::Client, JsonCodec, auth),
            Err(RpcError::Config { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ipc_socket_file_removed_on_close() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rpc.sock");
        let address = format!("ipc://{}", path.display());

        let server = Transport::new(Role::Server, JsonCodec, Authenticator::Null).unwrap();
        server.open(&address).await.unwrap();
        assert!(path.exists());

        server.close().await;
        assert!(!path.exists());
    }
}
