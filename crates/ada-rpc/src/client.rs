//! Synchronous-call client.
//!
//! Each call sends one request and waits for exactly one reply. Calls on the
//! same client are serialized, so concurrent callers queue instead of
//! interleaving on the request-reply socket.

use crate::auth::Authenticator;
use crate::codec::{Codec, CompressedCodec};
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::message::{Envelope, Payload, Request, Response};
use crate::transport::{Role, Transport};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A request-reply client.
///
/// `Client` (no type argument) sends opaque payloads with the compressed
/// framing; a `Client<JsonCodec>` sends named JSON requests.
pub struct Client<C: Codec = CompressedCodec> {
    transport: Transport<C>,
    call_lock: Mutex<()>,
}

impl<C: Codec> Client<C> {
    /// Connect to `path` and authenticate with `authenticator`.
    pub async fn open(path: &str, codec: C, authenticator: Authenticator) -> Result<Self> {
        let transport = Transport::new(Role::Client, codec, authenticator)?;
        transport.open(path).await?;
        Ok(Self {
            transport,
            call_lock: Mutex::new(()),
        })
    }

    /// Connect over CURVE, pinning the server key found in `server_certificate`.
    pub async fn connect(path: &str, server_certificate: &Path) -> Result<Self>
    where
        C: Default,
    {
        let authenticator = Authenticator::curve_client(server_certificate)?;
        Self::open(path, C::default(), authenticator).await
    }

    /// Connect without authentication.
    pub async fn plain(path: &str) -> Result<Self>
    where
        C: Default,
    {
        Self::open(path, C::default(), Authenticator::Null).await
    }

    /// Connect using a configuration file's settings. A configured
    /// `server_certificate` enables CURVE.
    pub async fn from_config(config: &RpcConfig) -> Result<Self>
    where
        C: Default,
    {
        let authenticator = match &config.server_certificate {
            Some(path) => Authenticator::curve_client(path)?,
            None => Authenticator::Null,
        };
        let transport = Transport::new(Role::Client, C::default(), authenticator)?
            .with_poll_interval(config.poll_interval());
        transport.open(&config.endpoint).await?;
        Ok(Self {
            transport,
            call_lock: Mutex::new(()),
        })
    }

    /// Send `payload` as an unnamed request and wait for the reply.
    pub async fn call(&self, payload: impl Into<Payload>) -> Result<Response> {
        self.exchange(Request::payload(payload), None).await
    }

    /// Like [`call`](Self::call), but give up after `wait`.
    ///
    /// A timed-out client is closed: a late reply would otherwise be taken
    /// as the answer to the next call.
    pub async fn call_timeout(&self, payload: impl Into<Payload>, wait: Duration) -> Result<Response> {
        self.exchange(Request::payload(payload), Some(wait)).await
    }

    /// Call a named endpoint. Fails with a protocol error under
    /// [`CompressedCodec`], which has no frame for the name.
    pub async fn request(&self, endpoint: impl Into<String>, args: impl Into<Payload>) -> Result<Response> {
        self.exchange(Request::new(endpoint, args), None).await
    }

    /// Send a prepared request and wait up to `wait` (forever if `None`).
    pub async fn exchange(&self, request: Request, wait: Option<Duration>) -> Result<Response> {
        let _guard = self.call_lock.lock().await;
        debug!("Calling {}", request.endpoint().unwrap_or("<default>"));
        self.transport.send(request).await?;

        let reply = match wait {
            None => Some(self.transport.recv().await?),
            Some(wait) => self.transport.recv_timeout(wait).await?,
        };
        match reply {
            Some(Envelope::Response(response)) => Ok(response),
            Some(Envelope::Request(_)) => Err(RpcError::protocol("expected a response, received a request")),
            None => {
                warn!("No reply within {:?}; closing client", wait.unwrap_or_default());
                self.transport.close().await;
                Err(RpcError::transport(format!(
                    "no reply within {:?}",
                    wait.unwrap_or_default()
                )))
            }
        }
    }

    pub fn transport(&self) -> &Transport<C> {
        &self.transport
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
