//! Blocking facade over [`crate::Client`] for callers outside async code,
//! such as an audio capture thread.

use crate::auth::Authenticator;
use crate::codec::{Codec, CompressedCodec};
use crate::config::RpcConfig;
use crate::context::Context;
use crate::error::Result;
use crate::message::{Payload, Response};
use std::path::Path;
use std::time::Duration;

/// A client whose calls block the current thread.
///
/// Sockets are driven by the shared [`Context`] runtime. Do not use from
/// inside an async task.
pub struct Client<C: Codec = CompressedCodec> {
    inner: crate::client::Client<C>,
    context: &'static Context,
}

impl<C: Codec> Client<C> {
    pub fn open(path: &str, codec: C, authenticator: Authenticator) -> Result<Self> {
        let context = Context::global()?;
        let inner = context.block_on(crate::client::Client::open(path, codec, authenticator))?;
        Ok(Self { inner, context })
    }

    pub fn connect(path: &str, server_certificate: &Path) -> Result<Self>
    where
        C: Default,
    {
        Self::open(path, C::default(), Authenticator::curve_client(server_certificate)?)
    }

    pub fn plain(path: &str) -> Result<Self>
    where
        C: Default,
    {
        Self::open(path, C::default(), Authenticator::Null)
    }

    pub fn from_config(config: &RpcConfig) -> Result<Self>
    where
        C: Default,
    {
        let context = Context::global()?;
        let inner = context.block_on(crate::client::Client::from_config(config))?;
        Ok(Self { inner, context })
    }

    pub fn call(&self, payload: impl Into<Payload>) -> Result<Response> {
        self.context.block_on(self.inner.call(payload))
    }

    pub fn call_timeout(&self, payload: impl Into<Payload>, wait: Duration) -> Result<Response> {
        self.context.block_on(self.inner.call_timeout(payload, wait))
    }

    pub fn request(&self, endpoint: impl Into<String>, args: impl Into<Payload>) -> Result<Response> {
        self.context.block_on(self.inner.request(endpoint, args))
    }

    pub fn close(&self) {
        self.context.block_on(self.inner.close());
    }
}
