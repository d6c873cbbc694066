//! Endpoint registry and request dispatch.
//!
//! A server binds a server-role transport and answers every request it
//! receives on the transport's watcher task:
//!
//! 1. Resolve the endpoint (a request without one goes to the default
//!    endpoint, if configured).
//! 2. Validate the arguments against the endpoint's [`ArgumentSchema`].
//! 3. Run the handler on the blocking pool.
//! 4. Send back a [`Response`]; dispatch failures become `success = false`.
//!
//! Nothing a handler does can stop the watcher: errors and panics are both
//! reported to the caller as failed responses.

use crate::address::Endpoint;
use crate::auth::Authenticator;
use crate::codec::{Codec, JsonCodec};
use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::message::{Envelope, Payload, Request, Response};
use crate::schema::ArgumentSchema;
use crate::transport::{MessageHandler, Role, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

type HandlerFn = dyn Fn(Payload) -> anyhow::Result<Payload> + Send + Sync;

struct Registration {
    handler: Box<HandlerFn>,
    schema: ArgumentSchema,
}

impl Registration {
    fn new<F>(handler: F, schema: ArgumentSchema) -> Self
    where
        F: Fn(Payload) -> anyhow::Result<Payload> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            schema,
        }
    }
}

/// Handlers by endpoint name. Read-only once the server is open.
#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Registration>,
    default_endpoint: Option<String>,
}

impl Registry {
    fn dispatch(&self, request: Request) -> Response {
        match self.call(request) {
            Ok(results) => Response::success(results),
            Err(e) => {
                debug!("Dispatch failed: {}", e);
                Response::failure(e.to_string())
            }
        }
    }

    fn call(&self, request: Request) -> Result<Payload> {
        let endpoint = request
            .endpoint()
            .or(self.default_endpoint.as_deref())
            .ok_or_else(|| RpcError::HandlerNotFound {
                endpoint: "<unnamed request>".to_string(),
            })?;
        let registration = self
            .handlers
            .get(endpoint)
            .ok_or_else(|| RpcError::HandlerNotFound {
                endpoint: endpoint.to_string(),
            })?;

        registration.schema.validate(request.args())?;
        debug!("Dispatching {}", endpoint);

        (registration.handler)(request.into_args()).map_err(|e| RpcError::Handler {
            message: format!("{:#}", e),
        })
    }
}

/// Watcher-side half of a running server.
struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    async fn respond(&self, request: Request) -> Response {
        let correlation = request.correlation().cloned();
        let registry = Arc::clone(&self.registry);
        let response = match tokio::task::spawn_blocking(move || registry.dispatch(request)).await {
            Ok(response) => response,
            Err(e) if e.is_panic() => {
                let panic = e.into_panic();
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Handler panicked: {}", reason);
                Response::failure(format!("handler panicked: {}", reason))
            }
            Err(e) => Response::failure(format!("handler was cancelled: {}", e)),
        };
        response.with_correlation(correlation)
    }
}

#[async_trait]
impl<C: Codec> MessageHandler<C> for Dispatcher {
    async fn handle(&self, transport: &Transport<C>, message: Result<Envelope>) {
        let response = match message {
            Ok(Envelope::Request(request)) => self.respond(request).await,
            Ok(Envelope::Response(_)) => Response::failure("expected a request, received a response"),
            Err(e) => {
                // The peer is waiting for a reply even if its request was garbage.
                warn!("Undecodable request: {}", e);
                Response::failure(e.to_string())
            }
        };
        let correlation = response.correlation().cloned();

        match transport.send(response).await {
            Ok(()) => {}
            Err(e @ (RpcError::Protocol { .. } | RpcError::Json { .. })) => {
                error!("Cannot encode reply: {}", e);
                let fallback = Response::failure(format!("cannot encode reply: {}", e))
                    .with_correlation(correlation);
                if let Err(e) = transport.send(fallback).await {
                    error!("Failed to send reply: {}", e);
                }
            }
            Err(e) => error!("Failed to send reply: {}", e),
        }
    }
}

/// A request-reply server.
///
/// `Server` (no type argument) speaks the JSON envelope; a
/// `Server<CompressedCodec>` answers opaque binary payloads, routing them to
/// its default endpoint.
pub struct Server<C: Codec = JsonCodec> {
    transport: Transport<C>,
    registry: Option<Registry>,
}

impl<C: Codec> Server<C> {
    pub fn new(codec: C, authenticator: Authenticator) -> Result<Self> {
        Ok(Self {
            transport: Transport::new(Role::Server, codec, authenticator)?,
            registry: Some(Registry::default()),
        })
    }

    /// Build a server from a configuration file's settings. A configured
    /// `secret_certificate` enables CURVE.
    pub fn from_config(config: &RpcConfig, codec: C) -> Result<Self> {
        let authenticator = match &config.secret_certificate {
            Some(path) => Authenticator::curve_server(path)?,
            None => Authenticator::Null,
        };
        let mut server = Self::new(codec, authenticator)?.with_poll_interval(config.poll_interval());
        if let Some(name) = &config.default_endpoint {
            server.set_default_endpoint(name.clone())?;
        }
        Ok(server)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.transport.set_poll_interval(interval);
        self
    }

    fn registry_mut(&mut self) -> Result<&mut Registry> {
        self.registry
            .as_mut()
            .ok_or_else(|| RpcError::config("handlers cannot be changed after the server is opened"))
    }

    /// Register `func` for `endpoint`. A later registration for the same
    /// endpoint replaces the earlier one.
    pub fn add_handler<F, R>(&mut self, endpoint: impl Into<String>, func: F, schema: ArgumentSchema) -> Result<()>
    where
        F: Fn(Payload) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Into<Payload>,
    {
        let endpoint = endpoint.into();
        let registration = Registration::new(move |args| func(args).map(Into::into), schema);
        if self
            .registry_mut()?
            .handlers
            .insert(endpoint.clone(), registration)
            .is_some()
        {
            debug!("Replaced handler for {}", endpoint);
        }
        Ok(())
    }

    /// Endpoint that receives requests carrying no endpoint name.
    pub fn set_default_endpoint(&mut self, endpoint: impl Into<String>) -> Result<()> {
        self.registry_mut()?.default_endpoint = Some(endpoint.into());
        Ok(())
    }

    /// Bind to `path` and start answering requests in the background.
    pub async fn open(&mut self, path: &str) -> Result<()> {
        if self.registry.is_none() {
            return Err(RpcError::transport("server is already open"));
        }
        self.transport.open(path).await?;

        let registry = self.registry.take().unwrap_or_default();
        info!(
            "Serving {} endpoint(s) on {}",
            registry.handlers.len(),
            self.local_endpoint().map(ToString::to_string).unwrap_or_default()
        );
        let dispatcher = Arc::new(Dispatcher {
            registry: Arc::new(registry),
        });
        self.transport.watch(dispatcher)
    }

    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.transport.local_endpoint()
    }

    pub fn transport(&self) -> &Transport<C> {
        &self.transport
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

impl<C: Codec> Drop for Server<C> {
    fn drop(&mut self) {
        self.transport.signal_stop();
    }
}
