//! Ada RPC - authenticated request-reply messaging.
//!
//! A small wire protocol for moving requests between Ada processes: named
//! JSON calls dispatched to registered handlers, and large opaque payloads
//! (captured audio) sent through a compressed three-frame framing with a
//! correlation check. Connections can be authenticated and sealed with a
//! CURVE handshake that pins the server's public key.
//!
//! The stack is one [`Transport`] type with two injected strategies, an
//! [`Authenticator`] and a [`Codec`]. [`Server`] and [`Client`] are thin
//! compositions on top.
//!
//! # Example
//!
//! ```rust,ignore
//! use ada_rpc::{ArgumentSchema, Authenticator, Client, JsonCodec, Payload, Server};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> ada_rpc::Result<()> {
//!     let mut server = Server::new(JsonCodec, Authenticator::Null)?;
//!     server.add_handler(
//!         "echo",
//!         |args: Payload| Ok(args.get("text").cloned().unwrap_or_default()),
//!         ArgumentSchema::new().required("text"),
//!     )?;
//!     server.open("tcp://127.0.0.1:5555").await?;
//!
//!     let client: Client<JsonCodec> = Client::plain("tcp://127.0.0.1:5555").await?;
//!     let response = client.request("echo", json!({"text": "hi"})).await?;
//!     assert!(response.is_success());
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod auth;
pub mod blocking;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod message;
pub mod schema;
pub mod transport;

mod client;
mod server;

// Re-export commonly used types
pub use address::Endpoint;
pub use auth::{create_certificates, load_key_pair, load_public_key, Authenticator, KeyPair};
pub use cancel::{CancellationToken, CancelledError};
pub use client::Client;
pub use codec::{Codec, CompressedCodec, JsonCodec};
pub use config::{CertificateConfig, RpcConfig, TransportConfig};
pub use context::Context;
pub use error::{Result, RpcError};
pub use message::{CorrelationToken, Envelope, Message, Payload, Request, Response};
pub use schema::{ArgumentSchema, ValidationError};
pub use server::Server;
pub use transport::{MessageHandler, ReadAccess, Role, Transport, TransportState};
