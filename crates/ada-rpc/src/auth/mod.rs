//! Connection authentication.
//!
//! Every connection starts with both sides sending a greeting that names
//! their mechanism. Under CURVE the client then proves nothing about itself
//! but pins the server: it sends an ephemeral public key (HELLO), and the
//! server answers with its own public key sealed under the agreed key
//! (WELCOME). Only the holder of the pinned key's secret can produce a
//! WELCOME the client can open.
//!
//! ```text
//! client                                  server
//!   | -- greeting "ADA-RPC/1 CURVE" ------> |
//!   | <------ greeting "ADA-RPC/1 CURVE" -- |
//!   | -- HELLO  client ephemeral pub -----> |
//!   | <------ WELCOME seal(server pub) ---- |
//!   |        sealed data frames ...         |
//! ```

mod certificate;
mod session;

pub use certificate::{create_certificates, load_key_pair, load_public_key, KeyPair};
pub use session::Session;

use crate::error::{Result, RpcError};
use crate::frame::{read_frame, write_frame, Frame};
use crate::transport::Role;
use session::{derive_keys, Direction};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;
use x25519_dalek::PublicKey;

const GREETING_PREFIX: &str = "ADA-RPC/1 ";
const WELCOME_AAD: &[u8] = b"WELCOME";

/// Authentication strategy injected into a transport.
#[derive(Debug, Clone)]
pub enum Authenticator {
    /// No authentication, frames travel in the clear.
    Null,
    /// Client side: ephemeral key pair plus the pinned server public key.
    CurveClient {
        server_key: PublicKey,
        local: KeyPair,
    },
    /// Server side: the server's fixed key pair.
    CurveServer { local: KeyPair },
}

impl Authenticator {
    /// Pin the server key found in `server_certificate` and generate a fresh
    /// ephemeral key pair for this connection.
    pub fn curve_client(server_certificate: &Path) -> Result<Self> {
        let server_key = load_public_key(server_certificate)?;
        Ok(Authenticator::CurveClient {
            server_key,
            local: KeyPair::generate(),
        })
    }

    /// Load the server's fixed key pair from its secret certificate.
    pub fn curve_server(secret_certificate: &Path) -> Result<Self> {
        Ok(Authenticator::CurveServer {
            local: load_key_pair(secret_certificate)?,
        })
    }

    pub fn mechanism(&self) -> &'static str {
        match self {
            Authenticator::Null => "NULL",
            Authenticator::CurveClient { .. } | Authenticator::CurveServer { .. } => "CURVE",
        }
    }

    /// Reject strategies that cannot be used in `role`.
    pub(crate) fn check_role(&self, role: Role) -> Result<()> {
        match (self, role) {
            (Authenticator::CurveClient { .. }, Role::Server) => Err(RpcError::config(
                "a CURVE client authenticator cannot be used by a server transport",
            )),
            (Authenticator::CurveServer { .. }, Role::Client) => Err(RpcError::config(
                "a CURVE server authenticator cannot be used by a client transport",
            )),
            _ => Ok(()),
        }
    }

    /// Run the handshake on a freshly connected stream.
    pub async fn handshake<S>(&self, stream: &mut S) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let greeting = format!("{}{}", GREETING_PREFIX, self.mechanism());
        write_frame(stream, &Frame::command(greeting.into_bytes())).await?;
        stream.flush().await?;

        let peer = read_command(stream).await?;
        let peer = std::str::from_utf8(&peer.body)
            .ok()
            .and_then(|text| text.strip_prefix(GREETING_PREFIX))
            .ok_or_else(|| RpcError::protocol("peer did not send a greeting"))?;
        if peer != self.mechanism() {
            return Err(RpcError::auth(format!(
                "peer uses the {} mechanism, this transport uses {}",
                peer,
                self.mechanism()
            )));
        }

        match self {
            Authenticator::Null => Ok(Session::plain()),
            Authenticator::CurveClient { server_key, local } => {
                write_frame(stream, &Frame::command(local.public().as_bytes().to_vec())).await?;
                stream.flush().await?;

                let welcome = read_command(stream).await?;
                let shared = local.secret().diffie_hellman(server_key);
                let keys = derive_keys(&shared, local.public(), server_key)?;

                let mut recv = Direction::new(&keys.server_to_client, 0);
                let presented = recv
                    .open(WELCOME_AAD, &welcome.body)
                    .map_err(|_| RpcError::auth("server key does not match the pinned key"))?;
                if presented.as_slice() != server_key.as_bytes() {
                    return Err(RpcError::auth("server key does not match the pinned key"));
                }

                debug!("CURVE handshake complete (client)");
                Ok(Session::sealed(
                    Direction::new(&keys.client_to_server, 0),
                    recv,
                ))
            }
            Authenticator::CurveServer { local } => {
                let hello = read_command(stream).await?;
                let client_key: [u8; 32] = hello.body[..]
                    .try_into()
                    .map_err(|_| RpcError::auth("HELLO must carry a 32-byte public key"))?;
                let client_key = PublicKey::from(client_key);

                let shared = local.secret().diffie_hellman(&client_key);
                let keys = derive_keys(&shared, &client_key, local.public())?;

                let mut send = Direction::new(&keys.server_to_client, 0);
                let welcome = send.seal(WELCOME_AAD, local.public().as_bytes())?;
                write_frame(stream, &Frame::command(welcome)).await?;
                stream.flush().await?;

                debug!("CURVE handshake complete (server)");
                Ok(Session::sealed(
                    send,
                    Direction::new(&keys.client_to_server, 0),
                ))
            }
        }
    }
}

async fn read_command<S>(stream: &mut S) -> Result<Frame>
where
    S: AsyncRead + Unpin + Send,
{
    let frame = read_frame(stream)
        .await?
        .ok_or_else(|| RpcError::auth("peer closed the connection during the handshake"))?;
    if !frame.is_command() {
        return Err(RpcError::protocol("expected a handshake frame"));
    }
    Ok(frame)
}
