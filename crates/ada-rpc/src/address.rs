//! Socket endpoint addresses.
//!
//! ```text
//! tcp://127.0.0.1:5555
//! ipc:///run/ada/rpc.sock
//! ```

use crate::error::{Result, RpcError};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Where a transport binds (server role) or connects (client role).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Ipc(PathBuf),
}

impl Endpoint {
    pub fn parse(path: &str) -> Result<Self> {
        if let Some(rest) = path.strip_prefix("tcp://") {
            return rest
                .parse::<SocketAddr>()
                .map(Endpoint::Tcp)
                .map_err(|e| RpcError::transport(format!("unusable address {}: {}", path, e)));
        }
        if let Some(rest) = path.strip_prefix("ipc://") {
            if rest.is_empty() {
                return Err(RpcError::transport(format!(
                    "unusable address {}: empty socket path",
                    path
                )));
            }
            #[cfg(unix)]
            return Ok(Endpoint::Ipc(PathBuf::from(rest)));
            #[cfg(not(unix))]
            return Err(RpcError::transport(format!(
                "unusable address {}: ipc endpoints require a Unix platform",
                path
            )));
        }
        Err(RpcError::transport(format!(
            "unusable address {}: expected tcp:// or ipc://",
            path
        )))
    }
}

impl std::str::FromStr for Endpoint {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}
