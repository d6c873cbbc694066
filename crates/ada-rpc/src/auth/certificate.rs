//! CURVE key pairs and certificate files.
//!
//! Certificates are small text files with `metadata` and `curve` sections:
//!
//! ```text
//! #   ****  Generated by ada-rpc  ****
//! metadata
//!     name = "server"
//! curve
//!     public-key = "<64 hex chars>"
//!     secret-key = "<64 hex chars>"
//! ```
//!
//! The public certificate (`<name>.key`) omits `secret-key` and is handed to
//! clients out-of-band; the secret certificate (`<name>.key_secret`) stays
//! with the server.

use crate::config::CertificateConfig;
use crate::error::{Result, RpcError};
use rand::RngCore;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

/// An X25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a key pair in memory. The secret is never written anywhere.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self::from_secret_bytes(bytes)
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_hex())
            .finish()
    }
}

/// Write a public and a secret certificate for a fresh key pair into `dir`.
///
/// Returns `(public_path, secret_path)`.
pub fn create_certificates(dir: &Path, name: &str) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let pair = KeyPair::generate();

    let public_path = dir.join(format!("{}{}", name, CertificateConfig::PUBLIC_SUFFIX));
    let secret_path = dir.join(format!("{}{}", name, CertificateConfig::SECRET_SUFFIX));

    std::fs::write(&public_path, render(name, &pair, false))?;
    std::fs::write(&secret_path, render(name, &pair, true))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&secret_path, std::fs::Permissions::from_mode(0o600))?;
    }

    debug!(
        "Wrote certificates {} and {}",
        public_path.display(),
        secret_path.display()
    );
    Ok((public_path, secret_path))
}

/// Load the public key from a public or secret certificate.
pub fn load_public_key(path: &Path) -> Result<PublicKey> {
    let fields = parse(path)?;
    let public = fields
        .public
        .ok_or_else(|| RpcError::auth(format!("{} has no public-key", path.display())))?;
    Ok(PublicKey::from(public))
}

/// Load a full key pair from a secret certificate.
pub fn load_key_pair(path: &Path) -> Result<KeyPair> {
    let fields = parse(path)?;
    let secret = fields
        .secret
        .ok_or_else(|| RpcError::auth(format!("{} has no secret-key", path.display())))?;
    let pair = KeyPair::from_secret_bytes(secret);

    if let Some(public) = fields.public {
        if public != *pair.public.as_bytes() {
            return Err(RpcError::auth(format!(
                "{}: public-key does not belong to secret-key",
                path.display()
            )));
        }
    }
    Ok(pair)
}

fn render(name: &str, pair: &KeyPair, include_secret: bool) -> String {
    let mut out = String::new();
    out.push_str("#   ****  Generated by ada-rpc  ****\n");
    out.push_str("#   Ada RPC CURVE certificate\n");
    out.push_str("metadata\n");
    out.push_str(&format!("    name = \"{}\"\n", name));
    out.push_str("curve\n");
    out.push_str(&format!("    public-key = \"{}\"\n", pair.public_hex()));
    if include_secret {
        out.push_str(&format!(
            "    secret-key = \"{}\"\n",
            hex::encode(pair.secret.to_bytes())
        ));
    }
    out
}

#[derive(Default)]
struct CertificateFields {
    public: Option<[u8; 32]>,
    secret: Option<[u8; 32]>,
}

fn parse(path: &Path) -> Result<CertificateFields> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| RpcError::auth(format!("cannot read certificate {}: {}", path.display(), e)))?;

    let mut fields = CertificateFields::default();
    let mut section = "";
    for line in contents.lines() {
        if line.trim_start().starts_with('#') || line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            section = line.trim();
            continue;
        }
        if section != "curve" {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(RpcError::auth(format!(
                "{}: malformed line {:?}",
                path.display(),
                line.trim()
            )));
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "public-key" => fields.public = Some(decode_key(path, value)?),
            "secret-key" => fields.secret = Some(decode_key(path, value)?),
            _ => {}
        }
    }
    Ok(fields)
}

fn decode_key(path: &Path, value: &str) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(value, &mut key)
        .map_err(|e| RpcError::auth(format!("{}: invalid key: {}", path.display(), e)))?;
    Ok(key)
}
