//! Encoding strategies that turn envelopes into frames and back.
//!
//! A transport is parameterised by one codec. The codec decides how many
//! frames a message occupies and what they contain; the transport only moves
//! frames.

mod compressed;
mod json;

pub use compressed::{compress, decompress, CompressedCodec};
pub use json::JsonCodec;

use crate::error::Result;
use crate::message::{CorrelationToken, Envelope};
use crate::transport::Role;
use bytes::Bytes;

pub trait Codec: Send + Sync + 'static {
    /// Encode an outgoing envelope. `local` is the sending transport's token.
    fn encode(&self, envelope: &Envelope, local: &CorrelationToken) -> Result<Vec<Bytes>>;

    /// Decode one received multipart message.
    ///
    /// A server-role transport decodes requests, a client-role transport
    /// decodes responses.
    fn decode(&self, role: Role, frames: Vec<Bytes>, local: &CorrelationToken) -> Result<Envelope>;
}
