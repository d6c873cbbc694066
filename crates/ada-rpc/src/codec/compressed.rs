//! Three-frame compressed framing for opaque binary payloads.
//!
//! ```text
//! frame 1 (MORE)  32 lowercase hex chars   correlation token
//! frame 2 (MORE)  decimal ASCII            uncompressed payload length
//! frame 3         zlib/deflate bytes       compressed payload
//! ```
//!
//! Requests carry the sender's own token and no endpoint name. A reply copies the token of the
//! request it answers, and the client refuses any reply whose token is not
//! its own. A failed reply carries `ERR` in place of the length and the
//! uncompressed UTF-8 error text as frame 3.

use super::Codec;
use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::message::{CorrelationToken, Envelope, Payload, Request, Response};
use crate::transport::Role;
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::debug;

const ERROR_MARKER: &[u8] = b"ERR";

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressedCodec;

impl Codec for CompressedCodec {
    fn encode(&self, envelope: &Envelope, local: &CorrelationToken) -> Result<Vec<Bytes>> {
        match envelope {
            Envelope::Request(request) => {
                if let Some(endpoint) = request.endpoint() {
                    return Err(RpcError::protocol(format!(
                        "compressed framing cannot carry an endpoint name ({})",
                        endpoint
                    )));
                }
                let body = request.args().to_bytes()?;
                data_frames(local, &body)
            }
            Envelope::Response(response) => {
                let token = response.correlation().unwrap_or(local);
                if !response.is_success() {
                    let error = response.error().unwrap_or("request failed");
                    return Ok(vec![
                        Bytes::copy_from_slice(token.as_bytes()),
                        Bytes::from_static(ERROR_MARKER),
                        Bytes::copy_from_slice(error.as_bytes()),
                    ]);
                }
                let body = match response.results() {
                    Some(results) => results.to_bytes()?,
                    None => Bytes::new(),
                };
                data_frames(token, &body)
            }
        }
    }

    fn decode(&self, role: Role, frames: Vec<Bytes>, local: &CorrelationToken) -> Result<Envelope> {
        match role {
            Role::Server => {
                let [token, length, body] = three_frames(frames)?;
                let token = CorrelationToken::from_bytes(&token)?;
                let payload = inflate(&length, &body)?;
                Ok(Envelope::Request(
                    Request::payload(Payload::Binary(payload)).with_correlation(token),
                ))
            }
            Role::Client => {
                let echoed = frames
                    .first()
                    .ok_or_else(|| RpcError::protocol("empty reply"))?;
                debug!(
                    "stored: {}, received: {}",
                    local,
                    String::from_utf8_lossy(echoed)
                );
                if echoed.as_ref() != local.as_bytes() {
                    return Err(RpcError::protocol(format!(
                        "correlation token mismatch: expected {}, received {}",
                        local,
                        String::from_utf8_lossy(echoed)
                    )));
                }
                let [_, length, body] = three_frames(frames)?;
                let response = if length.as_ref() == ERROR_MARKER {
                    Response::failure(String::from_utf8_lossy(&body).into_owned())
                } else {
                    Response::success(Payload::Binary(inflate(&length, &body)?))
                };
                Ok(Envelope::Response(response.with_correlation(Some(local.clone()))))
            }
        }
    }
}

fn data_frames(token: &CorrelationToken, body: &[u8]) -> Result<Vec<Bytes>> {
    let compressed = compress(body)?;
    debug!(
        "Compressed {} bytes to {} bytes",
        body.len(),
        compressed.len()
    );
    Ok(vec![
        Bytes::copy_from_slice(token.as_bytes()),
        Bytes::from(body.len().to_string()),
        Bytes::from(compressed),
    ])
}

fn three_frames(frames: Vec<Bytes>) -> Result<[Bytes; 3]> {
    frames.try_into().map_err(|frames: Vec<Bytes>| {
        RpcError::protocol(format!(
            "compressed message must have 3 frames, got {}",
            frames.len()
        ))
    })
}

fn inflate(length: &[u8], body: &[u8]) -> Result<Bytes> {
    let expected: usize = std::str::from_utf8(length)
        .ok()
        .filter(|text| !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| {
            RpcError::protocol(format!(
                "invalid length frame {:?}",
                String::from_utf8_lossy(length)
            ))
        })?;
    if expected > TransportConfig::MAX_FRAME_SIZE {
        return Err(RpcError::protocol(format!(
            "declared payload size {} exceeds maximum {}",
            expected,
            TransportConfig::MAX_FRAME_SIZE
        )));
    }
    Ok(Bytes::from(decompress(body, expected)?))
}

/// Deflate `data` in the zlib container.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflate `data`, which must expand to exactly `expected_len` bytes.
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    ZlibDecoder::new(data)
        .take(expected_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| RpcError::protocol(format!("decompression failed: {}", e)))?;
    if out.len() != expected_len {
        return Err(RpcError::protocol(format!(
            "payload length mismatch: declared {}, inflated {}",
            expected_len,
            out.len()
        )));
    }
    Ok(out)
}
