//! Single-frame JSON envelopes.

use super::Codec;
use crate::error::{Result, RpcError};
use crate::message::{CorrelationToken, Envelope, Message, Request, Response};
use crate::transport::Role;
use bytes::Bytes;
use tracing::debug;

/// `{"endpoint": ..., "args": {...}}` requests and
/// `{"success": ..., "results": ..., "error": ...}` responses, one frame each.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope, _local: &CorrelationToken) -> Result<Vec<Bytes>> {
        let message = match envelope {
            Envelope::Request(request) => request.to_message()?,
            Envelope::Response(response) => response.to_message()?,
        };
        debug!("Encoding JSON envelope {:?}", message.payload());
        Ok(vec![Bytes::from(message.to_vec()?)])
    }

    fn decode(&self, role: Role, frames: Vec<Bytes>, _local: &CorrelationToken) -> Result<Envelope> {
        let [frame]: [Bytes; 1] = frames.try_into().map_err(|frames: Vec<Bytes>| {
            RpcError::protocol(format!(
                "JSON envelope must be a single frame, got {}",
                frames.len()
            ))
        })?;
        let message = Message::from_slice(&frame)?;
        match role {
            Role::Server => Ok(Envelope::Request(Request::try_from(message)?)),
            Role::Client => Ok(Envelope::Response(Response::try_from(message)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use serde_json::json;

    #[test]
    fn test_request_is_one_json_frame() {
        let token = CorrelationToken::generate();
        let request = Request::new("echo", json!({"text": "hi"}));

        let frames = JsonCodec.encode(&request.clone().into(), &token).unwrap();
        assert_eq!(frames.len(), 1);

        let decoded = JsonCodec.decode(Role::Server, frames, &token).unwrap();
        assert_eq!(decoded, Envelope::Request(request));
    }

    #[test]
    fn test_wire_fields_keep_envelope_order() {
        let token = CorrelationToken::generate();
        let request = Request::new("echo", json!({"text": "hi", "lang": "en"}));
        let frames = JsonCodec.encode(&request.into(), &token).unwrap();
        assert_eq!(
            &frames[0][..],
            br#"{"endpoint":"echo","args":{"text":"hi","lang":"en"}}"#
        );

        let frames = JsonCodec
            .encode(&Response::success(json!("hi")).into(), &token)
            .unwrap();
        assert_eq!(&frames[0][..], br#"{"success":true,"results":"hi","error":false}"#);
    }

    #[test]
    fn test_client_role_decodes_responses() {
        let token = CorrelationToken::generate();
        let frames = vec![Bytes::from_static(br#"{"success": false, "results": null, "error": "HandlerNotFound"}"#)];

        match JsonCodec.decode(Role::Client, frames, &token).unwrap() {
            Envelope::Response(response) => {
                assert!(!response.is_success());
                assert_eq!(response.error(), Some("HandlerNotFound"));
            }
            other => panic!("Expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_multiple_frames() {
        let token = CorrelationToken::generate();
        let frames = vec![Bytes::from_static(b"{}"), Bytes::from_static(b"{}")];
        assert!(matches!(
            JsonCodec.decode(Role::Server, frames, &token),
            Err(RpcError::Protocol { .. })
        ));
    }

    #[test]
    fn test_rejects_invalid_json() {
        let token = CorrelationToken::generate();
        let frames = vec![Bytes::from_static(b"not json")];
        assert!(JsonCodec.decode(Role::Server, frames, &token).is_err());
    }

    #[test]
    fn test_binary_results_cannot_be_encoded() {
        let token = CorrelationToken::generate();
        let response = Response::success(Payload::from(vec![1u8, 2, 3]));
        assert!(JsonCodec.encode(&response.into(), &token).is_err());
    }
}
