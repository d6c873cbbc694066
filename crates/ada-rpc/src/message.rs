//! Message envelopes exchanged over a transport.
//!
//! `Message` is the JSON view of an envelope: an ordered mapping of named
//! fields. `Request` and `Response` are the typed wrappers built on top of it.
//! Arguments and results are a [`Payload`], which is either JSON or opaque
//! bytes (e.g. a captured audio clip sent through the compressed framing).
//!
//! Envelopes are built fresh for every exchange and never shared between
//! transports.

use crate::error::{Result, RpcError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Per-transport random identifier used to detect cross-talk between
/// exchanges. Rendered as 32 lowercase hex characters without dashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub const LEN: usize = 32;

    /// Generate a fresh random 128-bit token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Parse a token received on the wire.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let valid = raw.len() == Self::LEN
            && raw
                .iter()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b));
        if !valid {
            return Err(RpcError::protocol(format!(
                "malformed correlation token ({} bytes)",
                raw.len()
            )));
        }
        // Checked above: ASCII hex only.
        Ok(Self(String::from_utf8_lossy(raw).into_owned()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request arguments or response results.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Bytes),
}

impl Payload {
    /// An empty argument mapping.
    pub fn empty() -> Self {
        Payload::Json(Value::Object(Map::new()))
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Payload::Json(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            Payload::Json(_) => None,
        }
    }

    /// Look up a named argument.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(name))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    /// Raw bytes of this payload; JSON is serialized.
    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Payload::Binary(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Payload::Json(Value::Object(map))
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Payload::Binary(Bytes::from_static(bytes))
    }
}

/// Ordered mapping of named fields; the JSON body of an envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    payload: Map<String, Value>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn set_option(&mut self, key: impl Into<String>, value: Value) {
        self.payload.insert(key.into(), value);
    }

    /// Returns `None` when the field is unset.
    pub fn get_option(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.payload)?)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| RpcError::protocol(format!("invalid JSON envelope: {}", e)))
    }
}

/// A call to a named endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    endpoint: Option<String>,
    args: Payload,
    correlation: Option<CorrelationToken>,
}

impl Request {
    pub fn new(endpoint: impl Into<String>, args: impl Into<Payload>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            args: args.into(),
            correlation: None,
        }
    }

    /// A request without an endpoint name, carrying an opaque payload.
    pub fn payload(args: impl Into<Payload>) -> Self {
        Self {
            endpoint: None,
            args: args.into(),
            correlation: None,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn args(&self) -> &Payload {
        &self.args
    }

    pub fn into_args(self) -> Payload {
        self.args
    }

    /// Token of the peer that sent this request, when the framing carries one.
    pub fn correlation(&self) -> Option<&CorrelationToken> {
        self.correlation.as_ref()
    }

    pub(crate) fn with_correlation(mut self, token: CorrelationToken) -> Self {
        self.correlation = Some(token);
        self
    }

    pub fn to_message(&self) -> Result<Message> {
        let args = match &self.args {
            Payload::Json(value) => value.clone(),
            Payload::Binary(_) => {
                return Err(RpcError::protocol(
                    "binary arguments cannot be carried in a JSON envelope",
                ))
            }
        };
        let mut message = Message::new();
        message.set_option(
            "endpoint",
            self.endpoint.clone().map(Value::String).unwrap_or(Value::Null),
        );
        message.set_option("args", args);
        Ok(message)
    }
}

impl TryFrom<Message> for Request {
    type Error = RpcError;

    fn try_from(mut message: Message) -> Result<Self> {
        let endpoint = match message.payload.remove("endpoint") {
            Some(Value::String(name)) => Some(name),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(RpcError::protocol(format!(
                    "endpoint must be a string, got {}",
                    other
                )))
            }
        };
        let args = message
            .payload
            .remove("args")
            .map(Payload::Json)
            .unwrap_or_else(Payload::empty);
        Ok(Self {
            endpoint,
            args,
            correlation: None,
        })
    }
}

/// Outcome of a request.
///
/// Defaults to `success = true` with no results and no error.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    success: bool,
    results: Option<Payload>,
    error: Option<String>,
    correlation: Option<CorrelationToken>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            success: true,
            results: None,
            error: None,
            correlation: None,
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(results: impl Into<Payload>) -> Self {
        Self {
            results: Some(results.into()),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn results(&self) -> Option<&Payload> {
        self.results.as_ref()
    }

    pub fn into_results(self) -> Option<Payload> {
        self.results
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Token this response answers, when the framing carries one.
    pub fn correlation(&self) -> Option<&CorrelationToken> {
        self.correlation.as_ref()
    }

    pub(crate) fn with_correlation(mut self, token: Option<CorrelationToken>) -> Self {
        self.correlation = token;
        self
    }

    pub fn to_message(&self) -> Result<Message> {
        let results = match &self.results {
            None => Value::Null,
            Some(Payload::Json(value)) => value.clone(),
            Some(Payload::Binary(_)) => {
                return Err(RpcError::protocol(
                    "binary results cannot be carried in a JSON envelope",
                ))
            }
        };
        let mut message = Message::new();
        message.set_option("success", Value::Bool(self.success));
        message.set_option("results", results);
        message.set_option(
            "error",
            self.error.clone().map(Value::String).unwrap_or(Value::Bool(false)),
        );
        Ok(message)
    }
}

impl TryFrom<Message> for Response {
    type Error = RpcError;

    fn try_from(mut message: Message) -> Result<Self> {
        let success = match message.payload.remove("success") {
            Some(Value::Bool(flag)) => flag,
            None => true,
            Some(other) => {
                return Err(RpcError::protocol(format!(
                    "success must be a boolean, got {}",
                    other
                )))
            }
        };
        let results = match message.payload.remove("results") {
            Some(Value::Null) | None => None,
            Some(value) => Some(Payload::Json(value)),
        };
        let error = match message.payload.remove("error") {
            Some(Value::String(text)) => Some(text),
            Some(Value::Bool(false)) | Some(Value::Null) | None => None,
            Some(other) => {
                return Err(RpcError::protocol(format!(
                    "error must be a string or false, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            success,
            results,
            error,
            correlation: None,
        })
    }
}

/// A decoded message as delivered by a codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

impl From<Request> for Envelope {
    fn from(request: Request) -> Self {
        Envelope::Request(request)
    }
}

impl From<Response> for Envelope {
    fn from(response: Response) -> Self {
        Envelope::Response(response)
    }
}
