//! Demo endpoints served by `ada-rpc serve`.

use ada_rpc::{ArgumentSchema, CompressedCodec, JsonCodec, Payload, Server};
use serde_json::{json, Value};

/// Endpoint that binary requests are routed to under `--binary`. Compressed
/// requests carry no endpoint name, so it is the only one served there.
pub const BINARY_ECHO: &str = "echo_bytes";

pub fn echo(args: Payload) -> anyhow::Result<Value> {
    let text = args
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("text must be a string"))?;
    Ok(json!(text))
}

pub fn ping(_args: Payload) -> anyhow::Result<Value> {
    Ok(json!("pong"))
}

/// Returns the payload unchanged.
pub fn echo_bytes(payload: Payload) -> anyhow::Result<Payload> {
    Ok(Payload::Binary(payload.to_bytes()?))
}

pub fn register_json(server: &mut Server<JsonCodec>) -> ada_rpc::Result<()> {
    server.add_handler("echo", echo, ArgumentSchema::new().required("text"))?;
    server.add_handler("ping", ping, ArgumentSchema::new())?;
    Ok(())
}

pub fn register_binary(server: &mut Server<CompressedCodec>) -> ada_rpc::Result<()> {
    server.add_handler(BINARY_ECHO, echo_bytes, ArgumentSchema::new())
}
