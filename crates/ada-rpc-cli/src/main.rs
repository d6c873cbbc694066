//! Ada RPC command-line tool.
//!
//! Generates CURVE certificates, runs a demo server, and issues single calls
//! against a running server.

mod handlers;

use ada_rpc::{
    create_certificates, CertificateConfig, Client, CompressedCodec, JsonCodec, Response,
    RpcConfig, Server,
};
use anyhow::{bail, Context as _, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "ada-rpc")]
#[command(about = "Authenticated request-reply messaging for Ada")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a server key pair as public and secret certificates
    Keygen {
        /// Directory to write the certificates into
        dir: PathBuf,

        /// Certificate base name
        #[arg(long, default_value = CertificateConfig::DEFAULT_NAME)]
        name: String,
    },

    /// Run a demo server until interrupted
    Serve {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Server secret certificate; enables CURVE
        #[arg(long)]
        secret_cert: Option<PathBuf>,

        /// Serve opaque payloads with the compressed framing instead of JSON
        #[arg(long)]
        binary: bool,
    },

    /// Send one request and print the response
    Call {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Pinned server public certificate; enables CURVE
        #[arg(long)]
        server_cert: Option<PathBuf>,

        /// Give up if no reply arrives within this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Send this file's bytes with the compressed framing
        #[arg(long, conflicts_with = "json", required_unless_present = "json")]
        file: Option<PathBuf>,

        /// Call a named endpoint with JSON arguments: <ENDPOINT> <ARGS>
        #[arg(long, num_args = 2, value_names = ["ENDPOINT", "ARGS"])]
        json: Option<Vec<String>>,
    },
}

#[derive(ClapArgs, Debug)]
struct ConnectionArgs {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket address, e.g. tcp://127.0.0.1:5555 or ipc:///tmp/ada.sock
    #[arg(short, long)]
    endpoint: Option<String>,
}

impl ConnectionArgs {
    /// Load the configuration file, if any, then apply command-line overrides.
    fn resolve(&self) -> Result<RpcConfig> {
        let mut config = match &self.config {
            Some(path) => RpcConfig::load(path)?,
            None => RpcConfig::new(String::new()),
        };
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if config.endpoint.is_empty() {
            bail!("no endpoint given; pass --endpoint or a --config file");
        }
        Ok(config)
    }
}

fn init_logging(debug: bool, json: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.log_json);

    match args.command {
        Command::Keygen { dir, name } => keygen(&dir, &name),
        Command::Serve {
            connection,
            secret_cert,
            binary,
        } => {
            let mut config = connection.resolve()?;
            if secret_cert.is_some() {
                config.secret_certificate = secret_cert;
            }
            serve(config, binary).await
        }
        Command::Call {
            connection,
            server_cert,
            timeout_ms,
            file,
            json,
        } => {
            let mut config = connection.resolve()?;
            if server_cert.is_some() {
                config.server_certificate = server_cert;
            }
            let timeout = timeout_ms.map(Duration::from_millis);
            let response = match (file, json) {
                (Some(path), _) => call_file(&config, &path, timeout).await?,
                (None, Some(call)) => call_json(&config, &call, timeout).await?,
                (None, None) => bail!("pass --file or --json"),
            };
            report(response)
        }
    }
}

fn keygen(dir: &Path, name: &str) -> Result<()> {
    let (public, secret) = create_certificates(dir, name)
        .with_context(|| format!("Failed to write certificates to {}", dir.display()))?;
    info!("Public certificate: {}", public.display());
    info!("Secret certificate: {}", secret.display());
    println!("{}", public.display());
    Ok(())
}

async fn serve(mut config: RpcConfig, binary: bool) -> Result<()> {
    if binary {
        let default_endpoint = config
            .default_endpoint
            .get_or_insert_with(|| handlers::BINARY_ECHO.to_string())
            .clone();
        let mut server = Server::from_config(&config, CompressedCodec)?;
        handlers::register_binary(&mut server)?;
        server.open(&config.endpoint).await?;
        announce(server.local_endpoint(), &format!("binary, default endpoint {}", default_endpoint));
        wait_for_shutdown().await?;
        server.close().await;
    } else {
        let mut server = Server::from_config(&config, JsonCodec)?;
        handlers::register_json(&mut server)?;
        server.open(&config.endpoint).await?;
        announce(server.local_endpoint(), "json");
        wait_for_shutdown().await?;
        server.close().await;
    }
    Ok(())
}

fn announce(endpoint: Option<&ada_rpc::Endpoint>, mode: &str) {
    let endpoint = endpoint.map(ToString::to_string).unwrap_or_default();
    // Scripts read the bound address from stdout.
    println!("RPC_ENDPOINT={}", endpoint);
    info!("RPC server running on {} ({})", endpoint, mode);
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}

async fn call_file(config: &RpcConfig, path: &Path, timeout: Option<Duration>) -> Result<Response> {
    let payload = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    info!("Sending {} bytes from {}", payload.len(), path.display());

    let client: Client<CompressedCodec> = Client::from_config(config).await?;
    let response = match timeout {
        Some(wait) => client.call_timeout(payload, wait).await?,
        None => client.call(payload).await?,
    };
    client.close().await;
    Ok(response)
}

async fn call_json(config: &RpcConfig, call: &[String], timeout: Option<Duration>) -> Result<Response> {
    let [endpoint, args] = call else {
        bail!("--json takes an endpoint and a JSON object");
    };
    let args: Value = serde_json::from_str(args).with_context(|| format!("Invalid JSON arguments: {}", args))?;

    let client: Client<JsonCodec> = Client::from_config(config).await?;
    let response = client
        .exchange(ada_rpc::Request::new(endpoint.as_str(), args), timeout)
        .await?;
    client.close().await;
    Ok(response)
}

/// Print a response; a failed one becomes the process error.
fn report(response: Response) -> Result<()> {
    if !response.is_success() {
        bail!(
            "call failed: {}",
            response.error().unwrap_or("no error message")
        );
    }
    match response.results() {
        Some(ada_rpc::Payload::Json(value)) => println!("{}", serde_json::to_string_pretty(value)?),
        Some(ada_rpc::Payload::Binary(bytes)) => match std::str::from_utf8(bytes) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("<{} bytes>", bytes.len()),
        },
        None => println!("null"),
    }
    Ok(())
}
