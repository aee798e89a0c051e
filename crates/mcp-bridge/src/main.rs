//! MCP Bridge - Entry Point
//!
//! Client mode when a URL (or `SSE_URL`) is given, bridge mode otherwise.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mcp_bridge::backend::RuntimeOptions;
use mcp_bridge::bridge::Bridge;
use mcp_bridge::client::{self, ClientOptions, RemoteTransport};
use mcp_bridge::config::{self, BridgeSettings, ServerConfig};
use mcp_bridge::error::{BridgeError, ConfigError};
use mcp_bridge::server::{self, ServeOptions};

#[derive(Parser, Debug)]
#[command(name = "mcp-bridge")]
#[command(about = "Transport-switching proxy and aggregating bridge for MCP servers")]
#[command(version)]
struct Cli {
    /// Remote MCP endpoint URL (client mode) or a stdio server command
    /// (bridge mode). Falls back to $SSE_URL for the URL form.
    command_or_url: Option<String>,

    /// Arguments for the stdio server command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// HTTP listen port (bridge mode)
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// HTTP listen host (bridge mode)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Remote transport flavor (client mode only)
    #[arg(long, value_enum, default_value_t = TransportArg::Sse)]
    transport: TransportArg,

    /// Add a named stdio server: --named-server NAME 'COMMAND ARGS'
    #[arg(long = "named-server", num_args = 2, value_names = ["NAME", "COMMAND"], action = clap::ArgAction::Append)]
    named_server: Vec<String>,

    /// Named-server config file ({"mcpServers": {...}})
    #[arg(long = "named-server-config")]
    named_server_config: Option<PathBuf>,

    /// Full bridge config file (server descriptors + bridge policy)
    #[arg(long = "bridge-config")]
    bridge_config: Option<PathBuf>,

    /// Spawned children inherit the full host environment
    #[arg(long = "pass-environment")]
    pass_environment: bool,

    /// Extra environment for spawned children: --env KEY VALUE
    #[arg(long, num_args = 2, value_names = ["KEY", "VALUE"], action = clap::ArgAction::Append)]
    env: Vec<String>,

    /// Extra headers for remote transports: --headers KEY VALUE
    #[arg(long, num_args = 2, value_names = ["KEY", "VALUE"], action = clap::ArgAction::Append)]
    headers: Vec<String>,

    /// Access-Control-Allow-Origin value for the HTTP surface
    #[arg(long = "allow-origin")]
    allow_origin: Option<String>,

    /// Streamable HTTP without session ids
    #[arg(long)]
    stateless: bool,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Output logs as JSON
    #[arg(long = "json-logs")]
    json_logs: bool,

    /// Retry remote requests once after re-initializing the session
    #[arg(long = "retry-remote")]
    retry_remote: bool,

    /// Re-initialize retry budget for remote requests
    #[arg(long = "remote-retries", default_value_t = 0)]
    remote_retries: u32,

    /// Deprecated alias for --host
    #[arg(long = "sse-host", hide = true)]
    sse_host: Option<String>,

    /// Deprecated alias for --port
    #[arg(long = "sse-port", hide = true)]
    sse_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum TransportArg {
    /// GET event stream + POST messages
    Sse,
    /// Bidirectional framed POSTs on one URL
    #[value(name = "streamablehttp")]
    StreamableHttp,
}

fn init_tracing(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::registry().with(filter);
    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

/// Turn flattened `--flag KEY VALUE` pairs into a map.
fn pairs_to_map(pairs: &[String]) -> HashMap<String, String> {
    pairs
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.json_logs);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(BridgeError::Config(e)) => {
            tracing::error!(error = %e, "configuration error");
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::from(2)
        }
    }
}

async fn run(mut cli: Cli) -> Result<(), BridgeError> {
    if let Some(host) = cli.sse_host.take() {
        tracing::warn!("--sse-host is deprecated, use --host");
        cli.host = host;
    }
    if let Some(port) = cli.sse_port.take() {
        tracing::warn!("--sse-port is deprecated, use --port");
        cli.port = port;
    }
    let remote_retries = if cli.retry_remote { cli.remote_retries.max(1) } else { cli.remote_retries };

    // A URL positional (or $SSE_URL) selects client mode.
    let url = match &cli.command_or_url {
        Some(value) if value.starts_with("http://") || value.starts_with("https://") => {
            Some(value.clone())
        }
        Some(_) => None,
        None => std::env::var("SSE_URL").ok().filter(|v| !v.is_empty()),
    };

    if let Some(url) = url {
        let options = ClientOptions {
            url: url.clone(),
            transport: match cli.transport {
                TransportArg::Sse => RemoteTransport::Sse,
                TransportArg::StreamableHttp => RemoteTransport::StreamableHttp,
            },
            headers: pairs_to_map(&cli.headers),
            remote_retries,
        };
        return client::run(options).await.map_err(|e| {
            tracing::error!("{}", client::describe_connect_failure(&url, &e));
            BridgeError::Io(std::io::Error::other(e.to_string()))
        });
    }

    // Bridge mode: assemble the server set.
    let mut settings = BridgeSettings::default();
    let mut servers: Vec<ServerConfig> = Vec::new();

    if let Some(path) = &cli.bridge_config {
        let bridge_config = config::load_bridge_config(path)?;
        settings = bridge_config.bridge;
        let mut from_file: Vec<ServerConfig> = bridge_config.mcp_servers.into_values().collect();
        from_file.sort_by(|a, b| a.name.cmp(&b.name));
        servers.extend(from_file);
    }
    if let Some(path) = &cli.named_server_config {
        servers.extend(config::load_named_servers(path)?);
    }
    for pair in cli.named_server.chunks_exact(2) {
        servers.push(ServerConfig::from_command_line(&pair[0], &pair[1])?);
    }
    if let Some(command) = &cli.command_or_url {
        let command_line = std::iter::once(command.clone())
            .chain(cli.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        servers.push(ServerConfig::from_command_line("default", &command_line)?);
    }

    let mut seen = std::collections::HashSet::new();
    for server in &servers {
        if !seen.insert(server.name.clone()) {
            return Err(ConfigError::server(&server.name, "duplicate server name").into());
        }
    }
    if servers.iter().filter(|s| s.enabled).count() == 0 {
        return Err(ConfigError::Invalid("no runnable servers configured".to_string()).into());
    }

    tracing::info!(
        servers = servers.len(),
        host = %cli.host,
        port = cli.port,
        stateless = cli.stateless,
        "starting bridge"
    );

    let options = RuntimeOptions {
        extra_env: pairs_to_map(&cli.env),
        pass_environment: cli.pass_environment,
        remote_retries,
    };
    let bridge = Bridge::new(servers, settings, options);
    bridge.start();

    server::run(
        Arc::clone(&bridge),
        ServeOptions {
            host: cli.host.clone(),
            port: cli.port,
            stateless: cli.stateless,
            allow_origin: cli.allow_origin.clone(),
        },
    )
    .await
}
