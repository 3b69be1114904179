use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use duplex_client::{AnalyzeHandler, RelayClient};
use duplex_core::{ClientId, IdStrategy};
use duplex_server::ServerConfig;
use duplex_telemetry::{LogFormat, TelemetryConfig};

#[derive(Parser)]
#[command(name = "duplex", about = "Request/response relay over SSE push and HTTP POST")]
struct Cli {
    /// Default log level, overridden by RUST_LOG.
    #[arg(long, global = true, env = "DUPLEX_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    /// Log output format: pretty or json.
    #[arg(long, global = true, env = "DUPLEX_LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server.
    Serve(ServeArgs),
    /// Run the demo client that answers pushed requests.
    Client(ClientArgs),
    /// Dispatch one request through a running server and print the response.
    Trigger(TriggerArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "DUPLEX_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "DUPLEX_PORT", default_value_t = 8082)]
    port: u16,

    /// Requests buffered per client before dispatch reports backpressure.
    #[arg(long, env = "DUPLEX_PUSH_QUEUE_CAPACITY", default_value_t = 10)]
    push_queue_capacity: usize,

    #[arg(long, env = "DUPLEX_DEFAULT_TIMEOUT_SECS", default_value_t = 30)]
    default_timeout_secs: u64,

    #[arg(long, env = "DUPLEX_MAX_TIMEOUT_SECS", default_value_t = 300)]
    max_timeout_secs: u64,

    #[arg(long, env = "DUPLEX_KEEP_ALIVE_SECS", default_value_t = 15)]
    keep_alive_secs: u64,

    /// Request id scheme: sequential or uuid.
    #[arg(long, env = "DUPLEX_ID_STRATEGY", default_value = "sequential")]
    id_strategy: IdStrategy,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            push_queue_capacity: args.push_queue_capacity.max(1),
            default_timeout: Duration::from_secs(args.default_timeout_secs),
            max_timeout: Duration::from_secs(args.max_timeout_secs.max(args.default_timeout_secs)),
            keep_alive_interval: Duration::from_secs(args.keep_alive_secs.max(1)),
            id_strategy: args.id_strategy,
        }
    }
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long, env = "DUPLEX_SERVER_URL", default_value = "http://localhost:8082")]
    server: String,

    #[arg(long, env = "DUPLEX_CLIENT_ID", default_value = "demo_client")]
    client_id: String,

    /// Simulated processing time per request, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    delay_ms: u64,
}

#[derive(Args)]
struct TriggerArgs {
    #[arg(long, env = "DUPLEX_SERVER_URL", default_value = "http://localhost:8082")]
    server: String,

    #[arg(long, default_value = "demo_client")]
    client_id: String,

    #[arg(long, default_value = "analyze")]
    method: String,

    /// Wait for the response, in milliseconds. Server default when omitted.
    #[arg(long)]
    timeout_ms: Option<u64>,

    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = duplex_telemetry::init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        format: cli.log_format,
        ..Default::default()
    });

    match cli.command {
        Command::Serve(args) => serve(args.into(), telemetry.metrics()).await,
        Command::Client(args) => run_client(args).await,
        Command::Trigger(args) => trigger(args).await,
    }
}

async fn serve(config: ServerConfig, metrics: Arc<duplex_telemetry::MetricsRecorder>) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let handle = duplex_server::start(config, metrics)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(port = handle.port, "Duplex relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn run_client(args: ClientArgs) -> anyhow::Result<()> {
    let client = RelayClient::new(args.server).with_client_id(ClientId::from_raw(args.client_id));
    let handler = Arc::new(AnalyzeHandler::new(Duration::from_millis(args.delay_ms)));

    tokio::select! {
        result = client.run(handler) => result.context("push stream failed")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Client stopping"),
    }
    Ok(())
}

async fn trigger(args: TriggerArgs) -> anyhow::Result<()> {
    let client = RelayClient::new(args.server);
    let response = client
        .trigger(
            &ClientId::from_raw(args.client_id),
            &args.message,
            Some(&args.method),
            args.timeout_ms.map(Duration::from_millis),
        )
        .await
        .context("trigger failed")?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
