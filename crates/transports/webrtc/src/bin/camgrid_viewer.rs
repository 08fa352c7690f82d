//! Headless multi-camera viewer
//!
//! Connects to every configured camera stream on a WebRTC gateway, logs
//! state changes and admission progress, and shuts down cleanly on Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Streams from a config file
//! cargo run --bin camgrid_viewer -- --config streams.yaml
//!
//! # Streams on the command line, one handshake at a time
//! cargo run --bin camgrid_viewer -- \
//!   --gateway-url ws://10.0.10.3:1984/api/ws \
//!   --mode gated \
//!   --stream driveway=Driveway --stream porch=Porch
//!
//! # Bounded pool of 2 concurrent handshakes, JSON logs
//! CAMGRID_TOKEN=secret cargo run --bin camgrid_viewer -- \
//!   --config streams.toml --mode capped --max-concurrent 2 --log-json
//! ```

use anyhow::Context;
use camgrid_webrtc::config::TurnServerConfig;
use camgrid_webrtc::credential::{CredentialSource, StaticCredential};
use camgrid_webrtc::{
    Orchestrator, OrchestratorConfig, OrchestratorEvent, SchedulerMode, StreamConfig,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Camgrid viewer
///
/// Streams many live camera feeds from a WebRTC gateway with capped or
/// gated connection admission.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (.yaml, .yml, .toml or .json)
    #[arg(short, long, env = "CAMGRID_CONFIG")]
    config: Option<PathBuf>,

    /// Gateway WebSocket signaling URL
    #[arg(long, env = "CAMGRID_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Gateway credential
    #[arg(long, env = "CAMGRID_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Admission mode: capped, gated
    #[arg(short, long, env = "CAMGRID_MODE")]
    mode: Option<ModeArg>,

    /// Concurrent handshakes in capped mode
    #[arg(long, env = "CAMGRID_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Attempts before a stream is reported failed
    #[arg(long, env = "CAMGRID_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Extra streams (format: key or key=label, repeatable)
    #[arg(long = "stream")]
    streams: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "CAMGRID_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Log as JSON lines
    #[arg(long, default_value_t = false, env = "CAMGRID_LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ModeArg {
    /// Bounded pool of concurrent handshakes
    Capped,
    /// One handshake at a time, in configured order
    Gated,
}

impl From<ModeArg> for SchedulerMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Capped => SchedulerMode::Capped,
            ModeArg::Gated => SchedulerMode::Gated,
        }
    }
}

/// Parse TURN server string (format: turn:host:port:username:password or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> Result<TurnServerConfig, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        return Err(format!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        ));
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        return Err(format!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        ));
    }

    // Password may contain colons
    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        credential: parts[4..].join(":"),
    })
}

/// Parse `key` or `key=label`
fn parse_stream(s: &str) -> StreamConfig {
    match s.split_once('=') {
        Some((key, label)) => StreamConfig::new(key.trim(), label.trim()),
        None => StreamConfig::new(s.trim(), ""),
    }
}

/// Build the configuration: file first, then command line overrides
fn build_config(args: &Args) -> anyhow::Result<OrchestratorConfig> {
    let mut config = match &args.config {
        Some(path) => OrchestratorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };

    if let Some(url) = &args.gateway_url {
        config.gateway_url = url.clone();
    }
    if let Some(mode) = args.mode {
        config.scheduler.mode = mode.into();
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.scheduler.max_concurrent = max_concurrent;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.connection.max_attempts = max_attempts;
    }

    for turn_str in &args.turn_servers {
        let turn = parse_turn_server(turn_str).map_err(anyhow::Error::msg)?;
        info!("Adding TURN server: {} (user: {})", turn.url, turn.username);
        config.turn_servers.push(turn);
    }

    config
        .streams
        .extend(args.streams.iter().map(|s| parse_stream(s)));

    config.validate()?;
    if config.streams.is_empty() {
        anyhow::bail!("no streams configured; pass --config or --stream");
    }

    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        eprintln!("Ctrl+C received, shutting down...");
    })
    .context("failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("camgrid-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    let config = build_config(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        gateway = %config.gateway_url,
        mode = ?config.scheduler.mode,
        streams = config.streams.len(),
        "Camgrid viewer starting"
    );

    let credentials: Arc<dyn CredentialSource> =
        Arc::new(StaticCredential::new(args.token.clone().unwrap_or_default()));
    let orchestrator = Orchestrator::with_gateway(config, credentials)?;
    let (handle, mut events) = orchestrator.spawn();

    handle.request_all().await?;

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                log_event(&event);
            }
            _ = ticker.tick() => {
                if shutdown_flag.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    info!("Shutdown signal received, cleaning up...");
    handle.shutdown().await?;
    info!("Camgrid viewer shut down gracefully");

    Ok(())
}

fn log_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::StateChanged {
            stream_key,
            state,
            attempt,
            last_error,
        } => match last_error {
            Some(reason) => info!("{}: {} (attempt {}, last error: {})", stream_key, state, attempt, reason),
            None => info!("{}: {} (attempt {})", stream_key, state, attempt),
        },
        OrchestratorEvent::Connected { stream_key } => info!("{}: media flowing", stream_key),
        OrchestratorEvent::Failed { stream_key, reason } => {
            error!("{}: gave up: {}", stream_key, reason)
        }
        OrchestratorEvent::MediaAttached { stream_key, track } => {
            info!("{}: {:?} track {} ({})", stream_key, track.kind, track.id, track.codec)
        }
        OrchestratorEvent::MediaDetached { stream_key } => warn!("{}: media detached", stream_key),
        OrchestratorEvent::Progress { admitted, total } => {
            info!("Admitted {}/{} streams", admitted, total)
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_turn_server() {
        let turn = parse_turn_server("turns:turn.example:5349:user:pa:ss").unwrap();
        assert_eq!(turn.url, "turns:turn.example:5349");
        assert_eq!(turn.username, "user");
        assert_eq!(turn.credential, "pa:ss");

        assert!(parse_turn_server("stun:host:3478:u:p").is_err());
        assert!(parse_turn_server("turn:host").is_err());
    }

    #[test]
    fn test_parse_stream() {
        let stream = parse_stream("porch=Front porch");
        assert_eq!(stream.key, "porch");
        assert_eq!(stream.label, "Front porch");
        assert_eq!(parse_stream("garage").key, "garage");
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "camgrid_viewer",
            "--gateway-url",
            "ws://nvr:1984/api/ws",
            "--mode",
            "gated",
            "--max-attempts",
            "5",
            "--stream",
            "a",
            "--stream",
            "b=B",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.scheduler.mode, SchedulerMode::Gated);
        assert_eq!(config.connection.max_attempts, 5);
        assert_eq!(config.streams.len(), 2);
    }
}
