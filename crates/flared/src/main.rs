#![forbid(unsafe_code)]

use clap::Parser;
use flare_common::SERVICE_ID;
use flared::config::{load_config, Cli, Commands};
use flared::engine::{self, EngineConfig};
use flared::lan::LanTransport;
use flared::local_api;
use std::io::IsTerminal;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

// ── Daemon ──────────────────────────────────────────────────────────

async fn run_daemon(cli: &Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(ref listen) = cli.listen {
        config.listen = listen.clone();
    }
    if let Some(ref name) = cli.name {
        config.name = name.clone();
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let name = if config.name.is_empty() {
        let generated = format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        info!("no node name configured, using {}", generated);
        generated
    } else {
        config.name.clone()
    };

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let transport =
        LanTransport::bind(config.discovery_port, config.transport_port, transport_tx).await?;
    let mesh_port = transport.listen_port();

    // Startup banner
    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}\u{25c8} FLARE Node{RESET} {DIM}v{v}{RESET}");
        eprintln!("  {DIM}Name{RESET}       {CYAN}{name}{RESET}");
        eprintln!("  {DIM}Service{RESET}    {SERVICE_ID}");
        eprintln!("  {DIM}Listen{RESET}     {}", config.listen);
        eprintln!(
            "  {DIM}Mesh{RESET}       udp/{} tcp/{mesh_port}",
            config.discovery_port
        );
        eprintln!();
    }

    info!(name = %name, "starting flared");

    let engine_config = EngineConfig {
        service_id: SERVICE_ID.to_string(),
        local_name: name,
        seen_capacity: config.seen_capacity,
        timing: config.timing.clone(),
    };
    let (engine, engine_events) = engine::spawn(engine_config, transport, transport_rx);
    engine
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("engine failed to start: {e}"))?;

    let (subscribers, _) = broadcast::channel::<local_api::ApiEvent>(1024);
    let (peer_tx, peer_rx) = watch::channel(0usize);

    let pump_handle = tokio::spawn(local_api::pump_events(
        engine_events,
        subscribers.clone(),
        peer_tx,
    ));

    let api_handle = tokio::spawn({
        let listen = config.listen.clone();
        let engine = engine.clone();
        let max_alert_len = config.max_alert_len;
        async move {
            if let Err(e) =
                local_api::serve(&listen, engine, subscribers, peer_rx, max_alert_len).await
            {
                error!("Local API error: {}", e);
            }
        }
    });

    tokio::select! {
        _ = pump_handle => {
            warn!("event pump exited");
        }
        _ = api_handle => {
            info!("Local API server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    engine.shutdown().await;
    Ok(())
}

// ── Daemon IPC ──────────────────────────────────────────────────────

async fn daemon_cmd(listen: &str, cmd: &str) -> anyhow::Result<String> {
    match TcpStream::connect(listen).await {
        Ok(stream) => {
            let (reader, mut writer) = stream.into_split();
            let mut reader = tokio::io::BufReader::new(reader);

            writer.write_all(cmd.as_bytes()).await?;
            writer.write_all(b"\n").await?;

            let mut line = String::new();
            reader.read_line(&mut line).await?;

            Ok(line)
        }
        Err(e) => {
            if tty() {
                eprintln!();
                eprintln!("  {RED}\u{2717}{RESET} Could not connect to daemon");
                eprintln!("    {DIM}{e}{RESET}");
                eprintln!();
                eprintln!("    Is flared running? Try: {BOLD}flared start{RESET}");
                eprintln!();
            } else {
                eprintln!("Failed to connect to daemon: {e}");
            }
            std::process::exit(1);
        }
    }
}

// ── Pretty formatters ───────────────────────────────────────────────

fn fmt_status(json: &serde_json::Value) {
    let peers = json["peers"].as_u64().unwrap_or(0);
    let v = env!("CARGO_PKG_VERSION");

    let dot = if peers > 0 {
        format!("{GREEN}\u{25cf}{RESET}")
    } else {
        format!("{YELLOW}\u{25cf}{RESET}")
    };

    println!();
    println!("  {BOLD}\u{25c8} FLARE Node{RESET} {DIM}v{v}{RESET}");
    println!();
    println!("  {DIM}Status{RESET}     {dot} running");
    println!("  {DIM}Peers{RESET}      {peers} connected");
    println!();
}

fn fmt_send(json: &serde_json::Value) {
    let status = json["status"].as_str().unwrap_or("error");
    let error = json["error"].as_str();

    match (status, error) {
        ("sent", _) => println!("  {GREEN}\u{2713}{RESET} Alert sent"),
        (_, Some(msg)) => println!("  {RED}\u{2717}{RESET} {msg}"),
        _ => println!("  {RED}\u{2717}{RESET} Send failed"),
    }
}

fn fmt_event(json: &serde_json::Value) {
    match json["event"].as_str() {
        Some("alert") => {
            let text = json["text"].as_str().unwrap_or("");
            let ttl = json["ttl"].as_u64().unwrap_or(0);
            println!("  {RED}{BOLD}ALERT{RESET} {text} {DIM}(ttl {ttl}){RESET}");
        }
        Some("status") => {
            let message = json["message"].as_str().unwrap_or("");
            println!("  {DIM}{message}{RESET}");
        }
        _ => println!("  {DIM}{json}{RESET}"),
    }
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli)?;

    match &cli.command {
        Commands::Start => run_daemon(&cli).await?,

        Commands::Status => {
            let config = load_config(cli.config.as_deref())?;
            let addr = cli.listen.as_deref().unwrap_or(&config.listen);
            let resp = daemon_cmd(addr, "{\"cmd\": \"status\"}").await?;

            if tty() {
                let json: serde_json::Value = serde_json::from_str(resp.trim())?;
                fmt_status(&json);
            } else {
                print!("{resp}");
            }
        }

        Commands::Send { text } => {
            let config = load_config(cli.config.as_deref())?;
            let addr = cli.listen.as_deref().unwrap_or(&config.listen);
            let cmd = serde_json::json!({ "cmd": "send", "text": text });
            let resp = daemon_cmd(addr, &serde_json::to_string(&cmd)?).await?;

            if tty() {
                let json: serde_json::Value = serde_json::from_str(resp.trim())?;
                fmt_send(&json);
            } else {
                print!("{resp}");
            }
        }

        Commands::Watch => {
            let config = load_config(cli.config.as_deref())?;
            let addr = cli.listen.as_deref().unwrap_or(&config.listen);

            let stream = match TcpStream::connect(addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("Failed to connect to daemon: {e}");
                    std::process::exit(1);
                }
            };
            let (reader, mut writer) = stream.into_split();
            writer.write_all(b"{\"cmd\": \"subscribe\"}\n").await?;

            let mut lines = tokio::io::BufReader::new(reader).lines();
            while let Some(line) = lines.next_line().await? {
                if tty() {
                    match serde_json::from_str::<serde_json::Value>(&line) {
                        Ok(json) => fmt_event(&json),
                        Err(_) => println!("{line}"),
                    }
                } else {
                    println!("{line}");
                }
            }
        }
    }
    Ok(())
}
