use crate::engine::{EngineEvent, EngineHandle};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// Maximum command line length. Prevents unbounded memory allocation from
/// a misbehaving local process sending an enormous line.
const MAX_CMD_LEN: usize = 65_536;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd")]
enum ApiCommand {
    #[serde(rename = "send")]
    Send { text: String },
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "subscribe")]
    Subscribe,
}

/// Event fanned out to `subscribe` clients, one JSON line each.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ApiEvent {
    /// A newly received alert.
    #[serde(rename = "alert")]
    Alert {
        /// Unique alert identifier.
        id: String,
        /// Alert text.
        text: String,
        /// Origination time in milliseconds since the Unix epoch.
        timestamp: i64,
        /// Hop budget the alert arrived with.
        ttl: u32,
    },
    /// An engine status line.
    #[serde(rename = "status")]
    Status {
        /// Status text.
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
struct SendResponse {
    status: String,
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct StatusResponse {
    status: String,
    peers: usize,
}

/// Forwards engine events to API subscribers and keeps the peer-count
/// indicator current by parsing the literal `Status: <N> peers connected`
/// form.
pub async fn pump_events(
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    subscribers: broadcast::Sender<ApiEvent>,
    peer_count: watch::Sender<usize>,
) {
    while let Some(event) = events.recv().await {
        let api_event = match event {
            EngineEvent::AlertReceived {
                id,
                text,
                timestamp,
                ttl,
            } => ApiEvent::Alert {
                id,
                text,
                timestamp,
                ttl,
            },
            EngineEvent::Status { message } => {
                if let Some(count) = parse_peer_count(&message) {
                    let _ = peer_count.send(count);
                }
                ApiEvent::Status { message }
            }
        };
        // No subscribers is fine; events are best-effort.
        let _ = subscribers.send(api_event);
    }
}

fn parse_peer_count(message: &str) -> Option<usize> {
    message
        .strip_prefix("Status: ")?
        .strip_suffix(" peers connected")?
        .parse()
        .ok()
}

/// # Errors
///
/// Returns an error if binding the local API listener fails.
pub async fn serve(
    listen: &str,
    engine: EngineHandle,
    subscribers: broadcast::Sender<ApiEvent>,
    peer_count: watch::Receiver<usize>,
    max_alert_len: usize,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("local API listening on {}", listen);

    loop {
        let (stream, _) = listener.accept().await?;
        let engine = engine.clone();
        let subscribers = subscribers.clone();
        let peer_count = peer_count.clone();
        let (reader, writer) = stream.into_split();

        tokio::spawn(async move {
            if let Err(e) =
                handle_client(reader, writer, engine, &subscribers, peer_count, max_alert_len)
                    .await
            {
                debug!("client handler error: {}", e);
            }
        });
    }
}

async fn handle_client<R, W>(
    reader: R,
    mut writer: W,
    engine: EngineHandle,
    subscribers: &broadcast::Sender<ApiEvent>,
    peer_count: watch::Receiver<usize>,
    max_alert_len: usize,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_CMD_LEN as u64 + 1);
        match tokio::io::AsyncBufReadExt::read_line(&mut limited, &mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        if line.len() > MAX_CMD_LEN {
            let error = serde_json::to_string(&serde_json::json!({
                "error": format!("command exceeds maximum length ({MAX_CMD_LEN} bytes)")
            }))? + "\n";
            writer.write_all(error.as_bytes()).await?;
            continue;
        }

        let cmd: ApiCommand = match serde_json::from_str(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                let error =
                    serde_json::to_string(&serde_json::json!({"error": e.to_string()}))? + "\n";
                writer.write_all(error.as_bytes()).await?;
                continue;
            }
        };

        let response = match cmd {
            ApiCommand::Send { text } => {
                let response = if text.chars().count() > max_alert_len {
                    SendResponse {
                        status: "error".to_string(),
                        error: Some(format!("alert text exceeds {max_alert_len} characters")),
                    }
                } else {
                    match engine.send_alert(&text).await {
                        Ok(()) => SendResponse {
                            status: "sent".to_string(),
                            error: None,
                        },
                        Err(e) => SendResponse {
                            status: "error".to_string(),
                            error: Some(e.to_string()),
                        },
                    }
                };
                serde_json::to_string(&response)? + "\n"
            }
            ApiCommand::Status => {
                let response = StatusResponse {
                    status: "running".to_string(),
                    peers: *peer_count.borrow(),
                };
                serde_json::to_string(&response)? + "\n"
            }
            ApiCommand::Subscribe => {
                handle_subscribe(subscribers.subscribe(), &mut writer).await?;
                return Ok(());
            }
        };

        writer.write_all(response.as_bytes()).await?;
    }

    Ok(())
}

async fn handle_subscribe<W>(
    mut events: broadcast::Receiver<ApiEvent>,
    writer: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if writer.write_all((json + "\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "subscriber lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}
