use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use frames::document::SharedDocument;
use frames::event::RoomEvent;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use room_client::{
    AuthProvider, ClientConfig, ClientError, HttpAuthProvider, ReconnectPolicy, RoomSession, SessionEvent,
    StaticTicket,
};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing session token; pass --session-token or set ROOM_SESSION_TOKEN")]
    MissingSessionToken,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("server returned {status}: {message}")]
    ServerError { status: String, message: String },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("cannot read {path}: {message}")]
    Input { path: String, message: String },
    #[error("room closed: {0}")]
    Closed(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

#[derive(Parser, Debug)]
#[command(name = "room-cli", about = "Board room grant, presence and event CLI")]
struct Cli {
    #[arg(long, env = "ROOM_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "ROOM_SESSION_TOKEN")]
    session_token: Option<String>,

    /// Use a ticket obtained elsewhere instead of requesting a grant.
    /// Tickets are single-use, so reconnect is disabled.
    #[arg(long, env = "ROOM_TICKET")]
    ticket: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone)]
struct CliContext {
    base_url: String,
    session_token: Option<String>,
    ticket: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping,
    /// Request a room ticket for a board.
    Grant { board_id: String },
    /// List who is currently in a board's room.
    Participants { board_id: String },
    /// Join a room and print presence, events and document changes as JSON lines.
    Watch { board_id: String },
    /// Join a room, broadcast one event, and leave.
    Publish {
        board_id: String,
        /// Event JSON, e.g. '{"type":"CARD_MOVED","cardId":"c1","toListId":"l2"}'
        #[arg(long)]
        event: String,
    },
    /// Seed the room's shared document from a JSON file if the room has none.
    Seed {
        board_id: String,
        #[arg(long)]
        document: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = CliContext { base_url: cli.base_url, session_token: cli.session_token, ticket: cli.ticket };

    match cli.command {
        Command::Ping => run_ping(&ctx).await,
        Command::Grant { board_id } => {
            let path = format!("/api/rooms/{board_id}/grant");
            let json = api_request(&ctx, reqwest::Method::POST, &path).await?;
            print_json(&json)
        }
        Command::Participants { board_id } => {
            let path = format!("/api/rooms/{board_id}/participants");
            let json = api_request(&ctx, reqwest::Method::GET, &path).await?;
            print_json(&json)
        }
        Command::Watch { board_id } => run_watch(&ctx, &board_id).await,
        Command::Publish { board_id, event } => run_publish(&ctx, &board_id, &event).await,
        Command::Seed { board_id, document } => run_seed(&ctx, &board_id, &document).await,
    }
}

async fn run_ping(cli: &CliContext) -> Result<(), CliError> {
    let client = reqwest::Client::new();
    let url = format!("{}/healthz", cli.base_url.trim_end_matches('/'));
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::ServerError {
            status: format!("HTTP {}", status.as_u16()),
            message: "health check failed".to_owned(),
        });
    }
    println!("ok");
    Ok(())
}

// =============================================================================
// ROOM SESSIONS
// =============================================================================

async fn run_watch(cli: &CliContext, board_id: &str) -> Result<(), CliError> {
    let session = join(cli, board_id).await?;
    let mut events = session.subscribe();

    for participant in session.others() {
        print_json(&json!({ "type": "participant", "participant": participant }))?;
    }

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    print_json(&event_line(&event))?;
                    if let SessionEvent::Closed { reason } = event {
                        return Err(CliError::Closed(reason));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("watch fell behind; skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(CliError::Closed("session ended".to_owned())),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.disconnect().await;
    Ok(())
}

async fn run_publish(cli: &CliContext, board_id: &str, raw: &str) -> Result<(), CliError> {
    let event = parse_event(raw)?;
    let session = join(cli, board_id).await?;
    let kind = event.kind();
    session.publish(event);
    session.disconnect().await;
    eprintln!("published {kind} to {board_id}");
    Ok(())
}

async fn run_seed(cli: &CliContext, board_id: &str, path: &Path) -> Result<(), CliError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|error| CliError::Input { path: path.display().to_string(), message: error.to_string() })?;
    let document = serde_json::from_str::<SharedDocument>(&raw)?;

    let session = join(cli, board_id).await?;
    let mut events = session.subscribe();
    session.seed(document);

    let replaced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::DocumentReplaced) => return Ok(()),
                Ok(SessionEvent::Closed { reason }) => return Err(CliError::Closed(reason)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(CliError::Closed("session ended".to_owned())),
            }
        }
    })
    .await
    .map_err(|_| CliError::Timeout("seed reply"))?;
    replaced?;

    let document = session.document();
    session.disconnect().await;
    print_json(&serde_json::to_value(document)?)
}

async fn join(cli: &CliContext, board_id: &str) -> Result<RoomSession, CliError> {
    let mut config = ClientConfig::new(cli.base_url.clone());
    let auth: Arc<dyn AuthProvider> = match (&cli.ticket, &cli.session_token) {
        (Some(ticket), _) => {
            config = config.with_reconnect(ReconnectPolicy::disabled());
            Arc::new(StaticTicket(ticket.clone()))
        }
        (None, Some(token)) => Arc::new(HttpAuthProvider::new(config.clone(), token.clone())),
        (None, None) => return Err(CliError::MissingSessionToken),
    };
    Ok(room_client::connect(config, board_id, auth).await?)
}

// =============================================================================
// HTTP
// =============================================================================

async fn api_request(cli: &CliContext, method: reqwest::Method, path: &str) -> Result<Value, CliError> {
    let session_token = cli.session_token.as_deref().ok_or(CliError::MissingSessionToken)?;

    let mut headers = HeaderMap::new();
    headers.insert(COOKIE, HeaderValue::from_str(&format!("session_token={session_token}"))?);

    let client = reqwest::Client::builder().default_headers(headers).build()?;
    let url = format!("{}{}", cli.base_url.trim_end_matches('/'), path);

    let response = client.request(method, &url).send().await?;
    let status = response.status();
    let value = response.json::<Value>().await.unwrap_or(Value::Null);

    if !status.is_success() {
        return Err(CliError::ServerError { status: format!("HTTP {}", status.as_u16()), message: value.to_string() });
    }

    Ok(value)
}

// =============================================================================
// OUTPUT
// =============================================================================

fn parse_event(raw: &str) -> Result<RoomEvent, CliError> {
    Ok(serde_json::from_str::<RoomEvent>(raw)?)
}

/// One JSON object per session event, tagged by `type`.
fn event_line(event: &SessionEvent) -> Value {
    match event {
        SessionEvent::Connected { client_id } => json!({ "type": "connected", "clientId": client_id }),
        SessionEvent::Disconnected => json!({ "type": "disconnected" }),
        SessionEvent::Reconnecting { attempt, delay } => {
            json!({ "type": "reconnecting", "attempt": attempt, "delayMs": delay.as_millis() })
        }
        SessionEvent::ParticipantJoined(participant) => json!({ "type": "joined", "participant": participant }),
        SessionEvent::PresenceUpdated(participant) => json!({ "type": "presence", "participant": participant }),
        SessionEvent::ParticipantLeft { client_id, user_id } => {
            json!({ "type": "left", "clientId": client_id, "userId": user_id })
        }
        SessionEvent::Event(envelope) => json!({ "type": "event", "event": envelope }),
        SessionEvent::DocumentChanged(change) => json!({ "type": "doc_changed", "change": change }),
        SessionEvent::DocumentReplaced => json!({ "type": "doc_replaced" }),
        SessionEvent::OpRejected { code, message } => json!({ "type": "op_rejected", "code": code, "message": message }),
        SessionEvent::Closed { reason } => json!({ "type": "closed", "reason": reason }),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
