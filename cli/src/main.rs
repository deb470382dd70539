use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use protocol::{Canvas, Envelope, Inbound};
use reqwest::Url;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing session token; pass --token or set PHAINT_TOKEN")]
    MissingToken,
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Server { status: u16, body: String },
    #[error("websocket error: {0}")]
    Ws(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket closed")]
    WsClosed,
    #[error("timed out waiting for websocket message")]
    Timeout,
    #[error("invalid message on line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for CliError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Ws(Box::new(error))
    }
}

#[derive(Parser, Debug)]
#[command(name = "phaint-cli", about = "Phaint API and realtime CLI")]
struct Cli {
    #[arg(long, env = "PHAINT_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "PHAINT_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone)]
struct CliContext {
    base_url: String,
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping,
    /// Create an account and print its session token.
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Exchange credentials for a session token.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Project(ProjectCommand),
    Invite(InviteCommand),
    /// Stream a project's realtime messages to stdout as JSON lines.
    Watch(WatchArgs),
    /// Send envelopes from a JSONL file (or stdin) to a project.
    Send(SendArgs),
    Canvas(CanvasCommand),
}

#[derive(Args, Debug)]
struct ProjectCommand {
    #[command(subcommand)]
    command: ProjectSubcommand,
}

#[derive(Subcommand, Debug)]
enum ProjectSubcommand {
    List,
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        creation_date: Option<String>,
    },
    Find {
        name: String,
    },
    Read {
        project_id: String,
    },
    Delete {
        project_id: String,
    },
    Workboard {
        project_id: String,
    },
}

#[derive(Args, Debug)]
struct InviteCommand {
    #[command(subcommand)]
    command: InviteSubcommand,
}

#[derive(Subcommand, Debug)]
enum InviteSubcommand {
    Create { project_id: String },
    Accept { invite_link: String },
}

/// Where and as whom to connect.
#[derive(Args, Debug, Clone)]
struct SessionArgs {
    #[arg(long)]
    project_id: String,

    #[arg(long)]
    user_id: Option<String>,

    #[arg(long)]
    username: Option<String>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[command(flatten)]
    session: SessionArgs,

    #[arg(long, help = "Stop after this many messages")]
    count: Option<usize>,

    #[arg(long, default_value_t = false, help = "Hide users_state messages")]
    no_presence: bool,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    session: SessionArgs,

    #[arg(long, default_value = "-", help = "Input file path, or - for stdin")]
    input: String,

    #[arg(long, default_value_t = false, help = "Fail on the first invalid line instead of skipping it")]
    strict: bool,
}

#[derive(Args, Debug)]
struct CanvasCommand {
    #[command(subcommand)]
    command: CanvasSubcommand,
}

#[derive(Subcommand, Debug)]
enum CanvasSubcommand {
    /// Create a canvas through an `add` operation.
    Add(CanvasAddArgs),
}

#[derive(Args, Debug)]
struct CanvasAddArgs {
    #[command(flatten)]
    session: SessionArgs,

    #[arg(long)]
    canvas_id: Option<String>,

    #[arg(long, default_value_t = 800.0)]
    width: f64,

    #[arg(long, default_value_t = 600.0)]
    height: f64,

    #[arg(long, default_value = "#ffffff")]
    background: String,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let ctx = CliContext { base_url: cli.base_url, token: cli.token };

    match cli.command {
        Command::Ping => run_ping(&ctx).await,
        Command::Register { username, email, password } => {
            let body = serde_json::json!({ "username": username, "email": email, "password": password });
            let json = api_request(&ctx, reqwest::Method::POST, "/api/users/register", Some(body), false).await?;
            print_json(&json)
        }
        Command::Login { email, password } => {
            let body = serde_json::json!({ "email": email, "password": password });
            let json = api_request(&ctx, reqwest::Method::POST, "/api/users/login", Some(body), false).await?;
            print_json(&json)
        }
        Command::Project(project) => run_project(&ctx, project).await,
        Command::Invite(invite) => run_invite(&ctx, invite).await,
        Command::Watch(args) => run_watch(&ctx, args).await,
        Command::Send(args) => run_send(&ctx, args).await,
        Command::Canvas(canvas) => match canvas.command {
            CanvasSubcommand::Add(args) => run_canvas_add(&ctx, args).await,
        },
    }
}

async fn run_ping(cli: &CliContext) -> Result<(), CliError> {
    let client = reqwest::Client::new();
    let url = format!("{}/healthz", cli.base_url.trim_end_matches('/'));
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::Server { status: status.as_u16(), body: "health check failed".to_owned() });
    }
    println!("ok");
    Ok(())
}

async fn run_project(cli: &CliContext, project: ProjectCommand) -> Result<(), CliError> {
    let (method, path, body) = match project.command {
        ProjectSubcommand::List => (reqwest::Method::GET, "/api/projects".to_owned(), None),
        ProjectSubcommand::Create { name, creation_date } => {
            let mut body = serde_json::json!({ "name": name });
            if let Some(date) = creation_date {
                body["creationDate"] = Value::String(date);
            }
            (reqwest::Method::POST, "/api/projects".to_owned(), Some(body))
        }
        ProjectSubcommand::Find { name } => {
            (reqwest::Method::GET, format!("/api/projects/by-name/{}", path_segment(&name)), None)
        }
        ProjectSubcommand::Read { project_id } => (reqwest::Method::GET, format!("/api/projects/{project_id}"), None),
        ProjectSubcommand::Delete { project_id } => {
            (reqwest::Method::DELETE, format!("/api/projects/{project_id}"), None)
        }
        ProjectSubcommand::Workboard { project_id } => {
            (reqwest::Method::GET, format!("/api/projects/{project_id}/workboard"), None)
        }
    };
    let json = api_request(cli, method, &path, body, true).await?;
    print_json(&json)
}

async fn run_invite(cli: &CliContext, invite: InviteCommand) -> Result<(), CliError> {
    let (path, body) = match invite.command {
        InviteSubcommand::Create { project_id } => ("/api/invitations", serde_json::json!({ "projectId": project_id })),
        InviteSubcommand::Accept { invite_link } => {
            ("/api/invitations/accept", serde_json::json!({ "inviteLink": invite_link }))
        }
    };
    let json = api_request(cli, reqwest::Method::POST, path, Some(body), true).await?;
    print_json(&json)
}

async fn run_watch(cli: &CliContext, args: WatchArgs) -> Result<(), CliError> {
    let mut stream = connect(cli, &args.session).await?;
    let mut printed = 0_usize;

    while args.count.is_none_or(|limit| printed < limit) {
        let Some(message) = stream.next().await else {
            break;
        };
        let text = match message? {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };
        if args.no_presence && is_presence(&text) {
            continue;
        }
        println!("{text}");
        printed = printed.saturating_add(1);
    }
    Ok(())
}

async fn run_send(cli: &CliContext, args: SendArgs) -> Result<(), CliError> {
    let reader: Box<dyn BufRead> = if args.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(&args.input)?))
    };

    let mut stream = connect(cli, &args.session).await?;
    let mut sent = 0_usize;
    let mut skipped = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = index + 1;
        match validate_line(&line) {
            Ok(None) => {}
            Ok(Some(text)) => {
                stream.send(Message::text(text)).await?;
                sent = sent.saturating_add(1);
            }
            Err(reason) if args.strict => return Err(CliError::InvalidLine { line: line_no, reason }),
            Err(reason) => {
                eprintln!("skipping line {line_no}: {reason}");
                skipped = skipped.saturating_add(1);
            }
        }
    }

    stream.close(None).await?;
    eprintln!("send complete: project_id={} sent={sent} skipped={skipped}", args.session.project_id);
    Ok(())
}

async fn run_canvas_add(cli: &CliContext, args: CanvasAddArgs) -> Result<(), CliError> {
    let canvas_id = args.canvas_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let mut canvas = Canvas::new(canvas_id.clone());
    canvas.vector_data.width = args.width;
    canvas.vector_data.height = args.height;
    canvas.vector_data.background_fill = args.background;
    canvas.vector_data.timestamp = now_ms().to_string();

    let envelope = Envelope::operation("add", serde_json::to_value(&canvas)?).with_project(&args.session.project_id);
    let mut stream = connect(cli, &args.session).await?;
    stream.send(Message::text(envelope.to_text()?)).await?;

    // The hub relays to every session, the sender included.
    wait_for(&mut stream, Duration::from_secs(10), |msg| {
        msg.get("subtype").and_then(Value::as_str) == Some("add")
            && msg.pointer("/data/id").and_then(Value::as_str) == Some(canvas_id.as_str())
    })
    .await?;

    stream.close(None).await?;
    print_json(&serde_json::to_value(&canvas)?)
}

// =============================================================================
// HELPERS
// =============================================================================

async fn api_request(
    cli: &CliContext,
    method: reqwest::Method,
    path: &str,
    body: Option<Value>,
    authenticated: bool,
) -> Result<Value, CliError> {
    let client = reqwest::Client::new();
    let url = format!("{}{}", cli.base_url.trim_end_matches('/'), path);

    let mut request = client.request(method, &url);
    if authenticated {
        let token = cli.token.as_deref().ok_or(CliError::MissingToken)?;
        request = request.bearer_auth(token);
    }
    if let Some(json) = body {
        request = request.json(&json);
    }

    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(CliError::Server { status: status.as_u16(), body: text });
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

fn ws_url(base_url: &str, session: &SessionArgs) -> Result<Url, CliError> {
    let invalid = || CliError::InvalidBaseUrl(base_url.to_owned());
    let mut url = Url::parse(base_url).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|()| invalid())?;
    url.set_path("/ws");
    {
        let mut query = url.query_pairs_mut();
        query.clear().append_pair("projectId", &session.project_id);
        if let Some(user_id) = &session.user_id {
            query.append_pair("userId", user_id);
        }
        if let Some(username) = &session.username {
            query.append_pair("username", username);
        }
    }
    Ok(url)
}

async fn connect(cli: &CliContext, session: &SessionArgs) -> Result<WsStream, CliError> {
    let url = ws_url(&cli.base_url, session)?;
    let (stream, _) = connect_async(url.as_str()).await?;
    Ok(stream)
}

async fn wait_for(stream: &mut WsStream, timeout: Duration, matches: impl Fn(&Value) -> bool) -> Result<Value, CliError> {
    let fut = async {
        loop {
            let Some(message) = stream.next().await else {
                return Err(CliError::WsClosed);
            };
            let text = match message? {
                Message::Text(text) => text.as_str().to_owned(),
                Message::Close(_) => return Err(CliError::WsClosed),
                _ => continue,
            };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            if matches(&value) {
                return Ok(value);
            }
        }
    };

    tokio::time::timeout(timeout, fut).await.map_err(|_| CliError::Timeout)?
}

/// Check one JSONL line against the wire protocol. Blank lines yield `None`.
fn validate_line(line: &str) -> Result<Option<String>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Inbound::parse(trimmed).map_err(|e| e.to_string())?;
    Ok(Some(trimmed.to_owned()))
}

fn is_presence(text: &str) -> bool {
    Envelope::parse(text).is_ok_and(|envelope| envelope.kind == "users_state")
}

fn path_segment(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
