use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::Message;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(name = "trivia")]
#[command(about = "Trivia session coordinator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the session coordinator (HTTP + WebSocket).
    Serve {
        /// Config file path (default: TRIVIA_CONFIG_PATH or ~/.trivia/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,

        /// Bind address (default from config or 127.0.0.1)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Create a session on a running coordinator and print its code.
    Create {
        /// Game id in the content service.
        #[arg(long)]
        game: i64,

        /// Host display name.
        #[arg(long)]
        host: String,

        #[arg(long)]
        max_teams: Option<u32>,

        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },

    /// Join a session interactively. Prints every frame; stdin lines are sent as JSON
    /// or as shorthands (/start, /show N, /next, /answers, /score-start,
    /// /score N team=pts ..., /score-finish, /end, /join TEAM, /answer N TEXT).
    Connect {
        /// Session code.
        code: String,

        /// host or team
        #[arg(long, default_value = "team")]
        role: String,

        /// Display name (also the team name for /join and /answer).
        #[arg(long)]
        name: String,

        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("trivia {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, port, bind }) => {
            if let Err(e) = run_serve(config, port, bind).await {
                log::error!("server failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Create {
            game,
            host,
            max_teams,
            server,
        }) => {
            if let Err(e) = run_create(&server, game, &host, max_teams).await {
                log::error!("create failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Connect {
            code,
            role,
            name,
            server,
        }) => {
            if let Err(e) = run_connect(&server, &code, &role, &name).await {
                log::error!("connect failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
) -> anyhow::Result<()> {
    let (mut config, path) = trivia::config::load_config(config_path)?;
    log::debug!("config from {}", path.display());
    if let Some(p) = port {
        config.server.port = p;
    }
    if let Some(b) = bind {
        config.server.bind = b;
    }
    log::info!("starting server on {}:{}", config.server.bind, config.server.port);
    trivia::server::run_server(config).await
}

async fn run_create(server: &str, game: i64, host: &str, max_teams: Option<u32>) -> anyhow::Result<()> {
    let url = format!("{}/api/sessions", server.trim_end_matches('/'));
    let mut body = json!({ "game": game, "host_name": host });
    if let Some(n) = max_teams {
        body["max_teams"] = json!(n);
    }
    let res = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST {}", url))?;
    let status = res.status();
    let value: Value = res.json().await.context("reading create response")?;
    if !status.is_success() {
        bail!(
            "{}: {}",
            status,
            value.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error")
        );
    }
    println!(
        "session {} ({}, {} questions)",
        value.get("session_code").and_then(|v| v.as_str()).unwrap_or("?"),
        value.get("game_name").and_then(|v| v.as_str()).unwrap_or(""),
        value.get("questions").and_then(|v| v.as_u64()).unwrap_or(0)
    );
    Ok(())
}

fn ws_url(server: &str, code: &str, role: &str, name: &str) -> anyhow::Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(server).with_context(|| format!("invalid server url {}", server))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    if url.set_scheme(scheme).is_err() {
        bail!("cannot use {} as a websocket url", server);
    }
    url.set_path(&format!("/ws/{}", code));
    url.query_pairs_mut()
        .clear()
        .append_pair("type", role)
        .append_pair("name", name);
    Ok(url)
}

async fn run_connect(server: &str, code: &str, role: &str, name: &str) -> anyhow::Result<()> {
    let url = ws_url(server, code, role, name)?;
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("connecting to {}", url))?;
    let (mut sink, mut stream) = ws.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { break };
                match msg.context("reading frame")? {
                    Message::Text(text) => println!("< {}", text),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
                    break;
                }
                match parse_input(input, name) {
                    Ok(frame) => sink.send(Message::Text(frame.to_string())).await.context("sending frame")?,
                    Err(e) => eprintln!("{}", e),
                }
            }
        }
    }
    let _ = sink.close().await;
    Ok(())
}

/// Turn one input line into an envelope. Lines starting with `{` are sent as is.
fn parse_input(input: &str, name: &str) -> Result<Value, String> {
    if input.starts_with('{') {
        return serde_json::from_str(input).map_err(|e| format!("invalid JSON: {}", e));
    }
    let (head, rest) = input.split_once(' ').unwrap_or((input, ""));
    let rest = rest.trim();
    let number = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| format!("{}: expected a question number, got '{}'", head, s))
    };
    let command = |data: Value| json!({ "type": "host_command", "data": data });

    let frame = match head {
        "/start" => command(json!({ "command": "start_game" })),
        "/next" => command(json!({ "command": "next_question" })),
        "/answers" => command(json!({ "command": "show_answers" })),
        "/score-start" => command(json!({ "command": "start_scoring" })),
        "/score-finish" => command(json!({ "command": "finish_scoring" })),
        "/end" => command(json!({ "command": "end_game" })),
        "/show" => command(json!({ "command": "show_question", "question_number": number(rest)? })),
        "/score" => {
            let mut parts = rest.split_whitespace();
            let n = number(parts.next().unwrap_or(""))?;
            let mut scores = serde_json::Map::new();
            for pair in parts {
                let (team, points) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("/score: expected team=points, got '{}'", pair))?;
                let points: u32 = points
                    .parse()
                    .map_err(|_| format!("/score: bad points for {}: '{}'", team, points))?;
                scores.insert(team.to_string(), json!(points));
            }
            command(json!({ "command": "score_question", "question_number": n, "scores": scores }))
        }
        "/join" => {
            let team = if rest.is_empty() { name } else { rest };
            json!({ "type": "join_team", "data": { "team_name": team } })
        }
        "/answer" => {
            let (n, text) = rest.split_once(' ').unwrap_or((rest, ""));
            let text = text.trim();
            if text.is_empty() {
                return Err("/answer: usage /answer N TEXT".to_string());
            }
            json!({
                "type": "submit_answer",
                "data": { "team_name": name, "question_number": number(n)?, "answer_text": text }
            })
        }
        other => return Err(format!("unknown command {}", other)),
    };
    Ok(frame)
}
