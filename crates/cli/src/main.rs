use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use herald::message::MessageSpec;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Herald CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: HERALD_CONFIG_PATH or ~/.herald/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway (HTTP + WebSocket control plane).
    Gateway {
        /// Config file path (default: HERALD_CONFIG_PATH or ~/.herald/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 15252)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Show one tenant's session, or every known session when no tenant is given.
    Status {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, short)]
        tenant: Option<String>,
    },

    /// Start pairing for a tenant and print the pairing payload.
    Connect {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, short)]
        tenant: String,

        /// Keep running until the tenant is connected.
        #[arg(long)]
        wait: bool,
    },

    /// Disconnect a tenant. Running jobs for the tenant skip their remaining items.
    Disconnect {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, short)]
        tenant: String,
    },

    /// Send a message sequence to many recipients and follow progress until the job completes.
    Send {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, short)]
        tenant: String,

        /// Recipient identifier; repeat for several.
        #[arg(long = "to", value_name = "NUMBER")]
        to: Vec<String>,

        /// File with one recipient per line (first comma-separated column; `#` starts a comment).
        #[arg(long, value_name = "FILE")]
        recipients_file: Option<PathBuf>,

        /// Message in order of delivery: `text:<body>`, `image:<url>[|caption]`, `document:<url>[|file name]`.
        #[arg(long = "message", short = 'm', value_name = "MESSAGE", required = true, value_parser = parse_message_arg)]
        messages: Vec<MessageSpec>,

        /// Worker pool size (clamped by the gateway).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Fail the whole send when any recipient is invalid instead of dropping it.
        #[arg(long)]
        abort_on_invalid: bool,

        /// Print the job id and return without following progress.
        #[arg(long)]
        no_wait: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("herald {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Gateway { config, port }) => run_gateway(config, port).await,
        Some(Commands::Status { config, tenant }) => run_status(config, tenant).await,
        Some(Commands::Connect {
            config,
            tenant,
            wait,
        }) => run_connect(config, tenant, wait).await,
        Some(Commands::Disconnect { config, tenant }) => run_disconnect(config, tenant).await,
        Some(Commands::Send {
            config,
            tenant,
            to,
            recipients_file,
            messages,
            concurrency,
            abort_on_invalid,
            no_wait,
        }) => {
            let request = SendArgs {
                tenant,
                to,
                recipients_file,
                messages,
                concurrency,
                abort_on_invalid,
                no_wait,
            };
            run_send(config, request).await
        }
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(herald::config::default_config_path);
    let dir = herald::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = herald::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    herald::gateway::run_gateway(config, path).await
}

async fn run_status(config_path: Option<PathBuf>, tenant: Option<String>) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(config_path).await?;
    let payload = match tenant {
        Some(tenant_id) => client.request("session.status", json!({ "tenantId": tenant_id })).await?,
        None => client.request("session.list", json!({})).await?,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn run_connect(config_path: Option<PathBuf>, tenant: String, wait: bool) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(config_path).await?;
    let session = client
        .request("session.connect", json!({ "tenantId": tenant }))
        .await?;
    let state = session.get("state").and_then(Value::as_str).unwrap_or("unknown");
    println!("tenant {}: {}", tenant, state);
    if let Some(pairing) = session.get("pairing") {
        println!(
            "pairing payload: {}",
            pairing.get("payload").and_then(Value::as_str).unwrap_or("")
        );
        if let Some(expires) = pairing.get("expiresAt").and_then(Value::as_str) {
            println!("expires at: {}", expires);
        }
    }
    if !wait || state == "connected" {
        return Ok(());
    }

    println!("waiting for approval...");
    while let Some(event) = client.next_event().await? {
        if event.get("event").and_then(Value::as_str) != Some("session.state") {
            continue;
        }
        let payload = event.get("payload").cloned().unwrap_or_default();
        if payload.get("tenantId").and_then(Value::as_str) != Some(tenant.as_str()) {
            continue;
        }
        let to = payload.get("to").and_then(Value::as_str).unwrap_or("");
        println!("tenant {}: {}", tenant, to);
        match to {
            "connected" => return Ok(()),
            "disconnected" => bail!("pairing for {} ended without approval", tenant),
            _ => {}
        }
    }
    bail!("gateway closed the connection")
}

async fn run_disconnect(config_path: Option<PathBuf>, tenant: String) -> anyhow::Result<()> {
    let mut client = GatewayClient::connect(config_path).await?;
    let session = client
        .request("session.disconnect", json!({ "tenantId": tenant }))
        .await?;
    println!(
        "tenant {}: {}",
        tenant,
        session.get("state").and_then(Value::as_str).unwrap_or("unknown")
    );
    Ok(())
}

struct SendArgs {
    tenant: String,
    to: Vec<String>,
    recipients_file: Option<PathBuf>,
    messages: Vec<MessageSpec>,
    concurrency: Option<usize>,
    abort_on_invalid: bool,
    no_wait: bool,
}

async fn run_send(config_path: Option<PathBuf>, args: SendArgs) -> anyhow::Result<()> {
    let mut recipients = args.to;
    if let Some(path) = &args.recipients_file {
        recipients.extend(read_recipients_file(path)?);
    }
    if recipients.is_empty() {
        bail!("no recipients given (use --to or --recipients-file)");
    }

    let mut client = GatewayClient::connect(config_path).await?;
    let accepted = client
        .request(
            "dispatch.send",
            json!({
                "tenantId": args.tenant,
                "recipients": recipients,
                "messages": args.messages,
                "invalidRecipients": if args.abort_on_invalid { "abort" } else { "drop" },
                "concurrency": args.concurrency,
            }),
        )
        .await?;
    let job_id = accepted
        .get("jobId")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing jobId in dispatch.send response"))?
        .to_string();
    println!(
        "job {}: {} item(s)",
        job_id,
        accepted.get("total").and_then(Value::as_u64).unwrap_or(0)
    );
    if let Some(rejected) = accepted.get("rejected").and_then(Value::as_array) {
        for r in rejected {
            eprintln!(
                "skipped invalid recipient {}: {}",
                r.get("identifier").unwrap_or(&Value::Null),
                r.get("reason").unwrap_or(&Value::Null)
            );
        }
    }
    if args.no_wait {
        return Ok(());
    }

    while let Some(event) = client.next_event().await? {
        let payload = event.get("payload").cloned().unwrap_or_default();
        if payload.get("jobId").and_then(Value::as_str) != Some(job_id.as_str()) {
            continue;
        }
        match event.get("event").and_then(Value::as_str) {
            Some("dispatch.progress") => {
                let progress = payload.get("progress").cloned().unwrap_or_default();
                println!(
                    "{:>5.1}% ({}/{})",
                    payload.get("percentage").and_then(Value::as_f64).unwrap_or(0.0),
                    progress.get("dispatched").and_then(Value::as_u64).unwrap_or(0),
                    progress.get("total").and_then(Value::as_u64).unwrap_or(0)
                );
            }
            Some("dispatch.completed") => {
                let summary = client.request("dispatch.summary", json!({ "jobId": job_id })).await?;
                print_summary(&summary);
                return Ok(());
            }
            _ => {}
        }
    }
    bail!("gateway closed the connection before job {} completed", job_id)
}

fn print_summary(summary: &Value) {
    let count = |key: &str| summary.get(key).and_then(Value::as_u64).unwrap_or(0);
    println!(
        "sent {}, failed {}, skipped {} of {}",
        count("successCount"),
        count("failCount"),
        count("skippedCount"),
        count("total")
    );
    if summary.get("cancelled").and_then(Value::as_bool) == Some(true) {
        println!("job was cancelled");
    }
    if summary.get("sessionLost").and_then(Value::as_bool) == Some(true) {
        println!("session disconnected during the job");
    }
    for item in summary
        .get("results")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|r| r.get("status").and_then(Value::as_str) == Some("failed"))
    {
        println!(
            "  {} message #{}: {} {}",
            item.get("recipient").and_then(Value::as_str).unwrap_or("?"),
            item.get("sequenceIndex").and_then(Value::as_u64).unwrap_or(0),
            item.get("reason").and_then(Value::as_str).unwrap_or(""),
            item.get("detail").and_then(Value::as_str).unwrap_or("")
        );
    }
}

fn read_recipients_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading recipients from {}", path.display()))?;
    Ok(text
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").split(',').next().unwrap_or("").trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

fn parse_message_arg(s: &str) -> Result<MessageSpec, String> {
    let (kind, rest) = s
        .split_once(':')
        .ok_or_else(|| format!("expected <kind>:<value>, got {:?}", s))?;
    let (value, extra) = match rest.split_once('|') {
        Some((v, e)) => (v, Some(e.to_string())),
        None => (rest, None),
    };
    let spec = match kind {
        "text" => MessageSpec::text(rest),
        "image" => MessageSpec::image(value, extra.unwrap_or_default()),
        "document" => MessageSpec::document(value, extra),
        other => return Err(format!("unknown message kind {:?} (text, image, document)", other)),
    };
    spec.validated().map_err(|e| e.to_string())
}

/// Request/response client for the gateway WebSocket. Events that arrive while waiting for a
/// response are buffered for [`GatewayClient::next_event`].
struct GatewayClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    pending_events: VecDeque<Value>,
}

impl GatewayClient {
    async fn connect(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (config, _) = herald::config::load_config(config_path)?;
        let bind = config.gateway.bind.trim();
        let host = if bind == "0.0.0.0" { "127.0.0.1" } else { bind };
        let ws_url = format!("ws://{}:{}/ws", host, config.gateway.port);
        let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .with_context(|| format!("connecting to gateway at {} (is `herald gateway` running?)", ws_url))?;
        let mut client = Self {
            ws,
            next_id: 0,
            pending_events: VecDeque::new(),
        };
        let mut params = json!({
            "client": { "id": "herald-cli", "version": env!("CARGO_PKG_VERSION") },
            "auth": {}
        });
        if let Some(token) = herald::config::resolve_gateway_token(&config) {
            params["auth"] = json!({ "token": token });
        }
        client.request("connect", params).await?;
        Ok(client)
    }

    async fn request(&mut self, method: &str, params: Value) -> anyhow::Result<Value> {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let req = herald::gateway::WsRequest::new(id.clone(), method, params);
        self.ws
            .send(Message::Text(serde_json::to_string(&req)?))
            .await
            .context("sending request")?;

        while let Some(frame) = self.read_frame().await? {
            match frame.get("type").and_then(Value::as_str) {
                Some("event") => self.pending_events.push_back(frame),
                Some("res") if frame.get("id").and_then(Value::as_str) == Some(id.as_str()) => {
                    if !frame.get("ok").and_then(Value::as_bool).unwrap_or(false) {
                        let err = frame
                            .get("error")
                            .and_then(Value::as_str)
                            .unwrap_or("request failed");
                        bail!("{}: {}", method, err);
                    }
                    return Ok(frame.get("payload").cloned().unwrap_or_default());
                }
                _ => {}
            }
        }
        bail!("gateway closed the connection before answering {}", method)
    }

    async fn next_event(&mut self) -> anyhow::Result<Option<Value>> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(Some(event));
        }
        while let Some(frame) = self.read_frame().await? {
            if frame.get("type").and_then(Value::as_str) == Some("event") {
                if frame.get("event").and_then(Value::as_str) == Some("shutdown") {
                    bail!("gateway is shutting down");
                }
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }

    async fn read_frame(&mut self) -> anyhow::Result<Option<Value>> {
        while let Some(msg) = self.ws.next().await {
            let Message::Text(text) = msg.context("reading from gateway")? else { continue };
            return Ok(Some(serde_json::from_str(&text).context("parsing gateway frame")?));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald::message::MessageKind;

    #[test]
    fn message_args_keep_kind_and_extras() {
        let m = parse_message_arg("text:hello: world").unwrap();
        assert_eq!(m.kind, MessageKind::Text);
        assert_eq!(m.text, "hello: world");

        let m = parse_message_arg("image:https://cdn.example/a.png|launch day").unwrap();
        assert_eq!(m.media_ref.as_deref(), Some("https://cdn.example/a.png"));
        assert_eq!(m.text, "launch day");

        let m = parse_message_arg("document:https://cdn.example/q3.pdf").unwrap();
        assert_eq!(m.file_name.as_deref(), Some("q3.pdf"));

        assert!(parse_message_arg("video:x").is_err());
        assert!(parse_message_arg("text:").is_err());
    }
}
