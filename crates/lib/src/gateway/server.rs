//! Gateway HTTP + WebSocket server (single port).

use crate::channels::{BridgeClient, BridgeEvent, BridgeEventKind, ChannelTransport, UnconfiguredTransport};
use crate::config::{self, Config};
use crate::dispatch::{
    CreditLedger, Dispatcher, JobHandle, JobRegistry, LogQuery, MessageLog, Orchestrator,
};
use crate::gateway::protocol::{
    ConnectParams, GrantParams, HelloOk, HelloPolicy, JobParams, SendParams, TenantParams, WsEvent,
    WsRequest, WsResponse,
};
use crate::init;
use crate::session::{LocalPairingProvider, PairingProvider, SessionError, SessionManager};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const PROTOCOL_VERSION: u32 = 1;

const BRIDGE_SECRET_HEADER: &str = "X-Herald-Bridge-Secret";

/// When auth mode is token and a token is configured, returns it for connect validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway: config, the session manager, dispatch services and the event fan-out.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, WebSocket connect must provide params.auth.token matching this.
    pub required_token: Option<String>,
    /// Broadcasts events to connected clients. Subscribers receive JSON event frames.
    pub event_tx: broadcast::Sender<String>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Dispatcher,
    pub credits: Arc<CreditLedger>,
    pub message_log: Arc<MessageLog>,
}

impl GatewayState {
    /// Wire up collaborators from config: the HTTP bridge when a bridge URL is set, local pairing codes otherwise.
    pub fn from_config(config: Config) -> Result<Self> {
        let (provider, transport): (Arc<dyn PairingProvider>, Arc<dyn ChannelTransport>) =
            match config::resolve_bridge_url(&config) {
                Some(url) => {
                    let bridge = Arc::new(BridgeClient::new(&url).map_err(anyhow::Error::msg)?);
                    log::info!("using messaging bridge at {}", bridge.base_url());
                    (bridge.clone(), bridge)
                }
                None => {
                    log::info!("no bridge configured; pairing codes are issued locally and sends are rejected");
                    (
                        Arc::new(LocalPairingProvider::new()),
                        Arc::new(UnconfiguredTransport),
                    )
                }
            };
        let sessions = Arc::new(SessionManager::new(
            provider,
            transport,
            config.pairing.clone(),
        ));
        let credits = Arc::new(CreditLedger::new(config.credits.initial_balance));
        let message_log = Arc::new(MessageLog::new(config.dispatch.log_capacity));
        let orchestrator = Arc::new(
            Orchestrator::new(credits.clone(), config.dispatch.clone()).with_log(message_log.clone()),
        );
        let jobs = JobRegistry::with_retention(config.dispatch.job_retention());
        let dispatcher = Dispatcher::new(sessions.clone(), orchestrator, jobs);
        let (event_tx, _) = broadcast::channel(256);
        Ok(Self {
            required_token: require_connect_token(&config),
            config: Arc::new(config),
            event_tx,
            sessions,
            dispatcher,
            credits,
            message_log,
        })
    }

    fn broadcast(&self, event: WsEvent) {
        let _ = self.event_tx.send(event.to_frame());
    }
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup fails.
/// Blocks until shutdown (e.g. Ctrl+C).
/// Requires the configuration to be initialized (`herald init`).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or HERALD_GATEWAY_TOKEN)",
                bind
            );
        }
    }
    let port = config.gateway.port;
    let state = GatewayState::from_config(config)?;

    {
        let state = state.clone();
        let mut session_events = state.sessions.subscribe_events();
        tokio::spawn(async move {
            loop {
                match session_events.recv().await {
                    Ok(event) => state.broadcast(WsEvent::new(
                        "session.state",
                        serde_json::to_value(&event).unwrap_or_default(),
                    )),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("session event forwarder lagged {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let sweeper_running = Arc::new(AtomicBool::new(true));
    let sweeper = state
        .sessions
        .clone()
        .spawn_expiry_sweeper(sweeper_running.clone());

    let app = router(state.clone());

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state, sweeper_running))
        .await
        .context("gateway server exited")?;
    sweeper.abort();
    log::info!("gateway stopped");
    Ok(())
}

/// HTTP routes: health, WebSocket control plane and inbound bridge events.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .route("/bridge/events", post(bridge_events))
        .with_state(state)
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event to WebSocket clients, cancels running jobs and stops the expiry sweeper.
async fn shutdown_signal(state: GatewayState, sweeper_running: Arc<AtomicBool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining connections");

    state.broadcast(WsEvent::new("shutdown", json!({})));
    sweeper_running.store(false, Ordering::SeqCst);
    let cancelled = state.dispatcher.jobs().cancel_all().await;
    if cancelled > 0 {
        log::info!("cancelled {} running job(s)", cancelled);
    }
}

/// POST /bridge/events receives connection signals from the bridge; verifies the optional shared secret.
async fn bridge_events(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(event): Json<BridgeEvent>,
) -> Response {
    if let Some(ref expected) = state.config.bridge.webhook_secret {
        let provided = headers
            .get(BRIDGE_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_str() {
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    let tenant_id = event.tenant_id.as_str();
    let result = match event.event {
        BridgeEventKind::Approved => {
            let Some(channel) = event.channel_identity else {
                return (StatusCode::BAD_REQUEST, "approved event needs channelIdentity").into_response();
            };
            state
                .sessions
                .on_approval_detected(tenant_id, channel)
                .await
                .map(|outcome| json!({ "outcome": outcome }))
        }
        BridgeEventKind::Dropped => state
            .sessions
            .on_channel_dropped(tenant_id)
            .await
            .map(|session| json!({ "session": session })),
        BridgeEventKind::LoggedOut => {
            let session = state.sessions.disconnect(tenant_id).await;
            Ok(json!({ "session": session }))
        }
    };
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e @ SessionError::InvalidTransition(_)) => {
            log::debug!("bridge event for {} ignored: {}", tenant_id, e);
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        Err(e) => {
            log::warn!("bridge event for {} failed: {}", tenant_id, e);
            (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response()
        }
    }
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
        "tenants": state.sessions.list().await.len(),
        "jobs": state.dispatcher.jobs().list(None).await.len(),
    }))
}

/// GET /ws upgrades to WebSocket. First frame must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_response(socket: &mut WebSocket, res: &WsResponse) -> bool {
    let text = serde_json::to_string(res).unwrap_or_default();
    socket.send(Message::Text(text)).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut sent_hello = false;
    let mut event_rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        // events are only delivered after the handshake; shutdown always goes out
                        let is_shutdown = serde_json::from_str::<WsEvent>(&text)
                            .map_or(false, |e| e.event == "shutdown");
                        if sent_hello || is_shutdown {
                            let _ = socket.send(Message::Text(text)).await;
                        }
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} broadcast messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };

                if req.typ != "req" {
                    continue;
                }

                let res = if req.method == "connect" {
                    let res = connect(&state, &req);
                    sent_hello |= res.ok;
                    res
                } else if !sent_hello {
                    WsResponse::err(&req.id, "connect required before other requests")
                } else {
                    handle_request(&state, &req).await
                };
                if !send_response(&mut socket, &res).await {
                    break;
                }
            }
        }
    }

    if !sent_hello {
        log::debug!("ws client disconnected before sending connect");
    }
}

fn connect(state: &GatewayState, req: &WsRequest) -> WsResponse {
    let params: ConnectParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(_) => return WsResponse::err(&req.id, "invalid connect params"),
    };
    if let Some(ref required) = state.required_token {
        let provided = params.auth.token.as_deref().unwrap_or("").trim();
        if provided.is_empty() {
            return WsResponse::err(
                &req.id,
                "unauthorized: gateway token missing (set HERALD_GATEWAY_TOKEN or gateway.auth.token)",
            );
        }
        if provided != required {
            return WsResponse::err(&req.id, "unauthorized: gateway token mismatch");
        }
    }
    let protocol = params
        .max_protocol
        .unwrap_or(PROTOCOL_VERSION)
        .min(PROTOCOL_VERSION);
    let hello = HelloOk {
        typ: "hello-ok".to_string(),
        protocol,
        policy: Some(HelloPolicy {
            max_concurrency: state.config.dispatch.max_concurrency,
        }),
    };
    WsResponse::ok(&req.id, serde_json::to_value(&hello).unwrap_or(json!({})))
}

fn parse_params<T: DeserializeOwned>(req: &WsRequest) -> Result<T, WsResponse> {
    serde_json::from_value(req.params.clone())
        .map_err(|e| WsResponse::err(&req.id, format!("invalid {} params: {}", req.method, e)))
}

fn to_payload<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_default()
}

async fn handle_request(state: &GatewayState, req: &WsRequest) -> WsResponse {
    match route_request(state, req).await {
        Ok(payload) => WsResponse::ok(&req.id, payload),
        Err(res) => res,
    }
}

async fn route_request(state: &GatewayState, req: &WsRequest) -> Result<serde_json::Value, WsResponse> {
    let fail = |e: &dyn std::fmt::Display| WsResponse::err(&req.id, e.to_string());
    match req.method.as_str() {
        "health" => Ok(json!({
            "runtime": "running",
            "protocol": PROTOCOL_VERSION,
        })),
        "status" => {
            let auth_mode = if state.required_token.is_some() {
                "token"
            } else {
                "none"
            };
            Ok(json!({
                "runtime": "running",
                "protocol": PROTOCOL_VERSION,
                "port": state.config.gateway.port,
                "bind": state.config.gateway.bind,
                "auth": auth_mode,
                "bridge": config::resolve_bridge_url(&state.config),
                "dispatch": state.config.dispatch,
                "tenants": state.sessions.list().await.len(),
                "jobs": state.dispatcher.jobs().list(None).await.len(),
            }))
        }
        "session.connect" => {
            let params: TenantParams = parse_params(req)?;
            let session = state
                .sessions
                .request_connection(&params.tenant_id)
                .await
                .map_err(|e| fail(&e))?;
            Ok(to_payload(&session))
        }
        "session.status" => {
            let params: TenantParams = parse_params(req)?;
            Ok(to_payload(&state.sessions.get_status(&params.tenant_id).await))
        }
        "session.disconnect" => {
            let params: TenantParams = parse_params(req)?;
            Ok(to_payload(&state.sessions.disconnect(&params.tenant_id).await))
        }
        "session.list" => Ok(json!({ "sessions": state.sessions.list().await })),
        "dispatch.send" => {
            let params: SendParams = parse_params(req)?;
            let submission = state
                .dispatcher
                .submit(&params.tenant_id, params.request)
                .await
                .map_err(|e| fail(&e))?;
            let job = submission.job;
            spawn_job_events(state.clone(), job.clone());
            Ok(json!({
                "jobId": job.id(),
                "tenantId": job.tenant_id(),
                "total": job.progress().total,
                "rejected": submission.rejected,
                "duplicates": submission.duplicates,
            }))
        }
        "dispatch.progress" => {
            let job = find_job(state, req).await?;
            Ok(progress_payload(&job))
        }
        "dispatch.cancel" => {
            let job = find_job(state, req).await?;
            Ok(json!({ "jobId": job.id(), "cancelled": job.cancel(), "state": job.state() }))
        }
        "dispatch.summary" => {
            let params: JobParams = parse_params(req)?;
            let jobs = state.dispatcher.jobs();
            match jobs.take_summary(&params.job_id).await {
                Some(summary) => Ok(to_payload(&summary)),
                None if jobs.get(&params.job_id).await.is_some() => {
                    Err(WsResponse::err(&req.id, "job still running"))
                }
                None => Err(WsResponse::err(&req.id, "unknown job")),
            }
        }
        "logs.query" => {
            let query: LogQuery = parse_params(req)?;
            Ok(to_payload(&state.message_log.query(&query)))
        }
        "credits.balance" => {
            let params: TenantParams = parse_params(req)?;
            let balance = state.credits.balance(&params.tenant_id).await;
            Ok(json!({ "tenantId": params.tenant_id, "balance": balance }))
        }
        "credits.grant" => {
            let params: GrantParams = parse_params(req)?;
            let balance = state.credits.grant(&params.tenant_id, params.amount).await;
            Ok(json!({ "tenantId": params.tenant_id, "balance": balance }))
        }
        _ => Err(WsResponse::err(&req.id, format!("unknown method: {}", req.method))),
    }
}

async fn find_job(state: &GatewayState, req: &WsRequest) -> Result<JobHandle, WsResponse> {
    let params: JobParams = parse_params(req)?;
    state
        .dispatcher
        .jobs()
        .get(&params.job_id)
        .await
        .ok_or_else(|| WsResponse::err(&req.id, "unknown job"))
}

fn progress_payload(job: &JobHandle) -> serde_json::Value {
    let snapshot = job.progress();
    json!({
        "jobId": job.id(),
        "tenantId": job.tenant_id(),
        "state": job.state(),
        "progress": snapshot,
        "percentage": snapshot.percentage(),
    })
}

/// Forward a job's progress as `dispatch.progress` events, then `dispatch.completed` with the summary counts.
fn spawn_job_events(state: GatewayState, job: JobHandle) {
    tokio::spawn(async move {
        let mut progress = job.subscribe_progress();
        let mut progress_open = true;
        let finished = job.wait();
        tokio::pin!(finished);
        let summary = loop {
            tokio::select! {
                summary = &mut finished => break summary,
                changed = progress.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                        continue;
                    }
                    state.broadcast(WsEvent::new("dispatch.progress", progress_payload(&job)));
                }
            }
        };
        state.broadcast(WsEvent::new("dispatch.progress", progress_payload(&job)));
        state.broadcast(WsEvent::new(
            "dispatch.completed",
            json!({
                "jobId": summary.job_id,
                "tenantId": summary.tenant_id,
                "total": summary.total,
                "successCount": summary.success_count,
                "failCount": summary.fail_count,
                "skippedCount": summary.skipped_count,
                "cancelled": summary.cancelled,
                "sessionLost": summary.session_lost,
                "finishedAt": summary.finished_at,
            }),
        ));
    });
}
