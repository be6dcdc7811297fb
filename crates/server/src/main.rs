//! Storyforge Server
//!
//! Axum REST + WebSocket control surface over the core orchestrator, and a CLI for
//! running a single session in-process.

mod api;

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{header, Response, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use storyforge_core::channel::{ChannelClient, ChannelMessage, ClientEvent, ClientExit};
use storyforge_core::config::{default_config_path, CONFIG_DIR};
use storyforge_core::state::{StagePayload, StageResult};
use storyforge_core::{AdapterMode, ForgeConfig, ForgeRuntime, SessionInput, SessionStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use utoipa::{OpenApi, ToSchema};

use api::groups::group_routes;
use api::sessions::session_routes;

/// Application state
pub struct AppState {
    pub runtime: ForgeRuntime,
    pub offline: bool,
}

pub type SharedState = Arc<AppState>;

#[derive(Parser, Clone)]
#[command(author, version, about = "Storyforge - staged story-to-video generation")]
struct Args {
    /// Config file (defaults to .storyforge/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start the HTTP server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Use the scripted generation backend instead of model providers
        #[arg(long)]
        offline: bool,
    },
    /// Drive one session through every stage in this process
    Run {
        /// What the story is about
        prompt: String,
        #[arg(long)]
        offline: bool,
        /// Approve every stage without asking
        #[arg(long)]
        auto_approve: bool,
    },
    /// Print the effective configuration
    Config,
}

// === OpenAPI Definition ===

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storyforge API",
        version = "1.0.0",
        description = "Staged story, image, storyboard and video generation with human checkpoints"
    ),
    paths(
        api::sessions::start_session,
        api::sessions::get_session,
        api::sessions::run_session,
        api::sessions::approve_session,
        api::sessions::regenerate_session,
        api::groups::start_group,
        api::groups::get_group,
        api::groups::cancel_group,
        get_config,
        health
    ),
    components(schemas(
        api::sessions::StartSessionRequest,
        api::sessions::CoherenceRequest,
        api::sessions::StartSessionResponse,
        api::sessions::ApproveRequest,
        api::sessions::RegenerateRequest,
        api::groups::StartGroupBody,
        HealthResponse
    )),
    tags(
        (name = "sessions", description = "Single generation sessions"),
        (name = "groups", description = "Side-by-side sibling runs"),
        (name = "config", description = "Effective configuration"),
        (name = "health", description = "Liveness")
    )
)]
struct ApiDoc;

#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    status: &'static str,
    store: String,
    offline: bool,
    live_sessions: usize,
}

/// Liveness plus a store ping
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Healthy", body = HealthResponse),
        (status = 503, description = "Session store unreachable", body = HealthResponse)
    )
)]
async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let store = state.runtime.orchestrator.repository().store();
    let (code, status) = match store.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!("Health check store ping failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
    };
    (
        code,
        Json(HealthResponse {
            status,
            store: format!("{:?}", store.backend()),
            offline: state.offline,
            live_sessions: state.runtime.orchestrator.live_actors(),
        }),
    )
}

/// Effective configuration after file and environment overrides
#[utoipa::path(
    get,
    path = "/api/v1/config",
    tag = "config",
    responses((status = 200, description = "Effective configuration"))
)]
async fn get_config(State(state): State<SharedState>) -> Json<ForgeConfig> {
    Json(state.runtime.config.clone())
}

async fn serve_openapi() -> impl IntoResponse {
    match ApiDoc::openapi().to_json() {
        Ok(spec) => Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(spec))
            .map(IntoResponse::into_response)
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => {
            tracing::error!("OpenAPI serialization failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn adapter_mode(offline: bool) -> AdapterMode {
    if offline {
        AdapterMode::Offline
    } else {
        AdapterMode::Studio
    }
}

fn app(state: SharedState) -> Router {
    Router::new()
        .nest("/api/v1/sessions", session_routes())
        .nest("/api/v1/groups", group_routes())
        .route("/api/v1/config", get(get_config))
        .route("/api/v1/openapi.json", get(serve_openapi))
        .route("/health", get(health))
        .with_state(state)
}

async fn run_server(config: ForgeConfig, port: u16, offline: bool) -> anyhow::Result<()> {
    let runtime = ForgeRuntime::build(config, adapter_mode(offline)).await?;
    let _maintenance = runtime.spawn_maintenance();
    let state: SharedState = Arc::new(AppState { runtime, offline });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    println!("🚀 Storyforge Server running at http://{}", addr);
    println!("   Sessions: /api/v1/sessions, /{{id}}/approve, /{{id}}/regenerate");
    println!("   Channel:  /api/v1/sessions/{{id}}/channel (WebSocket)");
    println!("   Groups:   /api/v1/groups, /{{id}}/cancel");
    println!("   Docs:     /api/v1/openapi.json");
    if offline {
        println!("   ⚠️ Offline mode: scripted generation backend");
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// === CLI runner ===

fn print_result(result: &StageResult) {
    let flag = if result.below_threshold() {
        " (below quality threshold)"
    } else {
        ""
    };
    println!(
        "\n✅ {} ready, score {:.2}{}, cost {:.1}",
        result.stage.as_str(),
        result.selected_score(),
        flag,
        result.cost
    );
    match &result.payload {
        StagePayload::Story { text } => println!("\n{}\n", text),
        StagePayload::ReferenceImage { image, prompt } => {
            println!("   🖼️ {}\n   prompt: {}", image.uri, prompt)
        }
        StagePayload::Storyboard { frames } => {
            for frame in frames {
                println!("   🎞️ [{}] {} -> {}", frame.index, frame.caption, frame.image.uri);
            }
        }
        StagePayload::Video { clips } => {
            for clip in clips {
                println!("   🎬 [{}] {}", clip.index, clip.clip.uri);
            }
        }
    }
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Resynced(session) => {
            tracing::debug!(state = %session.state(), "Channel resynced")
        }
        ClientEvent::Message(ChannelMessage::Error {
            code,
            message,
            recoverable,
            ..
        }) => println!("📡 error {} (recoverable: {}): {}", code, recoverable, message),
        ClientEvent::Message(ChannelMessage::StageComplete { stage, status, .. }) => {
            println!("📡 {} -> {}", stage.as_str(), status.as_str())
        }
        ClientEvent::Message(other) => tracing::debug!(kind = other.kind(), "Channel message"),
        ClientEvent::Disconnected { reason } => println!("📡 disconnected: {}", reason),
        ClientEvent::GaveUp { attempts } => {
            println!("📡 gave up reconnecting after {} attempts", attempts)
        }
    }
}

async fn run_cli(config: ForgeConfig, prompt: String, offline: bool, auto_approve: bool) -> anyhow::Result<()> {
    let runtime = ForgeRuntime::build(config, adapter_mode(offline)).await?;
    let orchestrator = runtime.orchestrator.clone();
    let session_id = orchestrator
        .start("cli", SessionInput::new(prompt))
        .await
        .context("Failed to start session")?;
    println!("🎬 Session {}", session_id);

    let client = ChannelClient::new(
        Arc::new(runtime.local_connector()),
        Arc::new(orchestrator.clone()),
        runtime.config.reconnect.clone(),
    )
    .with_heartbeat(runtime.config.channel.heartbeat_interval());
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let follower = {
        let cancel = cancel.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { client.run(&session_id, events_tx, cancel).await })
    };
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let result = match orchestrator.run_stage_with_pause(&session_id).await {
            Ok(result) => result,
            Err(e) => {
                eprintln!("❌ {} ({})", e, e.code());
                if auto_approve || !e.recoverable() {
                    break;
                }
                println!("[r] retry, anything else quits");
                match lines.next_line().await? {
                    Some(line) if line.trim() == "r" => continue,
                    _ => break,
                }
            }
        };
        print_result(&result);

        if !auto_approve {
            println!("[enter] approve, type feedback to regenerate, [q] quit");
            let line = lines.next_line().await?.unwrap_or_else(|| "q".to_string());
            match line.trim() {
                "" | "y" => {}
                "q" => break,
                feedback => {
                    orchestrator.regenerate(&session_id, feedback).await?;
                    continue;
                }
            }
        }

        let session = orchestrator.approve(&session_id, Some(result.stage)).await?;
        if session.status == SessionStatus::Complete {
            println!("🏁 Session complete, total cost {:.1}", session.cost);
            break;
        }
    }

    cancel.cancel();
    match follower.await {
        Ok(ClientExit::Failed(report)) => eprintln!("❌ {}: {}", report.code, report.message),
        Ok(exit) => tracing::debug!(exit = ?exit, "Channel follower stopped"),
        Err(e) => tracing::warn!("Channel follower panicked: {}", e),
    }
    printer.abort();
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,storyforge_core=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_path(PathBuf::from(CONFIG_DIR).join(".env"));
    init_tracing();

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = ForgeConfig::resolve(&config_path).await?;

    match args.command {
        Some(CliCommand::Config) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some(CliCommand::Run {
            prompt,
            offline,
            auto_approve,
        }) => {
            storyforge_core::ignite();
            run_cli(config, prompt, offline, auto_approve).await
        }
        Some(CliCommand::Serve { port, offline }) => {
            println!("╔══════════════════════════════════════╗");
            println!("║         STORYFORGE SERVER            ║");
            println!("╚══════════════════════════════════════╝");
            run_server(config, port, offline).await
        }
        None => run_server(config, 8080, false).await,
    }
}
