use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use vulnscan_backend::adapters::{MockAdapter, NiktoAdapter, NmapAdapter, QueuedAdapter, SqlmapAdapter};
use vulnscan_backend::archive::ScanArchive;
use vulnscan_backend::config::{Config, ToolKind};
use vulnscan_backend::models::{CreateAccountInput, ScanStatus, SubmitScanInput, SubmitScanOutput};
use vulnscan_backend::rate_limit::{self, ClientRateLimiter};
use vulnscan_backend::redis_queue::RedisQueue;
use vulnscan_backend::{QuotaLedger, RegistryError, ScanEngine, SubmitError};

struct AppState {
    engine: Arc<ScanEngine>,
    redis: Option<Arc<RedisQueue>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    // Setup Database
    let archive = ScanArchive::connect(&config.database_url).await?;

    // Setup Redis
    let redis = match &config.redis_url {
        Some(url) => Some(Arc::new(RedisQueue::new(url).context("Invalid REDIS_URL")?)),
        None => None,
    };

    let ledger = Arc::new(QuotaLedger::new(config.guest_scan_limit));
    let mut builder = ScanEngine::builder(ledger)
        .archive(archive)
        .default_timeout(config.tool_timeout);

    for kind in &config.tools {
        builder = match kind {
            ToolKind::Sqlmap => builder.adapter(SqlmapAdapter::new(None)),
            ToolKind::Nmap => builder.adapter(NmapAdapter::new(None)),
            ToolKind::Nikto => builder.adapter(NiktoAdapter::new(Some(config.nikto_timeout))),
            ToolKind::Mock => builder.adapter(MockAdapter::demo("mock")),
        };
    }
    if let Some(queue) = &redis {
        for tool in &config.queued_tools {
            builder = builder.adapter(QueuedAdapter::new(tool, queue.clone(), config.queue_poll_interval));
        }
    }

    let engine = builder.build()?;
    info!(tools = ?engine.tool_names(), guest_limit = config.guest_scan_limit, "Scan engine ready");

    let state = Arc::new(AppState {
        engine: engine.clone(),
        redis,
    });

    let limiter = Arc::new(ClientRateLimiter::new(
        config.rate_limit_per_hour,
        config.rate_limit_per_day,
    )?);
    tokio::spawn({
        let limiter = limiter.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            loop {
                interval.tick().await;
                limiter.retain_recent();
            }
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/accounts", post(create_account))
        .route("/api/accounts/{id}/quota", get(get_quota))
        .route("/api/accounts/{id}/scans", get(list_scans))
        .route("/api/scans", post(submit_scan))
        .route("/api/scans/{id}", get(get_scan).delete(purge_scan))
        .route("/api/scans/{id}/cancel", post(cancel_scan))
        .route("/api/scans/{id}/events", get(get_scan_events))
        .route("/api/results", get(list_results))
        .route("/api/jobs/active", get(list_active_jobs))
        .layer(middleware::from_fn_with_state(limiter, rate_limit::enforce))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Backend listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(engine))
        .await?;

    Ok(())
}

async fn shutdown_signal(engine: Arc<ScanEngine>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    engine.shutdown().await;
}

fn registry_error(e: RegistryError) -> Response {
    let status = match e {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::ScanNotMutable { .. }
        | RegistryError::InvalidTransition { .. }
        | RegistryError::ScanActive(_) => StatusCode::CONFLICT,
    };
    (status, e.to_string()).into_response()
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CreateAccountInput>,
) -> impl IntoResponse {
    let ledger = state.engine.ledger();
    let account = if input.is_guest {
        ledger.register_guest()
    } else {
        ledger.register_verified()
    };
    info!(account_id = %account.id, is_guest = account.is_guest, "Account registered");
    (StatusCode::CREATED, Json(account))
}

async fn get_quota(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.engine.quota(&id) {
        Some(view) => Json(view).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_scans(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    if state.engine.ledger().account(&id).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(state.engine.list(&id)).into_response()
}

async fn submit_scan(
    State(state): State<Arc<AppState>>,
    Json(input): Json<SubmitScanInput>,
) -> impl IntoResponse {
    match state.engine.submit(input.account_id, &input.target_url) {
        Ok(scan_id) => (StatusCode::ACCEPTED, Json(SubmitScanOutput { scan_id })).into_response(),
        Err(e) => {
            let status = match e {
                SubmitError::InvalidTarget { .. } => StatusCode::BAD_REQUEST,
                SubmitError::QuotaExhausted(_) => StatusCode::FORBIDDEN,
                SubmitError::UnknownAccount(_) => StatusCode::NOT_FOUND,
                SubmitError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, e.to_string()).into_response()
        }
    }
}

async fn get_scan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.engine.report(&id) {
        Ok(report) => Json(report).into_response(),
        Err(e) => registry_error(e),
    }
}

async fn cancel_scan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.engine.cancel(&id).await {
        Ok(scan) => Json(scan).into_response(),
        Err(e) => registry_error(e),
    }
}

async fn purge_scan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.engine.purge(&id).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => registry_error(e),
    }
}

async fn list_results(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(archive) = state.engine.archive() else {
        return Json(Vec::<vulnscan_backend::archive::ScanSummary>::new()).into_response();
    };

    match archive.list_results().await {
        Ok(r) => Json(r).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn list_active_jobs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(redis) = &state.redis else {
        return Json(Vec::<HashMap<String, String>>::new()).into_response();
    };

    match redis.get_active_jobs().await {
        Ok(active) => Json(active).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Serialize)]
struct ScanEvent {
    scan_id: Uuid,
    status: ScanStatus,
    progress: u8,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Status snapshots of one scan, ending with its terminal state.
async fn get_scan_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let rx = match state.engine.registry().subscribe(&id) {
        Ok(rx) => rx,
        Err(e) => return registry_error(e),
    };

    let stream = stream::unfold(Some((state, id, rx, true)), |cursor| async move {
        let (state, id, mut rx, first) = cursor?;
        if !first && rx.changed().await.is_err() {
            return None;
        }

        let scan = state.engine.registry().scan(&id).ok()?;
        let event = Event::default()
            .event(scan.status.as_str())
            .json_data(ScanEvent {
                scan_id: scan.id,
                status: scan.status,
                progress: scan.progress(),
                finished_at: scan.finished_at,
            })
            .ok()?;

        let next = if scan.status.is_terminal() {
            None
        } else {
            Some((state, id, rx, false))
        };
        Some((Ok::<_, Infallible>(event), next))
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
