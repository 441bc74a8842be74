use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::controller::Controller;
use crate::error::ControlError;
use crate::programs::Program;
use crate::supervisor::ServiceProbe;

const PROBE_TIMEOUT_SEC: u64 = 5;

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// `{"success": false, "error": kind, "reason": ...}` with a matching status.
struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Busy(_) | ControlError::ConflictDetected(_) => StatusCode::CONFLICT,
            ControlError::InvalidInput(_) | ControlError::CapacityExceeded(_) => {
                StatusCode::BAD_REQUEST
            }
            ControlError::StorageFailure(_) | ControlError::Hardware(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({
            "success": false,
            "error": self.0.kind(),
            "reason": self.0.reason(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Json<serde_json::Value>, ApiError>;

fn ok() -> ApiResult {
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(controller: Controller) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/api/zones", get(api_zones))
        .route("/api/zones/stop", post(api_zones_stop))
        .route("/api/zones/{id}/start", post(api_zone_start))
        .route("/api/zones/{id}/stop", post(api_zone_stop))
        .route("/api/programs", get(api_programs).post(api_program_create))
        .route("/api/programs/stop", post(api_program_stop))
        .route(
            "/api/programs/{id}",
            put(api_program_update).delete(api_program_delete),
        )
        .route("/api/programs/{id}/run", post(api_program_run))
        .route("/api/health", get(api_health))
        .with_state(controller)
}

async fn index() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        concat!("irrigation-controller ", env!("CARGO_PKG_VERSION"), "\n"),
    )
}

async fn api_status(State(ctl): State<Controller>) -> impl IntoResponse {
    Json(json!({
        "success": true,
        "status": ctl.status(),
        "events": ctl.events(),
    }))
}

async fn api_zones(State(ctl): State<Controller>) -> impl IntoResponse {
    Json(json!({ "success": true, "zones": ctl.zone_status() }))
}

#[derive(Debug, Deserialize)]
struct StartZone {
    minutes: u32,
}

async fn api_zone_start(
    State(ctl): State<Controller>,
    Path(id): Path<u8>,
    Json(body): Json<StartZone>,
) -> ApiResult {
    ctl.activate_zone(id, body.minutes)?;
    ok()
}

async fn api_zone_stop(State(ctl): State<Controller>, Path(id): Path<u8>) -> ApiResult {
    ctl.deactivate_zone(id)?;
    ok()
}

async fn api_zones_stop(State(ctl): State<Controller>) -> ApiResult {
    ctl.deactivate_all_zones()?;
    ok()
}

async fn api_programs(State(ctl): State<Controller>) -> impl IntoResponse {
    Json(json!({ "success": true, "programs": ctl.list_programs() }))
}

async fn api_program_create(
    State(ctl): State<Controller>,
    Json(program): Json<Program>,
) -> ApiResult {
    let program = ctl.save_program(program)?;
    Ok(Json(json!({ "success": true, "program": program })))
}

async fn api_program_update(
    State(ctl): State<Controller>,
    Path(id): Path<String>,
    Json(program): Json<Program>,
) -> ApiResult {
    let program = ctl.update_program(&id, program)?;
    Ok(Json(json!({ "success": true, "program": program })))
}

async fn api_program_delete(State(ctl): State<Controller>, Path(id): Path<String>) -> ApiResult {
    ctl.delete_program(&id)?;
    ok()
}

async fn api_program_run(State(ctl): State<Controller>, Path(id): Path<String>) -> ApiResult {
    ctl.run_program_now(&id)?;
    ok()
}

async fn api_program_stop(State(ctl): State<Controller>) -> ApiResult {
    ctl.stop_running_program()?;
    ok()
}

async fn api_health(State(ctl): State<Controller>) -> impl IntoResponse {
    Json(json!({ "success": true, "health": ctl.health() }))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The HTTP server as a restartable service.
pub struct WebService {
    controller: Controller,
    addr: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebService {
    pub fn new(controller: Controller, addr: SocketAddr) -> Self {
        Self {
            controller,
            addr,
            bound: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Bind and start serving in a background task.
    pub async fn start(&self) -> Result<SocketAddr> {
        // A restart reuses the port actually bound the first time.
        let addr = self.bound_addr().unwrap_or(self.addr);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind web port {addr}"))?;
        let local = listener.local_addr()?;

        let app = router(self.controller.clone());
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("web server error: {e}");
            }
        });

        *self.bound.lock().unwrap_or_else(PoisonError::into_inner) = Some(local);
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        tracing::info!("web ui listening on http://{local}");
        Ok(local)
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address the probe connects to; a wildcard bind is probed on loopback.
    fn probe_addr(&self) -> SocketAddr {
        let mut addr = self.bound_addr().unwrap_or(self.addr);
        if addr.ip().is_unspecified() {
            addr.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        addr
    }
}

#[async_trait]
impl ServiceProbe for WebService {
    async fn probe(&self) -> Result<()> {
        let addr = self.probe_addr();
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await?;
            anyhow::Ok(buf[..n].starts_with(b"HTTP"))
        };

        match tokio::time::timeout(Duration::from_secs(PROBE_TIMEOUT_SEC), exchange).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => bail!("unexpected response from {addr}"),
            Ok(Err(e)) => Err(e.context(format!("probe of {addr} failed"))),
            Err(_) => bail!("probe of {addr} timed out after {PROBE_TIMEOUT_SEC}s"),
        }
    }

    async fn restart(&self) -> Result<()> {
        let previous = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(previous) = previous {
            previous.abort();
            // Wait for the listener to be dropped before binding again.
            let _ = previous.await;
        }
        self.start().await.map(|_| ())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
