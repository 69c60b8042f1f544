use std::convert::Infallible;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tower_http::cors::{Any, CorsLayer};

use crate::controller::ConversationController;
use crate::error::ActionRejected;
use crate::logger::EventLog;
use crate::models::{ControllerUpdate, NextStepRequest, QueryRequest, QuestionRequest};

pub const KEYRING_SERVICE: &str = "ScreenGuide";
pub const KEYRING_USER: &str = "openai";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub struct RouterState {
  pub started_at: Instant,
  pub controller: ConversationController,
  pub events: EventLog,
}

pub async fn run_router(listener: TcpListener, state: RouterState) -> anyhow::Result<()> {
  let app = Router::new()
    .route("/health", get(health))
    .route("/v1/state", get(state_snapshot))
    .route("/v1/ask", post(ask))
    .route("/v1/task/start", post(start_task))
    .route("/v1/task/next", post(next_step))
    .route("/v1/task/question", post(ask_question))
    .route("/v1/reset", post(reset))
    .route("/v1/events", get(updates))
    .route("/v1/diagnostics", get(diagnostics))
    .route("/v1/preview", get(preview))
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
    .with_state(Arc::new(state));

  listener.set_nonblocking(true)?;
  let listener = tokio::net::TcpListener::from_std(listener)?;
  axum::serve(listener, app).await?;
  Ok(())
}

async fn health(State(state): State<Arc<RouterState>>) -> Json<serde_json::Value> {
  let uptime = state.started_at.elapsed().as_millis();
  Json(serde_json::json!({
    "status": "ok",
    "version": env!("CARGO_PKG_VERSION"),
    "uptime_ms": uptime
  }))
}

async fn state_snapshot(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
  Json(state.controller.state().await)
}

async fn ask(State(state): State<Arc<RouterState>>, Json(req): Json<QueryRequest>) -> Response {
  let key = match resolve_api_key(req.api_key.as_deref()) {
    Ok(k) => k,
    Err(msg) => return error_response(StatusCode::BAD_REQUEST, "key_missing", &msg),
  };
  let result = state.controller.ask(&req.query, &key).await;
  accepted(&state, result).await
}

async fn start_task(
  State(state): State<Arc<RouterState>>,
  Json(req): Json<QueryRequest>,
) -> Response {
  let key = match resolve_api_key(req.api_key.as_deref()) {
    Ok(k) => k,
    Err(msg) => return error_response(StatusCode::BAD_REQUEST, "key_missing", &msg),
  };
  let result = state.controller.start_task(&req.query, &key).await;
  accepted(&state, result).await
}

async fn next_step(
  State(state): State<Arc<RouterState>>,
  Json(req): Json<NextStepRequest>,
) -> Response {
  let key = match resolve_api_key(req.api_key.as_deref()) {
    Ok(k) => k,
    Err(msg) => return error_response(StatusCode::BAD_REQUEST, "key_missing", &msg),
  };
  let result = state.controller.next_step(&key).await;
  accepted(&state, result).await
}

async fn ask_question(
  State(state): State<Arc<RouterState>>,
  Json(req): Json<QuestionRequest>,
) -> Response {
  let key = match resolve_api_key(req.api_key.as_deref()) {
    Ok(k) => k,
    Err(msg) => return error_response(StatusCode::BAD_REQUEST, "key_missing", &msg),
  };
  let result = state.controller.ask_question(&req.question, &key).await;
  accepted(&state, result).await
}

async fn reset(State(state): State<Arc<RouterState>>) -> Response {
  state.controller.reset().await;
  (StatusCode::OK, Json(state.controller.state().await)).into_response()
}

async fn accepted(state: &RouterState, result: Result<JoinHandle<()>, ActionRejected>) -> Response {
  match result {
    Ok(_) => (StatusCode::ACCEPTED, Json(state.controller.state().await)).into_response(),
    Err(rejected) => {
      error_response(rejection_status(rejected), rejected.code(), &rejected.to_string())
    }
  }
}

async fn updates(
  State(state): State<Arc<RouterState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let controller = state.controller.clone();
  let mut rx = controller.subscribe();

  let stream = stream! {
    let snapshot = serde_json::to_string(&controller.state().await).unwrap_or_default();
    yield Ok(Event::default().event("state").data(snapshot));

    loop {
      match rx.recv().await {
        Ok(ControllerUpdate::State(s)) => {
          let data = serde_json::to_string(&s).unwrap_or_default();
          yield Ok(Event::default().event("state").data(data));
        }
        Ok(ControllerUpdate::Delta(text)) => {
          let data = serde_json::json!({ "text": text }).to_string();
          yield Ok(Event::default().event("delta").data(data));
        }
        Err(RecvError::Lagged(_)) => {
          // Deltas were dropped; resync the client from a full snapshot.
          let snapshot = serde_json::to_string(&controller.state().await).unwrap_or_default();
          yield Ok(Event::default().event("state").data(snapshot));
        }
        Err(RecvError::Closed) => break,
      }
    }
  };

  Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn diagnostics(
  State(state): State<Arc<RouterState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let mut rx = state.events.subscribe();

  let stream = stream! {
    loop {
      match rx.recv().await {
        Ok(event) => {
          let data = serde_json::to_string(&event).unwrap_or_default();
          yield Ok(Event::default().event("diagnostic").data(data));
        }
        Err(RecvError::Lagged(_)) => continue,
        Err(RecvError::Closed) => break,
      }
    }
  };

  Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn preview(State(state): State<Arc<RouterState>>) -> Response {
  match state.controller.capturer().preview_png() {
    None => error_response(StatusCode::NOT_FOUND, "no_preview", "No frame captured yet."),
    Some(Err(err)) => {
      error_response(StatusCode::INTERNAL_SERVER_ERROR, "preview_failed", &err.to_string())
    }
    Some(Ok(png)) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
  }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
  let body = Json(serde_json::json!({ "error": message, "code": code }));
  (status, body).into_response()
}

fn rejection_status(rejected: ActionRejected) -> StatusCode {
  match rejected {
    ActionRejected::EmptyInput => StatusCode::BAD_REQUEST,
    ActionRejected::Busy | ActionRejected::NeedsReset | ActionRejected::NoActiveTask => {
      StatusCode::CONFLICT
    }
  }
}

/// Explicit key, then the OS keyring, then the environment.
fn resolve_api_key(explicit: Option<&str>) -> Result<String, String> {
  if let Some(key) = explicit.map(str::trim).filter(|k| !k.is_empty()) {
    return Ok(key.to_string());
  }

  let stored = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER)
    .and_then(|e| e.get_password())
    .ok()
    .filter(|k| !k.trim().is_empty());
  if let Some(key) = stored {
    return Ok(key);
  }

  match std::env::var(API_KEY_ENV) {
    Ok(key) if !key.trim().is_empty() => Ok(key),
    _ => Err(format!(
      "API key missing. Store it in the system keyring ({KEYRING_SERVICE}/{KEYRING_USER}) \
       or set {API_KEY_ENV}."
    )),
  }
}
