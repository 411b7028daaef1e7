//! Coordination store service
//!
//! Exposes one [`MemoryStore`] over HTTP so that masters, nodes and clients
//! in separate processes share a single cluster tree. Sessions are kept
//! alive by heartbeats and expired by a background reaper; watchers follow
//! the change feed through a long-polling event endpoint.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::memory::MemoryStore;
use super::{CreateMode, SessionId, TreeEvent};
use crate::config::StoreConfig;
use crate::error::{Error, Result};

// ============================================================================
// Wire Types
// ============================================================================

/// Response to opening a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOpened {
    pub session: SessionId,
    pub timeout_ms: u64,
    /// Sequence number to start following the event feed from
    pub last_seq: u64,
}

/// Query parameters addressing one entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathParams {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<CreateMode>,
}

/// Query parameters of the event long-poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventParams {
    pub since: u64,
    #[serde(default)]
    pub wait_ms: u64,
}

/// A batch of tree events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<TreeEvent>,
    pub last_seq: u64,
    /// Events after `since` were dropped; the caller must re-read its state
    pub reset: bool,
}

/// Error body returned with every non-2xx response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub sessions: usize,
    pub last_seq: u64,
}

// ============================================================================
// Event Log
// ============================================================================

/// Bounded history of tree events for long-polling watchers
#[derive(Debug)]
struct EventLog {
    events: VecDeque<TreeEvent>,
    /// Every event with a greater sequence number is retained
    floor: u64,
    capacity: usize,
}

impl EventLog {
    fn new(capacity: usize, floor: u64) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            floor,
            capacity,
        }
    }

    fn push(&mut self, event: TreeEvent) {
        if event.seq <= self.floor || self.events.back().is_some_and(|e| e.seq >= event.seq) {
            return;
        }
        if self.events.len() == self.capacity {
            if let Some(dropped) = self.events.pop_front() {
                self.floor = dropped.seq;
            }
        }
        self.events.push_back(event);
    }

    fn reset_to(&mut self, floor: u64) {
        self.events.clear();
        self.floor = floor;
    }

    fn since(&self, since: u64, last_seq: u64) -> EventBatch {
        if since < self.floor {
            return EventBatch {
                events: Vec::new(),
                last_seq,
                reset: true,
            };
        }
        EventBatch {
            events: self.events.iter().filter(|e| e.seq > since).cloned().collect(),
            last_seq,
            reset: false,
        }
    }
}

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct StoreState {
    pub store: Arc<MemoryStore>,
    heartbeats: Arc<Mutex<HashMap<SessionId, Instant>>>,
    log: Arc<Mutex<EventLog>>,
    latest: Arc<watch::Sender<u64>>,
    pub session_timeout: Duration,
    pub max_poll_wait: Duration,
    pub start_time: Instant,
}

impl StoreState {
    pub fn new(store: Arc<MemoryStore>, config: &StoreConfig) -> Self {
        let last_seq = store.last_seq();
        let (latest, _) = watch::channel(last_seq);
        Self {
            store,
            heartbeats: Arc::new(Mutex::new(HashMap::new())),
            log: Arc::new(Mutex::new(EventLog::new(config.event_log_capacity, last_seq))),
            latest: Arc::new(latest),
            session_timeout: Duration::from_millis(config.session_timeout_ms),
            max_poll_wait: Duration::from_millis(config.poll_wait_ms),
            start_time: Instant::now(),
        }
    }

    fn open_session(&self) -> SessionOpened {
        let session = self.store.open_session();
        lock(&self.heartbeats).insert(session, Instant::now());
        SessionOpened {
            session,
            timeout_ms: self.session_timeout.as_millis() as u64,
            last_seq: *self.latest.borrow(),
        }
    }

    fn heartbeat(&self, session: SessionId) -> bool {
        let mut heartbeats = lock(&self.heartbeats);
        match heartbeats.get_mut(&session) {
            Some(seen) if self.store.is_live(session) => {
                *seen = Instant::now();
                true
            }
            _ => {
                heartbeats.remove(&session);
                false
            }
        }
    }

    fn close_session(&self, session: SessionId) -> bool {
        lock(&self.heartbeats).remove(&session);
        self.store.close_session(session)
    }

    /// Expire sessions whose last heartbeat is older than the session timeout
    pub fn expire_stale_sessions(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let stale: Vec<SessionId> = {
            let mut heartbeats = lock(&self.heartbeats);
            let stale: Vec<SessionId> = heartbeats
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) > self.session_timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                heartbeats.remove(id);
            }
            stale
        };

        for id in &stale {
            warn!(session = id, "Session expired after missed heartbeats");
            self.store.close_session(*id);
        }
        stale
    }

    /// Copy the store's change feed into the event log until the store goes away
    fn start_event_pump(&self) {
        let mut feed = self.store.subscribe();
        let state = self.clone();
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        let seq = event.seq;
                        lock(&state.log).push(event);
                        state.latest.send_replace(seq);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let seq = state.store.last_seq();
                        warn!(missed = missed, "Event log lagged; watchers will resync");
                        lock(&state.log).reset_to(seq);
                        state.latest.send_replace(seq);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn start_reaper(&self) {
        let state = self.clone();
        let period = (self.session_timeout / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                state.expire_stale_sessions();
            }
        });
    }

    /// Start the background tasks backing sessions and the event feed
    pub fn start_background_tasks(&self) {
        self.start_event_pump();
        self.start_reaper();
        debug!("Store background tasks started");
    }

    async fn events_since(&self, since: u64, wait: Duration) -> EventBatch {
        let mut latest = self.latest.subscribe();
        let wait = wait.min(self.max_poll_wait);
        if *latest.borrow() <= since && !wait.is_zero() {
            let _ = tokio::time::timeout(wait, latest.wait_for(|seq| *seq > since)).await;
        }
        let last_seq = *self.latest.borrow();
        lock(&self.log).since(since, last_seq)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the store API router
pub fn create_router(state: StoreState) -> Router {
    Router::new()
        .route("/v1/health", get(health_check))
        .route("/v1/sessions", post(open_session))
        .route("/v1/sessions/{id}", delete(close_session))
        .route("/v1/sessions/{id}/heartbeat", post(heartbeat))
        .route(
            "/v1/entry",
            get(read_entry)
                .post(create_entry)
                .put(write_entry)
                .delete(delete_entry),
        )
        .route("/v1/exists", get(exists))
        .route("/v1/children", get(children))
        .route("/v1/events", get(events))
        .with_state(state)
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::AlreadyExists { .. } => StatusCode::CONFLICT,
            Error::ConnectionLost { .. } => StatusCode::GONE,
            Error::Other { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse::new(self.0.to_string()))).into_response()
    }
}

async fn health_check(State(state): State<StoreState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        sessions: state.store.session_count(),
        last_seq: *state.latest.borrow(),
    })
}

async fn open_session(State(state): State<StoreState>) -> impl IntoResponse {
    let opened = state.open_session();
    info!(session = opened.session, "Session opened");
    (StatusCode::CREATED, Json(opened))
}

async fn heartbeat(State(state): State<StoreState>, Path(id): Path<SessionId>) -> StatusCode {
    if state.heartbeat(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn close_session(State(state): State<StoreState>, Path(id): Path<SessionId>) -> StatusCode {
    if state.close_session(id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn create_entry(
    State(state): State<StoreState>,
    Query(params): Query<PathParams>,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let mode = params.mode.unwrap_or(CreateMode::Persistent);
    state
        .store
        .create(params.session, &params.path, body.to_vec(), mode)?;
    Ok(StatusCode::CREATED)
}

async fn read_entry(
    State(state): State<StoreState>,
    Query(params): Query<PathParams>,
) -> std::result::Result<Vec<u8>, ApiError> {
    Ok(state.store.read(&params.path)?)
}

async fn write_entry(
    State(state): State<StoreState>,
    Query(params): Query<PathParams>,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    state.store.write(&params.path, body.to_vec())?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_entry(
    State(state): State<StoreState>,
    Query(params): Query<PathParams>,
) -> std::result::Result<StatusCode, ApiError> {
    state.store.delete(&params.path)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn exists(
    State(state): State<StoreState>,
    Query(params): Query<PathParams>,
) -> std::result::Result<Json<bool>, ApiError> {
    Ok(Json(state.store.exists(&params.path)?))
}

async fn children(
    State(state): State<StoreState>,
    Query(params): Query<PathParams>,
) -> std::result::Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.store.children(&params.path)?))
}

async fn events(
    State(state): State<StoreState>,
    Query(params): Query<EventParams>,
) -> Json<EventBatch> {
    Json(
        state
            .events_since(params.since, Duration::from_millis(params.wait_ms))
            .await,
    )
}

// ============================================================================
// Store Server
// ============================================================================

/// The `shoal store` process
pub struct StoreServer {
    config: StoreConfig,
    state: StoreState,
}

impl StoreServer {
    pub fn new(config: StoreConfig) -> Self {
        let state = StoreState::new(MemoryStore::new(), &config);
        Self { config, state }
    }

    pub fn state(&self) -> StoreState {
        self.state.clone()
    }

    pub fn build_router(&self) -> Router {
        create_router(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown_signal` resolves
    pub async fn start_with_shutdown(
        &self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_address).await?;
        self.serve(listener, shutdown_signal).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        info!(address = %addr, "Starting coordination store");

        self.state.start_background_tasks();
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown_signal)
            .await?;

        info!("Coordination store shutdown complete");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
