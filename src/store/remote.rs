//! HTTP client for the coordination store service
//!
//! A background heartbeat keeps the session alive. When the service reports
//! the session as unknown, a fresh session is opened and announced with
//! [`SessionEvent::NewSession`]. A second task long-polls the event feed and
//! republishes it locally so watches work the same as in-process.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::server::{EventBatch, EventParams, PathParams, SessionOpened};
use super::{ClusterStore, CreateMode, SessionEvent, SessionId, TreeEvent, TreeEventKind};
use crate::error::{Error, Result};

const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// [`ClusterStore`] backed by a remote `shoal store` service
#[derive(Debug)]
pub struct RemoteStore {
    http: Client,
    base_url: String,
    session: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    tree: broadcast::Sender<TreeEvent>,
    sessions: broadcast::Sender<SessionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn transport(err: reqwest::Error) -> Error {
    Error::connection_lost(err.to_string())
}

impl RemoteStore {
    /// Open a session and start the heartbeat and event tasks
    pub async fn connect(
        url: &str,
        heartbeat_interval: Duration,
        poll_wait: Duration,
    ) -> Result<Arc<Self>> {
        let http = Client::builder()
            .timeout(poll_wait + Duration::from_secs(10))
            .build()?;
        let base_url = url.trim_end_matches('/').to_string();

        let opened = open_session(&http, &base_url).await?;
        info!(url = %base_url, session = opened.session, "Connected to coordination store");

        let (tree, _) = broadcast::channel(4096);
        let (sessions, _) = broadcast::channel(64);
        let store = Arc::new(Self {
            http,
            base_url,
            session: AtomicU64::new(opened.session),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            tree,
            sessions,
            tasks: Mutex::new(Vec::new()),
        });

        let heartbeat = tokio::spawn(heartbeat_loop(Arc::downgrade(&store), heartbeat_interval));
        let poller = tokio::spawn(poll_loop(
            store.http.clone(),
            store.base_url.clone(),
            store.tree.clone(),
            opened.last_seq,
            poll_wait,
        ));
        store.lock_tasks().extend([heartbeat, poller]);

        Ok(store)
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn params(&self, path: &str) -> PathParams {
        PathParams {
            path: path.to_string(),
            session: None,
            mode: None,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::connection_lost("session closed"))
        } else {
            Ok(())
        }
    }

    async fn heartbeat_once(&self) {
        let session = self.session_id();
        let result = self
            .http
            .post(self.url(&format!("/v1/sessions/{session}/heartbeat")))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                self.connected.store(true, Ordering::SeqCst);
                self.renew_session(session).await;
            }
            Ok(resp) if resp.status().is_success() => {
                if !self.connected.swap(true, Ordering::SeqCst) {
                    info!(session = session, "Reconnected to coordination store");
                    let _ = self.sessions.send(SessionEvent::Reconnected);
                }
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "Unexpected heartbeat response");
            }
            Err(e) => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    warn!(error = %e, "Lost connection to coordination store");
                    let _ = self.sessions.send(SessionEvent::Disconnected);
                }
            }
        }
    }

    async fn renew_session(&self, expired: SessionId) {
        warn!(session = expired, "Session expired");
        let _ = self.sessions.send(SessionEvent::Expired { session: expired });
        match open_session(&self.http, &self.base_url).await {
            Ok(opened) => {
                self.session.store(opened.session, Ordering::SeqCst);
                info!(session = opened.session, "Opened replacement session");
                let _ = self
                    .sessions
                    .send(SessionEvent::NewSession { session: opened.session });
            }
            Err(e) => {
                // The next heartbeat reports the old session as unknown again
                warn!(error = %e, "Failed to open replacement session");
            }
        }
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

async fn open_session(http: &Client, base_url: &str) -> Result<SessionOpened> {
    let resp = http
        .post(format!("{base_url}/v1/sessions"))
        .send()
        .await
        .map_err(transport)?;
    let resp = check(resp, "/v1/sessions").await?;
    decode(resp).await
}

/// Read a JSON body. A body cut off mid-stream means the service went away.
async fn decode<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T> {
    resp.json::<T>().await.map_err(|e| {
        if e.is_decode() {
            Error::connection_lost(format!("unreadable store response: {e}"))
        } else {
            transport(e)
        }
    })
}

async fn check(resp: Response, path: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => Error::not_found(path),
        StatusCode::CONFLICT => Error::already_exists(path),
        StatusCode::GONE => Error::connection_lost(message),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            Error::connection_lost(format!("store unavailable: {status}"))
        }
        _ => Error::other(format!("store returned {status} for {path}: {message}")),
    })
}

async fn heartbeat_loop(store: Weak<RemoteStore>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(store) = store.upgrade() else {
            break;
        };
        if store.closed.load(Ordering::SeqCst) {
            break;
        }
        store.heartbeat_once().await;
    }
}

async fn poll_loop(
    http: Client,
    base_url: String,
    tree: broadcast::Sender<TreeEvent>,
    mut since: u64,
    wait: Duration,
) {
    let url = format!("{base_url}/v1/events");
    loop {
        let params = EventParams {
            since,
            wait_ms: wait.as_millis() as u64,
        };
        let batch = match http.get(&url).query(&params).send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<EventBatch>().await,
            Ok(resp) => {
                debug!(status = %resp.status(), "Event poll rejected");
                tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                continue;
            }
            Err(e) => Err(e),
        };

        match batch {
            Ok(batch) if batch.reset || batch.last_seq < since => {
                debug!(since = since, last_seq = batch.last_seq, "Event feed reset");
                since = batch.last_seq;
                let _ = tree.send(TreeEvent {
                    seq: since,
                    path: "/".to_string(),
                    kind: TreeEventKind::Reset,
                });
            }
            Ok(batch) => {
                for event in batch.events {
                    since = since.max(event.seq);
                    let _ = tree.send(event);
                }
            }
            Err(e) => {
                debug!(error = %e, "Event poll failed");
                tokio::time::sleep(POLL_ERROR_BACKOFF).await;
            }
        }
    }
}

#[async_trait]
impl ClusterStore for RemoteStore {
    fn session_id(&self) -> SessionId {
        self.session.load(Ordering::SeqCst)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        let resp = self
            .http
            .get(self.url("/v1/exists"))
            .query(&self.params(path))
            .send()
            .await
            .map_err(transport)?;
        decode(check(resp, path).await?).await
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        self.check_open()?;
        let params = PathParams {
            path: path.to_string(),
            session: Some(self.session_id()),
            mode: Some(mode),
        };
        let resp = self
            .http
            .post(self.url("/v1/entry"))
            .query(&params)
            .body(data)
            .send()
            .await
            .map_err(transport)?;
        check(resp, path).await?;
        Ok(())
    }

    async fn read_data(&self, path: &str) -> Result<Vec<u8>> {
        self.check_open()?;
        let resp = self
            .http
            .get(self.url("/v1/entry"))
            .query(&self.params(path))
            .send()
            .await
            .map_err(transport)?;
        let bytes = check(resp, path).await?.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }

    async fn write_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.check_open()?;
        let resp = self
            .http
            .put(self.url("/v1/entry"))
            .query(&self.params(path))
            .body(data)
            .send()
            .await
            .map_err(transport)?;
        check(resp, path).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let resp = self
            .http
            .delete(self.url("/v1/entry"))
            .query(&self.params(path))
            .send()
            .await
            .map_err(transport)?;
        check(resp, path).await?;
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let resp = self
            .http
            .get(self.url("/v1/children"))
            .query(&self.params(path))
            .send()
            .await
            .map_err(transport)?;
        decode(check(resp, path).await?).await
    }

    fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.tree.subscribe()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.sessions.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        let session = self.session_id();
        let result = self
            .http
            .delete(self.url(&format!("/v1/sessions/{session}")))
            .send()
            .await;
        if let Err(e) = result {
            // The service expires the session on its own
            warn!(session = session, error = %e, "Failed to close session");
        }
        Ok(())
    }
}
