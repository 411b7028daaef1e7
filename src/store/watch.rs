//! Watches derived from the change feed
//!
//! A watch reports the *current* state after each relevant change rather
//! than a replay of individual events. Bursts are coalesced, and a lagged
//! feed, a reset or a new session simply triggers a re-read. Subscribing
//! before the initial read means no change between the two is lost.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use super::layout::parent_of;
use super::{ClusterStore, SessionEvent, StoreExt, TreeEvent, TreeEventKind};
use crate::error::Result;

const WATCH_BUFFER: usize = 64;

/// Membership change of a watched entry's children
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Full sorted membership after the change
    pub children: Vec<String>,
}

/// Data change of a watched entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChange {
    Changed(Vec<u8>),
    Deleted,
}

/// Live view of an entry's children; stops when dropped
#[derive(Debug)]
pub struct ChildWatch {
    pub path: String,
    /// Children at the time the watch was installed
    pub initial: Vec<String>,
    rx: mpsc::Receiver<ChildChange>,
    task: JoinHandle<()>,
}

impl ChildWatch {
    /// Wait for the next membership change; `None` once the store is gone
    pub async fn next(&mut self) -> Option<ChildChange> {
        self.rx.recv().await
    }
}

impl Drop for ChildWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Live view of an entry's data; stops when dropped
#[derive(Debug)]
pub struct DataWatch {
    pub path: String,
    /// Data at the time the watch was installed, `None` if absent
    pub initial: Option<Vec<u8>>,
    rx: mpsc::Receiver<DataChange>,
    task: JoinHandle<()>,
}

impl DataWatch {
    pub async fn next(&mut self) -> Option<DataChange> {
        self.rx.recv().await
    }
}

impl Drop for DataWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Outcome of waiting for the next feed item
enum Wake {
    Resync,
    Ignore,
    Stop,
}

fn classify_tree(
    item: std::result::Result<TreeEvent, broadcast::error::RecvError>,
    relevant: impl Fn(&TreeEvent) -> bool,
) -> Wake {
    match item {
        Ok(event) if event.kind == TreeEventKind::Reset || relevant(&event) => Wake::Resync,
        Ok(_) => Wake::Ignore,
        Err(broadcast::error::RecvError::Lagged(missed)) => {
            debug!(missed = missed, "Watch lagged behind change feed");
            Wake::Resync
        }
        Err(broadcast::error::RecvError::Closed) => Wake::Stop,
    }
}

fn classify_session(
    item: std::result::Result<SessionEvent, broadcast::error::RecvError>,
    open: &mut bool,
) -> Wake {
    match item {
        Ok(SessionEvent::NewSession { .. }) | Ok(SessionEvent::Reconnected) => Wake::Resync,
        Ok(_) => Wake::Ignore,
        Err(broadcast::error::RecvError::Lagged(_)) => Wake::Resync,
        Err(broadcast::error::RecvError::Closed) => {
            *open = false;
            Wake::Ignore
        }
    }
}

/// Watch the children of `path`. A missing entry is reported as no children.
pub async fn watch_children(store: Arc<dyn ClusterStore>, path: &str) -> Result<ChildWatch> {
    let mut events = store.subscribe();
    let mut sessions = store.session_events();
    let initial = store.children_or_empty(path).await?;

    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    let watched = path.to_string();
    let mut current: BTreeSet<String> = initial.iter().cloned().collect();

    let task = tokio::spawn(async move {
        let mut sessions_open = true;
        loop {
            let wake = tokio::select! {
                _ = tx.closed() => Wake::Stop,
                item = events.recv() => classify_tree(item, |e| {
                    e.path == watched || parent_of(&e.path) == Some(watched.as_str())
                }),
                item = sessions.recv(), if sessions_open => classify_session(item, &mut sessions_open),
            };
            match wake {
                Wake::Stop => break,
                Wake::Ignore => continue,
                Wake::Resync => {}
            }

            let next: BTreeSet<String> = match store.children_or_empty(&watched).await {
                Ok(children) => children.into_iter().collect(),
                Err(e) => {
                    // Retried on the next event or reconnect
                    debug!(path = %watched, error = %e, "Watch re-read failed");
                    continue;
                }
            };
            if next == current {
                continue;
            }

            let change = ChildChange {
                added: next.difference(&current).cloned().collect(),
                removed: current.difference(&next).cloned().collect(),
                children: next.iter().cloned().collect(),
            };
            current = next;
            if tx.send(change).await.is_err() {
                break;
            }
        }
    });

    Ok(ChildWatch {
        path: path.to_string(),
        initial,
        rx,
        task,
    })
}

/// Watch the data of `path`
pub async fn watch_data(store: Arc<dyn ClusterStore>, path: &str) -> Result<DataWatch> {
    let mut events = store.subscribe();
    let mut sessions = store.session_events();
    let initial = read_optional(store.as_ref(), path).await?;

    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    let watched = path.to_string();
    let mut current = initial.clone();

    let task = tokio::spawn(async move {
        let mut sessions_open = true;
        loop {
            let wake = tokio::select! {
                _ = tx.closed() => Wake::Stop,
                item = events.recv() => classify_tree(item, |e| e.path == watched),
                item = sessions.recv(), if sessions_open => classify_session(item, &mut sessions_open),
            };
            match wake {
                Wake::Stop => break,
                Wake::Ignore => continue,
                Wake::Resync => {}
            }

            let next = match read_optional(store.as_ref(), &watched).await {
                Ok(next) => next,
                Err(e) => {
                    debug!(path = %watched, error = %e, "Watch re-read failed");
                    continue;
                }
            };
            if next == current {
                continue;
            }

            let change = match &next {
                Some(bytes) => DataChange::Changed(bytes.clone()),
                None => DataChange::Deleted,
            };
            current = next;
            if tx.send(change).await.is_err() {
                break;
            }
        }
    });

    Ok(DataWatch {
        path: path.to_string(),
        initial,
        rx,
        task,
    })
}

async fn read_optional(store: &dyn ClusterStore, path: &str) -> Result<Option<Vec<u8>>> {
    match store.read_data(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CreateMode, MemoryStore};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_child_watch_reports_membership() {
        let store = MemoryStore::new();
        let session = store.connect();
        session.create("/p/a", vec![], CreateMode::Persistent).await.unwrap();

        let mut watch = watch_children(session.clone(), "/p").await.unwrap();
        assert_eq!(watch.initial, vec!["a"]);

        session.create("/p/b", vec![], CreateMode::Persistent).await.unwrap();
        let change = timeout(WAIT, watch.next()).await.unwrap().unwrap();
        assert_eq!(change.added, vec!["b"]);
        assert!(change.removed.is_empty());
        assert_eq!(change.children, vec!["a", "b"]);

        session.delete("/p/a").await.unwrap();
        let change = timeout(WAIT, watch.next()).await.unwrap().unwrap();
        assert_eq!(change.removed, vec!["a"]);
        assert_eq!(change.children, vec!["b"]);
    }

    #[tokio::test]
    async fn test_child_watch_ignores_grandchildren_data() {
        let store = MemoryStore::new();
        let session = store.connect();
        session.create("/p/a", vec![], CreateMode::Persistent).await.unwrap();
        let mut watch = watch_children(session.clone(), "/p").await.unwrap();

        session.write_data("/p/a", vec![1]).await.unwrap();
        session.create("/p/c", vec![], CreateMode::Persistent).await.unwrap();
        let change = timeout(WAIT, watch.next()).await.unwrap().unwrap();
        assert_eq!(change.added, vec!["c"]);
    }

    #[tokio::test]
    async fn test_child_watch_on_missing_parent() {
        let store = MemoryStore::new();
        let session = store.connect();
        let mut watch = watch_children(session.clone(), "/later").await.unwrap();
        assert!(watch.initial.is_empty());

        session.create("/later/x", vec![], CreateMode::Persistent).await.unwrap();
        let change = timeout(WAIT, watch.next()).await.unwrap().unwrap();
        assert_eq!(change.children, vec!["x"]);
    }

    #[tokio::test]
    async fn test_child_watch_sees_ephemeral_expiry() {
        let store = MemoryStore::new();
        let observer = store.connect();
        let owner = store.connect();
        owner.create("/nodes/n1", vec![], CreateMode::Ephemeral).await.unwrap();

        let mut watch = watch_children(observer.clone(), "/nodes").await.unwrap();
        assert_eq!(watch.initial, vec!["n1"]);

        owner.expire();
        let change = timeout(WAIT, watch.next()).await.unwrap().unwrap();
        assert_eq!(change.removed, vec!["n1"]);
    }

    #[tokio::test]
    async fn test_data_watch() {
        let store = MemoryStore::new();
        let session = store.connect();
        let mut watch = watch_data(session.clone(), "/d").await.unwrap();
        assert!(watch.initial.is_none());

        session.create("/d", vec![1], CreateMode::Persistent).await.unwrap();
        assert_eq!(
            timeout(WAIT, watch.next()).await.unwrap().unwrap(),
            DataChange::Changed(vec![1])
        );

        session.write_data("/d", vec![2]).await.unwrap();
        assert_eq!(
            timeout(WAIT, watch.next()).await.unwrap().unwrap(),
            DataChange::Changed(vec![2])
        );

        session.delete("/d").await.unwrap();
        assert_eq!(
            timeout(WAIT, watch.next()).await.unwrap().unwrap(),
            DataChange::Deleted
        );
    }

    #[tokio::test]
    async fn test_watch_resyncs_after_reconnect() {
        let store = MemoryStore::new();
        let observer = store.connect();
        let writer = store.connect();
        let mut watch = watch_children(observer.clone(), "/p").await.unwrap();

        observer.set_connected(false);
        writer.create("/p/a", vec![], CreateMode::Persistent).await.unwrap();
        observer.set_connected(true);

        let change = timeout(WAIT, watch.next()).await.unwrap().unwrap();
        assert_eq!(change.children, vec!["a"]);
    }
}
