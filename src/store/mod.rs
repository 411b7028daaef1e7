//! Cluster state store adapter
//!
//! Wraps a hierarchical, watchable coordination service with strict session
//! semantics. The cluster tree is the single source of truth for which
//! indexes exist, which nodes are alive and which shard is served where.
//!
//! # Contract
//!
//! - Entries are addressed by absolute `/`-separated paths and hold one
//!   serialized record each (see [`crate::codec`]).
//! - [`CreateMode::Ephemeral`] entries belong to the creating session and
//!   disappear when that session ends. This is the failure detector.
//! - Every operation fails with `ConnectionLost` while the session is broken.
//!   Callers retry; [`StoreExt::ensure_created`] and [`StoreExt::ensure_deleted`]
//!   treat "already in the expected end state" on a retry as success.
//! - When a session expires the adapter opens a new one and emits
//!   [`SessionEvent::NewSession`]. Owners of ephemeral state must treat this
//!   as "removed from the cluster" and register again from scratch.
//!
//! # Backends
//!
//! - [`memory`] - the coordination engine itself, usable in-process
//! - [`server`] - axum service exposing a [`memory::MemoryStore`] to other processes
//! - [`remote`] - reqwest client for [`server`]

pub mod layout;
pub mod memory;
pub mod remote;
pub mod server;
pub mod watch;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;

use crate::codec::Record;
use crate::error::{Error, Result};
use crate::utils::retry::{with_retry_if, RetryConfig};

pub use layout::ClusterLayout;
pub use memory::{MemorySession, MemoryStore};
pub use remote::RemoteStore;
pub use watch::{watch_children, watch_data, ChildChange, ChildWatch, DataChange, DataWatch};

/// Identifier of a coordination session
pub type SessionId = u64;

/// Lifetime of a created entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed automatically when the creating session ends
    Ephemeral,
}

/// Kind of change applied to one entry of the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeEventKind {
    Created,
    DataChanged,
    Deleted,
    /// Events were lost; watchers must re-read their state
    Reset,
}

/// One change to the cluster tree, in global order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEvent {
    pub seq: u64,
    pub path: String,
    pub kind: TreeEventKind,
}

/// Session lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The service is unreachable; the session may still be alive
    Disconnected,
    /// The service is reachable again and the old session survived
    Reconnected,
    /// The session ended; its ephemeral entries are gone
    Expired { session: SessionId },
    /// A fresh session replaced an expired one
    NewSession { session: SessionId },
}

/// Hierarchical, watchable coordination store bound to one session
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Current session identifier
    fn session_id(&self) -> SessionId;

    /// Check whether an entry exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create an entry; missing parents are created as persistent empty entries
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()>;

    /// Read the data of an entry
    async fn read_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Replace the data of an entry as a whole
    async fn write_data(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// Delete an entry together with its whole subtree
    async fn delete(&self, path: &str) -> Result<()>;

    /// Names of the direct children of an entry, sorted
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Feed of all tree changes, used to derive watches
    fn subscribe(&self) -> broadcast::Receiver<TreeEvent>;

    /// Feed of session lifecycle notifications
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    /// End the session; ephemeral entries of this session are removed
    async fn close(&self) -> Result<()>;
}

fn is_connection_lost(err: &Error) -> bool {
    err.is_connection_lost()
}

/// Typed and idempotent helpers on top of [`ClusterStore`]
#[async_trait]
pub trait StoreExt: ClusterStore {
    /// Read and decode a record
    async fn read_record<R: Record + Send>(&self, path: &str) -> Result<R> {
        let bytes = self.read_data(path).await?;
        R::decode(&bytes)
    }

    /// Read and decode a record, mapping a missing entry to `None`
    async fn try_read_record<R: Record + Send>(&self, path: &str) -> Result<Option<R>> {
        match self.read_data(path).await {
            Ok(bytes) => R::decode(&bytes).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Encode and create a record
    async fn create_record<R: Record + Sync>(
        &self,
        path: &str,
        record: &R,
        mode: CreateMode,
    ) -> Result<()> {
        self.create(path, record.encode()?, mode).await
    }

    /// Encode and overwrite a record
    async fn write_record<R: Record + Sync>(&self, path: &str, record: &R) -> Result<()> {
        self.write_data(path, record.encode()?).await
    }

    /// Overwrite a record, creating it if it does not exist yet
    async fn upsert_record<R: Record + Sync>(
        &self,
        path: &str,
        record: &R,
        mode: CreateMode,
    ) -> Result<()> {
        let bytes = record.encode()?;
        match self.write_data(path, bytes.clone()).await {
            Err(e) if e.is_not_found() => match self.create(path, bytes.clone(), mode).await {
                Err(e) if e.is_already_exists() => self.write_data(path, bytes).await,
                other => other,
            },
            other => other,
        }
    }

    /// Create an entry, retrying on `ConnectionLost`.
    ///
    /// Returns `Ok(true)` if this call created the entry and `Ok(false)` if a
    /// retry found it already present. `AlreadyExists` on the first attempt
    /// is returned to the caller.
    async fn ensure_created(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        retry: &RetryConfig,
    ) -> Result<bool> {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let data = &data;
        with_retry_if(
            retry,
            move || {
                let data = data.clone();
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    match self.create(path, data, mode).await {
                        Ok(()) => Ok(true),
                        Err(e) if e.is_already_exists() && attempt > 0 => Ok(false),
                        Err(e) => Err(e),
                    }
                }
            },
            is_connection_lost,
        )
        .await
    }

    /// Delete an entry, retrying on `ConnectionLost`.
    ///
    /// Returns `Ok(false)` if the entry was already gone.
    async fn ensure_deleted(&self, path: &str, retry: &RetryConfig) -> Result<bool> {
        with_retry_if(
            retry,
            move || async move {
                match self.delete(path).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            },
            is_connection_lost,
        )
        .await
    }

    /// Children of an entry, mapping a missing entry to an empty list
    async fn children_or_empty(&self, path: &str) -> Result<Vec<String>> {
        match self.get_children(path).await {
            Ok(children) => Ok(children),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

impl<T: ClusterStore + ?Sized> StoreExt for T {}
