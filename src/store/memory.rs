//! In-process coordination engine
//!
//! [`MemoryStore`] holds the tree, the session table and the global change
//! feed. [`MemorySession`] binds one session to it and implements
//! [`ClusterStore`]. The `shoal store` service wraps the same engine.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::layout::{is_valid_path, last_segment, parent_of};
use super::{ClusterStore, CreateMode, SessionEvent, SessionId, TreeEvent, TreeEventKind};
use crate::error::{Error, Result};

/// Capacity of the change feed before slow subscribers lag
const EVENT_CAPACITY: usize = 4096;

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    owner: Option<SessionId>,
    children: BTreeSet<String>,
}

impl Entry {
    fn new(data: Vec<u8>, owner: Option<SessionId>) -> Self {
        Self {
            data,
            owner,
            children: BTreeSet::new(),
        }
    }
}

#[derive(Debug)]
struct TreeState {
    entries: HashMap<String, Entry>,
    sessions: HashMap<SessionId, BTreeSet<String>>,
    next_session: SessionId,
    seq: u64,
}

impl TreeState {
    fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert("/".to_string(), Entry::new(Vec::new(), None));
        Self {
            entries,
            sessions: HashMap::new(),
            next_session: 1,
            seq: 0,
        }
    }
}

/// The coordination tree shared by all sessions
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<TreeState>,
    events: broadcast::Sender<TreeEvent>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(TreeState::new()),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        // A panic while holding the lock leaves a consistent tree: every
        // mutation is applied before its event is emitted.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, state: &mut TreeState, path: &str, kind: TreeEventKind) {
        state.seq += 1;
        let _ = self.events.send(TreeEvent {
            seq: state.seq,
            path: path.to_string(),
            kind,
        });
    }

    /// Open a session bound to this tree
    pub fn connect(self: &Arc<Self>) -> Arc<MemorySession> {
        let session = self.open_session();
        let (events, _) = broadcast::channel(64);
        Arc::new(MemorySession {
            store: Arc::clone(self),
            session: AtomicU64::new(session),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            events,
        })
    }

    /// Register a new session
    pub fn open_session(&self) -> SessionId {
        let mut state = self.lock();
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(id, BTreeSet::new());
        debug!(session = id, "Session opened");
        id
    }

    /// End a session and remove its ephemeral entries; returns false if it was not live
    pub fn close_session(&self, session: SessionId) -> bool {
        let mut state = self.lock();
        let Some(owned) = state.sessions.remove(&session) else {
            return false;
        };
        for path in owned.iter().rev() {
            if state.entries.contains_key(path) {
                self.remove_subtree(&mut state, path);
            }
        }
        info!(session = session, ephemerals = owned.len(), "Session closed");
        true
    }

    pub fn is_live(&self, session: SessionId) -> bool {
        self.lock().sessions.contains_key(&session)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Sequence number of the most recent change
    pub fn last_seq(&self) -> u64 {
        self.lock().seq
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        check_path(path)?;
        Ok(self.lock().entries.contains_key(path))
    }

    /// Create an entry; `session` owns it when `mode` is ephemeral
    pub fn create(
        &self,
        session: Option<SessionId>,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<()> {
        check_path(path)?;
        if path == "/" {
            return Err(Error::already_exists(path));
        }

        let mut state = self.lock();
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => match session {
                Some(id) if state.sessions.contains_key(&id) => Some(id),
                _ => return Err(Error::connection_lost("session expired")),
            },
        };
        if state.entries.contains_key(path) {
            return Err(Error::already_exists(path));
        }

        // Collect missing ancestors, nearest first
        let mut missing = Vec::new();
        let mut current = parent_of(path);
        while let Some(parent) = current {
            match state.entries.get(parent) {
                Some(entry) if entry.owner.is_some() => {
                    return Err(Error::other(format!(
                        "cannot create {path}: {parent} is ephemeral"
                    )));
                }
                Some(_) => break,
                None => missing.push(parent.to_string()),
            }
            current = parent_of(parent);
        }

        for ancestor in missing.iter().rev() {
            self.insert(&mut state, ancestor, Vec::new(), None);
        }
        self.insert(&mut state, path, data, owner);
        if let Some(id) = owner {
            if let Some(owned) = state.sessions.get_mut(&id) {
                owned.insert(path.to_string());
            }
        }
        Ok(())
    }

    fn insert(&self, state: &mut TreeState, path: &str, data: Vec<u8>, owner: Option<SessionId>) {
        if let Some(parent) = parent_of(path) {
            if let Some(entry) = state.entries.get_mut(parent) {
                entry.children.insert(last_segment(path).to_string());
            }
        }
        state.entries.insert(path.to_string(), Entry::new(data, owner));
        self.emit(state, path, TreeEventKind::Created);
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        check_path(path)?;
        self.lock()
            .entries
            .get(path)
            .map(|e| e.data.clone())
            .ok_or_else(|| Error::not_found(path))
    }

    pub fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        check_path(path)?;
        let mut state = self.lock();
        let entry = state
            .entries
            .get_mut(path)
            .ok_or_else(|| Error::not_found(path))?;
        entry.data = data;
        self.emit(&mut state, path, TreeEventKind::DataChanged);
        Ok(())
    }

    /// Delete an entry and its whole subtree
    pub fn delete(&self, path: &str) -> Result<()> {
        check_path(path)?;
        if path == "/" {
            return Err(Error::other("cannot delete the root entry"));
        }
        let mut state = self.lock();
        if !state.entries.contains_key(path) {
            return Err(Error::not_found(path));
        }
        self.remove_subtree(&mut state, path);
        Ok(())
    }

    fn remove_subtree(&self, state: &mut TreeState, path: &str) {
        // Depth-first so children are deleted before their parent
        let mut order = Vec::new();
        let mut stack = vec![path.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(entry) = state.entries.get(&current) {
                for child in &entry.children {
                    stack.push(super::layout::join(&current, child));
                }
            }
            order.push(current);
        }

        for current in order.iter().rev() {
            if let Some(entry) = state.entries.remove(current) {
                if let Some(owner) = entry.owner {
                    if let Some(owned) = state.sessions.get_mut(&owner) {
                        owned.remove(current);
                    }
                }
                self.emit(state, current, TreeEventKind::Deleted);
            }
        }

        if let Some(parent) = parent_of(path) {
            if let Some(entry) = state.entries.get_mut(parent) {
                entry.children.remove(last_segment(path));
            }
        }
    }

    pub fn children(&self, path: &str) -> Result<Vec<String>> {
        check_path(path)?;
        self.lock()
            .entries
            .get(path)
            .map(|e| e.children.iter().cloned().collect())
            .ok_or_else(|| Error::not_found(path))
    }
}

fn check_path(path: &str) -> Result<()> {
    if is_valid_path(path) {
        Ok(())
    } else {
        Err(Error::other(format!("invalid path: '{path}'")))
    }
}

/// One session on a [`MemoryStore`]
///
/// Connectivity can be toggled and the session expired on demand, which is
/// how failure scenarios are driven in-process.
#[derive(Debug)]
pub struct MemorySession {
    store: Arc<MemoryStore>,
    session: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl MemorySession {
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Simulate losing or regaining the connection without losing the session
    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            let event = if connected {
                SessionEvent::Reconnected
            } else {
                SessionEvent::Disconnected
            };
            let _ = self.events.send(event);
        }
    }

    /// Expire the session: its ephemeral entries vanish and a fresh session replaces it
    pub fn expire(&self) -> SessionId {
        let old = self.session.load(Ordering::SeqCst);
        self.store.close_session(old);
        let _ = self.events.send(SessionEvent::Expired { session: old });

        let new = self.store.open_session();
        self.session.store(new, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::NewSession { session: new });
        new
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::connection_lost("session closed"));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::connection_lost("disconnected"));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for MemorySession {
    fn session_id(&self) -> SessionId {
        self.session.load(Ordering::SeqCst)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check()?;
        self.store.exists(path)
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        self.check()?;
        self.store.create(Some(self.session_id()), path, data, mode)
    }

    async fn read_data(&self, path: &str) -> Result<Vec<u8>> {
        self.check()?;
        self.store.read(path)
    }

    async fn write_data(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.check()?;
        self.store.write(path, data)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check()?;
        self.store.delete(path)
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check()?;
        self.store.children(path)
    }

    fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.store.subscribe()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.store.close_session(self.session_id());
        }
        Ok(())
    }
}
