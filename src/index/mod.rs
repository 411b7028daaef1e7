//! Local index library and shard storage
//!
//! Nodes never look inside shard data themselves. They fetch a shard from
//! the shared storage into a working directory ([`ShardStorage`]) and open
//! it through an [`IndexLibrary`], which executes queries and scores
//! documents.
//!
//! The bundled implementations are [`jsonl::JsonlLibrary`], a term-matching
//! library over JSON-lines documents, and [`storage::FsStorage`], which
//! treats a directory on a shared filesystem as the storage.

pub mod jsonl;
pub mod storage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::models::DetailFields;

pub use jsonl::JsonlLibrary;
pub use storage::FsStorage;

/// One scored document of a shard-local result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredDoc {
    pub doc_id: u32,
    pub score: f32,
}

/// Shard-local top-k plus the number of all matching documents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardHits {
    pub docs: Vec<ScoredDoc>,
    pub total: u64,
}

/// An open shard
pub trait ShardHandle: Send + Sync + std::fmt::Debug {
    /// Number of documents in the shard
    fn doc_count(&self) -> u64;

    /// Number of documents matching `query`
    fn count(&self, query: &str) -> Result<u64>;

    /// Best `limit` documents for `query`, ordered by descending score then doc id
    fn search(&self, query: &str, limit: usize) -> Result<ShardHits>;

    /// Stored fields of one document; `None` if the id is out of range
    fn stored_fields(&self, doc_id: u32) -> Result<Option<DetailFields>>;

    /// Release the shard; later calls fail
    fn close(&self);
}

/// Opens shards that were fetched into a local directory
pub trait IndexLibrary: Send + Sync {
    /// Open a shard. `analyzer` names how its documents were tokenized.
    fn open(&self, dir: &Path, analyzer: &str) -> Result<Arc<dyn ShardHandle>>;
}

/// A shard discovered at an index location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSource {
    /// Shard name, unique within its index
    pub name: String,
    /// Location of the shard's data in the storage
    pub location: String,
}

/// Shared storage holding shard data
#[async_trait]
pub trait ShardStorage: Send + Sync {
    /// Enumerate the shards of an index location, sorted by name
    async fn list_shards(&self, location: &str) -> Result<Vec<ShardSource>>;

    /// Copy one shard into `dest`, replacing anything already there
    async fn fetch(&self, location: &str, dest: &Path) -> Result<()>;
}
