//! Term-matching index library over JSON-lines shards
//!
//! A shard is a directory of `*.jsonl` files. Every line is one document,
//! a JSON object whose values become its stored fields. Document ids are
//! assigned in file-name order, then line order, so they are stable for a
//! given shard.
//!
//! Queries are whitespace-separated terms, optionally restricted to one
//! field with `field:term`. A document matches if it contains any term and
//! is scored with term frequency times inverse document frequency.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use super::{IndexLibrary, ScoredDoc, ShardHandle, ShardHits};
use crate::error::{Error, Result};
use crate::models::DetailFields;

/// File extension of shard data files
pub const SHARD_FILE_EXTENSION: &str = "jsonl";

/// How document text is split into terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Analyzer {
    /// Lower-cased runs of letters and digits
    Standard,
    /// Whitespace-separated, case preserved
    Whitespace,
}

impl Analyzer {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "standard" | "" => Ok(Self::Standard),
            "whitespace" => Ok(Self::Whitespace),
            other => Err(Error::IndexLibrary(format!("unknown analyzer '{other}'"))),
        }
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        match self {
            Self::Standard => {
                static WORD_RE: OnceLock<Regex> = OnceLock::new();
                let re = WORD_RE
                    .get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").expect("Invalid regex pattern"));
                re.find_iter(&text.to_lowercase())
                    .map(|m| m.as_str().to_string())
                    .collect()
            }
            Self::Whitespace => text.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// One query term, optionally bound to a field
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueryTerm {
    field: Option<String>,
    term: String,
}

fn parse_query(analyzer: Analyzer, query: &str) -> Vec<QueryTerm> {
    let mut terms = Vec::new();
    for part in query.split_whitespace() {
        let (field, text) = match part.split_once(':') {
            Some((field, text)) if !field.is_empty() && !text.is_empty() => {
                (Some(field.to_string()), text)
            }
            _ => (None, part),
        };
        for term in analyzer.tokenize(text) {
            terms.push(QueryTerm {
                field: field.clone(),
                term,
            });
        }
    }
    terms
}

#[derive(Debug, Clone, Copy)]
struct Posting {
    doc_id: u32,
    field: usize,
    freq: u32,
}

/// Library opening JSON-lines shards
#[derive(Debug, Default, Clone)]
pub struct JsonlLibrary {
    open_handles: Arc<AtomicUsize>,
}

impl JsonlLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shards opened through this library and not yet closed
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }
}

impl IndexLibrary for JsonlLibrary {
    fn open(&self, dir: &Path, analyzer: &str) -> Result<Arc<dyn ShardHandle>> {
        let analyzer = Analyzer::parse(analyzer)?;
        let files = shard_files(dir)?;
        if files.is_empty() {
            return Err(Error::IndexLibrary(format!(
                "no .{SHARD_FILE_EXTENSION} files in {}",
                dir.display()
            )));
        }

        let mut shard = JsonlShard {
            analyzer,
            docs: Vec::new(),
            fields: Vec::new(),
            postings: HashMap::new(),
            // Only counted as open once fully loaded
            closed: AtomicBool::new(true),
            open_handles: Arc::clone(&self.open_handles),
        };
        for file in &files {
            let content = std::fs::read_to_string(file)?;
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let value: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line)
                    .map_err(|e| {
                        Error::IndexLibrary(format!("{}:{}: {e}", file.display(), line_no + 1))
                    })?;
                shard.add_document(value)?;
            }
        }

        debug!(dir = %dir.display(), docs = shard.docs.len(), "Opened shard");
        shard.closed.store(false, Ordering::SeqCst);
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(shard))
    }
}

/// The data files of a shard directory, sorted by name
pub fn shard_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == SHARD_FILE_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug)]
struct JsonlShard {
    analyzer: Analyzer,
    docs: Vec<DetailFields>,
    fields: Vec<String>,
    postings: HashMap<String, Vec<Posting>>,
    closed: AtomicBool,
    open_handles: Arc<AtomicUsize>,
}

impl JsonlShard {
    fn add_document(&mut self, value: serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let doc_id = u32::try_from(self.docs.len())
            .map_err(|_| Error::IndexLibrary("too many documents in shard".to_string()))?;

        let mut stored = DetailFields::new();
        for (name, value) in value {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };

            let field = match self.fields.iter().position(|f| *f == name) {
                Some(i) => i,
                None => {
                    self.fields.push(name.clone());
                    self.fields.len() - 1
                }
            };

            let mut freqs: HashMap<String, u32> = HashMap::new();
            for term in self.analyzer.tokenize(&text) {
                *freqs.entry(term).or_insert(0) += 1;
            }
            for (term, freq) in freqs {
                self.postings.entry(term).or_default().push(Posting {
                    doc_id,
                    field,
                    freq,
                });
            }
            stored.insert(name, text);
        }
        self.docs.push(stored);
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::ShardClosed)
        } else {
            Ok(())
        }
    }

    /// Score every matching document
    fn score(&self, query: &str) -> HashMap<u32, f32> {
        let doc_count = self.docs.len() as f32;
        let mut scores: HashMap<u32, f32> = HashMap::new();

        for term in parse_query(self.analyzer, query) {
            let Some(postings) = self.postings.get(&term.term) else {
                continue;
            };
            let field = match &term.field {
                Some(name) => match self.fields.iter().position(|f| f == name) {
                    Some(i) => Some(i),
                    None => continue,
                },
                None => None,
            };

            let mut freqs: HashMap<u32, u32> = HashMap::new();
            for posting in postings {
                if field.map_or(true, |f| f == posting.field) {
                    *freqs.entry(posting.doc_id).or_insert(0) += posting.freq;
                }
            }
            if freqs.is_empty() {
                continue;
            }

            let idf = (1.0 + doc_count / freqs.len() as f32).ln();
            for (doc_id, freq) in freqs {
                *scores.entry(doc_id).or_insert(0.0) += freq as f32 * idf;
            }
        }
        scores
    }
}

impl ShardHandle for JsonlShard {
    fn doc_count(&self) -> u64 {
        self.docs.len() as u64
    }

    fn count(&self, query: &str) -> Result<u64> {
        self.check_open()?;
        Ok(self.score(query).len() as u64)
    }

    fn search(&self, query: &str, limit: usize) -> Result<ShardHits> {
        self.check_open()?;
        let scores = self.score(query);
        let total = scores.len() as u64;

        let mut docs: Vec<ScoredDoc> = scores
            .into_iter()
            .map(|(doc_id, score)| ScoredDoc { doc_id, score })
            .collect();
        docs.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
        docs.truncate(limit);

        Ok(ShardHits { docs, total })
    }

    fn stored_fields(&self, doc_id: u32) -> Result<Option<DetailFields>> {
        self.check_open()?;
        Ok(self.docs.get(doc_id as usize).cloned())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for JsonlShard {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_shard(dir: &Path, lines: &[&str]) {
        let mut file = std::fs::File::create(dir.join("part-0.jsonl")).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    fn open(lines: &[&str]) -> (tempfile::TempDir, JsonlLibrary, Arc<dyn ShardHandle>) {
        let dir = tempfile::tempdir().unwrap();
        write_shard(dir.path(), lines);
        let library = JsonlLibrary::new();
        let handle = library.open(dir.path(), "standard").unwrap();
        (dir, library, handle)
    }

    #[test]
    fn test_standard_analyzer() {
        let tokens = Analyzer::Standard.tokenize("Hello, World! 42x");
        assert_eq!(tokens, vec!["hello", "world", "42x"]);
        assert!(Analyzer::parse("unknown").is_err());
    }

    #[test]
    fn test_count_and_search() {
        let (_dir, _library, shard) = open(&[
            r#"{"title": "rust search", "body": "fast search engine"}"#,
            r#"{"title": "cooking", "body": "pasta recipes"}"#,
            r#"{"title": "search", "body": "rust"}"#,
        ]);

        assert_eq!(shard.doc_count(), 3);
        assert_eq!(shard.count("search").unwrap(), 2);
        assert_eq!(shard.count("pasta rust").unwrap(), 3);
        assert_eq!(shard.count("missing").unwrap(), 0);
        assert_eq!(shard.count("").unwrap(), 0);

        let hits = shard.search("search", 1).unwrap();
        assert_eq!(hits.total, 2);
        assert_eq!(hits.docs.len(), 1);
        // doc 0 mentions "search" twice
        assert_eq!(hits.docs[0].doc_id, 0);
    }

    #[test]
    fn test_field_restricted_term() {
        let (_dir, _library, shard) = open(&[
            r#"{"title": "rust", "body": "other"}"#,
            r#"{"title": "other", "body": "rust"}"#,
        ]);
        let hits = shard.search("title:rust", 10).unwrap();
        assert_eq!(hits.total, 1);
        assert_eq!(hits.docs[0].doc_id, 0);
        assert_eq!(shard.count("nofield:rust").unwrap(), 0);
    }

    #[test]
    fn test_search_is_deterministic_on_ties() {
        let (_dir, _library, shard) = open(&[
            r#"{"t": "same"}"#,
            r#"{"t": "same"}"#,
            r#"{"t": "same"}"#,
        ]);
        let ids: Vec<u32> = shard
            .search("same", 10)
            .unwrap()
            .docs
            .iter()
            .map(|d| d.doc_id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_stored_fields() {
        let (_dir, _library, shard) = open(&[r#"{"title": "a", "year": 2001, "none": null}"#]);
        let fields = shard.stored_fields(0).unwrap().unwrap();
        assert_eq!(fields.get("title").map(String::as_str), Some("a"));
        assert_eq!(fields.get("year").map(String::as_str), Some("2001"));
        assert!(!fields.contains_key("none"));
        assert!(shard.stored_fields(1).unwrap().is_none());
    }

    #[test]
    fn test_close_tracks_handles() {
        let (_dir, library, shard) = open(&[r#"{"t": "x"}"#]);
        assert_eq!(library.open_handles(), 1);
        shard.close();
        assert_eq!(library.open_handles(), 0);
        assert!(matches!(shard.count("x"), Err(Error::ShardClosed)));
        assert!(matches!(shard.stored_fields(0), Err(Error::ShardClosed)));
        drop(shard);
        assert_eq!(library.open_handles(), 0);
    }

    #[test]
    fn test_open_rejects_bad_input() {
        let library = JsonlLibrary::new();
        let empty = tempfile::tempdir().unwrap();
        assert!(library.open(empty.path(), "standard").is_err());

        let bad = tempfile::tempdir().unwrap();
        write_shard(bad.path(), &["not json"]);
        assert!(library.open(bad.path(), "standard").is_err());
        assert_eq!(library.open_handles(), 0);
    }
}
