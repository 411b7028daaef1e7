//! Filesystem shard storage
//!
//! An index location is a directory (a plain path or a `file://` URL) on a
//! filesystem every node can read. Each sub-directory, and each loose
//! `*.jsonl` file, in it is one shard.

use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tracing::debug;
use url::Url;

use super::jsonl::SHARD_FILE_EXTENSION;
use super::{ShardSource, ShardStorage};
use crate::error::{Error, Result};
use crate::models::validate_name;

/// Shard storage on a shared or local filesystem
#[derive(Debug, Clone, Default)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }
}

/// Resolve a location string to a local path
pub fn resolve_location(location: &str) -> Result<PathBuf> {
    if location.contains("://") {
        let url = Url::parse(location)
            .map_err(|e| Error::config(format!("invalid location '{location}': {e}")))?;
        if url.scheme() != "file" {
            return Err(Error::config(format!(
                "unsupported location scheme '{}'",
                url.scheme()
            )));
        }
        return url
            .to_file_path()
            .map_err(|_| Error::config(format!("invalid file location '{location}'")));
    }
    Ok(PathBuf::from(location))
}

fn copy_dir<'a>(
    src: &'a Path,
    dest: &'a Path,
) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dest).await?;
        let mut copied = 0;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let target = dest.join(entry.file_name());
            if file_type.is_dir() {
                copied += copy_dir(&entry.path(), &target).await?;
            } else if file_type.is_file() {
                copied += tokio::fs::copy(entry.path(), target).await?;
            }
        }
        Ok(copied)
    })
}

#[async_trait]
impl ShardStorage for FsStorage {
    async fn list_shards(&self, location: &str) -> Result<Vec<ShardSource>> {
        let dir = resolve_location(location)?;
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            Error::with_source(format!("cannot list shards at {}", dir.display()), e)
        })?;

        let mut shards = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            let name = if file_type.is_dir() {
                entry.file_name().to_string_lossy().into_owned()
            } else if file_type.is_file()
                && path.extension().is_some_and(|e| e == SHARD_FILE_EXTENSION)
            {
                match path.file_stem() {
                    Some(stem) => stem.to_string_lossy().into_owned(),
                    None => continue,
                }
            } else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            validate_name("shard", &name)?;
            shards.push(ShardSource {
                name,
                location: path.to_string_lossy().into_owned(),
            });
        }

        shards.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(shards)
    }

    async fn fetch(&self, location: &str, dest: &Path) -> Result<()> {
        let src = resolve_location(location)?;
        if tokio::fs::try_exists(dest).await? {
            tokio::fs::remove_dir_all(dest).await?;
        }

        let metadata = tokio::fs::metadata(&src).await.map_err(|e| {
            Error::with_source(format!("cannot read shard at {}", src.display()), e)
        })?;
        let bytes = if metadata.is_dir() {
            copy_dir(&src, dest).await?
        } else {
            tokio::fs::create_dir_all(dest).await?;
            let file_name = src
                .file_name()
                .ok_or_else(|| Error::config(format!("invalid shard location '{location}'")))?;
            tokio::fs::copy(&src, dest.join(file_name)).await?
        };

        debug!(source = %src.display(), dest = %dest.display(), bytes = bytes, "Fetched shard");
        Ok(())
    }
}
