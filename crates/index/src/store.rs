//! On-disk layout of per-entity shards.
//!
//! Each entity owns `<key>.index` (vectors) and `<key>.meta.jsonl`, where
//! `<key>` is the percent-encoded entity id. The metadata file starts with a
//! header line holding the build id, followed by one chunk per line (row i
//! describes vector i). The index header carries the same build id. Files are
//! written to a temp name and renamed into place.

use std::path::{Path, PathBuf};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use ingest::ReviewChunk;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::flat_index::{FlatIndex, Metric};

const INDEX_SUFFIX: &str = ".index";
const METADATA_SUFFIX: &str = ".meta.jsonl";
const TMP_SUFFIX: &str = ".tmp";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Everything but `[A-Za-z0-9_-]` is escaped, so keys never contain a dot.
const KEY_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Entity id used in errors that concern the whole index directory.
const DIRECTORY: &str = "*";

/// Embedding settings the indexes in a directory were built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub model: String,
    pub dimension: usize,
    pub metric: Metric,
    pub normalized: bool,
}

/// First line of a metadata file.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataHeader {
    build_id: Uuid,
}

/// Files found for one entity during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFiles {
    pub entity_id: String,
    pub index_path: PathBuf,
    pub metadata_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileCounts {
    pub index_files: usize,
    pub metadata_files: usize,
}

/// A loaded shard: vector `i` is described by `metadata[i]`.
#[derive(Debug, Clone)]
pub struct EntityIndex {
    pub entity_id: String,
    pub index: FlatIndex,
    pub metadata: Vec<ReviewChunk>,
}

#[derive(Debug, Clone)]
pub struct ShardStore {
    dir: PathBuf,
}

impl ShardStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_key(entity_id: &str) -> String {
        utf8_percent_encode(entity_id, KEY_SET).to_string()
    }

    pub fn index_path(&self, entity_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{INDEX_SUFFIX}", Self::shard_key(entity_id)))
    }

    pub fn metadata_path(&self, entity_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{METADATA_SUFFIX}", Self::shard_key(entity_id)))
    }

    fn tmp_path(&self, entity_id: &str) -> PathBuf {
        self.dir.join(format!(
            ".{}.{}{TMP_SUFFIX}",
            Self::shard_key(entity_id),
            Uuid::new_v4()
        ))
    }

    /// Persist one entity's index and metadata as a pair.
    ///
    /// Both halves are fully written to temp files under a fresh build id
    /// first. Any previous metadata file is moved aside, the new metadata is
    /// renamed into place, then the index. If a rename fails the previous
    /// metadata is restored, so the old pair stays intact. A crash between the
    /// renames leaves two halves with different build ids, which `load_shard`
    /// rejects.
    pub async fn write_shard(
        &self,
        entity_id: &str,
        index: &FlatIndex,
        chunks: &[ReviewChunk],
    ) -> Result<(), PipelineError> {
        if index.len() != chunks.len() {
            return Err(PipelineError::mismatch(
                entity_id,
                format!("{} vectors but {} metadata rows", index.len(), chunks.len()),
            ));
        }

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PipelineError::persistence(entity_id, format!("create dir: {e}")))?;

        let build_id = Uuid::new_v4();
        let mut metadata = serde_json::to_string(&MetadataHeader { build_id })
            .map_err(|e| PipelineError::persistence(entity_id, e))?;
        metadata.push('\n');
        for chunk in chunks {
            let line = serde_json::to_string(chunk)
                .map_err(|e| PipelineError::persistence(entity_id, e))?;
            metadata.push_str(&line);
            metadata.push('\n');
        }

        let metadata_tmp = self.tmp_path(entity_id);
        let index_tmp = self.tmp_path(entity_id);
        let result = self
            .write_pair(
                entity_id,
                &metadata_tmp,
                metadata.as_bytes(),
                &index_tmp,
                &index.to_bytes(build_id),
            )
            .await;

        if result.is_err() {
            let _ = fs::remove_file(&metadata_tmp).await;
            let _ = fs::remove_file(&index_tmp).await;
        }
        result
    }

    async fn write_pair(
        &self,
        entity_id: &str,
        metadata_tmp: &Path,
        metadata: &[u8],
        index_tmp: &Path,
        index: &[u8],
    ) -> Result<(), PipelineError> {
        write_synced(metadata_tmp, metadata)
            .await
            .map_err(|e| PipelineError::persistence(entity_id, format!("write metadata: {e}")))?;
        write_synced(index_tmp, index)
            .await
            .map_err(|e| PipelineError::persistence(entity_id, format!("write index: {e}")))?;

        let metadata_path = self.metadata_path(entity_id);
        let backup_path = self.tmp_path(entity_id);
        let backup = match fs::rename(&metadata_path, &backup_path).await {
            Ok(()) => Some(backup_path.as_path()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(PipelineError::persistence(
                    entity_id,
                    format!("move previous metadata aside: {e}"),
                ));
            }
        };

        if let Err(e) = fs::rename(metadata_tmp, &metadata_path).await {
            restore_metadata(backup, &metadata_path).await;
            return Err(PipelineError::persistence(
                entity_id,
                format!("rename metadata: {e}"),
            ));
        }

        if let Err(e) = fs::rename(index_tmp, self.index_path(entity_id)).await {
            restore_metadata(backup, &metadata_path).await;
            return Err(PipelineError::persistence(
                entity_id,
                format!("rename index: {e}"),
            ));
        }

        if let Some(backup) = backup {
            let _ = fs::remove_file(backup).await;
        }
        Ok(())
    }

    /// Every index file in the directory with its metadata file, if present.
    /// Sorted by entity id. Metadata files without an index are logged.
    pub async fn discover(&self) -> Result<Vec<ShardFiles>, PipelineError> {
        let names = self.file_names().await?;

        let mut shards = Vec::new();
        for name in &names {
            let Some(key) = name.strip_suffix(INDEX_SUFFIX) else {
                continue;
            };
            let Some(entity_id) = decode_key(key) else {
                tracing::warn!(file = %name, "skipping index file with undecodable name");
                continue;
            };
            let metadata_name = format!("{key}{METADATA_SUFFIX}");
            let metadata_path = names
                .contains(&metadata_name)
                .then(|| self.dir.join(&metadata_name));

            shards.push(ShardFiles {
                entity_id,
                index_path: self.dir.join(name),
                metadata_path,
            });
        }

        for name in &names {
            if let Some(key) = name.strip_suffix(METADATA_SUFFIX) {
                if !names.contains(&format!("{key}{INDEX_SUFFIX}")) {
                    tracing::warn!(file = %name, "metadata file has no matching index, ignoring");
                }
            }
        }

        shards.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(shards)
    }

    /// Load a discovered shard, checking that both halves exist and line up.
    pub async fn load_shard(&self, files: &ShardFiles) -> Result<EntityIndex, PipelineError> {
        let entity_id = files.entity_id.as_str();
        let metadata_path = files
            .metadata_path
            .as_deref()
            .ok_or_else(|| PipelineError::mismatch(entity_id, "metadata file is missing"))?;

        let bytes = fs::read(&files.index_path)
            .await
            .map_err(|e| PipelineError::persistence(entity_id, format!("read index: {e}")))?;
        let (index, index_build) = FlatIndex::from_bytes(&bytes)
            .map_err(|e| PipelineError::persistence(entity_id, format!("decode index: {e}")))?;

        let raw = fs::read_to_string(metadata_path)
            .await
            .map_err(|e| PipelineError::persistence(entity_id, format!("read metadata: {e}")))?;
        let (metadata_build, metadata) = parse_metadata(entity_id, &raw)?;

        if index_build != metadata_build {
            return Err(PipelineError::mismatch(
                entity_id,
                format!("index is from build {index_build} but metadata is from build {metadata_build}"),
            ));
        }
        if metadata.len() != index.len() {
            return Err(PipelineError::mismatch(
                entity_id,
                format!(
                    "{} vectors but {} metadata rows",
                    index.len(),
                    metadata.len()
                ),
            ));
        }
        if let Some(stray) = metadata.iter().find(|row| row.entity_id != entity_id) {
            return Err(PipelineError::mismatch(
                entity_id,
                format!("metadata row {} belongs to {}", stray.chunk_id, stray.entity_id),
            ));
        }

        Ok(EntityIndex {
            entity_id: entity_id.to_string(),
            index,
            metadata,
        })
    }

    pub async fn count_files(&self) -> Result<FileCounts, PipelineError> {
        let names = self.file_names().await?;
        Ok(FileCounts {
            index_files: names.iter().filter(|n| n.ends_with(INDEX_SUFFIX)).count(),
            metadata_files: names.iter().filter(|n| n.ends_with(METADATA_SUFFIX)).count(),
        })
    }

    pub async fn write_manifest(&self, manifest: &IndexManifest) -> Result<(), PipelineError> {
        let body = serde_json::to_vec_pretty(manifest)
            .map_err(|e| PipelineError::persistence(DIRECTORY, e))?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| PipelineError::persistence(DIRECTORY, e))?;

        let tmp = self.tmp_path("manifest");
        write_synced(&tmp, &body)
            .await
            .map_err(|e| PipelineError::persistence(DIRECTORY, e))?;
        fs::rename(&tmp, self.dir.join(MANIFEST_FILE))
            .await
            .map_err(|e| PipelineError::persistence(DIRECTORY, e))
    }

    pub async fn read_manifest(&self) -> Result<Option<IndexManifest>, PipelineError> {
        let path = self.dir.join(MANIFEST_FILE);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PipelineError::persistence(DIRECTORY, format!("manifest: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::persistence(DIRECTORY, e)),
        }
    }

    /// Remove index, metadata, manifest and leftover temp files. Anything else
    /// in the directory is kept. Returns the number of files removed.
    pub async fn clear(&self) -> Result<usize, PipelineError> {
        let mut removed = 0;
        for name in self.file_names().await? {
            let owned = name.ends_with(INDEX_SUFFIX)
                || name.ends_with(METADATA_SUFFIX)
                || name == MANIFEST_FILE
                || (name.starts_with('.') && name.ends_with(TMP_SUFFIX));
            if owned {
                fs::remove_file(self.dir.join(&name))
                    .await
                    .map_err(|e| PipelineError::persistence(DIRECTORY, e))?;
                removed += 1;
            }
        }
        tracing::info!(dir = %self.dir.display(), removed, "cleared index directory");
        Ok(removed)
    }

    /// Names of regular files in the directory; a missing directory is empty.
    async fn file_names(&self) -> Result<Vec<String>, PipelineError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::persistence(DIRECTORY, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::persistence(DIRECTORY, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if let (true, Some(name)) = (is_file, entry.file_name().to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Put the previous metadata file back, or drop the new one when there was none.
async fn restore_metadata(backup: Option<&Path>, metadata_path: &Path) {
    let restored = match backup {
        Some(backup) => fs::rename(backup, metadata_path).await,
        None => fs::remove_file(metadata_path).await,
    };
    if let Err(e) = restored {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::error!(path = %metadata_path.display(), error = %e, "failed to restore metadata");
        }
    }
}

/// Split a metadata file into its build id and chunk rows.
fn parse_metadata(entity_id: &str, raw: &str) -> Result<(Uuid, Vec<ReviewChunk>), PipelineError> {
    let mut lines = raw.lines().filter(|line| !line.trim().is_empty());
    let header: MetadataHeader = lines
        .next()
        .and_then(|line| serde_json::from_str(line).ok())
        .ok_or_else(|| PipelineError::mismatch(entity_id, "metadata file has no build id"))?;

    let rows = lines
        .enumerate()
        .map(|(row, line)| {
            serde_json::from_str(line).map_err(|e| {
                PipelineError::persistence(entity_id, format!("metadata row {row}: {e}"))
            })
        })
        .collect::<Result<Vec<ReviewChunk>, _>>()?;

    Ok((header.build_id, rows))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

fn decode_key(key: &str) -> Option<String> {
    percent_decode_str(key)
        .decode_utf8()
        .ok()
        .map(|id| id.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(entity_id: &str, review_id: &str) -> ReviewChunk {
        ReviewChunk {
            chunk_id: format!("{review_id}_0"),
            review_id: review_id.to_string(),
            entity_id: entity_id.to_string(),
            entity_name: "Noodle Bar".to_string(),
            text: format!("text of {review_id}"),
            char_count: 10,
            star_rating: 4.5,
            date: "2020-10-10".to_string(),
            chunk_index: 0,
        }
    }

    fn shard(entity_id: &str, n: usize) -> (FlatIndex, Vec<ReviewChunk>) {
        let mut index = FlatIndex::new(Metric::Cosine, 2).unwrap();
        let mut chunks = Vec::new();
        for i in 0..n {
            index.add(&[i as f32, 1.0]).unwrap();
            chunks.push(chunk(entity_id, &format!("r{i}")));
        }
        (index, chunks)
    }

    #[tokio::test]
    async fn test_written_shard_reloads_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let (index, chunks) = shard("biz-1", 3);

        store.write_shard("biz-1", &index, &chunks).await.unwrap();

        let files = store.discover().await.unwrap();
        assert_eq!(files.len(), 1);
        for _ in 0..2 {
            let loaded = store.load_shard(&files[0]).await.unwrap();
            assert_eq!(loaded.index, index);
            let ids: Vec<_> = loaded.metadata.iter().map(|c| c.chunk_id.as_str()).collect();
            assert_eq!(ids, vec!["r0_0", "r1_0", "r2_0"]);
        }
        assert_eq!(
            store.count_files().await.unwrap(),
            FileCounts {
                index_files: 1,
                metadata_files: 1
            }
        );
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let (index, chunks) = shard("biz-1", 2);

        store.write_shard("biz-1", &index, &chunks).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_unsafe_entity_ids_round_trip_through_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let entity = "../tapas/bar.meta";
        let (index, chunks) = shard(entity, 1);

        store.write_shard(entity, &index, &chunks).await.unwrap();

        let files = store.discover().await.unwrap();
        assert_eq!(files[0].entity_id, entity);
        assert!(files[0].index_path.starts_with(dir.path()));
        assert!(store.load_shard(&files[0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_metadata_is_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let (index, chunks) = shard("biz-1", 2);
        store.write_shard("biz-1", &index, &chunks).await.unwrap();
        std::fs::remove_file(store.metadata_path("biz-1")).unwrap();

        let files = store.discover().await.unwrap();
        assert_eq!(files[0].metadata_path, None);

        let err = store.load_shard(&files[0]).await.unwrap_err();
        assert!(matches!(err, PipelineError::IndexMetadataMismatch { .. }));
    }

    #[tokio::test]
    async fn test_row_count_disagreement_is_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let (index, chunks) = shard("biz-1", 2);
        store.write_shard("biz-1", &index, &chunks).await.unwrap();

        let written = std::fs::read_to_string(store.metadata_path("biz-1")).unwrap();
        let header = written.lines().next().unwrap();
        let one_row = format!("{header}\n{}\n", serde_json::to_string(&chunks[0]).unwrap());
        std::fs::write(store.metadata_path("biz-1"), one_row).unwrap();

        let files = store.discover().await.unwrap();
        let err = store.load_shard(&files[0]).await.unwrap_err();
        assert!(matches!(err, PipelineError::IndexMetadataMismatch { .. }));
    }

    #[tokio::test]
    async fn test_rebuild_replaces_both_halves() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let (old_index, old_chunks) = shard("biz-1", 2);
        store.write_shard("biz-1", &old_index, &old_chunks).await.unwrap();

        let (new_index, mut new_chunks) = shard("biz-1", 3);
        new_chunks[0].text = "rebuilt".to_string();
        store.write_shard("biz-1", &new_index, &new_chunks).await.unwrap();

        let files = store.discover().await.unwrap();
        let loaded = store.load_shard(&files[0]).await.unwrap();
        assert_eq!(loaded.index, new_index);
        assert_eq!(loaded.metadata[0].text, "rebuilt");
        assert_eq!(store.clear().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_halves_from_different_builds_are_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let (index, mut chunks) = shard("biz-1", 2);
        store.write_shard("biz-1", &index, &chunks).await.unwrap();
        let first_index = std::fs::read(store.index_path("biz-1")).unwrap();

        // same row count, rows swapped: only the build id tells them apart
        chunks.reverse();
        store.write_shard("biz-1", &index, &chunks).await.unwrap();
        std::fs::write(store.index_path("biz-1"), first_index).unwrap();

        let files = store.discover().await.unwrap();
        let err = store.load_shard(&files[0]).await.unwrap_err();

        assert!(matches!(err, PipelineError::IndexMetadataMismatch { .. }));
        assert!(err.to_string().contains("build"));
    }

    #[tokio::test]
    async fn test_failed_index_rename_restores_previous_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let (index, chunks) = shard("biz-1", 2);
        std::fs::write(store.metadata_path("biz-1"), "previous\n").unwrap();
        // a directory where the index file should go makes its rename fail
        std::fs::create_dir(store.index_path("biz-1")).unwrap();

        let err = store.write_shard("biz-1", &index, &chunks).await.unwrap_err();

        assert!(matches!(err, PipelineError::IndexPersistence { .. }));
        assert_eq!(
            std::fs::read_to_string(store.metadata_path("biz-1")).unwrap(),
            "previous\n"
        );
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_metadata_without_build_id_is_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let (index, chunks) = shard("biz-1", 1);
        store.write_shard("biz-1", &index, &chunks).await.unwrap();

        let bare_row = format!("{}\n", serde_json::to_string(&chunks[0]).unwrap());
        std::fs::write(store.metadata_path("biz-1"), bare_row).unwrap();

        let files = store.discover().await.unwrap();
        let err = store.load_shard(&files[0]).await.unwrap_err();
        assert!(matches!(err, PipelineError::IndexMetadataMismatch { .. }));
    }

    #[tokio::test]
    async fn test_refuses_unaligned_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        let (index, mut chunks) = shard("biz-1", 2);
        chunks.pop();

        let err = store.write_shard("biz-1", &index, &chunks).await.unwrap_err();

        assert!(matches!(err, PipelineError::IndexMetadataMismatch { .. }));
        assert_eq!(store.count_files().await.unwrap(), FileCounts::default());
    }

    #[tokio::test]
    async fn test_manifest_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardStore::new(dir.path());
        assert_eq!(store.read_manifest().await.unwrap(), None);

        let manifest = IndexManifest {
            model: "nomic-embed-text".to_string(),
            dimension: 2,
            metric: Metric::Cosine,
            normalized: true,
        };
        store.write_manifest(&manifest).await.unwrap();
        let (index, chunks) = shard("biz-1", 1);
        store.write_shard("biz-1", &index, &chunks).await.unwrap();
        std::fs::write(dir.path().join("README.md"), "keep me").unwrap();

        assert_eq!(store.read_manifest().await.unwrap(), Some(manifest));

        let removed = store.clear().await.unwrap();

        assert_eq!(removed, 3);
        assert!(dir.path().join("README.md").exists());
        assert!(store.discover().await.unwrap().is_empty());
    }
}
