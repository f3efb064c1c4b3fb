use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid review row at {path}:{line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One review as delivered by the dataset stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRow {
    pub entity_id: String,
    pub entity_name: String,
    pub review_id: String,
    pub star_rating: f32,
    pub date: String,
    pub text: String,
}

pub struct FileReader;

impl FileReader {
    /// Read newline-delimited JSON rows. Blank lines are skipped.
    pub async fn read_jsonl<T>(path: &Path) -> Result<Vec<T>, ReadError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let content = fs::read_to_string(path).await.map_err(|source| ReadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut rows = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row = serde_json::from_str(line).map_err(|source| ReadError::Parse {
                path: path.to_path_buf(),
                line: i + 1,
                source,
            })?;
            rows.push(row);
        }

        Ok(rows)
    }

    /// Read every `*.jsonl` file under `dir`, in path order.
    pub async fn read_directory<T>(dir: &Path) -> Result<Vec<T>, ReadError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| ReadError::Io {
                path: dir.to_path_buf(),
                source: e.into(),
            })?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path.to_path_buf());
            }
        }

        let mut rows = Vec::new();
        for path in &files {
            rows.extend(Self::read_jsonl(path).await?);
        }

        tracing::debug!(files = files.len(), rows = rows.len(), dir = %dir.display(), "read directory");
        Ok(rows)
    }

    /// Read a single JSONL file or a directory of them.
    pub async fn read_path<T>(path: &Path) -> Result<Vec<T>, ReadError>
    where
        T: for<'de> Deserialize<'de>,
    {
        if path.is_dir() {
            Self::read_directory(path).await
        } else {
            Self::read_jsonl(path).await
        }
    }

    /// Write rows as JSONL, creating parent directories.
    pub async fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), ReadError> {
        let io_err = |source| ReadError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let mut buf = String::new();
        for row in rows {
            let line = serde_json::to_string(row)
                .map_err(|e| io_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
            buf.push_str(&line);
            buf.push('\n');
        }

        fs::write(path, buf).await.map_err(io_err)
    }
}
