//! Batched export of newly-visited URLs.
//!
//! The exporter streams the visited set out of the store in id order,
//! one batch per text file, and keeps its cursor in a small JSON state
//! file so later runs resume where the previous one stopped. The store's
//! monotonic id guarantee (gaps allowed, inversions never) is what makes
//! the cursor safe across crawler restarts.

use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

use crate::store::{Store, StoreError};

/// Default rows per export batch file.
pub const DEFAULT_EXPORT_BATCH_SIZE: i64 = 1000;

/// Name of the cursor state file inside the output directory.
const STATE_FILE_NAME: &str = "state.json";

/// Errors from the export pipeline.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Reading the visited set failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Output directory, batch file, or state file IO failed.
    #[error("export io error at {path}: {source}")]
    Io {
        /// Path being written or read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The state file exists but does not parse.
    #[error("corrupt export state at {path}: {source}")]
    CorruptState {
        /// Path of the state file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted export cursor.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ExportState {
    last_id: i64,
}

/// Writes visited URLs to `YYYY-MM-DD_HH-MM-SS_batch_NNNNN.txt` files.
///
/// The session timestamp is fixed at construction so all batches of one
/// run sort together; the batch counter restarts per run while `last_id`
/// persists across runs.
pub struct UrlBatchExporter {
    store: Store,
    out_dir: PathBuf,
    batch_size: i64,
    state_path: PathBuf,
    session_id: String,
    batch_counter: u32,
    last_id: i64,
}

impl UrlBatchExporter {
    /// Prepares the output directory and loads the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Io`] when the directory or state file
    /// cannot be accessed, [`ExportError::CorruptState`] when the state
    /// file does not parse.
    #[instrument(skip(store), fields(out_dir = %out_dir.display()))]
    pub async fn new(
        store: Store,
        out_dir: &Path,
        batch_size: i64,
    ) -> Result<Self, ExportError> {
        tokio::fs::create_dir_all(out_dir).await.map_err(|source| {
            ExportError::Io {
                path: out_dir.to_path_buf(),
                source,
            }
        })?;

        let state_path = out_dir.join(STATE_FILE_NAME);
        let last_id = load_state(&state_path).await?;

        Ok(Self {
            store,
            out_dir: out_dir.to_path_buf(),
            batch_size: batch_size.max(1),
            state_path,
            session_id: Local::now().format("%Y-%m-%d_%H-%M-%S").to_string(),
            batch_counter: 0,
            last_id,
        })
    }

    /// Cursor position: highest visited id already exported.
    #[must_use]
    pub fn last_id(&self) -> i64 {
        self.last_id
    }

    /// Exports the next batch, if any. Returns false once the visited
    /// set is drained past the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Store`] or [`ExportError::Io`]; the cursor
    /// only advances after the batch file and state are both written.
    #[instrument(skip(self))]
    pub async fn export_next_batch(&mut self) -> Result<bool, ExportError> {
        let rows = self
            .store
            .fetch_visited_since(self.last_id, self.batch_size)
            .await?;
        if rows.is_empty() {
            return Ok(false);
        }

        self.batch_counter += 1;
        let filename = format!(
            "{}_batch_{:05}.txt",
            self.session_id, self.batch_counter
        );
        let path = self.out_dir.join(filename);

        let mut contents = String::new();
        for row in &rows {
            contents.push_str(&row.url);
            contents.push('\n');
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| ExportError::Io {
                path: path.clone(),
                source,
            })?;

        // Rows are id-ascending, so the last one is the new cursor.
        if let Some(last) = rows.last() {
            self.last_id = last.id;
        }
        self.save_state().await?;

        info!(rows = rows.len(), path = %path.display(), "wrote export batch");
        Ok(true)
    }

    /// Exports until the visited set is drained. Returns batches written.
    ///
    /// # Errors
    ///
    /// Same as [`UrlBatchExporter::export_next_batch`].
    pub async fn export_all(&mut self) -> Result<u32, ExportError> {
        let mut batches = 0;
        while self.export_next_batch().await? {
            batches += 1;
        }
        Ok(batches)
    }

    async fn save_state(&self) -> Result<(), ExportError> {
        let state = ExportState {
            last_id: self.last_id,
        };
        // Infallible: the state struct always serializes.
        let body = serde_json::to_string(&state).unwrap_or_default();
        tokio::fs::write(&self.state_path, body)
            .await
            .map_err(|source| ExportError::Io {
                path: self.state_path.clone(),
                source,
            })
    }
}

async fn load_state(state_path: &Path) -> Result<i64, ExportError> {
    match tokio::fs::read_to_string(state_path).await {
        Ok(body) => {
            let state: ExportState =
                serde_json::from_str(&body).map_err(|source| ExportError::CorruptState {
                    path: state_path.to_path_buf(),
                    source,
                })?;
            Ok(state.last_id)
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(ExportError::Io {
            path: state_path.to_path_buf(),
            source,
        }),
    }
}
