//! Durable storage for [`PersistentState`](crate::state::PersistentState).
//!
//! §6 requires the on-disk layout to be atomically replaced, fully
//! recoverable after a crash at any point, and self-delimiting. We get all
//! three from a single trick: encode the whole state with `bincode` into a
//! sibling temp file, `fsync` it, then rename it over the real path.
//! `rename` is atomic on every platform this crate targets, so the real
//! path is either the previous complete state or the new complete state —
//! never a partial record, because a partial write is never renamed into
//! place.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::RaftError;
use crate::state::PersistentState;

pub struct PersistentStore {
    path: PathBuf,
}

impl PersistentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PersistentStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Idempotent restoration. A missing file materializes `term=0,
    /// votedFor=none, log=[]`, matching `load`'s contract in §4.2.
    pub async fn load(&self) -> Result<PersistentState, RaftError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(PersistentState::new()),
            Ok(bytes) => {
                let state: PersistentState = bincode::deserialize(&bytes)?;
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistentState::new()),
            Err(e) => Err(RaftError::Persistence(e.to_string())),
        }
    }

    /// Durably persists `state`, fsyncing before the rename and returning
    /// only once the rename itself has completed. Any failure is surfaced
    /// as [`RaftError::Persistence`] — callers must treat this as fatal
    /// per §7, not retry-and-continue.
    pub async fn save(&self, state: &PersistentState) -> Result<(), RaftError> {
        let bytes = bincode::serialize(state)?;
        let tmp_path = self.tmp_path();

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| RaftError::Persistence(e.to_string()))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| RaftError::Persistence(e.to_string()))?;
        file.sync_all()
            .await
            .map_err(|e| RaftError::Persistence(e.to_string()))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| RaftError::Persistence(e.to_string()))?;

        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }
}
