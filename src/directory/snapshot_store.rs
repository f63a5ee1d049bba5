use crate::consensus::Snapshot;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot I/O failed at '{}'", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode snapshot")]
    Encode(#[source] serde_json::Error),

    #[error("Snapshot at '{}' is corrupt", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Snapshot task panicked or was cancelled")]
    TaskFailed(#[source] tokio::task::JoinError),

    #[error("Failed to capture cluster state")]
    Capture(#[source] io::Error),

    #[error("Consensus engine is not running")]
    EngineNotRunning,
}

/// Durable home of the latest snapshot: one JSON file, replaced atomically.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub(crate) fn new(path: PathBuf) -> Self {
        SnapshotStore { path }
    }

    /// None when nothing was ever saved.
    pub(crate) async fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_snapshot(&path))
            .await
            .map_err(SnapshotError::TaskFailed)?
    }

    pub(crate) async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(SnapshotError::Encode)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(SnapshotError::TaskFailed)?
    }
}

fn read_snapshot(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| SnapshotError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

// Write to a sibling temp file, sync, then rename over the old snapshot.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| SnapshotError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
    }

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).map_err(io_err(&temp_path))?;
    file.write_all(bytes).map_err(io_err(&temp_path))?;
    file.sync_all().map_err(io_err(&temp_path))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(io_err(path))
}

/// Outcome history of snapshot writes, shared with whoever wants to report on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiagnostics {
    pub snapshots_written: u64,
    pub failed_writes: u64,
    pub last_failure: Option<String>,
    pub last_written_index: Option<u64>,
    pub last_written_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Default)]
pub(crate) struct SharedDiagnostics {
    inner: Arc<Mutex<SnapshotDiagnostics>>,
}

impl SharedDiagnostics {
    pub(crate) fn record(&self, index: u64, result: &Result<(), SnapshotError>) {
        let mut diagnostics = self.inner.lock().expect("SnapshotDiagnostics mutex guard poisoned");
        match result {
            Ok(()) => {
                diagnostics.snapshots_written += 1;
                diagnostics.last_written_index = Some(index);
                diagnostics.last_written_at = Some(Utc::now());
            }
            Err(e) => {
                diagnostics.failed_writes += 1;
                diagnostics.last_failure = Some(format!("{:?}", e));
            }
        }
    }

    pub(crate) fn get(&self) -> SnapshotDiagnostics {
        self.inner
            .lock()
            .expect("SnapshotDiagnostics mutex guard poisoned")
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{PersistedClusterState, PersistedMember};
    use std::collections::BTreeMap;

    fn snapshot() -> Snapshot {
        let mut members = BTreeMap::new();
        members.insert(
            "n1".to_string(),
            PersistedMember {
                address: "127.0.0.1:7001".into(),
                term: 3,
                last_seen: Some(Utc::now()),
            },
        );
        members.insert(
            "n2".to_string(),
            PersistedMember {
                address: "127.0.0.1:7002".into(),
                term: 3,
                last_seen: None,
            },
        );

        Snapshot {
            term: 3,
            index: 17,
            state: PersistedClusterState {
                members,
                leader_id: Some("n2".into()),
                current_term: 3,
                commit_index: 17,
                config_version: 4,
                config: Some(b"{\"shards\":4}".to_vec()),
            },
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("state").join("cluster.json"));

        assert_eq!(store.load().await.unwrap(), None);

        let first = snapshot();
        store.save(&first).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(first.clone()));

        let mut second = first;
        second.index = 20;
        second.state.commit_index = 20;
        store.save(&second).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(second));
        assert!(!dir.path().join("state").join("cluster.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = SnapshotStore::new(path);
        assert!(matches!(store.load().await, Err(SnapshotError::Decode { .. })));
    }

    #[tokio::test]
    async fn unwritable_location_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the parent directory should be.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let store = SnapshotStore::new(blocker.join("cluster.json"));
        let diagnostics = SharedDiagnostics::default();

        let result = store.save(&snapshot()).await;
        assert!(matches!(result, Err(SnapshotError::Io { .. })));
        diagnostics.record(17, &result);
        diagnostics.record(18, &Ok(()));

        let report = diagnostics.get();
        assert_eq!(report.failed_writes, 1);
        assert_eq!(report.snapshots_written, 1);
        assert_eq!(report.last_written_index, Some(18));
        assert!(report.last_failure.is_some());
    }
}
