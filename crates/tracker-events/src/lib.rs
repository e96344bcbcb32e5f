use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};
use tracker_protocol::{ConversationId, Event, TrackerBackend, TrackerError, TrackerResult};

/// Process-local backend. Durable only for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryTrackerBackend {
    logs: Mutex<HashMap<ConversationId, Vec<Event>>>,
}

impl InMemoryTrackerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_count(&self) -> usize {
        self.logs.lock().len()
    }
}

#[async_trait]
impl TrackerBackend for InMemoryTrackerBackend {
    async fn load(&self, conversation_id: &ConversationId) -> TrackerResult<Option<Vec<Event>>> {
        Ok(self.logs.lock().get(conversation_id).cloned())
    }

    async fn store(&self, conversation_id: &ConversationId, events: &[Event]) -> TrackerResult<()> {
        self.logs
            .lock()
            .insert(conversation_id.clone(), events.to_vec());
        Ok(())
    }

    async fn exists(&self, conversation_id: &ConversationId) -> TrackerResult<bool> {
        Ok(self.logs.lock().contains_key(conversation_id))
    }

    async fn remove(&self, conversation_id: &ConversationId) -> TrackerResult<bool> {
        Ok(self.logs.lock().remove(conversation_id).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// One JSONL file per conversation under `<root>/trackers/`.
///
/// File names are the SHA-256 digest of the conversation id, so every id maps
/// to a fixed-length name inside the directory. `store` writes a temporary
/// sibling and renames it over the previous log, so readers observe either
/// the old or the new log. Concurrent writers for one id must be serialized
/// by the caller; the tracker store does this with its per-id locks.
#[derive(Debug, Clone)]
pub struct FileTrackerBackend {
    root: PathBuf,
}

impl FileTrackerBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, conversation_id: &ConversationId) -> PathBuf {
        let digest = Sha256::digest(conversation_id.as_str().as_bytes());
        self.root
            .join("trackers")
            .join(format!("{}.jsonl", hex::encode(digest)))
    }

    async fn ensure_parent(path: &Path) -> TrackerResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|error| {
                TrackerError::Persistence(format!("failed to create trackers dir {parent:?}: {error}"))
            })?;
        }
        Ok(())
    }

    /// `None` only when the log does not exist; every other I/O failure is
    /// an error.
    async fn read_log(path: &Path) -> TrackerResult<Option<Vec<Event>>> {
        let file = match OpenOptions::new().read(true).open(path).await {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(TrackerError::Persistence(format!(
                    "failed opening {path:?}: {error}"
                )));
            }
        };
        let mut reader = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(TrackerError::persistence)?
        {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line).map_err(|error| {
                TrackerError::Persistence(format!("failed parsing event line in {path:?}: {error}"))
            })?;
            events.push(event);
        }
        Ok(Some(events))
    }

    async fn write_log(path: &Path, events: &[Event]) -> TrackerResult<()> {
        let mut payload = Vec::new();
        for event in events {
            serde_json::to_writer(&mut payload, event).map_err(|error| {
                TrackerError::Persistence(format!("failed serializing event: {error}"))
            })?;
            payload.push(b'\n');
        }

        let pending = PendingLog::new(
            path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple())),
        );
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(pending.path())
            .await
            .map_err(|error| {
                TrackerError::Persistence(format!("failed opening {:?}: {error}", pending.path()))
            })?;
        file.write_all(&payload)
            .await
            .map_err(TrackerError::persistence)?;
        file.flush().await.map_err(TrackerError::persistence)?;
        file.sync_all().await.map_err(TrackerError::persistence)?;
        drop(file);

        pending.persist(path).await.map_err(|error| {
            TrackerError::Persistence(format!("failed replacing tracker log {path:?}: {error}"))
        })
    }
}

/// Temporary log file. Removed on drop unless it was renamed into place, so
/// a failed or abandoned write leaves nothing behind.
#[derive(Debug)]
struct PendingLog {
    path: PathBuf,
    persisted: bool,
}

impl PendingLog {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(mut self, target: &Path) -> std::io::Result<()> {
        fs::rename(&self.path, target).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PendingLog {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[async_trait]
impl TrackerBackend for FileTrackerBackend {
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    async fn load(&self, conversation_id: &ConversationId) -> TrackerResult<Option<Vec<Event>>> {
        let path = self.file_path(conversation_id);
        let events = Self::read_log(&path).await?;
        match &events {
            Some(events) => debug!(count = events.len(), "tracker events loaded"),
            None => debug!("no persisted tracker"),
        }
        Ok(events)
    }

    #[instrument(skip(self, events), fields(conversation_id = %conversation_id, count = events.len()))]
    async fn store(&self, conversation_id: &ConversationId, events: &[Event]) -> TrackerResult<()> {
        let path = self.file_path(conversation_id);
        Self::ensure_parent(&path).await?;

        if let Err(error) = Self::write_log(&path, events).await {
            warn!(%error, "failed persisting tracker");
            return Err(error);
        }
        debug!("tracker persisted");
        Ok(())
    }

    async fn exists(&self, conversation_id: &ConversationId) -> TrackerResult<bool> {
        let path = self.file_path(conversation_id);
        fs::try_exists(&path)
            .await
            .map_err(TrackerError::persistence)
    }

    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    async fn remove(&self, conversation_id: &ConversationId) -> TrackerResult<bool> {
        let path = self.file_path(conversation_id);
        let removed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(error) if error.kind() == ErrorKind::NotFound => false,
            Err(error) => {
                return Err(TrackerError::Persistence(format!(
                    "failed removing {path:?}: {error}"
                )));
            }
        };
        debug!(removed, "tracker removed");
        Ok(removed)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use serde_json::json;
    use tokio::fs;
    use tracker_protocol::{ConversationId, Event, TrackerBackend};

    use crate::{FileTrackerBackend, InMemoryTrackerBackend, PendingLog};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn conversation(raw: &str) -> ConversationId {
        ConversationId::parse(raw).unwrap()
    }

    fn sample_log() -> Vec<Event> {
        vec![
            Event::action_executed("action_listen"),
            Event::slot_set("x", json!(1)),
            Event::restarted(),
        ]
    }

    #[tokio::test]
    async fn memory_backend_stores_and_overwrites() -> Result<()> {
        let backend = InMemoryTrackerBackend::new();
        let id = conversation("memory");
        assert!(backend.load(&id).await?.is_none());
        assert!(!backend.exists(&id).await?);

        backend.store(&id, &sample_log()).await?;
        assert_eq!(backend.load(&id).await?, Some(sample_log()));

        let replacement = vec![Event::slot_set("x", json!(2))];
        backend.store(&id, &replacement).await?;
        assert_eq!(backend.load(&id).await?, Some(replacement));
        assert_eq!(backend.conversation_count(), 1);

        assert!(backend.remove(&id).await?);
        assert!(!backend.remove(&id).await?);
        assert!(!backend.exists(&id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn file_backend_round_trips_event_log() -> Result<()> {
        let root = unique_test_root("tracker-events");
        let backend = FileTrackerBackend::new(&root);
        let id = conversation("default");
        let log = sample_log();

        assert!(backend.load(&id).await?.is_none());
        backend.store(&id, &log).await?;
        assert!(backend.exists(&id).await?);
        assert_eq!(backend.load(&id).await?, Some(log));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_backend_store_replaces_previous_log() -> Result<()> {
        let root = unique_test_root("tracker-events-replace");
        let backend = FileTrackerBackend::new(&root);
        let id = conversation("replace");

        backend.store(&id, &sample_log()).await?;
        backend.store(&id, &sample_log()).await?;
        assert_eq!(backend.load(&id).await?.map(|log| log.len()), Some(3));

        backend.store(&id, &[]).await?;
        assert_eq!(backend.load(&id).await?, Some(Vec::new()));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_backend_keeps_hostile_ids_inside_root() -> Result<()> {
        let root = unique_test_root("tracker-events-ids");
        let backend = FileTrackerBackend::new(&root);
        let sneaky = conversation("../../etc/passwd");
        let plain = conversation("etc");

        backend.store(&sneaky, &sample_log()).await?;
        backend.store(&plain, &[Event::restarted()]).await?;

        let mut entries = fs::read_dir(root.join("trackers")).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|name| name.ends_with(".jsonl")));
        assert_eq!(backend.load(&plain).await?.map(|log| log.len()), Some(1));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_backend_remove_deletes_log() -> Result<()> {
        let root = unique_test_root("tracker-events-remove");
        let backend = FileTrackerBackend::new(&root);
        let id = conversation("gone");

        backend.store(&id, &sample_log()).await?;
        assert!(backend.remove(&id).await?);
        assert!(!backend.exists(&id).await?);
        assert!(backend.load(&id).await?.is_none());
        assert!(!backend.remove(&id).await?);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_backend_reports_corrupt_logs() -> Result<()> {
        let root = unique_test_root("tracker-events-corrupt");
        let backend = FileTrackerBackend::new(&root);
        let id = conversation("corrupt");

        backend.store(&id, &sample_log()).await?;
        let path = backend.file_path(&id);
        fs::write(&path, "{\"event\":\"teleport\"}\n").await?;

        let err = backend.load(&id).await.unwrap_err();
        assert!(err.to_string().contains("failed parsing event line"));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    async fn trackers_dir_entries(root: &std::path::Path) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(root.join("trackers")).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    #[tokio::test]
    async fn file_backend_accepts_long_conversation_ids() -> Result<()> {
        let root = unique_test_root("tracker-events-long-id");
        let backend = FileTrackerBackend::new(&root);
        let id = conversation(&"u".repeat(200));

        backend.store(&id, &sample_log()).await?;
        assert!(backend.exists(&id).await?);
        assert_eq!(backend.load(&id).await?, Some(sample_log()));

        let names = trackers_dir_entries(&root).await?;
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].len(), 64 + ".jsonl".len());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_backend_load_surfaces_io_errors() -> Result<()> {
        let root = unique_test_root("tracker-events-io");
        fs::create_dir_all(&root).await?;
        // a regular file where the trackers directory should be
        fs::write(root.join("trackers"), b"not a directory").await?;
        let backend = FileTrackerBackend::new(&root);
        let id = conversation("blocked");

        let err = backend.load(&id).await.unwrap_err();
        assert!(err.to_string().contains("failed opening"));
        assert!(backend.exists(&id).await.is_err());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn failed_replace_leaves_no_temp_files() -> Result<()> {
        let root = unique_test_root("tracker-events-tmp");
        let backend = FileTrackerBackend::new(&root);
        let id = conversation("stuck");

        // a non-empty directory in place of the log makes the rename fail
        let path = backend.file_path(&id);
        fs::create_dir_all(&path).await?;
        fs::write(path.join("keep"), b"x").await?;

        assert!(backend.store(&id, &sample_log()).await.is_err());
        let names = trackers_dir_entries(&root).await?;
        assert_eq!(names.len(), 1);
        assert!(names.iter().all(|name| !name.ends_with(".tmp")));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn abandoned_pending_log_is_removed() -> Result<()> {
        let root = unique_test_root("tracker-events-pending");
        fs::create_dir_all(&root).await?;
        let tmp = root.join("abc.0123.tmp");
        fs::write(&tmp, b"partial").await?;

        drop(PendingLog::new(tmp.clone()));
        assert!(!fs::try_exists(&tmp).await?);

        let target = root.join("abc.jsonl");
        fs::write(&tmp, b"complete").await?;
        PendingLog::new(tmp.clone()).persist(&target).await?;
        assert!(!fs::try_exists(&tmp).await?);
        assert_eq!(fs::read(&target).await?, b"complete");

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
