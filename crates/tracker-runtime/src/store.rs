use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};
use tracker_events::InMemoryTrackerBackend;
use tracker_protocol::{ConversationId, Event, TrackerBackend, TrackerError, TrackerResult};

use crate::tracker::DialogueTracker;

type LockTable = Arc<Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Upper bound for a single backend call.
    pub persist_timeout: Duration,
    /// Trackers kept in memory between requests. `0` disables the cache and
    /// every read goes to the backend.
    pub resident_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            persist_timeout: Duration::from_secs(10),
            resident_capacity: 1024,
        }
    }
}

/// Exclusive access to one conversation. Dropping it releases the id, and
/// the id's lock entry too when nobody else is waiting for it.
pub struct ConversationGuard {
    conversation_id: ConversationId,
    locks: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ConversationGuard {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        let Some(guard) = self.guard.take() else {
            return;
        };
        let mutex = Arc::clone(OwnedMutexGuard::mutex(&guard));
        drop(guard);
        // The table handle and `mutex` are the only references left unless
        // another task is queued on this id.
        let idle = locks
            .get(&self.conversation_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &mutex) && Arc::strong_count(entry) == 2);
        if idle {
            locks.remove(&self.conversation_id);
        }
    }
}

impl fmt::Debug for ConversationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationGuard")
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}

/// Least-recently-used set of trackers that mirror what the backend holds.
#[derive(Debug)]
struct ResidentCache {
    capacity: usize,
    clock: u64,
    entries: HashMap<ConversationId, (u64, DialogueTracker)>,
}

impl ResidentCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: 0,
            entries: HashMap::new(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, conversation_id: &ConversationId) -> Option<DialogueTracker> {
        let now = self.tick();
        let (last_used, tracker) = self.entries.get_mut(conversation_id)?;
        *last_used = now;
        Some(tracker.clone())
    }

    fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.entries.contains_key(conversation_id)
    }

    fn insert(&mut self, tracker: DialogueTracker) {
        if self.capacity == 0 {
            return;
        }
        let now = self.tick();
        self.entries
            .insert(tracker.sender_id().clone(), (now, tracker));
        self.evict();
    }

    /// Keeps an entry that is already resident; it is at least as new as
    /// whatever a concurrent reader loaded.
    fn insert_if_absent(&mut self, tracker: DialogueTracker) -> DialogueTracker {
        match self.get(tracker.sender_id()) {
            Some(resident) => resident,
            None => {
                self.insert(tracker.clone());
                tracker
            }
        }
    }

    fn remove(&mut self, conversation_id: &ConversationId) -> bool {
        self.entries.remove(conversation_id).is_some()
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (last_used, _))| *last_used)
                .map(|(id, _)| id.clone())
            else {
                return;
            };
            self.entries.remove(&oldest);
            debug!(conversation_id = %oldest, "tracker evicted from memory");
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Keyed repository of trackers over a [`TrackerBackend`].
///
/// Cloning is cheap and every clone shares the same resident cache, lock
/// table and backend. At most one tracker is resident per id; the resident
/// copy is only ever replaced by a successful [`save`](Self::save) or a load,
/// so evicting it never loses events. The cache holds at most
/// [`StoreConfig::resident_capacity`] trackers.
///
/// The store does not lock on its own for single calls. Callers that run a
/// read-modify-write sequence hold [`lock`](Self::lock) for its duration, or
/// use [`modify`](Self::modify) / [`replace`](Self::replace) which do so.
#[derive(Clone)]
pub struct TrackerStore {
    backend: Arc<dyn TrackerBackend>,
    config: StoreConfig,
    resident: Arc<Mutex<ResidentCache>>,
    locks: LockTable,
}

impl fmt::Debug for TrackerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerStore")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("resident", &self.resident.lock().len())
            .finish()
    }
}

impl TrackerStore {
    pub fn new(backend: Arc<dyn TrackerBackend>) -> Self {
        Self::with_config(backend, StoreConfig::default())
    }

    pub fn with_config(backend: Arc<dyn TrackerBackend>, config: StoreConfig) -> Self {
        Self {
            backend,
            resident: Arc::new(Mutex::new(ResidentCache::new(config.resident_capacity))),
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTrackerBackend::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock_for(&self, conversation_id: &ConversationId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.locks.lock();
        guard
            .entry(conversation_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `conversation_id`.
    pub async fn lock(&self, conversation_id: &ConversationId) -> ConversationGuard {
        let guard = self.lock_for(conversation_id).lock_owned().await;
        ConversationGuard {
            conversation_id: conversation_id.clone(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Ids that are currently locked or waited on.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn resident_count(&self) -> usize {
        self.resident.lock().len()
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = TrackerResult<T>>,
    ) -> TrackerResult<T> {
        match tokio::time::timeout(self.config.persist_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TrackerError::Persistence(format!(
                "{operation} timed out after {:?} on {} backend",
                self.config.persist_timeout,
                self.backend.name()
            ))),
        }
    }

    async fn load(&self, conversation_id: &ConversationId) -> TrackerResult<Option<DialogueTracker>> {
        if let Some(tracker) = self.resident.lock().get(conversation_id) {
            return Ok(Some(tracker));
        }
        let Some(events) = self
            .bounded("load", self.backend.load(conversation_id))
            .await?
        else {
            return Ok(None);
        };

        let tracker = DialogueTracker::from_events(conversation_id.clone(), events);
        debug!(count = tracker.len(), "tracker rehydrated from backend");
        Ok(Some(self.resident.lock().insert_if_absent(tracker)))
    }

    /// Resident tracker, else the persisted one, else a new empty tracker
    /// that is persisted before it is returned.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn get_or_create(&self, conversation_id: &ConversationId) -> TrackerResult<DialogueTracker> {
        if let Some(tracker) = self.load(conversation_id).await? {
            return Ok(tracker);
        }
        let tracker = self.create_fresh(conversation_id);
        self.save(&tracker).await?;
        info!("created new tracker");
        Ok(tracker)
    }

    /// Like [`get_or_create`](Self::get_or_create) without the creation step.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn get(&self, conversation_id: &ConversationId) -> TrackerResult<DialogueTracker> {
        self.load(conversation_id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(conversation_id.to_string()))
    }

    /// A new empty tracker for `conversation_id`. Durable state is replaced
    /// only when the returned tracker is saved.
    pub fn create_fresh(&self, conversation_id: &ConversationId) -> DialogueTracker {
        DialogueTracker::new(conversation_id.clone())
    }

    /// Persist the tracker's full event log, overwriting the previous one.
    #[instrument(skip(self, tracker), fields(conversation_id = %tracker.sender_id(), count = tracker.len()))]
    pub async fn save(&self, tracker: &DialogueTracker) -> TrackerResult<()> {
        let conversation_id = tracker.sender_id();
        if let Err(error) = self
            .bounded("store", self.backend.store(conversation_id, tracker.events()))
            .await
        {
            warn!(%error, "failed saving tracker");
            return Err(error);
        }
        self.resident.lock().insert(tracker.clone());
        debug!("tracker saved");
        Ok(())
    }

    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn exists(&self, conversation_id: &ConversationId) -> TrackerResult<bool> {
        if self.resident.lock().contains(conversation_id) {
            return Ok(true);
        }
        self.bounded("exists", self.backend.exists(conversation_id))
            .await
    }

    /// Remove persisted and resident state. Returns whether anything existed.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn delete(&self, conversation_id: &ConversationId) -> TrackerResult<bool> {
        let persisted = self
            .bounded("remove", self.backend.remove(conversation_id))
            .await?;
        let resident = self.resident.lock().remove(conversation_id);
        info!(persisted, resident, "tracker deleted");
        Ok(persisted || resident)
    }

    /// Locked `get_or_create → f → save`. Returns the saved tracker.
    pub async fn modify<F>(&self, conversation_id: &ConversationId, f: F) -> TrackerResult<DialogueTracker>
    where
        F: FnOnce(&mut DialogueTracker),
    {
        let _guard = self.lock(conversation_id).await;
        let mut tracker = self.get_or_create(conversation_id).await?;
        f(&mut tracker);
        self.save(&tracker).await?;
        Ok(tracker)
    }

    /// Locked `create_fresh → update_all → save`.
    pub async fn replace(
        &self,
        conversation_id: &ConversationId,
        events: Vec<Event>,
    ) -> TrackerResult<DialogueTracker> {
        let _guard = self.lock(conversation_id).await;
        let mut tracker = self.create_fresh(conversation_id);
        tracker.update_all(events);
        self.save(&tracker).await?;
        Ok(tracker)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use tracker_events::InMemoryTrackerBackend;
    use tracker_protocol::{
        ConversationId, Event, EventKind, TrackerBackend, TrackerError, TrackerResult,
    };

    use super::{StoreConfig, TrackerStore};

    fn conversation(raw: &str) -> ConversationId {
        ConversationId::parse(raw).unwrap()
    }

    /// In-memory backend whose writes can be switched to fail or stall.
    #[derive(Debug, Default)]
    struct FlakyBackend {
        inner: InMemoryTrackerBackend,
        fail_writes: AtomicBool,
        stall_writes: AtomicBool,
    }

    #[async_trait]
    impl TrackerBackend for FlakyBackend {
        async fn load(&self, id: &ConversationId) -> TrackerResult<Option<Vec<Event>>> {
            self.inner.load(id).await
        }

        async fn store(&self, id: &ConversationId, events: &[Event]) -> TrackerResult<()> {
            if self.stall_writes.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TrackerError::Persistence("disk full".into()));
            }
            self.inner.store(id, events).await
        }

        async fn exists(&self, id: &ConversationId) -> TrackerResult<bool> {
            self.inner.exists(id).await
        }

        async fn remove(&self, id: &ConversationId) -> TrackerResult<bool> {
            self.inner.remove(id).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn get_or_create_persists_new_tracker() -> Result<()> {
        let backend = Arc::new(InMemoryTrackerBackend::new());
        let store = TrackerStore::new(backend.clone());
        let id = conversation("default");

        assert!(!store.exists(&id).await?);
        let tracker = store.get_or_create(&id).await?;
        assert!(tracker.is_empty());
        assert_eq!(backend.load(&id).await?, Some(Vec::new()));
        assert_eq!(store.resident_count(), 1);
        assert!(store.exists(&id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn get_reports_missing_conversations() -> Result<()> {
        let store = TrackerStore::in_memory();
        let err = store.get(&conversation("nobody")).await.unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(id) if id == "nobody"));
        assert_eq!(store.resident_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn non_resident_trackers_are_rehydrated_from_backend() -> Result<()> {
        let backend = Arc::new(InMemoryTrackerBackend::new());
        let id = conversation("default");
        backend
            .store(
                &id,
                &[
                    Event::action_executed("utter_greet"),
                    Event::slot_set("x", json!(3)),
                ],
            )
            .await?;

        let store = TrackerStore::new(backend);
        let tracker = store.get(&id).await?;
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.state().slot("x"), Some(&json!(3)));
        assert_eq!(tracker.latest_action_name(), Some("utter_greet"));
        assert_eq!(store.resident_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn save_is_idempotent() -> Result<()> {
        let backend = Arc::new(InMemoryTrackerBackend::new());
        let store = TrackerStore::new(backend.clone());
        let id = conversation("twice");

        let mut tracker = store.get_or_create(&id).await?;
        tracker.update(Event::slot_set("x", json!(1)));
        store.save(&tracker).await?;
        let first = backend.load(&id).await?;
        store.save(&tracker).await?;

        assert_eq!(backend.load(&id).await?, first);
        assert_eq!(first.map(|log| log.len()), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn create_fresh_then_save_discards_old_history() -> Result<()> {
        let store = TrackerStore::in_memory();
        let id = conversation("reset");
        store
            .modify(&id, |tracker| {
                tracker.update(Event::slot_set("x", json!(1)));
                tracker.update(Event::action_executed("utter_greet"));
            })
            .await?;

        let fresh = store.create_fresh(&id);
        assert_eq!(store.get(&id).await?.len(), 2);
        store.save(&fresh).await?;

        let tracker = store.get_or_create(&id).await?;
        assert!(tracker.is_empty());
        assert!(tracker.state().slots.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_save_leaves_trackers_untouched() -> Result<()> {
        let backend = Arc::new(FlakyBackend::default());
        let store = TrackerStore::new(backend.clone());
        let id = conversation("flaky");

        let mut tracker = store.get_or_create(&id).await?;
        backend.fail_writes.store(true, Ordering::SeqCst);
        tracker.update(Event::slot_set("x", json!(1)));

        let err = store.save(&tracker).await.unwrap_err();
        assert!(matches!(err, TrackerError::Persistence(_)));
        assert_eq!(tracker.len(), 1);
        assert!(store.get(&id).await?.is_empty());
        assert_eq!(backend.load(&id).await?, Some(Vec::new()));
        Ok(())
    }

    #[tokio::test]
    async fn stalled_backend_times_out() -> Result<()> {
        let backend = Arc::new(FlakyBackend::default());
        let store = TrackerStore::with_config(
            backend.clone(),
            StoreConfig {
                persist_timeout: Duration::from_millis(20),
                ..StoreConfig::default()
            },
        );
        backend.stall_writes.store(true, Ordering::SeqCst);

        let err = store.get_or_create(&conversation("slow")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(store.resident_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn replace_swaps_full_history() -> Result<()> {
        let store = TrackerStore::in_memory();
        let id = conversation("replace");
        store
            .modify(&id, |tracker| tracker.update(Event::slot_set("x", json!("old"))))
            .await?;

        let tracker = store
            .replace(
                &id,
                vec![
                    Event::action_executed("utter_greet"),
                    Event::new(EventKind::ConversationPaused),
                ],
            )
            .await?;
        assert_eq!(tracker.len(), 2);
        assert!(tracker.state().paused);

        let stored = store.get(&id).await?;
        assert_eq!(stored, tracker);
        assert_eq!(stored.state().slot("x"), None);
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_resident_and_persisted_state() -> Result<()> {
        let backend = Arc::new(InMemoryTrackerBackend::new());
        let store = TrackerStore::new(backend.clone());
        let id = conversation("gone");
        store.get_or_create(&id).await?;

        assert!(store.delete(&id).await?);
        assert!(!store.exists(&id).await?);
        assert!(backend.load(&id).await?.is_none());
        assert!(!store.delete(&id).await?);
        assert_eq!(store.lock_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_modifications_on_one_id_never_interleave() -> Result<()> {
        let store = TrackerStore::in_memory();
        let id = conversation("busy");
        let writers = 16;
        let per_writer = 5;

        let tasks = (0..writers).map(|writer| {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                store
                    .modify(&id, |tracker| {
                        for step in 0..per_writer {
                            tracker.update(Event::slot_set(
                                format!("w{writer}"),
                                json!(step),
                            ));
                        }
                    })
                    .await
            })
        });
        for outcome in futures_util::future::join_all(tasks).await {
            outcome??;
        }

        let tracker = store.get(&id).await?;
        assert_eq!(tracker.len(), writers * per_writer);
        // every writer's batch is contiguous and in submission order
        for batch in tracker.events().chunks(per_writer) {
            let names: Vec<_> = batch
                .iter()
                .map(|event| match event.kind() {
                    EventKind::SlotSet { name, value } => (name.clone(), value.clone()),
                    other => panic!("unexpected event {other:?}"),
                })
                .collect();
            assert!(names.iter().all(|(name, _)| name == &names[0].0));
            let values: Vec<_> = names.into_iter().map(|(_, value)| value).collect();
            assert_eq!(values, (0..per_writer).map(|step| json!(step)).collect::<Vec<_>>());
        }
        for writer in 0..writers {
            assert_eq!(
                tracker.state().slot(&format!("w{writer}")),
                Some(&json!(per_writer - 1))
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn different_ids_do_not_block_each_other() -> Result<()> {
        let store = TrackerStore::in_memory();
        let held = store.lock(&conversation("a")).await;

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            store.modify(&conversation("b"), |tracker| {
                tracker.update(Event::restarted());
            }),
        )
        .await??;
        assert_eq!(other.len(), 1);
        assert_eq!(held.conversation_id().as_str(), "a");
        assert_eq!(store.lock_count(), 1);

        drop(held);
        assert_eq!(store.lock_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn lock_entries_are_released_with_their_last_guard() -> Result<()> {
        let store = TrackerStore::with_config(
            Arc::new(InMemoryTrackerBackend::new()),
            StoreConfig {
                resident_capacity: 100,
                ..StoreConfig::default()
            },
        );
        let id = conversation("queued");

        let first = store.lock(&id).await;
        let waiter = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let _guard = store.lock(&id).await;
            })
        };
        tokio::task::yield_now().await;
        drop(first);
        // the queued task still needs the entry
        waiter.await?;
        assert_eq!(store.lock_count(), 0);

        for n in 0..1000 {
            store
                .modify(&conversation(&format!("user-{n}")), |tracker| {
                    tracker.update(Event::restarted());
                })
                .await?;
        }
        assert_eq!(store.lock_count(), 0);
        assert_eq!(store.resident_count(), 100);
        Ok(())
    }

    #[tokio::test]
    async fn resident_cache_evicts_least_recently_used() -> Result<()> {
        let backend = Arc::new(InMemoryTrackerBackend::new());
        let store = TrackerStore::with_config(
            backend.clone(),
            StoreConfig {
                resident_capacity: 2,
                ..StoreConfig::default()
            },
        );
        let (a, b, c) = (conversation("a"), conversation("b"), conversation("c"));
        store.get_or_create(&a).await?;
        store.get_or_create(&b).await?;
        store.get(&a).await?;
        store.get_or_create(&c).await?;
        assert_eq!(store.resident_count(), 2);

        // `b` was evicted but its history is still on the backend
        backend.store(&b, &[Event::restarted()]).await?;
        assert_eq!(store.get(&b).await?.len(), 1);
        assert!(store.get(&a).await?.is_empty());
        assert_eq!(store.resident_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn zero_capacity_reads_through_to_backend() -> Result<()> {
        let backend = Arc::new(InMemoryTrackerBackend::new());
        let store = TrackerStore::with_config(
            backend.clone(),
            StoreConfig {
                resident_capacity: 0,
                ..StoreConfig::default()
            },
        );
        let id = conversation("uncached");

        let tracker = store
            .modify(&id, |tracker| tracker.update(Event::slot_set("x", json!(1))))
            .await?;
        assert_eq!(store.resident_count(), 0);
        assert_eq!(store.get(&id).await?, tracker);
        assert!(store.exists(&id).await?);
        assert_eq!(store.resident_count(), 0);
        Ok(())
    }
}
