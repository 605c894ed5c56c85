use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    thread,
};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::{
    events::SharedEmitter,
    models::{Task, TaskEntry, TaskId, TaskListSnapshot, TaskState},
};

type EventQueue = mpsc::UnboundedSender<Arc<TaskListSnapshot>>;

/// Authoritative `Task -> TaskState` store.
///
/// Every mutation builds an immutable snapshot and publishes it on a watch
/// channel. Readers only ever clone the latest published `Arc`, so they never
/// contend with writers, and slow subscribers simply observe the newest value.
///
/// With an emitter attached, every snapshot is also queued in mutation order
/// and handed to the emitter from a dedicated thread, so emitter I/O never
/// runs under the registry lock.
pub struct TaskRegistry {
    inner: RwLock<Inner>,
    publisher: watch::Sender<Arc<TaskListSnapshot>>,
    events: Option<EventQueue>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Arc<TaskEntry>>,
    /// Ids sorted by creation time, then id.
    order: Vec<TaskId>,
    revision: u64,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_emitter(emitter: SharedEmitter) -> Self {
        Self::build(spawn_forwarder(emitter))
    }

    fn build(events: Option<EventQueue>) -> Self {
        let (publisher, _) = watch::channel(Arc::new(TaskListSnapshot::default()));
        Self {
            inner: RwLock::new(Inner::default()),
            publisher,
            events,
        }
    }

    pub fn upsert(&self, task: Task, state: TaskState) {
        let mut inner = self.inner.write().expect("task registry lock poisoned");
        let Inner { tasks, order, .. } = &mut *inner;
        let key = (task.time_created, task.id);
        if !tasks.contains_key(&task.id) {
            let at = order.partition_point(|id| {
                let existing = &tasks[id].task;
                (existing.time_created, existing.id) < key
            });
            order.insert(at, task.id);
        }
        tasks.insert(task.id, Arc::new(TaskEntry { task, state }));
        self.publish(&mut inner);
    }

    /// Applies `f` to a copy of an existing task's state and stores it when
    /// `f` reports a change. Returns whether the task was present and changed.
    /// Absent tasks are never re-created, which keeps late writers from
    /// resurrecting removed tasks.
    pub fn update<F>(&self, id: TaskId, f: F) -> bool
    where
        F: FnOnce(&mut TaskState) -> bool,
    {
        let mut inner = self.inner.write().expect("task registry lock poisoned");
        let Some(entry) = inner.tasks.get_mut(&id) else {
            return false;
        };
        let mut state = entry.state.clone();
        if !f(&mut state) {
            return false;
        }
        Arc::make_mut(entry).state = state;
        self.publish(&mut inner);
        true
    }

    pub fn remove(&self, id: TaskId) -> Option<TaskEntry> {
        let mut inner = self.inner.write().expect("task registry lock poisoned");
        let removed = inner.tasks.remove(&id)?;
        inner.order.retain(|other| *other != id);
        self.publish(&mut inner);
        Some(Arc::unwrap_or_clone(removed))
    }

    /// Point-in-time view of every registered task, oldest first.
    pub fn get(&self) -> Vec<TaskEntry> {
        self.snapshot()
            .entries
            .iter()
            .map(|e| TaskEntry::clone(e))
            .collect()
    }

    pub fn snapshot(&self) -> Arc<TaskListSnapshot> {
        self.publisher.borrow().clone()
    }

    pub fn entry(&self, id: TaskId) -> Option<TaskEntry> {
        self.inner
            .read()
            .expect("task registry lock poisoned")
            .tasks
            .get(&id)
            .map(|e| TaskEntry::clone(e))
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.inner
            .read()
            .expect("task registry lock poisoned")
            .tasks
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("task registry lock poisoned")
            .tasks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live stream of snapshots. The receiver starts at the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TaskListSnapshot>> {
        self.publisher.subscribe()
    }

    fn publish(&self, inner: &mut Inner) {
        inner.revision += 1;
        let entries = inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect();
        let snapshot = Arc::new(TaskListSnapshot {
            revision: inner.revision,
            entries,
        });
        if let Some(events) = &self.events {
            if events.send(snapshot.clone()).is_err() {
                debug!(revision = snapshot.revision, "task event forwarder is gone");
            }
        }
        self.publisher.send_replace(snapshot);
    }
}

fn spawn_forwarder(emitter: SharedEmitter) -> Option<EventQueue> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<TaskListSnapshot>>();
    let spawned = thread::Builder::new()
        .name("task-events".to_string())
        .spawn(move || {
            while let Some(snapshot) = rx.blocking_recv() {
                if let Err(err) = emitter.emit_task_update(&snapshot) {
                    warn!(revision = snapshot.revision, "task update emitter failed: {err:#}");
                }
            }
        });
    match spawned {
        Ok(_) => Some(tx),
        Err(err) => {
            warn!("failed to start task event forwarder: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex, mpsc},
        thread,
        time::{Duration, Instant},
    };

    use anyhow::Result;

    use crate::{
        events::EventEmitter,
        models::{DownloadState, Task, TaskListSnapshot, TaskState},
    };

    use super::TaskRegistry;

    fn running(progress: f32) -> DownloadState {
        DownloadState::Running {
            progress,
            rate_bytes_per_sec: None,
            eta_secs: None,
        }
    }

    /// Blocks on every snapshot until the test hands out a permit.
    struct GatedEmitter {
        permits: Mutex<mpsc::Receiver<()>>,
        seen: Mutex<Vec<u64>>,
    }

    impl EventEmitter for GatedEmitter {
        fn emit_task_update(&self, snapshot: &TaskListSnapshot) -> Result<()> {
            let _ = self.permits.lock().expect("permits mutex").recv();
            self.seen.lock().expect("seen mutex").push(snapshot.revision);
            Ok(())
        }
    }

    #[test]
    fn upsert_then_get_returns_single_entry_per_task() {
        let registry = TaskRegistry::new();
        let task = Task::new("https://example.com/a");
        registry.upsert(task.clone(), TaskState::idle(&task));
        let mut state = TaskState::idle(&task);
        state.download_state = DownloadState::FetchingInfo;
        registry.upsert(task.clone(), state);

        let entries = registry.get();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task, task);
        assert_eq!(entries[0].state.download_state, DownloadState::FetchingInfo);
    }

    #[test]
    fn snapshot_lists_tasks_oldest_first() {
        let registry = TaskRegistry::new();
        let tasks = (0..5)
            .map(|i| Task::new(format!("https://example.com/{i}")))
            .collect::<Vec<_>>();
        for task in tasks.iter().rev() {
            registry.upsert(task.clone(), TaskState::idle(task));
        }

        let mut expected = tasks.clone();
        expected.sort_by_key(|t| (t.time_created, t.id));
        let listed = registry.get().into_iter().map(|e| e.task).collect::<Vec<_>>();
        assert_eq!(listed, expected);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = TaskRegistry::new();
        let task = Task::new("https://example.com/a");
        registry.upsert(task.clone(), TaskState::idle(&task));

        assert!(registry.remove(task.id).is_some());
        assert!(registry.remove(task.id).is_none());
        assert!(registry.get().is_empty());
        assert_eq!(registry.snapshot().revision, 2);
    }

    #[test]
    fn update_does_not_recreate_removed_task() {
        let registry = TaskRegistry::new();
        let task = Task::new("https://example.com/a");
        registry.upsert(task.clone(), TaskState::idle(&task));
        registry.remove(task.id);

        let applied = registry.update(task.id, |state| {
            state.download_state = DownloadState::Canceled;
            true
        });
        assert!(!applied);
        assert!(!registry.contains(task.id));
    }

    #[test]
    fn unchanged_update_does_not_publish() {
        let registry = TaskRegistry::new();
        let task = Task::new("https://example.com/a");
        registry.upsert(task.clone(), TaskState::idle(&task));
        let before = registry.snapshot().revision;

        assert!(!registry.update(task.id, |state| {
            state.download_state = DownloadState::Canceled;
            false
        }));
        assert_eq!(registry.snapshot().revision, before);
        assert_eq!(
            registry.entry(task.id).expect("task").state.download_state,
            DownloadState::Idle
        );
    }

    #[test]
    fn untouched_entries_are_shared_between_snapshots() {
        let registry = TaskRegistry::new();
        let a = Task::new("https://example.com/a");
        let b = Task::new("https://example.com/b");
        registry.upsert(a.clone(), TaskState::idle(&a));
        registry.upsert(b.clone(), TaskState::idle(&b));
        let before = registry.snapshot();

        registry.update(b.id, |state| {
            state.download_state = running(0.5);
            true
        });
        let after = registry.snapshot();

        let a_before = before.entries.iter().find(|e| e.task.id == a.id).expect("a");
        let a_after = after.entries.iter().find(|e| e.task.id == a.id).expect("a");
        assert!(Arc::ptr_eq(a_before, a_after));
        assert_eq!(before.state_of(b.id), Some(&DownloadState::Idle));
        assert_eq!(after.state_of(b.id), Some(&running(0.5)));
    }

    #[tokio::test]
    async fn subscriber_sees_latest_snapshot_after_burst() {
        let registry = TaskRegistry::new();
        let mut rx = registry.subscribe();
        let task = Task::new("https://example.com/a");
        registry.upsert(task.clone(), TaskState::idle(&task));
        for step in 1..=10 {
            registry.update(task.id, |state| {
                state.download_state = running(step as f32 / 10.0);
                true
            });
        }

        rx.changed().await.expect("registry dropped");
        let latest = rx.borrow_and_update().clone();
        assert_eq!(latest.revision, 11);
        assert_eq!(latest.state_of(task.id).and_then(|s| s.progress()), Some(1.0));
    }

    #[test]
    fn blocked_emitter_does_not_hold_up_writers() {
        let (release, permits) = mpsc::channel();
        let emitter = Arc::new(GatedEmitter {
            permits: Mutex::new(permits),
            seen: Mutex::new(Vec::new()),
        });
        let registry = TaskRegistry::with_emitter(emitter.clone());
        let task = Task::new("https://example.com/a");
        registry.upsert(task.clone(), TaskState::idle(&task));
        for step in 1..=20 {
            registry.update(task.id, |state| {
                state.download_state = running(step as f32 / 20.0);
                true
            });
        }
        assert_eq!(registry.snapshot().revision, 21);
        assert!(emitter.seen.lock().expect("seen mutex").is_empty());

        for _ in 0..21 {
            release.send(()).expect("emitter thread alive");
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while emitter.seen.lock().expect("seen mutex").len() < 21 {
            assert!(Instant::now() < deadline, "emitter never drained");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(
            *emitter.seen.lock().expect("seen mutex"),
            (1..=21).collect::<Vec<u64>>()
        );
    }

    #[test]
    fn concurrent_writers_keep_one_state_per_task() {
        let registry = Arc::new(TaskRegistry::new());
        let tasks = (0..8)
            .map(|i| Task::new(format!("https://example.com/{i}")))
            .collect::<Vec<_>>();
        for task in &tasks {
            registry.upsert(task.clone(), TaskState::idle(task));
        }

        let handles = tasks
            .iter()
            .cloned()
            .map(|task| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for step in 0..100 {
                        registry.update(task.id, |state| {
                            state.download_state = running(step as f32 / 100.0);
                            true
                        });
                        let _ = registry.get();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("writer thread panicked");
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), tasks.len());
        for task in &tasks {
            let matches = snapshot.entries.iter().filter(|e| e.task.id == task.id).count();
            assert_eq!(matches, 1);
        }
    }
}
