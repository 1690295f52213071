//! The registry: authoritative in-memory store of every known download
//! request, its status, progress and cancellation handle.
//!
//! All mutations go through a single `RwLock`; the priority queue is only
//! touched while the write lock is held, so it needs no locking of its own.
//! Nothing under the lock performs I/O. Lifecycle transitions are enforced
//! here: terminal records only move again through a fresh `add`, with the one
//! exception of the sweeper demoting `available` to `done` when a file has
//! left the ingest directory.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::models::{BookInfo, QueueOrderItem, QueueStatus};
use super::queue::PriorityQueue;

pub struct Registry {
    inner: RwLock<Inner>,
    status_timeout: Duration,
}

#[derive(Default)]
struct Inner {
    queue: PriorityQueue,
    books: HashMap<String, BookInfo>,
    status: HashMap<String, QueueStatus>,
    status_mtime: HashMap<String, DateTime<Utc>>,
    cancel_tokens: HashMap<String, CancellationToken>,
    active: HashSet<String>,
}

impl Inner {
    /// Records a status change. Terminal transitions drop the record out of
    /// the active set and close any outstanding cancellation token.
    fn set_status(&mut self, id: &str, status: QueueStatus) {
        self.status.insert(id.to_string(), status);
        self.status_mtime.insert(id.to_string(), Utc::now());

        if status.is_terminal() {
            self.active.remove(id);
            if let Some(token) = self.cancel_tokens.remove(id) {
                token.cancel();
            }
            if let Some(book) = self.books.get_mut(id) {
                book.progress = None;
            }
        }
    }

    /// Removes every trace of a record.
    fn remove(&mut self, id: &str) {
        self.books.remove(id);
        self.status.remove(id);
        self.status_mtime.remove(id);
        self.active.remove(id);
        if let Some(token) = self.cancel_tokens.remove(id) {
            token.cancel();
        }
    }
}

impl Registry {
    pub fn new(status_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            status_timeout,
        }
    }

    // A poisoned lock means a panic inside one of these short critical
    // sections; the state itself is still coherent, so keep going.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a new request in `queued` state and pushes it onto the heap.
    ///
    /// A record that already exists in a non-replaceable state is left
    /// untouched; re-adding after `error`, `done` or `cancelled` resets it.
    pub fn add(&self, mut book: BookInfo, priority: i32) {
        let mut inner = self.write();
        if let Some(status) = inner.status.get(&book.id) {
            if !status.is_replaceable() {
                tracing::debug!("book {} already tracked, ignoring re-add", book.id);
                return;
            }
        }

        book.priority = priority;
        book.progress = None;
        book.download_path = None;

        let id = book.id.clone();
        inner.queue.push(id.clone(), priority);
        inner.books.insert(id.clone(), book);
        inner.set_status(&id, QueueStatus::Queued);
    }

    /// Pops the next dispatchable request, skipping stale heap entries whose
    /// owner is no longer `queued` (lazy cancellation). On success the record
    /// transitions to `downloading` and gets a fresh cancellation token.
    ///
    /// Returns immediately with `None` when nothing is dispatchable.
    pub fn get_next(&self) -> Option<(String, CancellationToken)> {
        let mut inner = self.write();
        while let Some(entry) = inner.queue.pop() {
            if inner.status.get(&entry.id).copied() != Some(QueueStatus::Queued) {
                continue;
            }

            let token = CancellationToken::new();
            inner
                .cancel_tokens
                .insert(entry.id.clone(), token.clone());
            inner.active.insert(entry.id.clone());
            if let Some(book) = inner.books.get_mut(&entry.id) {
                book.progress = None;
            }
            inner.set_status(&entry.id, QueueStatus::Downloading);
            return Some((entry.id, token));
        }
        None
    }

    /// Applies a status transition. Unknown ids are ignored. Terminal states
    /// are sticky except for `available` → `done` (file lost from disk).
    pub fn update_status(&self, id: &str, status: QueueStatus) {
        let mut inner = self.write();
        if !inner.books.contains_key(id) {
            return;
        }
        if let Some(current) = inner.status.get(id).copied() {
            let demotion =
                current == QueueStatus::Available && status == QueueStatus::Done;
            if current.is_terminal() && !demotion {
                return;
            }
            if demotion {
                if let Some(book) = inner.books.get_mut(id) {
                    book.download_path = None;
                }
            }
        }
        inner.set_status(id, status);
    }

    /// Updates the progress percentage of an active download. Progress never
    /// regresses within one downloading episode.
    pub fn update_progress(&self, id: &str, progress: f64) {
        let mut inner = self.write();
        if !inner.active.contains(id) {
            return;
        }
        if let Some(book) = inner.books.get_mut(id) {
            let clamped = progress.clamp(0.0, 100.0);
            if book.progress.map_or(true, |current| clamped >= current) {
                book.progress = Some(clamped);
            }
        }
    }

    /// Records the final on-disk path of a download. Ignored for unknown ids.
    pub fn update_path(&self, id: &str, path: &Path) {
        let mut inner = self.write();
        if let Some(book) = inner.books.get_mut(id) {
            book.download_path = Some(path.to_string_lossy().into_owned());
        }
    }

    /// Cancels a request. A queued record flips straight to `cancelled` (its
    /// heap entry is discarded lazily at pop time); a downloading record has
    /// its token closed so the fetcher stops at the next chunk boundary.
    /// Returns false for unknown ids and any other state.
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.write();
        match inner.status.get(id).copied() {
            Some(QueueStatus::Queued) | Some(QueueStatus::Downloading) => {
                inner.set_status(id, QueueStatus::Cancelled);
                true
            }
            _ => false,
        }
    }

    /// Retunes the priority of a queued record. Returns false when the id is
    /// unknown or not in `queued` state.
    pub fn set_priority(&self, id: &str, priority: i32) -> bool {
        let mut inner = self.write();
        if inner.status.get(id).copied() != Some(QueueStatus::Queued) {
            return false;
        }
        let updated = inner.queue.update_priority(id, priority);
        if updated {
            if let Some(book) = inner.books.get_mut(id) {
                book.priority = priority;
            }
        }
        updated
    }

    /// Applies a bulk priority update to any queued entries, then
    /// re-heapifies once.
    pub fn reorder(&self, priorities: &HashMap<String, i32>) -> bool {
        let mut inner = self.write();
        inner.queue.reorder(priorities);
        for (id, &priority) in priorities {
            if inner.status.get(id).copied() == Some(QueueStatus::Queued) {
                if let Some(book) = inner.books.get_mut(id) {
                    book.priority = priority;
                }
            }
        }
        true
    }

    /// Snapshot of all records grouped by status. Every status group is
    /// present, empty or not.
    pub fn status(&self) -> HashMap<QueueStatus, HashMap<String, BookInfo>> {
        let inner = self.read();
        let mut result: HashMap<QueueStatus, HashMap<String, BookInfo>> = QueueStatus::ALL
            .iter()
            .map(|status| (*status, HashMap::new()))
            .collect();

        for (id, status) in &inner.status {
            if let Some(book) = inner.books.get(id) {
                result
                    .entry(*status)
                    .or_default()
                    .insert(id.clone(), book.clone());
            }
        }
        result
    }

    /// The queued portion of the heap projected in dispatch order. Stale
    /// entries left behind by lazy cancellation are filtered out.
    pub fn queue_order(&self) -> Vec<QueueOrderItem> {
        let inner = self.read();
        let mut seen = HashSet::new();
        let mut items = Vec::new();

        for entry in inner.queue.entries() {
            if inner.status.get(&entry.id).copied() != Some(QueueStatus::Queued) {
                continue;
            }
            if !seen.insert(entry.id.clone()) {
                continue;
            }
            if let Some(book) = inner.books.get(&entry.id) {
                items.push(QueueOrderItem {
                    id: entry.id.clone(),
                    title: book.title.clone(),
                    author: book.author.clone(),
                    priority: entry.priority,
                    inserted_at: entry.inserted_at,
                    status: QueueStatus::Queued,
                });
            }
        }
        items
    }

    /// Ids currently owned by a worker.
    pub fn active_downloads(&self) -> Vec<String> {
        self.read().active.iter().cloned().collect()
    }

    /// Removes every record in `done`, `error` or `cancelled` state and
    /// returns how many were dropped.
    pub fn clear_completed(&self) -> usize {
        let mut inner = self.write();
        let ids: Vec<String> = inner
            .status
            .iter()
            .filter(|&(_, &status)| status.is_replaceable())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            inner.remove(id);
        }
        ids.len()
    }

    /// `(id, final_path)` of every `available` record, for the sweeper's
    /// on-disk reconciliation. The filesystem checks happen outside the lock.
    pub fn available_paths(&self) -> Vec<(String, String)> {
        let inner = self.read();
        inner
            .status
            .iter()
            .filter(|&(_, &status)| status == QueueStatus::Available)
            .filter_map(|(id, _)| {
                inner
                    .books
                    .get(id)
                    .and_then(|book| book.download_path.clone())
                    .map(|path| (id.clone(), path))
            })
            .collect()
    }

    /// Demotes an `available` record whose file has vanished to `done`.
    pub fn mark_file_missing(&self, id: &str) {
        self.update_status(id, QueueStatus::Done);
    }

    /// Evicts terminal records whose last status change is older than the
    /// configured retention timeout. Returns how many were removed.
    pub fn evict_stale(&self) -> usize {
        // a retention too large to represent simply never evicts
        let Some(cutoff) = chrono::Duration::from_std(self.status_timeout)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let mut inner = self.write();
        let ids: Vec<String> = inner
            .status
            .iter()
            .filter(|&(_, &status)| status.is_terminal())
            .filter(|(id, _)| {
                inner
                    .status_mtime
                    .get(*id)
                    .is_some_and(|mtime| *mtime < cutoff)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            inner.remove(id);
        }
        ids.len()
    }

    /// Clone of a tracked descriptor.
    pub fn book(&self, id: &str) -> Option<BookInfo> {
        self.read().books.get(id).cloned()
    }

    /// Descriptor plus current status, for read-back endpoints.
    pub fn book_with_status(&self, id: &str) -> Option<(BookInfo, QueueStatus)> {
        let inner = self.read();
        let book = inner.books.get(id)?.clone();
        let status = inner.status.get(id).copied()?;
        Some((book, status))
    }

    /// Number of tracked records.
    pub fn len(&self) -> usize {
        self.read().books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().books.is_empty()
    }
}
