//! Epoch Publisher: the freshness gate every read depends on. A read that
//! touches file X must block until X is `CLEAN` at an epoch at or after the
//! epoch the reader was admitted at — there is no fallback to stale data
//! (§4.5).
//!
//! Grounded in SPEC_FULL.md §5A's architectural decision: a per-file
//! freshness map guarded by `std::sync::{Condvar, Mutex}`, not an async
//! runtime, since the core has no networking and the teacher only pulls
//! `tokio` for its HTTP server (dropped along with the rest of the wire
//! protocol). This is the target "per-file map" implementation named in
//! §4.5, not the minimum-viable global event.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::ids::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessState {
    Clean,
    Dirty,
    Stale,
    Unindexed,
}

struct Inner {
    epoch_id: i64,
    /// Per-file state as of the current epoch. Absence means `Unindexed`.
    files: HashMap<FileId, FreshnessState>,
}

/// Publishes epochs and blocks readers on per-file freshness. One instance
/// per repository; shared behind an `Arc` by every component that reads T0/T1.
pub struct EpochPublisher {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl Default for EpochPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochPublisher {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { epoch_id: 0, files: HashMap::new() }), condvar: Condvar::new() }
    }

    pub fn current_epoch(&self) -> i64 {
        self.inner.lock().unwrap().epoch_id
    }

    pub fn state_of(&self, file_id: FileId) -> FreshnessState {
        self.inner.lock().unwrap().files.get(&file_id).copied().unwrap_or(FreshnessState::Unindexed)
    }

    /// Mark a file dirty ahead of reindexing — called by the Reconciler the
    /// moment it observes a change, before the Parser Facade has caught up.
    pub fn mark_dirty(&self, file_id: FileId) {
        let mut inner = self.inner.lock().unwrap();
        inner.files.insert(file_id, FreshnessState::Dirty);
    }

    pub fn mark_stale(&self, file_id: FileId) {
        let mut inner = self.inner.lock().unwrap();
        inner.files.insert(file_id, FreshnessState::Stale);
    }

    /// Commit a reindex pass: mark every file in `clean_files` `CLEAN`,
    /// advance the epoch, and wake every blocked reader. This is the single
    /// point that "publishes" an epoch (§4.5 steps a-c performed atomically
    /// under the lock).
    pub fn publish(&self, clean_files: &[FileId]) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        for file_id in clean_files {
            inner.files.insert(*file_id, FreshnessState::Clean);
        }
        inner.epoch_id += 1;
        let epoch = inner.epoch_id;
        drop(inner);
        self.condvar.notify_all();
        epoch
    }

    /// Block until every file in `file_ids` is `CLEAN` at or after
    /// `admitted_epoch`, or `timeout` elapses. Returns `Ok(epoch)` on
    /// success, `Err(())` on timeout — callers map that to `InternalTimeout`.
    pub fn wait_clean(&self, file_ids: &[FileId], admitted_epoch: i64, timeout: Duration) -> Result<i64, ()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            let all_clean = inner.epoch_id >= admitted_epoch
                && file_ids.iter().all(|id| matches!(inner.files.get(id), Some(FreshnessState::Clean)));
            if all_clean {
                return Ok(inner.epoch_id);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(());
            }
            let (guard, timeout_result) = self.condvar.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if timeout_result.timed_out() {
                let all_clean_final = file_ids.iter().all(|id| matches!(inner.files.get(id), Some(FreshnessState::Clean)));
                if all_clean_final {
                    return Ok(inner.epoch_id);
                }
                return Err(());
            }
        }
    }

    /// Snapshot of files not yet `CLEAN`, for building `suggested_refresh_scope`.
    pub fn not_clean(&self, file_ids: &[FileId]) -> Vec<FileId> {
        let inner = self.inner.lock().unwrap();
        file_ids
            .iter()
            .copied()
            .filter(|id| !matches!(inner.files.get(id), Some(FreshnessState::Clean)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fresh_file_is_unindexed() {
        let pub_ = EpochPublisher::new();
        assert_eq!(pub_.state_of(FileId(1)), FreshnessState::Unindexed);
    }

    #[test]
    fn publish_marks_clean_and_advances_epoch() {
        let pub_ = EpochPublisher::new();
        pub_.mark_dirty(FileId(1));
        let epoch = pub_.publish(&[FileId(1)]);
        assert_eq!(epoch, 1);
        assert_eq!(pub_.state_of(FileId(1)), FreshnessState::Clean);
    }

    #[test]
    fn wait_clean_times_out_without_publish() {
        let pub_ = EpochPublisher::new();
        pub_.mark_dirty(FileId(1));
        let result = pub_.wait_clean(&[FileId(1)], 1, Duration::from_millis(20));
        assert!(result.is_err());
    }

    #[test]
    fn wait_clean_unblocks_on_publish_from_another_thread() {
        let pub_ = Arc::new(EpochPublisher::new());
        pub_.mark_dirty(FileId(1));
        let writer = Arc::clone(&pub_);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.publish(&[FileId(1)]);
        });
        let result = pub_.wait_clean(&[FileId(1)], 1, Duration::from_secs(2));
        handle.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn not_clean_lists_only_unclean_files() {
        let pub_ = EpochPublisher::new();
        pub_.mark_dirty(FileId(1));
        pub_.publish(&[FileId(1)]);
        pub_.mark_dirty(FileId(2));
        assert_eq!(pub_.not_clean(&[FileId(1), FileId(2)]), vec![FileId(2)]);
    }
}
