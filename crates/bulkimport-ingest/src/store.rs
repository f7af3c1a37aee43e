//! User storage
//!
//! The pipeline only needs to append validated records and read them back,
//! so storage sits behind the small [`UserStore`] trait. The current backing
//! is [`InMemoryUserStore`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::models::UserRecord;

/// Append-only destination for validated users
pub trait UserStore: Send + Sync {
    /// Append `records` in order, returning how many were stored
    fn append(&self, records: Vec<UserRecord>) -> usize;

    /// Copy of everything stored so far, in append order
    fn snapshot(&self) -> Vec<UserRecord>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutex-guarded vector of records
///
/// Cloning shares the underlying storage. Duplicate ids are kept as-is.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserStore {
    records: Arc<Mutex<Vec<UserRecord>>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Poisoning is ignored: extend never exposes a partially built record.
    fn lock(&self) -> MutexGuard<'_, Vec<UserRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UserStore for InMemoryUserStore {
    fn append(&self, records: Vec<UserRecord>) -> usize {
        let count = records.len();
        if count == 0 {
            return 0;
        }

        let mut stored = self.lock();
        stored.extend(records);
        debug!(appended = count, total = stored.len(), "Appended users to store");
        count
    }

    fn snapshot(&self) -> Vec<UserRecord> {
        self.lock().clone()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserRecord {
        UserRecord {
            id: id.to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            email: format!("user{id}@example.com"),
        }
    }

    #[test]
    fn test_append_and_snapshot() {
        let store = InMemoryUserStore::new();
        assert!(store.is_empty());

        assert_eq!(store.append(vec![user("1"), user("2")]), 2);
        assert_eq!(store.append(Vec::new()), 0);
        assert_eq!(store.append(vec![user("3")]), 1);

        let ids: Vec<String> = store.snapshot().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_duplicate_ids_are_kept() {
        let store = InMemoryUserStore::new();
        store.append(vec![user("1")]);
        store.append(vec![user("1")]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let store = InMemoryUserStore::new();
        store.append(vec![user("1")]);
        let before = store.snapshot();
        store.append(vec![user("2")]);
        assert_eq!(before.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends() {
        let store = InMemoryUserStore::new();
        let mut handles = Vec::new();

        for task in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..50 {
                    store.append(vec![user(&format!("{task}-{n}"))]);
                    tokio::task::yield_now().await;
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 16 * 50);

        // Each task's own records keep their relative order
        let task_three: Vec<String> = snapshot
            .iter()
            .filter(|u| u.id.starts_with("3-"))
            .map(|u| u.id.clone())
            .collect();
        let expected: Vec<String> = (0..50).map(|n| format!("3-{n}")).collect();
        assert_eq!(task_three, expected);
    }
}
