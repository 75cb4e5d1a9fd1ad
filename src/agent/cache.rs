use std::sync::Arc;

use parking_lot::Mutex;

use crate::proto::ProbeTask;

/// Latest peer list received from the control plane.
///
/// A replace swaps in a new immutable slice; snapshots handed out earlier
/// keep the slice they were taken from.
#[derive(Clone, Default)]
pub struct TaskCache {
    tasks: Arc<Mutex<Arc<[ProbeTask]>>>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards the current list and installs `tasks`.
    pub fn replace(&self, tasks: Vec<ProbeTask>) {
        let tasks: Arc<[ProbeTask]> = tasks.into();
        *self.tasks.lock() = tasks;
    }

    pub fn snapshot(&self) -> Arc<[ProbeTask]> {
        Arc::clone(&self.tasks.lock())
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(source: &str, count: usize) -> Vec<ProbeTask> {
        (0..count)
            .map(|i| ProbeTask::new(source, format!("10.0.1.{i}")))
            .collect()
    }

    #[test]
    fn test_replace_overwrites() {
        let cache = TaskCache::new();
        assert!(cache.is_empty());

        cache.replace(peers("a", 3));
        cache.replace(peers("b", 1));

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].ip1, "b");
    }

    #[test]
    fn test_snapshot_unaffected_by_later_replace() {
        let cache = TaskCache::new();
        cache.replace(peers("a", 4));

        let before = cache.snapshot();
        cache.replace(Vec::new());

        assert_eq!(before.len(), 4);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_replaces_leave_one_whole_list() {
        let cache = TaskCache::new();

        std::thread::scope(|scope| {
            for writer in 0..50 {
                let cache = cache.clone();
                scope.spawn(move || {
                    cache.replace(peers(&format!("w{writer}"), 1 + writer % 7));
                });
            }
        });

        let snapshot = cache.snapshot();
        let source = &snapshot[0].ip1;
        let writer: usize = source[1..].parse().expect("writer id");

        assert_eq!(snapshot.len(), 1 + writer % 7);
        assert!(snapshot.iter().all(|t| &t.ip1 == source));
    }
}
