use std::collections::HashMap;
use std::sync::Mutex;

use petgraph::graph::NodeIndex;

use super::queue::TaskId;

/// What a memoized task produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Identity {
    Node(NodeIndex),
    Pattern(String),
    /// Canonical form of a resource descriptor.
    Resource(String),
}

/// Task cache guaranteeing one task per identity for the whole run.
#[derive(Debug, Default)]
pub(crate) struct TaskCache {
    tasks: Mutex<HashMap<Identity, TaskId>>,
}

impl TaskCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, identity: &Identity) -> Option<TaskId> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(identity)
            .copied()
    }

    /// Returns the task registered for `identity`, creating it with
    /// `factory` on first request. The lock is held across the factory, so
    /// concurrent requesters always observe the same task.
    pub(crate) fn get_or_insert_with(
        &self,
        identity: Identity,
        factory: impl FnOnce() -> TaskId,
    ) -> TaskId {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        *tasks.entry(identity).or_insert_with(factory)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn factory_runs_once_per_identity() {
        let memo = Arc::new(TaskCache::new());
        let created = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let memo = memo.clone();
                let created = created.clone();
                std::thread::spawn(move || {
                    memo.get_or_insert_with(Identity::Pattern("TOOL".into()), || {
                        created.fetch_add(1, Ordering::SeqCst)
                    })
                })
            })
            .collect();

        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|&id| id == ids[0]));

        let other = memo.get_or_insert_with(Identity::Resource("file:x".into()), || 7);
        assert_eq!(other, 7);
        assert_eq!(memo.len(), 2);
        assert_eq!(memo.get(&Identity::Resource("file:x".into())), Some(7));
    }
}
