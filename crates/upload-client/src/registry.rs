use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::task::{TaskSnapshot, UploadTask};

/// Upload tasks keyed by `file_id`.
///
/// Owned by one orchestrator; two orchestrators never see each other's
/// tasks.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<UploadTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, task: Arc<UploadTask>) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.file_id().to_string(), task);
    }

    pub fn get(&self, file_id: &str) -> Option<Arc<UploadTask>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(file_id)
            .cloned()
    }

    /// Drops a task from the registry. Its run, if any, keeps going.
    pub fn remove(&self, file_id: &str) -> Option<Arc<UploadTask>> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(file_id)
    }

    /// Snapshots of every task, ordered by file id.
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|t| t.snapshot())
            .collect();
        all.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        all
    }

    pub fn len(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::types::TaskStatus;
    use chunkline_transfer::ChunkLayout;

    fn task(file_id: &str) -> Arc<UploadTask> {
        Arc::new(UploadTask::new(
            file_id.into(),
            Arc::new(MemorySource::new("a", vec![1u8; 4])),
            "a".into(),
            "text/plain".into(),
            None,
            ChunkLayout::new(4, 2).unwrap(),
            None,
            TaskStatus::Queued,
        ))
    }

    #[test]
    fn registries_are_independent() {
        let a = TaskRegistry::new();
        let b = TaskRegistry::new();
        a.insert(task("f1"));
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert!(b.get("f1").is_none());
    }

    #[test]
    fn snapshots_are_sorted_and_remove_works() {
        let reg = TaskRegistry::new();
        reg.insert(task("f2"));
        reg.insert(task("f1"));
        let ids: Vec<String> = reg.snapshots().into_iter().map(|s| s.file_id).collect();
        assert_eq!(ids, vec!["f1", "f2"]);

        assert!(reg.remove("f1").is_some());
        assert!(reg.remove("f1").is_none());
        assert_eq!(reg.len(), 1);
    }
}
