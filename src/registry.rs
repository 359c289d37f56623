use crate::model::{Task, TaskStatus};
use log::{debug, warn};
use std::collections::HashMap;

/// Result of applying one `update` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Changed { previous: TaskStatus },
    /// The update would have moved the task out of a terminal state.
    Rejected { current: TaskStatus },
}

impl Applied {
    pub fn took_effect(self) -> bool {
        !matches!(self, Applied::Rejected { .. })
    }
}

/// Client-side view of every task the backend knows about, keyed by task id.
/// Only protocol events mutate it.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Task>,
    synced: bool,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_snapshot(&mut self, tasks: Vec<Task>) {
        self.tasks = tasks
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();
        self.synced = true;
        debug!("Task registry resynced with {} task(s)", self.tasks.len());
    }

    pub fn apply_update(&mut self, task: Task) -> Applied {
        match self.tasks.get_mut(&task.id) {
            None => {
                self.tasks.insert(task.id.clone(), task);
                Applied::Created
            }
            Some(existing) => {
                let previous = existing.status;
                if !previous.can_transition_to(task.status) {
                    warn!(
                        "Dropping update for task {}: it already ended as {}, not {}",
                        task.id,
                        previous.slug(),
                        task.status.slug()
                    );
                    return Applied::Rejected { current: previous };
                }
                *existing = task;
                Applied::Changed { previous }
            }
        }
    }

    pub fn apply_remove(&mut self, id: &str) -> Option<Task> {
        let removed = self.tasks.remove(id);
        if removed.is_none() {
            debug!("Remove for unknown task {id} ignored");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn in_flight(&self) -> Vec<Task> {
        self.tasks()
            .into_iter()
            .filter(|task| task.is_in_flight())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// False between a channel drop and the next snapshot.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn mark_unsynced(&mut self) {
        self.synced = false;
    }
}
