use crate::{
    api::ConfigurationUpdate,
    catalog::CatalogService,
    model::{Task, TaskStatus},
};
use log::{debug, warn};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingActivation {
    pub task_id: String,
    pub ui_name: String,
}

/// A completed install/repair whose installation should become the active UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Activation {
    pub task_id: String,
    pub ui_name: String,
    pub installation_id: String,
}

/// Install and repair tasks flagged "set as active on completion".
#[derive(Debug, Default)]
pub struct PendingActivations {
    pending: HashMap<String, PendingActivation>,
}

impl PendingActivations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_id: impl Into<String>, ui_name: impl Into<String>) {
        let task_id = task_id.into();
        let ui_name = ui_name.into();
        debug!("Task {task_id} will activate its {ui_name} installation on completion");
        self.pending
            .insert(task_id.clone(), PendingActivation { task_id, ui_name });
    }

    /// Check-and-remove in one step. A second call for the same id yields
    /// `None`, which is what keeps the trigger at-most-once.
    pub fn take(&mut self, task_id: &str) -> Option<PendingActivation> {
        self.pending.remove(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.pending.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Evaluates a task as seen by the registry. Any terminal status consumes
    /// the pending entry; only `completed` with an installation id fires.
    pub fn on_task(&mut self, task: &Task) -> Option<Activation> {
        if !task.is_terminal() {
            return None;
        }
        let entry = self.take(&task.id)?;
        match (task.status, task.installation_id.as_ref()) {
            (TaskStatus::Completed, Some(installation_id)) => Some(Activation {
                task_id: entry.task_id,
                ui_name: entry.ui_name,
                installation_id: installation_id.clone(),
            }),
            (TaskStatus::Completed, None) => {
                warn!(
                    "Task {} completed without an installation id; {} will not be activated",
                    task.id, entry.ui_name
                );
                None
            }
            (status, _) => {
                debug!(
                    "Task {} ended as {}; dropping pending activation",
                    task.id,
                    status.slug()
                );
                None
            }
        }
    }
}

/// Builds the configuration update for an activation, or `None` when the
/// catalog has no usable profile for the UI.
pub fn configuration_for(
    activation: &Activation,
    catalog: &CatalogService,
) -> Option<ConfigurationUpdate> {
    match catalog.profile_hint(&activation.ui_name) {
        Ok(profile) => Some(ConfigurationUpdate {
            ui_profile: Some(profile),
            active_ui_installation_id: Some(activation.installation_id.clone()),
        }),
        Err(err) => {
            warn!(
                "Not activating installation {} from task {}: {err}",
                activation.installation_id, activation.task_id
            );
            None
        }
    }
}
