use crate::{
    api::{
        AdoptionAnalysis, AdoptionTarget, CommandAck, CommandApi, CommandError, DownloadRequest,
        FinalizeAdoptionRequest, ManagedInstallation, RepairRequest, UiInstallRequest,
        UiTaskResponse,
    },
    autoconfig::{self, Activation, PendingActivations},
    catalog::CatalogService,
    channel::ChannelEvent,
    model::{ServerEvent, Task, TaskKind},
    registry::{Applied, TaskRegistry},
};
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc::UnboundedReceiver};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no task with id {0}")]
    UnknownTask(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected { reason: String },
}

/// Change notifications for whatever renders the task list.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackerEvent {
    Connection(ConnectionState),
    Snapshot(Vec<Task>),
    Updated(Task),
    Removed(String),
    /// The set of managed UI installations may have changed.
    InstallationsChanged,
}

#[derive(Debug, Default)]
struct TrackerState {
    registry: TaskRegistry,
    activations: PendingActivations,
    origins: HashMap<String, TaskKind>,
}

impl TrackerState {
    /// Kind recorded when this client created the task wins over the decoded
    /// one; a download keeps the decoded kind since only the wire carries its
    /// target path. The installation id is settled against the final kind.
    fn reconcile(&self, mut task: Task) -> Task {
        if let Some(recorded) = self.origins.get(&task.id) {
            let both_downloads = matches!(
                (recorded, &task.kind),
                (TaskKind::Download { .. }, TaskKind::Download { .. })
            );
            if !both_downloads && *recorded != task.kind {
                debug!(
                    "Task {} reported as {}, tracking it as {}",
                    task.id,
                    task.kind.label(),
                    recorded.label()
                );
                task.kind = recorded.clone();
            }
        }
        task.settle_installation_id();
        task
    }

    /// Replaces the registry and drops bookkeeping for tasks the backend no
    /// longer reports. Ids this client created but has not seen yet are kept.
    fn apply_snapshot(&mut self, downloads: Vec<Task>) -> Vec<Activation> {
        let previous = self.registry.ids();
        let downloads: Vec<Task> = downloads
            .into_iter()
            .map(|task| self.reconcile(task))
            .collect();
        let activations: Vec<Activation> = downloads
            .iter()
            .filter_map(|task| self.activations.on_task(task))
            .collect();
        self.registry.apply_snapshot(downloads);

        for id in previous {
            if self.registry.contains(&id) {
                continue;
            }
            self.origins.remove(&id);
            if self.activations.take(&id).is_some() {
                debug!("Task {id} vanished while disconnected; dropping pending activation");
            }
        }
        activations
    }

    fn forget(&mut self, task_id: &str) -> Option<Task> {
        self.origins.remove(task_id);
        if self.activations.take(task_id).is_some() {
            debug!("Discarded pending activation for task {task_id}");
        }
        self.registry.apply_remove(task_id)
    }
}

/// Applies task channel events to the registry one at a time and issues
/// commands against the backend. The registry never changes because of a
/// command result alone; the only exception is a confirmed dismiss.
pub struct TaskTracker {
    api: Arc<dyn CommandApi>,
    catalog: Arc<CatalogService>,
    state: Mutex<TrackerState>,
    events: broadcast::Sender<TrackerEvent>,
}

impl TaskTracker {
    pub fn new(api: Arc<dyn CommandApi>, catalog: Arc<CatalogService>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            api,
            catalog,
            state: Mutex::new(TrackerState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.lock_state().registry.get(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock_state().registry.tasks()
    }

    pub fn in_flight(&self) -> Vec<Task> {
        self.lock_state().registry.in_flight()
    }

    pub fn is_synced(&self) -> bool {
        self.lock_state().registry.is_synced()
    }

    pub fn pending_activations(&self) -> usize {
        self.lock_state().activations.len()
    }

    /// Consumes channel events until every sender is gone.
    pub async fn pump(&self, mut events: UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!("Task channel event stream ended");
    }

    pub async fn handle(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                self.lock_state().registry.mark_unsynced();
                self.publish(TrackerEvent::Connection(ConnectionState::Connected));
            }
            ChannelEvent::Disconnected { reason } => {
                self.lock_state().registry.mark_unsynced();
                self.publish(TrackerEvent::Connection(ConnectionState::Disconnected {
                    reason,
                }));
            }
            ChannelEvent::Message(ServerEvent::InitialState { downloads }) => {
                self.apply_snapshot(downloads).await;
            }
            ChannelEvent::Message(ServerEvent::Update { data }) => {
                self.apply_update(data).await;
            }
            ChannelEvent::Message(ServerEvent::Remove { download_id }) => {
                let removed = self.lock_state().forget(&download_id);
                if removed.is_some() {
                    self.publish(TrackerEvent::Removed(download_id));
                }
            }
        }
    }

    async fn apply_snapshot(&self, downloads: Vec<Task>) {
        let (tasks, activations) = {
            let mut state = self.lock_state();
            let activations = state.apply_snapshot(downloads);
            (state.registry.tasks(), activations)
        };

        info!("Task snapshot received with {} task(s)", tasks.len());
        self.publish(TrackerEvent::Snapshot(tasks));
        for activation in activations {
            self.activate(activation).await;
        }
    }

    async fn apply_update(&self, task: Task) {
        let (task, activation, ended_ui_task) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let task = state.reconcile(task);
            let outcome = state.registry.apply_update(task.clone());
            let newly_terminal = match outcome {
                Applied::Rejected { .. } => return,
                Applied::Created => task.is_terminal(),
                Applied::Changed { previous } => !previous.is_terminal() && task.is_terminal(),
            };
            if newly_terminal {
                debug!("Task {} finished as {}", task.id, task.status.slug());
            }
            let activation = state.activations.on_task(&task);
            let ended_ui_task = newly_terminal && task.kind.is_ui_task();
            (task, activation, ended_ui_task)
        };

        self.publish(TrackerEvent::Updated(task));
        if let Some(activation) = activation {
            self.activate(activation).await;
        }
        if ended_ui_task {
            self.publish(TrackerEvent::InstallationsChanged);
        }
    }

    /// Issues the follow-up configuration update. Failures are logged and
    /// never touch the task.
    async fn activate(&self, activation: Activation) {
        let Some(update) = autoconfig::configuration_for(&activation, &self.catalog) else {
            return;
        };
        match self.api.update_configuration(&update).await {
            Ok(()) => {
                info!(
                    "Installation {} is now the active {} UI",
                    activation.installation_id, activation.ui_name
                );
                self.publish(TrackerEvent::InstallationsChanged);
            }
            Err(err) => warn!(
                "Failed to activate installation {} after task {}: {err}",
                activation.installation_id, activation.task_id
            ),
        }
    }

    pub async fn start_download(&self, request: &DownloadRequest) -> Result<String, TrackerError> {
        let task_id = self.api.start_download(request).await?;
        let kind = TaskKind::Download {
            repo_id: request.repo_id.clone(),
            target_path: None,
        };
        self.track_created(&task_id, kind, None).await;
        info!("Queued download {} as task {task_id}", request.filename);
        Ok(task_id)
    }

    pub async fn install_ui(
        &self,
        request: &UiInstallRequest,
    ) -> Result<UiTaskResponse, TrackerError> {
        let response = self.api.install_ui(request).await?;
        let activate_as = response
            .set_as_active_on_completion
            .then_some(request.ui_name.as_str());
        self.track_created(&response.task_id, TaskKind::Install, activate_as)
            .await;
        info!(
            "Installing {} as task {}",
            request.display_name, response.task_id
        );
        Ok(response)
    }

    /// Starts a managed installation. The returned task id is the process
    /// handle used to stop it.
    pub async fn run_ui(&self, installation_id: &str) -> Result<String, TrackerError> {
        let task_id = self.api.run_ui(installation_id).await?;
        self.track_created(&task_id, TaskKind::Process, None).await;
        Ok(task_id)
    }

    pub async fn repair_ui(&self, request: &RepairRequest) -> Result<UiTaskResponse, TrackerError> {
        let response = self.api.repair_adoption(request).await?;
        let activate_as = response
            .set_as_active_on_completion
            .then_some(request.ui_name.as_str());
        self.track_created(&response.task_id, TaskKind::Repair, activate_as)
            .await;
        Ok(response)
    }

    pub async fn analyze_adoption(
        &self,
        target: &AdoptionTarget,
    ) -> Result<AdoptionAnalysis, TrackerError> {
        Ok(self.api.analyze_adoption(target).await?)
    }

    pub async fn finalize_adoption(
        &self,
        request: &FinalizeAdoptionRequest,
    ) -> Result<ManagedInstallation, TrackerError> {
        let installation = self.api.finalize_adoption(request).await?;
        info!(
            "Adopted {} at {} as installation {}",
            installation.ui_name, installation.install_path, installation.installation_id
        );
        self.publish(TrackerEvent::InstallationsChanged);
        Ok(installation)
    }

    pub async fn delete_ui(&self, installation_id: &str) -> Result<(), TrackerError> {
        self.api.delete_ui(installation_id).await?;
        self.publish(TrackerEvent::InstallationsChanged);
        Ok(())
    }

    /// Asks the backend to stop a task. The local entry is left alone; the
    /// resulting `cancelled` (or `completed`, if the cancel lost the race)
    /// arrives over the channel.
    pub async fn cancel(&self, task_id: &str) -> Result<CommandAck, TrackerError> {
        let kind = {
            let state = self.lock_state();
            state
                .origins
                .get(task_id)
                .cloned()
                .or_else(|| state.registry.get(task_id).map(|task| task.kind.clone()))
        };
        let Some(kind) = kind else {
            return Err(TrackerError::UnknownTask(task_id.to_string()));
        };

        let ack = match kind {
            TaskKind::Download { .. } => self.api.cancel_download(task_id).await?,
            TaskKind::Install | TaskKind::Repair | TaskKind::Adoption => {
                self.api.cancel_ui_task(task_id).await?
            }
            TaskKind::Process => self.api.stop_ui(task_id).await?,
        };
        debug!("Cancel of {} task {task_id} accepted", kind.label());
        Ok(ack)
    }

    /// Stops a running UI. `task_id` is the process handle from `run_ui`,
    /// which need not be in the registry yet.
    pub async fn stop(&self, task_id: &str) -> Result<CommandAck, TrackerError> {
        Ok(self.api.stop_ui(task_id).await?)
    }

    /// Removes a task from the backend and, once confirmed, from the local
    /// registry. Ids this client does not know are forwarded best-effort and
    /// never fail.
    pub async fn dismiss(&self, task_id: &str) -> Result<(), TrackerError> {
        let known = {
            let state = self.lock_state();
            state.registry.contains(task_id) || state.origins.contains_key(task_id)
        };

        if let Err(err) = self.api.dismiss(task_id).await {
            if !known {
                debug!("Dismiss of unknown task {task_id} failed: {err}");
                return Ok(());
            }
            warn!("Failed to dismiss task {task_id}: {err}");
            return Err(err.into());
        }

        let removed = self.lock_state().forget(task_id);
        if removed.is_some() {
            self.publish(TrackerEvent::Removed(task_id.to_string()));
        }
        Ok(())
    }

    async fn track_created(&self, task_id: &str, kind: TaskKind, activate_as: Option<&str>) {
        let activation = {
            let mut guard = self.lock_state();
            let TrackerState {
                registry,
                activations,
                origins,
            } = &mut *guard;
            origins.insert(task_id.to_string(), kind);
            match activate_as {
                Some(ui_name) => {
                    activations.register(task_id, ui_name);
                    // The completion may have arrived before this response.
                    registry
                        .get(task_id)
                        .and_then(|task| activations.on_task(task))
                }
                None => None,
            }
        };
        if let Some(activation) = activation {
            self.activate(activation).await;
        }
    }

    fn publish(&self, event: TrackerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
