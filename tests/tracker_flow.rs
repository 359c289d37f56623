use async_trait::async_trait;
use mal_client::{
    api::{
        AdoptionAnalysis, AdoptionTarget, CommandAck, CommandApi, CommandError,
        ConfigurationUpdate, DownloadRequest, FinalizeAdoptionRequest, ManagedInstallation,
        ModelSource, RepairRequest, UiInstallRequest, UiTaskResponse,
    },
    catalog::{AvailableUi, CatalogService, UiCatalog},
    channel::ChannelEvent,
    model::{ModelType, NoticeTone, ServerEvent, TaskKind, TaskStatus},
    tracker::{TaskTracker, TrackerError, TrackerEvent},
};
use serde_json::json;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::sync::broadcast;

#[derive(Default)]
struct FakeBackend {
    calls: Mutex<Vec<String>>,
    configs: Mutex<Vec<ConfigurationUpdate>>,
    fail_dismiss: AtomicBool,
    fail_config: AtomicBool,
}

impl FakeBackend {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn configs(&self) -> Vec<ConfigurationUpdate> {
        self.configs.lock().unwrap().clone()
    }

    fn ack() -> CommandAck {
        CommandAck {
            success: true,
            message: "ok".to_string(),
        }
    }
}

#[async_trait]
impl CommandApi for FakeBackend {
    async fn start_download(&self, request: &DownloadRequest) -> Result<String, CommandError> {
        request.validate()?;
        self.record(format!("start_download:{}", request.filename));
        Ok("d1".to_string())
    }

    async fn cancel_download(&self, task_id: &str) -> Result<CommandAck, CommandError> {
        self.record(format!("cancel_download:{task_id}"));
        Ok(Self::ack())
    }

    async fn dismiss(&self, task_id: &str) -> Result<(), CommandError> {
        self.record(format!("dismiss:{task_id}"));
        if self.fail_dismiss.load(Ordering::SeqCst) {
            return Err(CommandError::Server {
                status: 500,
                message: "database locked".to_string(),
            });
        }
        Ok(())
    }

    async fn install_ui(&self, request: &UiInstallRequest) -> Result<UiTaskResponse, CommandError> {
        self.record(format!("install_ui:{}", request.ui_name));
        Ok(UiTaskResponse {
            task_id: "i1".to_string(),
            set_as_active_on_completion: request.set_as_active,
        })
    }

    async fn run_ui(&self, installation_id: &str) -> Result<String, CommandError> {
        self.record(format!("run_ui:{installation_id}"));
        Ok("p1".to_string())
    }

    async fn stop_ui(&self, task_id: &str) -> Result<CommandAck, CommandError> {
        self.record(format!("stop_ui:{task_id}"));
        Ok(Self::ack())
    }

    async fn cancel_ui_task(&self, task_id: &str) -> Result<CommandAck, CommandError> {
        self.record(format!("cancel_ui_task:{task_id}"));
        Ok(Self::ack())
    }

    async fn delete_ui(&self, installation_id: &str) -> Result<(), CommandError> {
        self.record(format!("delete_ui:{installation_id}"));
        Ok(())
    }

    async fn analyze_adoption(
        &self,
        target: &AdoptionTarget,
    ) -> Result<AdoptionAnalysis, CommandError> {
        self.record(format!("analyze_adoption:{}", target.path));
        Ok(AdoptionAnalysis {
            is_adoptable: true,
            is_healthy: true,
            issues: Vec::new(),
            detected_version: None,
        })
    }

    async fn repair_adoption(
        &self,
        request: &RepairRequest,
    ) -> Result<UiTaskResponse, CommandError> {
        self.record(format!("repair_adoption:{}", request.path));
        Ok(UiTaskResponse {
            task_id: "r1".to_string(),
            set_as_active_on_completion: request.set_as_active,
        })
    }

    async fn finalize_adoption(
        &self,
        request: &FinalizeAdoptionRequest,
    ) -> Result<ManagedInstallation, CommandError> {
        self.record(format!("finalize_adoption:{}", request.path));
        Ok(ManagedInstallation {
            installation_id: "adopted1".to_string(),
            ui_name: request.ui_name.clone(),
            display_name: request.display_name.clone(),
            install_path: request.path.clone(),
            port: None,
        })
    }

    async fn update_configuration(&self, update: &ConfigurationUpdate) -> Result<(), CommandError> {
        self.record("update_configuration".to_string());
        if self.fail_config.load(Ordering::SeqCst) {
            return Err(CommandError::Server {
                status: 503,
                message: "config unavailable".to_string(),
            });
        }
        self.configs.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn available_uis(&self) -> Result<Vec<AvailableUi>, CommandError> {
        Ok(Vec::new())
    }
}

fn catalog() -> Arc<CatalogService> {
    Arc::new(CatalogService::from_catalog(UiCatalog {
        catalog_version: 1,
        uis: vec![AvailableUi {
            ui_name: "ComfyUI".to_string(),
            display_name: "ComfyUI".to_string(),
            git_url: None,
            default_profile_name: Some("ComfyUI".to_string()),
        }],
    }))
}

fn setup() -> (Arc<FakeBackend>, TaskTracker) {
    let backend = Arc::new(FakeBackend::default());
    let tracker = TaskTracker::new(backend.clone(), catalog());
    (backend, tracker)
}

fn frame(value: serde_json::Value) -> ChannelEvent {
    ChannelEvent::Message(ServerEvent::parse(&value.to_string()).unwrap())
}

fn update(id: &str, repo_id: &str, status: &str, progress: f64) -> ChannelEvent {
    frame(json!({
        "type": "update",
        "data": {
            "download_id": id,
            "filename": "model.safetensors",
            "repo_id": repo_id,
            "status": status,
            "progress": progress,
        }
    }))
}

fn completed_install(id: &str, installation_id: &str) -> ChannelEvent {
    frame(json!({
        "type": "update",
        "data": {
            "download_id": id,
            "filename": "ComfyUI",
            "repo_id": "UI Installation",
            "status": "completed",
            "progress": 100,
            "installation_id": installation_id,
        }
    }))
}

fn install_request(ui_name: &str) -> UiInstallRequest {
    UiInstallRequest {
        ui_name: ui_name.to_string(),
        display_name: format!("{ui_name} (managed)"),
        install_path: None,
        port: None,
        set_as_active: true,
    }
}

fn drain(events: &mut broadcast::Receiver<TrackerEvent>) -> Vec<TrackerEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn download_lifecycle_from_request_to_dismiss() {
    let (backend, tracker) = setup();
    let mut events = tracker.subscribe();

    let request = DownloadRequest::new(
        ModelSource::HuggingFace,
        "org/model",
        "model.safetensors",
        ModelType::Checkpoints,
    );
    let task_id = tracker.start_download(&request).await.unwrap();
    assert_eq!(task_id, "d1");
    assert!(tracker.task("d1").is_none());

    tracker.handle(update("d1", "org/model", "pending", 0.0)).await;
    tracker.handle(update("d1", "org/model", "downloading", 50.0)).await;
    let task = tracker.task("d1").unwrap();
    assert_eq!(task.status, TaskStatus::Downloading);
    assert_eq!(task.progress, 50.0);

    tracker.handle(update("d1", "org/model", "completed", 100.0)).await;
    let task = tracker.task("d1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.notice().unwrap().tone, NoticeTone::Success);

    tracker.dismiss("d1").await.unwrap();
    assert!(tracker.task("d1").is_none());
    assert_eq!(
        backend.calls(),
        vec!["start_download:model.safetensors", "dismiss:d1"]
    );

    let seen = drain(&mut events);
    assert_eq!(seen.len(), 4);
    assert_eq!(seen.last(), Some(&TrackerEvent::Removed("d1".to_string())));
}

#[tokio::test]
async fn invalid_download_request_creates_nothing() {
    let (backend, tracker) = setup();
    let request = DownloadRequest::new(
        ModelSource::HuggingFace,
        "org/model",
        "",
        ModelType::Loras,
    );
    let err = tracker.start_download(&request).await.unwrap_err();
    assert!(matches!(err, TrackerError::Command(ref inner) if inner.is_validation()));
    assert!(backend.calls().is_empty());
    assert!(tracker.tasks().is_empty());
}

#[tokio::test]
async fn cancel_waits_for_confirmation_and_never_reverts() {
    let (backend, tracker) = setup();
    tracker.handle(update("d1", "org/model", "downloading", 10.0)).await;

    tracker.cancel("d1").await.unwrap();
    assert_eq!(backend.calls(), vec!["cancel_download:d1"]);
    assert_eq!(tracker.task("d1").unwrap().status, TaskStatus::Downloading);

    tracker.handle(update("d1", "org/model", "cancelled", 10.0)).await;
    assert_eq!(tracker.task("d1").unwrap().status, TaskStatus::Cancelled);

    tracker.handle(update("d1", "org/model", "downloading", 20.0)).await;
    tracker.handle(update("d1", "org/model", "completed", 100.0)).await;
    let task = tracker.task("d1").unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.progress, 10.0);
}

#[tokio::test]
async fn cancel_routes_by_task_kind() {
    let (backend, tracker) = setup();
    tracker.install_ui(&install_request("ComfyUI")).await.unwrap();
    let process = tracker.run_ui("inst-9").await.unwrap();
    assert_eq!(process, "p1");

    tracker.cancel("i1").await.unwrap();
    tracker.cancel("p1").await.unwrap();
    assert_eq!(
        backend.calls(),
        vec![
            "install_ui:ComfyUI",
            "run_ui:inst-9",
            "cancel_ui_task:i1",
            "stop_ui:p1"
        ]
    );

    let err = tracker.cancel("nope").await.unwrap_err();
    assert!(matches!(err, TrackerError::UnknownTask(id) if id == "nope"));

    tracker.stop("p-untracked").await.unwrap();
    assert_eq!(backend.calls().last().unwrap(), "stop_ui:p-untracked");
}

#[tokio::test]
async fn duplicate_completion_activates_installation_once() {
    let (backend, tracker) = setup();
    let mut events = tracker.subscribe();

    let response = tracker.install_ui(&install_request("ComfyUI")).await.unwrap();
    assert!(response.set_as_active_on_completion);
    assert_eq!(tracker.pending_activations(), 1);

    tracker.handle(update("i1", "UI Installation", "running", 40.0)).await;
    tracker.handle(completed_install("i1", "abc123")).await;
    tracker.handle(completed_install("i1", "abc123")).await;

    let configs = backend.configs();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].ui_profile.as_deref(), Some("ComfyUI"));
    assert_eq!(
        configs[0].active_ui_installation_id.as_deref(),
        Some("abc123")
    );
    assert_eq!(tracker.pending_activations(), 0);

    let task = tracker.task("i1").unwrap();
    assert_eq!(task.kind, TaskKind::Install);
    assert_eq!(task.installation_id.as_deref(), Some("abc123"));

    let changes = drain(&mut events)
        .into_iter()
        .filter(|event| *event == TrackerEvent::InstallationsChanged)
        .count();
    assert_eq!(changes, 2);
}

#[tokio::test]
async fn completion_before_response_still_activates() {
    let (backend, tracker) = setup();
    tracker.handle(completed_install("i1", "early1")).await;
    assert!(backend.configs().is_empty());

    tracker.install_ui(&install_request("ComfyUI")).await.unwrap();
    let configs = backend.configs();
    assert_eq!(configs.len(), 1);
    assert_eq!(
        configs[0].active_ui_installation_id.as_deref(),
        Some("early1")
    );
}

#[tokio::test]
async fn completion_seen_in_reconnect_snapshot_activates() {
    let (backend, tracker) = setup();
    tracker.handle(ChannelEvent::Connected).await;
    tracker.install_ui(&install_request("ComfyUI")).await.unwrap();
    tracker
        .handle(ChannelEvent::Disconnected {
            reason: "connection reset".to_string(),
        })
        .await;
    assert!(!tracker.is_synced());

    tracker.handle(ChannelEvent::Connected).await;
    tracker
        .handle(frame(json!({
            "type": "initial_state",
            "downloads": [{
                "download_id": "i1",
                "filename": "ComfyUI",
                "repo_id": "UI Installation",
                "status": "completed",
                "progress": 100,
                "installation_id": "snap1"
            }]
        })))
        .await;

    assert!(tracker.is_synced());
    assert_eq!(backend.configs().len(), 1);
    assert_eq!(tracker.tasks().len(), 1);
}

#[tokio::test]
async fn failed_install_does_not_activate() {
    let (backend, tracker) = setup();
    tracker.install_ui(&install_request("ComfyUI")).await.unwrap();
    tracker.handle(update("i1", "UI Installation", "error", 30.0)).await;
    tracker.handle(completed_install("i1", "late")).await;

    assert!(backend.configs().is_empty());
    assert_eq!(tracker.task("i1").unwrap().status, TaskStatus::Error);
    assert_eq!(tracker.pending_activations(), 0);
}

#[tokio::test]
async fn unknown_profile_skips_activation_without_failing_task() {
    let (backend, tracker) = setup();
    tracker.install_ui(&install_request("InvokeAI")).await.unwrap();
    tracker.handle(completed_install("i1", "inv1")).await;

    assert!(!backend.calls().contains(&"update_configuration".to_string()));
    assert_eq!(tracker.task("i1").unwrap().status, TaskStatus::Completed);
    assert_eq!(tracker.pending_activations(), 0);
}

#[tokio::test]
async fn configuration_failure_is_only_logged() {
    let (backend, tracker) = setup();
    backend.fail_config.store(true, Ordering::SeqCst);
    tracker.install_ui(&install_request("ComfyUI")).await.unwrap();
    tracker.handle(completed_install("i1", "abc123")).await;
    tracker.handle(completed_install("i1", "abc123")).await;

    let attempts = backend
        .calls()
        .iter()
        .filter(|call| *call == "update_configuration")
        .count();
    assert_eq!(attempts, 1);
    assert_eq!(tracker.task("i1").unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn failed_dismiss_keeps_task() {
    let (backend, tracker) = setup();
    tracker.handle(update("d1", "org/model", "completed", 100.0)).await;
    backend.fail_dismiss.store(true, Ordering::SeqCst);

    let err = tracker.dismiss("d1").await.unwrap_err();
    assert!(matches!(err, TrackerError::Command(CommandError::Server { status: 500, .. })));
    assert!(tracker.task("d1").is_some());
}

#[tokio::test]
async fn dismissing_unknown_task_never_errors() {
    let (backend, tracker) = setup();
    tracker.dismiss("ghost").await.unwrap();
    backend.fail_dismiss.store(true, Ordering::SeqCst);
    tracker.dismiss("ghost").await.unwrap();
    assert_eq!(backend.calls(), vec!["dismiss:ghost", "dismiss:ghost"]);
}

#[tokio::test]
async fn dismiss_discards_pending_activation() {
    let (backend, tracker) = setup();
    tracker.install_ui(&install_request("ComfyUI")).await.unwrap();
    tracker.handle(update("i1", "UI Installation", "running", 5.0)).await;
    tracker.dismiss("i1").await.unwrap();
    assert_eq!(tracker.pending_activations(), 0);

    tracker.handle(completed_install("i1", "abc123")).await;
    assert!(backend.configs().is_empty());
}

#[tokio::test]
async fn update_for_unknown_id_creates_task() {
    let (_backend, tracker) = setup();
    tracker.handle(update("zz", "org/other", "running", 0.0)).await;
    let task = tracker.task("zz").unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(tracker.in_flight().len(), 1);
}

#[tokio::test]
async fn remove_event_is_idempotent() {
    let (_backend, tracker) = setup();
    let mut events = tracker.subscribe();
    tracker.handle(update("d1", "org/model", "completed", 100.0)).await;
    let remove = frame(json!({"type": "remove", "download_id": "d1"}));
    tracker.handle(remove.clone()).await;
    tracker.handle(remove).await;

    assert!(tracker.tasks().is_empty());
    let removals = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, TrackerEvent::Removed(_)))
        .count();
    assert_eq!(removals, 1);
}

#[tokio::test]
async fn adoption_commands_report_installation_changes() {
    let (backend, tracker) = setup();
    let mut events = tracker.subscribe();
    let target = AdoptionTarget {
        ui_name: "ComfyUI".to_string(),
        path: "/opt/ComfyUI".to_string(),
    };
    let analysis = tracker.analyze_adoption(&target).await.unwrap();
    assert!(analysis.is_adoptable);

    let installation = tracker
        .finalize_adoption(&FinalizeAdoptionRequest {
            ui_name: "ComfyUI".to_string(),
            path: "/opt/ComfyUI".to_string(),
            display_name: "ComfyUI (adopted)".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(installation.installation_id, "adopted1");
    tracker.delete_ui("adopted1").await.unwrap();

    assert_eq!(
        drain(&mut events),
        vec![
            TrackerEvent::InstallationsChanged,
            TrackerEvent::InstallationsChanged
        ]
    );
    assert_eq!(backend.calls().len(), 3);
}

#[tokio::test]
async fn repair_is_tracked_as_repair_and_can_activate() {
    let (backend, tracker) = setup();
    let response = tracker
        .repair_ui(&RepairRequest {
            ui_name: "ComfyUI".to_string(),
            path: "/opt/ComfyUI".to_string(),
            display_name: "ComfyUI".to_string(),
            issues_to_fix: vec!["missing_venv".to_string()],
            set_as_active: true,
        })
        .await
        .unwrap();
    assert_eq!(response.task_id, "r1");

    tracker
        .handle(frame(json!({
            "type": "update",
            "data": {
                "download_id": "r1",
                "filename": "ComfyUI",
                "repo_id": "UI Repair",
                "status": "completed",
                "progress": 100,
                "installation_id": "fixed1"
            }
        })))
        .await;

    assert_eq!(tracker.task("r1").unwrap().kind, TaskKind::Repair);
    assert_eq!(
        backend.configs()[0].active_ui_installation_id.as_deref(),
        Some("fixed1")
    );

    tracker.cancel("r1").await.unwrap();
    assert!(backend.calls().contains(&"cancel_ui_task:r1".to_string()));
}

#[tokio::test]
async fn repair_under_unlabeled_repo_id_still_activates() {
    let (backend, tracker) = setup();
    tracker
        .repair_ui(&RepairRequest {
            ui_name: "ComfyUI".to_string(),
            path: "/opt/ComfyUI".to_string(),
            display_name: "ComfyUI".to_string(),
            issues_to_fix: Vec::new(),
            set_as_active: true,
        })
        .await
        .unwrap();

    tracker
        .handle(frame(json!({
            "type": "update",
            "data": {
                "download_id": "r1",
                "filename": "ComfyUI",
                "repo_id": "UI Adoption Repair",
                "status": "completed",
                "progress": 100,
                "installation_id": "abc123"
            }
        })))
        .await;

    let task = tracker.task("r1").unwrap();
    assert_eq!(task.kind, TaskKind::Repair);
    assert_eq!(task.installation_id.as_deref(), Some("abc123"));
    let configs = backend.configs();
    assert_eq!(configs.len(), 1);
    assert_eq!(
        configs[0].active_ui_installation_id.as_deref(),
        Some("abc123")
    );
}

#[tokio::test]
async fn install_moves_between_active_phases() {
    let (_backend, tracker) = setup();
    tracker.install_ui(&install_request("ComfyUI")).await.unwrap();

    let phase = |status: &str, progress: f64, text: &str| {
        frame(json!({
            "type": "update",
            "data": {
                "download_id": "i1",
                "filename": "ComfyUI",
                "repo_id": "UI Installation",
                "status": status,
                "progress": progress,
                "status_text": text
            }
        }))
    };
    tracker.handle(phase("downloading", 30.0, "Cloning")).await;
    tracker
        .handle(phase("running", 60.0, "Installing dependencies"))
        .await;

    let task = tracker.task("i1").unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.progress, 60.0);
    assert_eq!(task.status_text.as_deref(), Some("Installing dependencies"));
}

#[tokio::test]
async fn snapshot_forgets_tasks_removed_while_disconnected() {
    let (backend, tracker) = setup();
    tracker.install_ui(&install_request("ComfyUI")).await.unwrap();
    tracker.handle(update("i1", "UI Installation", "running", 20.0)).await;
    tracker
        .handle(ChannelEvent::Disconnected {
            reason: "connection reset".to_string(),
        })
        .await;

    tracker
        .handle(frame(json!({"type": "initial_state", "downloads": []})))
        .await;
    assert_eq!(tracker.pending_activations(), 0);
    assert!(matches!(
        tracker.cancel("i1").await.unwrap_err(),
        TrackerError::UnknownTask(_)
    ));

    tracker.handle(completed_install("i1", "abc123")).await;
    assert!(backend.configs().is_empty());
}
