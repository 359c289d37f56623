use log::debug;
use serde::{Deserialize, Serialize};

pub const UI_INSTALLATION_SENTINEL: &str = "UI Installation";
pub const UI_PROCESS_SENTINEL: &str = "UI Process";
pub const UI_REPAIR_SENTINEL: &str = "UI Repair";
pub const UI_ADOPTION_SENTINEL: &str = "UI Adoption";

/// A background unit of work tracked by the backend: a model file download,
/// a UI installation, a running UI process, or an adoption/repair workflow.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(from = "WireTask", into = "WireTask")]
pub struct Task {
    pub id: String,
    pub label: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: f64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub error_message: Option<String>,
    pub status_text: Option<String>,
    pub installation_id: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, label: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind,
            status: TaskStatus::Pending,
            progress: 0.0,
            total_bytes: 0,
            transferred_bytes: 0,
            error_message: None,
            status_text: None,
            installation_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending or active; anything that has not reached a terminal state.
    pub fn is_in_flight(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Drops an `installation_id` the task cannot own: only a completed
    /// install, repair or adoption produces an installation. Call once the
    /// task's kind is final.
    pub fn settle_installation_id(&mut self) {
        let owns_installation =
            self.kind.yields_installation() && self.status == TaskStatus::Completed;
        if owns_installation {
            return;
        }
        if let Some(id) = self.installation_id.take() {
            debug!(
                "Ignoring installation id {id} on {} task {} in state {}",
                self.kind.label(),
                self.id,
                self.status.slug()
            );
        }
    }

    /// Terminal outcome suitable for a toast or sidebar entry. `None` while
    /// the task is still pending or active.
    pub fn notice(&self) -> Option<TaskNotice> {
        let notice = match self.status {
            TaskStatus::Completed => TaskNotice {
                tone: NoticeTone::Success,
                message: format!("{} finished.", self.label),
            },
            TaskStatus::Error => TaskNotice {
                tone: NoticeTone::Failure,
                message: match self.error_message.as_deref() {
                    Some(reason) if !reason.trim().is_empty() => {
                        format!("{} failed: {}", self.label, reason.trim())
                    }
                    _ => format!("{} failed.", self.label),
                },
            },
            TaskStatus::Cancelled => TaskNotice {
                tone: NoticeTone::Cancelled,
                message: self
                    .error_message
                    .clone()
                    .filter(|reason| !reason.trim().is_empty())
                    .unwrap_or_else(|| format!("{} was cancelled.", self.label)),
            },
            TaskStatus::Pending | TaskStatus::Downloading | TaskStatus::Running => return None,
        };
        Some(notice)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Downloading | TaskStatus::Running)
    }

    /// The backend owns phase changes; only a terminal state constrains what
    /// may follow it, and then only a repeat of itself.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() || self == next
    }

    pub fn slug(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// What a task is, decided when the task is created. On the wire this is
/// folded into `repo_id`; the sentinel strings are only interpreted here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Download {
        repo_id: String,
        target_path: Option<String>,
    },
    Install,
    Process,
    Repair,
    Adoption,
}

impl TaskKind {
    pub fn from_wire(repo_id: &str, target_path: Option<String>) -> Self {
        match repo_id {
            UI_INSTALLATION_SENTINEL => TaskKind::Install,
            UI_PROCESS_SENTINEL => TaskKind::Process,
            UI_REPAIR_SENTINEL => TaskKind::Repair,
            UI_ADOPTION_SENTINEL => TaskKind::Adoption,
            other => TaskKind::Download {
                repo_id: other.to_string(),
                target_path,
            },
        }
    }

    pub fn wire_repo_id(&self) -> &str {
        match self {
            TaskKind::Download { repo_id, .. } => repo_id,
            TaskKind::Install => UI_INSTALLATION_SENTINEL,
            TaskKind::Process => UI_PROCESS_SENTINEL,
            TaskKind::Repair => UI_REPAIR_SENTINEL,
            TaskKind::Adoption => UI_ADOPTION_SENTINEL,
        }
    }

    /// Install-like tasks produce a managed UI installation when they complete.
    pub fn yields_installation(&self) -> bool {
        matches!(
            self,
            TaskKind::Install | TaskKind::Repair | TaskKind::Adoption
        )
    }

    pub fn is_ui_task(&self) -> bool {
        !matches!(self, TaskKind::Download { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Download { .. } => "Download",
            TaskKind::Install => "Installation",
            TaskKind::Process => "UI Process",
            TaskKind::Repair => "Repair",
            TaskKind::Adoption => "Adoption",
        }
    }
}

/// Destination folder family of a downloaded model file.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Checkpoints,
    DiffusionModels,
    Vae,
    #[serde(alias = "clip")]
    TextEncoders,
    ClipVision,
    Unet,
    Loras,
    Embeddings,
    Controlnet,
    #[serde(alias = "upscale_models")]
    Upscalers,
    Ipadapter,
    #[serde(other)]
    Unknown,
}

impl ModelType {
    pub fn all() -> &'static [ModelType] {
        use ModelType::*;
        &[
            Checkpoints,
            DiffusionModels,
            Vae,
            TextEncoders,
            ClipVision,
            Unet,
            Loras,
            Embeddings,
            Controlnet,
            Upscalers,
            Ipadapter,
        ]
    }

    pub fn slug(&self) -> &'static str {
        match self {
            ModelType::Checkpoints => "checkpoints",
            ModelType::DiffusionModels => "diffusion_models",
            ModelType::Vae => "vae",
            ModelType::TextEncoders => "text_encoders",
            ModelType::ClipVision => "clip_vision",
            ModelType::Unet => "unet",
            ModelType::Loras => "loras",
            ModelType::Embeddings => "embeddings",
            ModelType::Controlnet => "controlnet",
            ModelType::Upscalers => "upscalers",
            ModelType::Ipadapter => "ipadapter",
            ModelType::Unknown => "unknown",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "checkpoints" => Some(ModelType::Checkpoints),
            "diffusion_models" => Some(ModelType::DiffusionModels),
            "vae" => Some(ModelType::Vae),
            "text_encoders" | "clip" => Some(ModelType::TextEncoders),
            "clip_vision" => Some(ModelType::ClipVision),
            "unet" => Some(ModelType::Unet),
            "loras" => Some(ModelType::Loras),
            "embeddings" => Some(ModelType::Embeddings),
            "controlnet" => Some(ModelType::Controlnet),
            "upscalers" | "upscale_models" => Some(ModelType::Upscalers),
            "ipadapter" => Some(ModelType::Ipadapter),
            "unknown" => Some(ModelType::Unknown),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::Checkpoints => "Checkpoint",
            ModelType::DiffusionModels => "Diffusion Model",
            ModelType::Vae => "VAE",
            ModelType::TextEncoders => "Text Encoder",
            ModelType::ClipVision => "CLIP Vision",
            ModelType::Unet => "UNet",
            ModelType::Loras => "LoRA",
            ModelType::Embeddings => "Embedding",
            ModelType::Controlnet => "ControlNet",
            ModelType::Upscalers => "Upscaler",
            ModelType::Ipadapter => "IP-Adapter",
            ModelType::Unknown => "Other",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeTone {
    Success,
    Failure,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskNotice {
    pub tone: NoticeTone,
    pub message: String,
}

/// Server-to-client frames on the task channel.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    InitialState { downloads: Vec<Task> },
    Update { data: Task },
    Remove { download_id: String },
}

impl ServerEvent {
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            ServerEvent::InitialState { .. } => None,
            ServerEvent::Update { data } => Some(&data.id),
            ServerEvent::Remove { download_id } => Some(download_id),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct WireTask {
    download_id: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    repo_id: String,
    status: TaskStatus,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    total_size_bytes: u64,
    #[serde(default)]
    downloaded_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    installation_id: Option<String>,
}

impl From<WireTask> for Task {
    fn from(wire: WireTask) -> Self {
        let kind = TaskKind::from_wire(&wire.repo_id, wire.target_path);
        let progress = if wire.progress.is_finite() {
            wire.progress.clamp(0.0, 100.0)
        } else {
            0.0
        };

        Task {
            id: wire.download_id,
            label: wire.filename,
            kind,
            status: wire.status,
            progress,
            total_bytes: wire.total_size_bytes,
            transferred_bytes: wire.downloaded_bytes,
            error_message: wire.error_message,
            status_text: wire.status_text,
            installation_id: wire.installation_id,
        }
    }
}

impl From<Task> for WireTask {
    fn from(task: Task) -> Self {
        let repo_id = task.kind.wire_repo_id().to_string();
        let target_path = match task.kind {
            TaskKind::Download { target_path, .. } => target_path,
            _ => None,
        };
        WireTask {
            download_id: task.id,
            filename: task.label,
            repo_id,
            status: task.status,
            progress: task.progress,
            total_size_bytes: task.total_bytes,
            downloaded_bytes: task.transferred_bytes,
            error_message: task.error_message,
            target_path,
            status_text: task.status_text,
            installation_id: task.installation_id,
        }
    }
}
