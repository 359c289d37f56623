use crate::{app::APP_ID, channel::ReconnectPolicy, env_flags};
use anyhow::{anyhow, Context, Result};
use directories::BaseDirs;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};
use url::Url;

const SETTINGS_FILE: &str = "settings.json";
const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000/api/";
const WEBSOCKET_PATH: &str = "ws";

#[derive(Debug)]
pub struct ConfigStore {
    root_dir: PathBuf,
    config_dir: PathBuf,
    cache_dir: PathBuf,
    settings: RwLock<AppSettings>,
}

impl ConfigStore {
    pub fn new() -> Result<Self> {
        let dirs = BaseDirs::new()
            .ok_or_else(|| anyhow!("no home directory to keep {APP_ID} settings in"))?;
        Self::with_root(dirs.data_local_dir().join(APP_ID))
    }

    /// Opens (creating if needed) a settings tree under `root_dir`.
    pub fn with_root(root_dir: PathBuf) -> Result<Self> {
        let config_dir = ensure_dir(root_dir.join("config"))?;
        let cache_dir = ensure_dir(root_dir.join("cache"))?;
        let settings = load_settings(&config_dir.join(SETTINGS_FILE))?;

        Ok(Self {
            root_dir,
            config_dir,
            cache_dir,
            settings: RwLock::new(settings),
        })
    }

    pub fn settings(&self) -> AppSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Applies `mutate` and writes the result before releasing the lock, so
    /// concurrent updates reach disk in the order they were applied.
    pub fn update_settings<F>(&self, mutate: F) -> Result<AppSettings>
    where
        F: FnOnce(&mut AppSettings),
    {
        let mut current = self
            .settings
            .write()
            .map_err(|_| anyhow!("settings lock poisoned"))?;
        let mut next = current.clone();
        mutate(&mut next);
        self.write_settings(&next)?;
        *current = next.clone();
        Ok(next)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.clone()
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.clone()
    }

    pub fn root_path(&self) -> PathBuf {
        self.root_dir.clone()
    }

    fn write_settings(&self, settings: &AppSettings) -> Result<()> {
        let target = self.config_dir.join(SETTINGS_FILE);
        let staging = target.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(settings)?;
        fs::write(&staging, json)
            .with_context(|| format!("failed to stage settings at {staging:?}"))?;
        fs::rename(&staging, &target)
            .with_context(|| format!("failed to replace settings at {target:?}"))?;
        debug!("Settings saved to {target:?}");
        Ok(())
    }
}

fn ensure_dir(dir: PathBuf) -> Result<PathBuf> {
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {dir:?}"))?;
    Ok(dir)
}

fn load_settings(path: &Path) -> Result<AppSettings> {
    match fs::read(path) {
        Ok(json) => serde_json::from_slice(&json)
            .with_context(|| format!("settings at {path:?} are not valid JSON")),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(AppSettings::default()),
        Err(err) => Err(err).with_context(|| format!("failed to read settings at {path:?}")),
    }
}

/// Connection settings for the launcher backend.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AppSettings {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl AppSettings {
    /// REST base URL. Always ends in `/` so relative joins keep the prefix.
    pub fn backend_endpoint(&self) -> Result<Url> {
        let raw = env_flags::backend_url_override().unwrap_or_else(|| self.backend_url.clone());
        parse_base_url(&raw)
    }

    /// Task channel URL: explicit override, else `ws` under the backend base
    /// with the scheme swapped to ws/wss.
    pub fn websocket_endpoint(&self) -> Result<Url> {
        if let Some(raw) = env_flags::websocket_url_override().or_else(|| self.websocket_url.clone())
        {
            return Url::parse(raw.trim())
                .with_context(|| format!("invalid websocket URL {raw:?}"));
        }

        let base = self.backend_endpoint()?;
        let mut url = base
            .join(WEBSOCKET_PATH)
            .with_context(|| format!("failed to derive websocket URL from {base}"))?;
        let scheme = match base.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("unsupported backend scheme {other:?}")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("failed to set websocket scheme on {url}"))?;
        Ok(url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            websocket_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&normalized).with_context(|| format!("invalid backend URL {raw:?}"))
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}
