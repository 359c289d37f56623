use crate::{api::CommandApi, env_flags};
use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard},
};
use thiserror::Error;

const BUNDLED_CATALOG: &str = include_str!("../data/ui_catalog.json");
const CATALOG_FILE: &str = "ui_catalog.json";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AvailableUi {
    pub ui_name: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile_name: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UiCatalog {
    pub catalog_version: u32,
    pub uis: Vec<AvailableUi>,
}

impl UiCatalog {
    pub fn find(&self, ui_name: &str) -> Option<&AvailableUi> {
        let wanted = ui_name.trim();
        self.uis
            .iter()
            .find(|ui| ui.ui_name.eq_ignore_ascii_case(wanted))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("UI {0:?} is not in the catalog")]
    UnknownUi(String),
    #[error("catalog entry for {0:?} has no profile")]
    NoProfile(String),
}

#[derive(Debug)]
pub struct CatalogService {
    catalog: RwLock<UiCatalog>,
    cache_dir: Option<PathBuf>,
}

impl CatalogService {
    pub fn new(cache_dir: Option<PathBuf>) -> Result<Self> {
        let catalog = match resolve_catalog(cache_dir.as_ref()) {
            Some(catalog) => catalog,
            None => serde_json::from_str(BUNDLED_CATALOG)
                .context("bundled UI catalog is not valid JSON")?,
        };
        Ok(Self {
            catalog: RwLock::new(catalog),
            cache_dir,
        })
    }

    pub fn from_catalog(catalog: UiCatalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            cache_dir: None,
        }
    }

    pub fn snapshot(&self) -> UiCatalog {
        self.read().clone()
    }

    pub fn find(&self, ui_name: &str) -> Option<AvailableUi> {
        self.read().find(ui_name).cloned()
    }

    /// Profile the app configuration should switch to when an installation
    /// of `ui_name` becomes the active UI.
    pub fn profile_hint(&self, ui_name: &str) -> Result<String, LookupError> {
        let catalog = self.read();
        let entry = catalog
            .find(ui_name)
            .ok_or_else(|| LookupError::UnknownUi(ui_name.to_string()))?;
        entry
            .default_profile_name
            .as_deref()
            .map(str::trim)
            .filter(|profile| !profile.is_empty())
            .map(str::to_string)
            .ok_or_else(|| LookupError::NoProfile(entry.ui_name.clone()))
    }

    /// Replaces the catalog with the backend's list and caches it for the
    /// next launch. An empty list keeps the current catalog.
    pub async fn refresh(&self, api: &dyn CommandApi) -> Result<usize> {
        let uis = api
            .available_uis()
            .await
            .context("failed to fetch available UIs")?;
        if uis.is_empty() {
            warn!("Backend returned an empty UI catalog; keeping the current one.");
            return Ok(self.read().uis.len());
        }

        let updated = {
            let mut guard = match self.catalog.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.uis = uis;
            guard.clone()
        };
        info!("UI catalog refreshed with {} entries", updated.uis.len());

        if let Some(dir) = &self.cache_dir {
            let path = dir.join(CATALOG_FILE);
            let data = serde_json::to_vec_pretty(&updated)?;
            if let Err(err) = tokio::fs::write(&path, data).await {
                warn!("Failed to cache UI catalog at {:?}: {err}", path);
            }
        }
        Ok(updated.uis.len())
    }

    fn read(&self) -> RwLockReadGuard<'_, UiCatalog> {
        match self.catalog.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn resolve_catalog(cache_dir: Option<&PathBuf>) -> Option<UiCatalog> {
    for path in catalog_candidate_paths(cache_dir) {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<UiCatalog>(&contents) {
                Ok(parsed) => {
                    info!("Loaded UI catalog from {:?}", path);
                    return Some(parsed);
                }
                Err(err) => warn!("Failed to parse UI catalog at {:?}: {err}", path),
            },
            Err(err) => warn!("Failed to read UI catalog at {:?}: {err}", path),
        }
    }
    info!("Using bundled UI catalog.");
    None
}

fn catalog_candidate_paths(cache_dir: Option<&PathBuf>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(custom) = env_flags::ui_catalog_path_override() {
        candidates.push(PathBuf::from(custom));
    }

    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join("data").join(CATALOG_FILE));
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
    {
        candidates.push(exe_dir.join("data").join(CATALOG_FILE));
    }

    if let Some(dir) = cache_dir {
        candidates.push(dir.join(CATALOG_FILE));
    }

    candidates.retain(|p| p.exists());
    candidates
}
