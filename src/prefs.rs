// ===============================
// src/prefs.rs (persisted preferences)
// ===============================
//
// Flat JSON object on disk, string keys to string values. The core reads one
// key from it: the currently selected account id.
//
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::domain::AccountId;

pub const CURRENT_ACCOUNT_KEY: &str = "CurrentAccountID";
pub const USERNAME_KEY: &str = "Username";

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("prefs io on {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("prefs file {path} is not a JSON object: {source}")]
    Parse { path: String, source: serde_json::Error },
}

#[derive(Debug, Clone)]
pub struct Prefs {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl Prefs {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), values: BTreeMap::new() }
    }

    /// Load from `path`. A missing file is an empty store.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PrefsError> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no prefs file yet");
                return Ok(Self::empty(path));
            }
            Err(source) => return Err(PrefsError::Io { path: path.display().to_string(), source }),
        };
        let values = serde_json::from_str(&text)
            .map_err(|source| PrefsError::Parse { path: path.display().to_string(), source })?;
        Ok(Self { path: path.to_path_buf(), values })
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set_string(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Write to a sibling temp file, then rename over the target.
    pub async fn save(&self) -> Result<(), PrefsError> {
        let io = |source| PrefsError::Io { path: self.path.display().to_string(), source };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io)?;
            }
        }
        let body = serde_json::to_vec_pretty(&self.values).unwrap_or_default();
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body).await.map_err(io)?;
        fs::rename(&tmp, &self.path).await.map_err(io)?;
        Ok(())
    }

    /// Selected account; absent, `0` or garbage all mean "none selected".
    pub fn current_account_id(&self) -> Option<AccountId> {
        let raw = self.get_string(CURRENT_ACCOUNT_KEY)?;
        match raw.trim().parse::<AccountId>() {
            Ok(0) => None,
            Ok(id) => Some(id),
            Err(_) => {
                warn!(value = %raw, "stored account id is not a number");
                None
            }
        }
    }

    pub fn set_current_account(&mut self, id: AccountId) {
        self.set_string(CURRENT_ACCOUNT_KEY, id.to_string());
    }

    pub fn username(&self) -> Option<&str> {
        self.get_string(USERNAME_KEY).filter(|u| !u.trim().is_empty())
    }
}
