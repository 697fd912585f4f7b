//! Settings file and data locations.

use shared::settings::AppSettings;
use std::fs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com.local", "Parley", "Parley")
}

pub fn config_path() -> Option<PathBuf> {
    let proj = project_dirs()?;
    let _ = fs::create_dir_all(proj.config_dir());
    Some(proj.config_dir().join("settings.json"))
}

/// Where the chat database lives.
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Parse a settings file; missing fields take their defaults.
pub fn read_settings(path: &Path) -> Option<AppSettings> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice::<AppSettings>(&bytes) {
        Ok(settings) => Some(settings),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
            None
        }
    }
}

/// Returns the settings and whether this is a fresh install.
pub fn load_settings_or_default() -> (AppSettings, bool) {
    if let Some(settings) = config_path().as_deref().and_then(read_settings) {
        return (settings, false);
    }
    (AppSettings::default(), true)
}

pub fn write_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(settings)?;
    fs::write(path, bytes)
}

pub fn save_settings(settings: &AppSettings) {
    if let Some(path) = config_path() {
        if let Err(e) = write_settings(&path, settings) {
            tracing::warn!(path = %path.display(), error = %e, "failed to save settings");
        }
    }
}
