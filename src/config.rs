use crate::model::Settings;
use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "sdtune";
const SETTINGS_FILE: &str = "settings.json";
const STORE_DIR: &str = "store";

pub fn config_root() -> Result<PathBuf> {
    if let Ok(override_dir) = env::var("SDTUNE_CONFIG_DIR") {
        return Ok(PathBuf::from(override_dir));
    }

    let home = env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .context("neither HOME nor USERPROFILE is set")?;
    Ok(PathBuf::from(home).join(".config").join(APP_DIR))
}

pub fn settings_path(root: &Path) -> PathBuf {
    root.join(SETTINGS_FILE)
}

/// Key-value store location, relative to `root` unless configured.
pub fn store_dir(root: &Path, settings: &Settings) -> PathBuf {
    settings
        .store_dir
        .clone()
        .unwrap_or_else(|| root.join(STORE_DIR))
}

pub fn load_settings(root: &Path) -> Result<Settings> {
    let path = settings_path(root);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    let settings: Settings = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse settings file {}", path.display()))?;
    Ok(settings)
}

/// Loads settings, writing the defaults out on first run so there is a
/// file to edit.
pub fn load_or_create_settings(root: &Path) -> Result<Settings> {
    if settings_path(root).exists() {
        return load_settings(root);
    }
    let settings = Settings::default();
    save_settings(root, &settings)?;
    Ok(settings)
}

pub fn save_settings(root: &Path, settings: &Settings) -> Result<()> {
    fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
    let path = settings_path(root);
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
