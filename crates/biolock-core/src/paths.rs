use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::SettingsError;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "biolock";
pub const APP_NAME: &str = "biolock-host";

pub const CONFIG_ENV: &str = "BIOLOCK_CONFIG";

pub fn config_dir() -> Result<PathBuf, SettingsError> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or(SettingsError::NoConfigDir)?;
    Ok(dirs.config_dir().to_path_buf())
}

pub fn settings_path() -> Result<PathBuf, SettingsError> {
    if let Ok(override_path) = std::env::var(CONFIG_ENV) {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    Ok(config_dir()?.join("settings.json"))
}
