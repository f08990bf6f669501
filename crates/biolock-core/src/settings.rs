use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::SettingsError;
use crate::frame::DEFAULT_MAX_FRAME_LEN;

pub const DEFAULT_APP_ID: &str = "com.biolock.host";
pub const DEFAULT_POLKIT_ACTION: &str = "com.biolock.host.unlock";
pub const DEFAULT_SECRET_SERVICE: &str = "com.biolock.host";

/// Smallest usable frame limit; error notices must always fit.
pub const MIN_FRAME_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Identifier announced in the `connected` notice.
    pub app_id: String,
    pub polkit_action_id: String,
    /// Service name the OS credential vault files secrets under.
    pub secret_service: String,
    pub max_frame_len: usize,
    /// Only decrypt frames from app ids that completed a handshake.
    pub strict_app_binding: bool,
    pub log_filter: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.into(),
            polkit_action_id: DEFAULT_POLKIT_ACTION.into(),
            secret_service: DEFAULT_SECRET_SERVICE.into(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            strict_app_binding: false,
            log_filter: "info".into(),
        }
    }
}

impl HostSettings {
    /// Load settings from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let display = path.display().to_string();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(SettingsError::Read {
                    path: display,
                    source,
                })
            }
        };
        let settings: Self = serde_json::from_slice(&bytes).map_err(|source| {
            SettingsError::Parse {
                path: display,
                source,
            }
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.app_id.trim().is_empty() {
            return Err(SettingsError::Invalid("app_id must not be empty".into()));
        }
        if self.secret_service.trim().is_empty() {
            return Err(SettingsError::Invalid(
                "secret_service must not be empty".into(),
            ));
        }
        if self.max_frame_len < MIN_FRAME_LEN || self.max_frame_len > u32::MAX as usize {
            return Err(SettingsError::Invalid(format!(
                "max_frame_len {} out of range",
                self.max_frame_len
            )));
        }
        Ok(())
    }
}
