//! Biometric authorization gate.
//!
//! The gate may block for as long as the OS prompt is on screen. Dropping the
//! pending future abandons the prompt.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::settings::HostSettings;

#[async_trait]
pub trait BiometricGate: Send + Sync {
    /// `true` only when the user positively authorized the unlock. Any
    /// failure to ask counts as a denial.
    async fn check_biometrics(&self) -> bool;
}

/// polkit authorization for the current process, via `pkcheck`.
///
/// The prompt text comes from the action's `<message>` in the installed
/// polkit policy; unprivileged callers cannot pass details.
pub struct PolkitGate {
    action_id: String,
    program: String,
}

impl PolkitGate {
    pub fn new(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            program: "pkcheck".to_string(),
        }
    }

    /// Use a different checker binary with the same arguments and exit codes.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, pid: u32) -> Vec<String> {
        vec![
            "--action-id".into(),
            self.action_id.clone(),
            "--process".into(),
            pid.to_string(),
            "--allow-user-interaction".into(),
        ]
    }
}

#[async_trait]
impl BiometricGate for PolkitGate {
    async fn check_biometrics(&self) -> bool {
        let output = tokio::process::Command::new(&self.program)
            .args(self.args(std::process::id()))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => {
                debug!(action = %self.action_id, "polkit authorized");
                true
            }
            Ok(out) => {
                // 1 = not authorized, 2 = dismissed, 3 = error
                warn!(
                    action = %self.action_id,
                    code = ?out.status.code(),
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "polkit denied"
                );
                false
            }
            Err(e) => {
                warn!(program = %self.program, error = %e, "cannot run polkit checker");
                false
            }
        }
    }
}

/// Platforms without a supported prompt always deny.
pub struct UnsupportedGate;

#[async_trait]
impl BiometricGate for UnsupportedGate {
    async fn check_biometrics(&self) -> bool {
        warn!("biometric authorization is not supported on this platform");
        false
    }
}

#[cfg(any(
    target_os = "linux",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub fn platform_gate(settings: &HostSettings) -> Arc<dyn BiometricGate> {
    Arc::new(PolkitGate::new(settings.polkit_action_id.clone()))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
pub fn platform_gate(_settings: &HostSettings) -> Arc<dyn BiometricGate> {
    Arc::new(UnsupportedGate)
}
