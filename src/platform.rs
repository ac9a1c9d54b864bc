use std::os::unix::process::CommandExt;
use std::process::Command;

use log::debug;

use crate::config::ProbeConfig;
use crate::error::AppError;

/// Host facts the manager needs to number GPIO lines.
pub trait HostPlatform: Send + Sync {
    fn kernel_release(&self) -> Result<String, AppError>;
    /// Raw output of the GPIO namespace probe.
    fn probe_gpio_ids(&self) -> Result<String, AppError>;
}

pub struct SystemPlatform {
    probe: ProbeConfig,
}

impl SystemPlatform {
    pub fn new(probe: ProbeConfig) -> Self {
        Self { probe }
    }
}

impl HostPlatform for SystemPlatform {
    fn kernel_release(&self) -> Result<String, AppError> {
        let uts = nix::sys::utsname::uname()
            .map_err(|e| AppError::Probe(format!("uname: {e}")))?;
        Ok(uts.release().to_string_lossy().into_owned())
    }

    fn probe_gpio_ids(&self) -> Result<String, AppError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.probe.command);
        if let Some(gid) = self.probe.gid {
            cmd.gid(gid);
        }
        if let Some(uid) = self.probe.uid {
            cmd.uid(uid);
        }

        debug!("running GPIO probe: {}", self.probe.command);
        let output = cmd
            .output()
            .map_err(|e| AppError::Probe(format!("spawn `{}`: {e}", self.probe.command)))?;

        if !output.status.success() {
            return Err(AppError::Probe(format!(
                "`{}` exited with {}: {}",
                self.probe.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
