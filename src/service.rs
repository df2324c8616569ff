// stackvault/src/service.rs
use anyhow::Context;
use nix::unistd::User;
use std::os::unix::fs::lchown;
use std::path::Path;
use std::process::Command;
use walkdir::WalkDir;

use crate::config::StackConfig;
use crate::errors::{AppError, Result};
use crate::utils::{check_output, progress};

/// Controls the fronting service and the application's management interface.
pub trait ServiceController: Send + Sync {
    fn stop_service(&self) -> Result<()>;
    fn start_service(&self) -> Result<()>;
    fn set_maintenance(&self, enabled: bool) -> Result<()>;
    /// Tells the application its data changed underneath it so clients resync.
    fn refresh_data_fingerprint(&self) -> Result<()>;
    /// Recursively hands `dir` to the service user.
    fn fix_ownership(&self, dir: &Path) -> Result<()>;
}

/// systemd for the service, the application's CLI (run as the service user) for the rest.
pub struct SystemdController {
    service_name: String,
    service_user: String,
    app_cli: Vec<String>,
}

impl SystemdController {
    pub fn from_config(config: &StackConfig) -> Self {
        SystemdController {
            service_name: config.service_name.clone(),
            service_user: config.service_user.clone(),
            app_cli: config.app_cli.clone(),
        }
    }

    fn systemctl(&self, verb: &str) -> Result<()> {
        tracing::debug!(service = %self.service_name, verb, "systemctl");
        let output = Command::new("systemctl")
            .arg(verb)
            .arg(&self.service_name)
            .output()
            .with_context(|| format!("Failed to execute systemctl {} {}", verb, self.service_name))
            .map_err(AppError::service)?;
        check_output(&format!("systemctl {} {}", verb, self.service_name), &output)
            .map_err(AppError::service)
    }

    /// Argument vector for running an application command as the service user.
    pub fn app_command_args(&self, command: &[&str]) -> Vec<String> {
        let mut args = vec!["-u".to_string(), self.service_user.clone()];
        args.extend(self.app_cli.iter().cloned());
        args.extend(command.iter().map(|s| s.to_string()));
        args
    }

    fn app_command(&self, command: &[&str]) -> anyhow::Result<()> {
        let args = self.app_command_args(command);
        tracing::debug!(?args, "application command");
        let output = Command::new("sudo")
            .args(&args)
            .output()
            .with_context(|| format!("Failed to execute application command {:?}", command))?;
        check_output(&command.join(" "), &output)
    }
}

impl ServiceController for SystemdController {
    fn stop_service(&self) -> Result<()> {
        self.systemctl("stop")
    }

    fn start_service(&self) -> Result<()> {
        self.systemctl("start")
    }

    fn set_maintenance(&self, enabled: bool) -> Result<()> {
        let flag = if enabled { "--on" } else { "--off" };
        self.app_command(&["maintenance:mode", flag])
            .map_err(AppError::service)
    }

    fn refresh_data_fingerprint(&self) -> Result<()> {
        self.app_command(&["maintenance:data-fingerprint"])
            .map_err(AppError::service)
    }

    fn fix_ownership(&self, dir: &Path) -> Result<()> {
        let user = User::from_name(&self.service_user)
            .map_err(|e| AppError::ServiceControl(format!("Failed to look up user '{}': {}", self.service_user, e)))?
            .ok_or_else(|| AppError::ServiceControl(format!("Unknown service user '{}'", self.service_user)))?;
        let (uid, gid) = (user.uid.as_raw(), user.gid.as_raw());

        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry
                .with_context(|| format!("Failed to walk directory: {}", dir.display()))
                .map_err(AppError::service)?;
            lchown(entry.path(), Some(uid), Some(gid))
                .with_context(|| format!("Failed to chown {}", entry.path().display()))
                .map_err(AppError::service)?;
        }
        Ok(())
    }
}

/// Maintenance mode held for the lifetime of the guard.
///
/// The guard exists before maintenance is switched on, so a failed or partial
/// enable is still followed by an attempt to switch it off.
pub struct MaintenanceGuard<'a> {
    services: &'a dyn ServiceController,
    active: bool,
}

impl<'a> MaintenanceGuard<'a> {
    pub fn enable(services: &'a dyn ServiceController) -> Result<Self> {
        let guard = MaintenanceGuard { services, active: true };
        services.set_maintenance(true)?;
        Ok(guard)
    }

    pub fn disable(mut self) -> Result<()> {
        self.active = false;
        self.services.set_maintenance(false)
    }

    /// Leaves maintenance mode on after the guard is gone.
    pub fn keep_enabled(mut self) {
        self.active = false;
    }
}

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.services.set_maintenance(false) {
                progress::step_failed("Disable maintenance mode", &e);
            }
        }
    }
}

/// The service held stopped for the lifetime of the guard.
pub struct StoppedService<'a> {
    services: &'a dyn ServiceController,
    active: bool,
}

impl<'a> StoppedService<'a> {
    pub fn stop(services: &'a dyn ServiceController) -> Result<Self> {
        let guard = StoppedService { services, active: true };
        services.stop_service()?;
        Ok(guard)
    }

    pub fn restart(mut self) -> Result<()> {
        self.active = false;
        self.services.start_service()
    }
}

impl Drop for StoppedService<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(e) = self.services.start_service() {
                progress::step_failed("Restart service", &e);
            }
        }
    }
}
