//! Backup/restore state machine.
//!
//! A run moves through [`Phase`]s in a fixed order. Maintenance mode and the
//! stopped service are held as guards, so every exit path (failure,
//! cancellation, panic) brings the service back and, unless the operator asks
//! otherwise on cancellation, lifts maintenance mode.

pub mod lease;
pub mod prompt;
pub mod snapshot;

use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::backup::archive::ArchiveEngine;
use crate::config::StackConfig;
use crate::database::DatabaseAdapter;
use crate::errors::{AppError, Result};
use crate::retention;
use crate::secrets::Credentials;
use crate::service::{MaintenanceGuard, ServiceController, StoppedService};
use crate::utils::privilege::{ensure_elevated, is_elevated};
use crate::utils::progress;

use self::lease::SnapshotLease;
pub use self::prompt::OperatorPrompt;
pub use self::snapshot::SnapshotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Validated,
    MaintenanceOn,
    ServiceStopped,
    ArtifactsCaptured,
    Restored,
    ServiceRestarted,
    MaintenanceOff,
    RetentionApplied,
    Done,
    Cancelling,
}

/// A backup step that failed without aborting the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: String,
    pub error: String,
}

#[derive(Debug)]
pub struct BackupReport {
    pub snapshot_id: SnapshotId,
    pub snapshot_dir: PathBuf,
    pub failures: Vec<StepFailure>,
    pub pruned: Vec<PathBuf>,
    /// Set when pruning was held back because this snapshot is incomplete.
    pub retention_skipped: bool,
}

impl BackupReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Artifact {
    Installation,
    Data,
    Database,
}

impl Artifact {
    const ALL: [Artifact; 3] = [Artifact::Installation, Artifact::Data, Artifact::Database];

    fn file_name(self, config: &StackConfig) -> &str {
        match self {
            Artifact::Installation => &config.artifacts.installation,
            Artifact::Data => &config.artifacts.data,
            Artifact::Database => &config.artifacts.database,
        }
    }

    /// Live directory for the two archived artifacts.
    fn live_dir(self, config: &StackConfig) -> Option<&Path> {
        match self {
            Artifact::Installation => Some(&config.installation_dir),
            Artifact::Data => Some(&config.data_dir),
            Artifact::Database => None,
        }
    }

    fn capture_step(self) -> &'static str {
        match self {
            Artifact::Installation => "Archive installation directory",
            Artifact::Data => "Archive data directory",
            Artifact::Database => "Dump database",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Artifact::Installation => "installation",
            Artifact::Data => "data",
            Artifact::Database => "database",
        }
    }
}

/// External capabilities the coordinator drives.
pub struct Collaborators<'a> {
    pub services: &'a dyn ServiceController,
    pub archiver: &'a dyn ArchiveEngine,
    pub database: &'a dyn DatabaseAdapter,
    pub prompt: &'a dyn OperatorPrompt,
}

pub struct Coordinator<'a> {
    config: &'a StackConfig,
    credentials: &'a Credentials,
    services: &'a dyn ServiceController,
    archiver: &'a dyn ArchiveEngine,
    database: &'a dyn DatabaseAdapter,
    prompt: &'a dyn OperatorPrompt,
    cancel: CancellationToken,
    privilege_check: fn() -> bool,
    history: Vec<Phase>,
}

fn run_step<T>(name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    progress::step_start(name);
    match f() {
        Ok(value) => {
            progress::step_done(name);
            Ok(value)
        }
        Err(e) => {
            progress::step_failed(name, &e);
            Err(e)
        }
    }
}

async fn run_step_async<T>(name: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    progress::step_start(name);
    match fut.await {
        Ok(value) => {
            progress::step_done(name);
            Ok(value)
        }
        Err(e) => {
            progress::step_failed(name, &e);
            Err(e)
        }
    }
}

fn recreate_dir(dir: &Path) -> Result<()> {
    let annotate = |action: &str, e: io::Error| {
        AppError::Io(io::Error::new(e.kind(), format!("{} {}: {}", action, dir.display(), e)))
    };
    if dir.symlink_metadata().is_ok() {
        fs::remove_dir_all(dir).map_err(|e| annotate("removing", e))?;
    }
    fs::create_dir_all(dir).map_err(|e| annotate("creating", e))
}

fn discard_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(file = %path.display(), error = %e, "could not remove partial artifact");
        }
    }
}

/// Removes a snapshot directory that never received an artifact.
fn discard_empty_snapshot(dir: &Path) {
    if fs::remove_dir(dir).is_ok() {
        tracing::debug!(dir = %dir.display(), "removed empty snapshot directory");
    }
}

impl<'a> Coordinator<'a> {
    pub fn new(
        config: &'a StackConfig,
        credentials: &'a Credentials,
        collaborators: Collaborators<'a>,
        cancel: CancellationToken,
    ) -> Self {
        Coordinator {
            config,
            credentials,
            services: collaborators.services,
            archiver: collaborators.archiver,
            database: collaborators.database,
            prompt: collaborators.prompt,
            cancel,
            privilege_check: is_elevated,
            history: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn with_privilege_check(mut self, check: fn() -> bool) -> Self {
        self.privilege_check = check;
        self
    }

    /// Phases entered by the most recent run, in order.
    #[cfg(test)]
    pub fn phases(&self) -> &[Phase] {
        &self.history
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(?phase, "entering phase");
        self.history.push(phase);
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(AppError::Cancelled { maintenance_left_on: true })
        } else {
            Ok(())
        }
    }

    /// Cancellation seen before anything was changed needs no unwinding.
    fn checkpoint_before_mutation(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(AppError::Cancelled { maintenance_left_on: false })
        } else {
            Ok(())
        }
    }

    /// Restarts the service if it is still held stopped, then settles maintenance mode.
    fn unwind<T>(
        &mut self,
        outcome: Result<T>,
        stopped: Option<StoppedService<'a>>,
        maintenance: MaintenanceGuard<'a>,
    ) -> Result<T> {
        let cancelled = matches!(outcome, Err(AppError::Cancelled { .. }));
        if cancelled {
            self.enter(Phase::Cancelling);
        }
        let mut cleanup_failures = Vec::new();

        // The service always comes back first, whatever the operator decides below.
        if let Some(stopped) = stopped {
            match run_step("Restart service", || stopped.restart()) {
                Ok(()) => self.enter(Phase::ServiceRestarted),
                Err(e) => cleanup_failures.push(format!("restart service: {}", e)),
            }
        }

        let mut maintenance_on = cancelled && self.prompt.keep_maintenance();
        if maintenance_on {
            maintenance.keep_enabled();
            progress::warn("Maintenance mode left enabled at operator request.");
        } else {
            match run_step("Disable maintenance mode", || maintenance.disable()) {
                Ok(()) => self.enter(Phase::MaintenanceOff),
                Err(e) => {
                    maintenance_on = true;
                    cleanup_failures.push(format!("disable maintenance mode: {}", e));
                }
            }
        }

        let outcome = match outcome {
            Err(AppError::Cancelled { .. }) => Err(AppError::Cancelled {
                maintenance_left_on: maintenance_on,
            }),
            other => other,
        };
        if cleanup_failures.is_empty() {
            return outcome;
        }
        match outcome {
            Ok(_) => Err(AppError::ServiceControl(cleanup_failures.join("; "))),
            Err(cause) => Err(AppError::Unwind {
                cause: Box::new(cause),
                failures: cleanup_failures,
            }),
        }
    }

    pub async fn run_backup(&mut self) -> Result<BackupReport> {
        self.run_backup_as(SnapshotId::now()).await
    }

    /// Backup into the snapshot named `id`.
    pub async fn run_backup_as(&mut self, id: SnapshotId) -> Result<BackupReport> {
        self.history.clear();
        self.enter(Phase::Init);
        ensure_elevated(self.privilege_check)?;

        let config = self.config;
        let _lease = SnapshotLease::acquire(&config.snapshot_root)?;
        let snapshot_dir = snapshot::create_snapshot_dir(&config.snapshot_root, &id)?;
        progress::banner(&format!("Backing up into snapshot {} ({})", id, snapshot_dir.display()));

        // Advisory only: a missing client costs the dump, not the whole backup.
        if let Err(e) = self.database.ensure_client_tools() {
            progress::warn(&format!("{}; the database dump will fail", e));
        }
        self.enter(Phase::Validated);

        if let Err(e) = self.checkpoint_before_mutation() {
            discard_empty_snapshot(&snapshot_dir);
            return Err(e);
        }
        let services = self.services;
        let maintenance = match run_step("Enable maintenance mode", || MaintenanceGuard::enable(services)) {
            Ok(guard) => guard,
            Err(e) => {
                discard_empty_snapshot(&snapshot_dir);
                return Err(e);
            }
        };
        self.enter(Phase::MaintenanceOn);

        let mut failures = Vec::new();
        let mut stopped = None;
        let outcome = self
            .capture_under_maintenance(&snapshot_dir, &mut stopped, &mut failures)
            .await;
        if let Err(e) = self.unwind(outcome, stopped, maintenance) {
            discard_empty_snapshot(&snapshot_dir);
            return Err(e);
        }

        // An incomplete snapshot must not push the last complete one out of retention.
        let retention_skipped = !failures.is_empty() && self.config.retention > 0;
        let pruned = if retention_skipped {
            progress::warn("Snapshot is incomplete; retention skipped so older snapshots are kept.");
            Vec::new()
        } else {
            self.apply_retention(&mut failures)
        };
        self.enter(Phase::Done);
        Ok(BackupReport {
            snapshot_id: id,
            snapshot_dir,
            failures,
            pruned,
            retention_skipped,
        })
    }

    async fn capture_under_maintenance(
        &mut self,
        snapshot_dir: &Path,
        stopped: &mut Option<StoppedService<'a>>,
        failures: &mut Vec<StepFailure>,
    ) -> Result<()> {
        let (config, services, archiver, database, credentials) =
            (self.config, self.services, self.archiver, self.database, self.credentials);

        self.checkpoint()?;
        *stopped = Some(run_step("Stop service", || StoppedService::stop(services))?);
        self.enter(Phase::ServiceStopped);

        for artifact in Artifact::ALL {
            self.checkpoint()?;
            let step = artifact.capture_step();
            let dest = snapshot_dir.join(artifact.file_name(config));
            let result = match artifact.live_dir(config) {
                Some(source) => run_step(step, || archiver.capture(source, &dest, config.compression)),
                None => run_step_async(step, database.dump(credentials, &dest)).await,
            };
            if let Err(e) = result {
                discard_file(&dest);
                if !config.policy.continue_on_artifact_error {
                    return Err(e);
                }
                failures.push(StepFailure {
                    step: step.to_string(),
                    error: e.to_string(),
                });
            }
        }

        self.checkpoint()?;
        self.enter(Phase::ArtifactsCaptured);
        Ok(())
    }

    fn apply_retention(&mut self, failures: &mut Vec<StepFailure>) -> Vec<PathBuf> {
        let keep = self.config.retention;
        if keep == 0 {
            progress::info("Retention is unlimited; no snapshots pruned.");
            self.enter(Phase::RetentionApplied);
            return Vec::new();
        }

        let step = "Apply retention";
        progress::step_start(step);
        let pruned = match retention::prune(&self.config.snapshot_root, keep) {
            Ok(report) => {
                for (path, error) in &report.failed {
                    let failure = StepFailure {
                        step: format!("Remove old snapshot {}", path.display()),
                        error: error.clone(),
                    };
                    progress::step_failed(&failure.step, &failure.error);
                    failures.push(failure);
                }
                progress::step_done(step);
                report.removed
            }
            Err(e) => {
                progress::step_failed(step, &e);
                failures.push(StepFailure {
                    step: step.to_string(),
                    error: e.to_string(),
                });
                Vec::new()
            }
        };
        self.enter(Phase::RetentionApplied);
        pruned
    }

    /// Restores the snapshot named `snapshot_id` over the live installation, data and database.
    pub async fn run_restore(&mut self, snapshot_id: &str) -> Result<()> {
        self.history.clear();
        self.enter(Phase::Init);
        ensure_elevated(self.privilege_check)?;
        let id = SnapshotId::parse(snapshot_id)?;

        let config = self.config;
        let _lease = SnapshotLease::acquire(&config.snapshot_root)?;
        let snapshot_dir = id.dir_in(&config.snapshot_root);
        if !snapshot_dir.is_dir() {
            return Err(AppError::Precondition(format!(
                "snapshot {} not found under {}",
                id,
                config.snapshot_root.display()
            )));
        }
        if config.policy.require_complete_snapshot {
            snapshot::ensure_complete(&snapshot_dir, &config.artifacts)?;
        } else {
            let missing = snapshot::missing_artifacts(&snapshot_dir, &config.artifacts);
            if !missing.is_empty() {
                progress::warn(&format!(
                    "Snapshot {} is missing or has empty artifacts: {}",
                    id,
                    missing.join(", ")
                ));
            }
        }
        self.database.ensure_client_tools()?;

        if config.policy.verify_archives_before_delete {
            let archiver = self.archiver;
            for artifact in [Artifact::Installation, Artifact::Data] {
                let src = snapshot_dir.join(artifact.file_name(config));
                run_step(&format!("Verify {} archive", artifact.label()), || {
                    archiver.verify(&src, config.compression)
                })?;
            }
        } else {
            progress::warn(
                "Archive verification is disabled: live directories are deleted before the archives \
                 are known to extract. A corrupt archive leaves the instance without them until \
                 another snapshot is restored.",
            );
        }
        self.enter(Phase::Validated);
        self.checkpoint_before_mutation()?;

        progress::banner(&format!("Restoring snapshot {} ({})", id, snapshot_dir.display()));
        let services = self.services;
        let maintenance = run_step("Enable maintenance mode", || MaintenanceGuard::enable(services))?;
        self.enter(Phase::MaintenanceOn);

        let mut stopped = None;
        let outcome = self.restore_under_maintenance(&snapshot_dir, &mut stopped).await;
        let destructive_started = self.history.contains(&Phase::ServiceStopped);
        let result = self.unwind(outcome, stopped, maintenance);
        if result.is_err() && destructive_started {
            progress::warn(&format!(
                "The instance may be partially restored. Re-run `restore {}` once the cause is fixed.",
                id
            ));
        }
        result?;
        self.enter(Phase::Done);
        Ok(())
    }

    async fn restore_under_maintenance(
        &mut self,
        snapshot_dir: &Path,
        stopped: &mut Option<StoppedService<'a>>,
    ) -> Result<()> {
        let (config, services, archiver, database, credentials) =
            (self.config, self.services, self.archiver, self.database, self.credentials);

        self.checkpoint()?;
        *stopped = Some(run_step("Stop service", || StoppedService::stop(services))?);
        self.enter(Phase::ServiceStopped);

        for artifact in [Artifact::Installation, Artifact::Data] {
            if let Some(dir) = artifact.live_dir(config) {
                self.checkpoint()?;
                run_step(&format!("Recreate {} directory {}", artifact.label(), dir.display()), || {
                    recreate_dir(dir)
                })?;
            }
        }
        for artifact in [Artifact::Installation, Artifact::Data] {
            if let Some(dir) = artifact.live_dir(config) {
                self.checkpoint()?;
                let src = snapshot_dir.join(artifact.file_name(config));
                run_step(&format!("Extract {} archive", artifact.label()), || {
                    archiver.restore(&src, dir, config.compression)
                })?;
            }
        }

        let dump = snapshot_dir.join(Artifact::Database.file_name(config));
        self.checkpoint()?;
        run_step_async("Drop database", database.drop_database(credentials)).await?;
        self.checkpoint()?;
        run_step_async("Create database", database.create_database(credentials)).await?;
        self.checkpoint()?;
        run_step_async("Import database dump", database.import(credentials, &dump)).await?;
        self.enter(Phase::Restored);

        if let Some(service) = stopped.take() {
            run_step("Restart service", || service.restart())?;
            self.enter(Phase::ServiceRestarted);
        }
        for dir in [&config.installation_dir, &config.data_dir] {
            run_step(&format!("Fix ownership of {}", dir.display()), || {
                services.fix_ownership(dir)
            })?;
        }
        run_step("Refresh data fingerprint", || services.refresh_data_fingerprint())?;
        Ok(())
    }
}
