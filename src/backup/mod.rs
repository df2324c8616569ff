pub(crate) mod archive;

use tokio_util::sync::CancellationToken;

use crate::config::StackConfig;
use crate::coordinator::prompt::{listen_for_interrupt, prompt_for};
use crate::coordinator::{BackupReport, Collaborators, Coordinator};
use crate::database::select_adapter;
use crate::errors::Result;
use crate::secrets::{Credentials, EnvSecretProvider};
use crate::service::SystemdController;

use self::archive::TarArchiver;

/// Public entry point for the backup process.
/// Wires the live service manager, tar archiver and database clients into a coordinator run.
pub async fn run_backup_flow(config: &StackConfig) -> Result<BackupReport> {
    let provider = EnvSecretProvider::new(config.secrets_env_file.as_deref())?;
    let credentials = Credentials::resolve(&provider)?;
    let services = SystemdController::from_config(config);
    let database = select_adapter(config);
    let prompt = prompt_for(config.policy.on_cancel);

    let cancel = CancellationToken::new();
    listen_for_interrupt(cancel.clone());

    let mut coordinator = Coordinator::new(
        config,
        &credentials,
        Collaborators {
            services: &services,
            archiver: &TarArchiver,
            database: database.as_ref(),
            prompt: prompt.as_ref(),
        },
        cancel,
    );
    let report = coordinator.run_backup().await?;
    print_summary(&report);
    Ok(report)
}

fn print_summary(report: &BackupReport) {
    println!();
    println!("📦 Snapshot {} at {}", report.snapshot_id, report.snapshot_dir.display());
    if report.is_complete() {
        println!("   All artifacts captured.");
    } else {
        println!("   ⚠ Incomplete snapshot, {} step(s) failed:", report.failures.len());
        for failure in &report.failures {
            println!("     - {}: {}", failure.step, failure.error);
        }
    }
    if report.retention_skipped {
        println!("   Retention skipped; no older snapshots were removed.");
    }
    for path in &report.pruned {
        println!("   🗑 Pruned {}", path.display());
    }
}
