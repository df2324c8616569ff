use tokio_util::sync::CancellationToken;

use crate::backup::archive::TarArchiver;
use crate::config::StackConfig;
use crate::coordinator::prompt::{listen_for_interrupt, prompt_for};
use crate::coordinator::{Collaborators, Coordinator};
use crate::database::select_adapter;
use crate::errors::Result;
use crate::secrets::{Credentials, EnvSecretProvider};
use crate::service::SystemdController;

/// Public entry point for the restore process.
/// Replaces the live installation, data directory and database with the snapshot `snapshot_id`.
pub async fn run_restore_flow(config: &StackConfig, snapshot_id: &str) -> Result<()> {
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
    coordinator.run_restore(snapshot_id).await?;
    println!("🔄 Snapshot {} restored into {} and {}.",
        snapshot_id,
        config.installation_dir.display(),
        config.data_dir.display()
    );
    Ok(())
}
