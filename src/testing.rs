//! In-memory collaborators for exercising the coordinator.

use async_trait::async_trait;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::backup::archive::{ArchiveEngine, TarArchiver};
use crate::config::DatabaseEngine;
use crate::coordinator::OperatorPrompt;
use crate::database::DatabaseAdapter;
use crate::errors::{AppError, Result};
use crate::secrets::Credentials;
use crate::service::ServiceController;

/// Shared event log with fault and cancellation injection, keyed by event name.
#[derive(Clone, Default)]
pub struct Script {
    inner: Arc<ScriptInner>,
}

#[derive(Default)]
struct ScriptInner {
    log: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    cancel_on: Mutex<Option<String>>,
    token: CancellationToken,
}

impl Script {
    pub fn fail(&self, event: &str) -> &Self {
        self.inner.failing.lock().unwrap().insert(event.to_string());
        self
    }

    /// Raises the cancellation token right after `event` happens.
    pub fn cancel_after(&self, event: &str) -> &Self {
        *self.inner.cancel_on.lock().unwrap() = Some(event.to_string());
        self
    }

    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.inner.log.lock().unwrap().clone()
    }

    pub fn saw(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event)
    }

    /// Records `event`; returns true when it was scripted to fail.
    fn hit(&self, event: &str) -> bool {
        self.inner.log.lock().unwrap().push(event.to_string());
        if self.inner.cancel_on.lock().unwrap().as_deref() == Some(event) {
            self.inner.token.cancel();
        }
        self.inner.failing.lock().unwrap().contains(event)
    }
}

#[derive(Default)]
pub struct FakeServices {
    pub script: Script,
    state: Mutex<ServiceState>,
}

struct ServiceState {
    maintenance: bool,
    running: bool,
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState { maintenance: false, running: true }
    }
}

impl FakeServices {
    pub fn new(script: Script) -> Self {
        FakeServices { script, state: Mutex::default() }
    }

    pub fn failing(self, event: &str) -> Self {
        self.script.fail(event);
        self
    }

    pub fn maintenance(&self) -> bool {
        self.state.lock().unwrap().maintenance
    }

    pub fn running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn events(&self) -> Vec<String> {
        self.script.events()
    }

    fn act(&self, event: &str, apply: impl FnOnce(&mut ServiceState)) -> Result<()> {
        if self.script.hit(event) {
            return Err(AppError::ServiceControl(format!("{} failed", event)));
        }
        apply(&mut self.state.lock().unwrap());
        Ok(())
    }
}

impl ServiceController for FakeServices {
    fn stop_service(&self) -> Result<()> {
        self.act("stop", |s| s.running = false)
    }

    fn start_service(&self) -> Result<()> {
        self.act("start", |s| s.running = true)
    }

    fn set_maintenance(&self, enabled: bool) -> Result<()> {
        let event = if enabled { "maintenance:on" } else { "maintenance:off" };
        self.act(event, |s| s.maintenance = enabled)
    }

    fn refresh_data_fingerprint(&self) -> Result<()> {
        self.act("fingerprint", |_| ())
    }

    fn fix_ownership(&self, dir: &Path) -> Result<()> {
        let name = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        self.act(&format!("chown:{}", name), |_| ())
    }
}

/// Database whose content is the text of the last imported dump.
pub struct FakeDatabase {
    pub script: Script,
    pub tools_present: bool,
    content: Mutex<Option<String>>,
}

impl FakeDatabase {
    pub fn new(script: Script, content: &str) -> Self {
        FakeDatabase {
            script,
            tools_present: true,
            content: Mutex::new(Some(content.to_string())),
        }
    }

    pub fn content(&self) -> Option<String> {
        self.content.lock().unwrap().clone()
    }

    fn fail_if_scripted(&self, event: &str) -> Result<()> {
        if self.script.hit(event) {
            return Err(AppError::Database(format!("{} failed", event)));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseAdapter for FakeDatabase {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::MySql
    }

    fn required_tools(&self) -> &'static [&'static str] {
        &["fake-client"]
    }

    fn ensure_client_tools(&self) -> Result<()> {
        self.script.hit("tools");
        if self.tools_present {
            Ok(())
        } else {
            Err(AppError::ToolMissing { tool: "fake-client".into(), engine: "mysql".into() })
        }
    }

    async fn dump(&self, credentials: &Credentials, dest_file: &Path) -> Result<()> {
        self.fail_if_scripted("dump")?;
        let content = self.content().unwrap_or_default();
        fs::write(dest_file, format!("-- {}\n{}", credentials.database, content))?;
        Ok(())
    }

    async fn drop_database(&self, _credentials: &Credentials) -> Result<()> {
        self.fail_if_scripted("drop")?;
        *self.content.lock().unwrap() = None;
        Ok(())
    }

    async fn create_database(&self, _credentials: &Credentials) -> Result<()> {
        self.fail_if_scripted("create")?;
        *self.content.lock().unwrap() = Some(String::new());
        Ok(())
    }

    async fn import(&self, credentials: &Credentials, src_file: &Path) -> Result<()> {
        self.fail_if_scripted("import")?;
        let text = fs::read_to_string(src_file)?;
        let header = format!("-- {}\n", credentials.database);
        let body = text.strip_prefix(&header).unwrap_or(&text).to_string();
        *self.content.lock().unwrap() = Some(body);
        Ok(())
    }
}

/// Real tar archiving with scripted failures, events named `<op>:<artifact file name>`.
pub struct ScriptedArchiver {
    pub script: Script,
}

impl ScriptedArchiver {
    fn event(&self, op: &str, artifact: &Path) -> Result<()> {
        let name = artifact.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let event = format!("{}:{}", op, name);
        if self.script.hit(&event) {
            return Err(AppError::Archive(format!("{} failed", event)));
        }
        Ok(())
    }
}

impl ArchiveEngine for ScriptedArchiver {
    fn capture(&self, source_dir: &Path, dest_file: &Path, compressed: bool) -> Result<()> {
        self.event("capture", dest_file)?;
        TarArchiver.capture(source_dir, dest_file, compressed)
    }

    fn restore(&self, src_file: &Path, dest_dir: &Path, compressed: bool) -> Result<()> {
        self.event("restore", src_file)?;
        TarArchiver.restore(src_file, dest_dir, compressed)
    }

    fn verify(&self, src_file: &Path, compressed: bool) -> Result<()> {
        self.event("verify", src_file)?;
        TarArchiver.verify(src_file, compressed)
    }
}

pub struct FixedPrompt {
    pub keep: bool,
    pub asked: Mutex<usize>,
}

impl FixedPrompt {
    pub fn answering(keep: bool) -> Self {
        FixedPrompt { keep, asked: Mutex::new(0) }
    }

    pub fn times_asked(&self) -> usize {
        *self.asked.lock().unwrap()
    }
}

impl OperatorPrompt for FixedPrompt {
    fn keep_maintenance(&self) -> bool {
        *self.asked.lock().unwrap() += 1;
        self.keep
    }
}
