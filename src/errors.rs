use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Insufficient privilege: {0}")]
    Privilege(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Another run holds the snapshot root: {0}")]
    ConcurrentRun(String),

    #[error("Required client tool '{tool}' not found in PATH for the {engine} adapter")]
    ToolMissing { tool: String, engine: String },

    #[error("Archive operation failed: {0}")]
    Archive(String),

    #[error("Database operation failed: {0}")]
    Database(String),

    #[error("Service control failed: {0}")]
    ServiceControl(String),

    #[error("Secret lookup failed: {0}")]
    Secret(String),

    #[error("Operation cancelled by operator (maintenance mode left {})", on_off(.maintenance_left_on))]
    Cancelled { maintenance_left_on: bool },

    #[error("{cause}; cleanup also failed: {}", .failures.join("; "))]
    Unwind {
        cause: Box<AppError>,
        failures: Vec<String>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Wraps an anyhow chain into one of the message-carrying variants.
    pub fn config(err: anyhow::Error) -> Self {
        AppError::Config(format!("{:#}", err))
    }

    pub fn archive(err: anyhow::Error) -> Self {
        AppError::Archive(format!("{:#}", err))
    }

    pub fn database(err: anyhow::Error) -> Self {
        AppError::Database(format!("{:#}", err))
    }

    pub fn service(err: anyhow::Error) -> Self {
        AppError::ServiceControl(format!("{:#}", err))
    }

    /// The error that started the failure, looking through cleanup wrappers.
    pub fn root_cause(&self) -> &AppError {
        match self {
            AppError::Unwind { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

fn on_off(flag: &bool) -> &'static str {
    if *flag { "on" } else { "off" }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwind_message_carries_both_failures() {
        let err = AppError::Unwind {
            cause: Box::new(AppError::Archive("truncated".into())),
            failures: vec!["start nginx: exit 1".into()],
        };
        let text = err.to_string();
        assert!(text.contains("truncated"));
        assert!(text.contains("start nginx: exit 1"));
        assert!(matches!(err.root_cause(), AppError::Archive(_)));
    }

    #[test]
    fn test_anyhow_chain_is_flattened() {
        let inner = anyhow::anyhow!("disk full").context("writing data archive");
        let err = AppError::archive(inner);
        assert_eq!(err.to_string(), "Archive operation failed: writing data archive: disk full");
    }
}
