use std::time::Duration;

use crate::patcher::ConfigError;
use crate::supervisor::process::ProcessError;

/// 익스텐션 수명주기 훅(prepare/startup/shutdown) 실패
#[derive(thiserror::Error, Debug)]
pub enum ExtensionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("{kind} port {port} is already in use by '{owner}' ({held_as})")]
    PortConflict {
        kind: String,
        port: u16,
        owner: String,
        held_as: String,
    },

    #[error("not installed: {0}")]
    NotInstalled(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),
}

impl ExtensionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(ConfigError::Unparseable { .. }) => "CONFIG_UNPARSEABLE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Process(_) => "PROCESS_ERROR",
            Self::PortConflict { .. } => "PORT_CONFLICT",
            Self::NotInstalled(_) => "NOT_INSTALLED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Failed(_) => "EXTENSION_FAILED",
        }
    }
}

/// Extension spec could not be turned into an extension.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown extension '{0}'")]
    NotFound(String),

    #[error("extension '{extension}': option '{key}' {reason}")]
    InvalidConfig {
        extension: String,
        key: String,
        reason: String,
    },
}

impl RegistryError {
    pub fn missing(extension: &str, key: &str) -> Self {
        Self::InvalidConfig {
            extension: extension.to_string(),
            key: key.to_string(),
            reason: "is required".to_string(),
        }
    }

    pub fn invalid(extension: &str, key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            extension: extension.to_string(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "EXTENSION_NOT_FOUND",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
        }
    }
}
