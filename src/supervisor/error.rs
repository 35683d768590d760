//! Supervisor 전용 에러 타입 — 인스턴스 수명주기 훅이 돌려주는 에러

use crate::extension::ExtensionError;

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Extension '{extension}' failed to prepare: {source}")]
    PrepareFailed {
        extension: String,
        #[source]
        source: ExtensionError,
    },

    #[error("Required extension '{extension}' failed to start: {source}")]
    StartupFailed {
        extension: String,
        #[source]
        source: ExtensionError,
    },

    #[error("{} extension(s) failed to shut down", .0.len())]
    ShutdownFailed(Vec<(String, ExtensionError)>),

    #[error("Instance '{0}' is not prepared")]
    NotPrepared(String),
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PrepareFailed { .. } => "PREPARE_FAILED",
            Self::StartupFailed { .. } => "STARTUP_FAILED",
            Self::ShutdownFailed(_) => "SHUTDOWN_FAILED",
            Self::NotPrepared(_) => "NOT_PREPARED",
        }
    }

    /// 실패한 익스텐션 이름 (배치 에러는 첫 번째)
    pub fn extension(&self) -> Option<&str> {
        match self {
            Self::PrepareFailed { extension, .. } | Self::StartupFailed { extension, .. } => {
                Some(extension)
            }
            Self::ShutdownFailed(errors) => errors.first().map(|(name, _)| name.as_str()),
            Self::NotPrepared(_) => None,
        }
    }
}
