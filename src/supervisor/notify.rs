//! Admin notification channel.
//!
//! Fatal prepare failures, rejected specs, startup failures, restart-budget exhaustion
//! and batched shutdown errors are pushed as human-readable events.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminEvent {
    PrepareFailed {
        owner: String,
        extension: String,
        reason: String,
    },
    RegistryRejected {
        owner: String,
        extension: String,
        reason: String,
    },
    StartupFailed {
        owner: String,
        extension: String,
        reason: String,
        /// required 익스텐션이면 인스턴스 시작 중단
        fatal: bool,
    },
    RestartBudgetExhausted {
        owner: String,
        extension: String,
        restarts: u32,
        window: Duration,
    },
    ShutdownErrors {
        owner: String,
        errors: Vec<(String, String)>,
    },
}

impl AdminEvent {
    pub fn owner(&self) -> &str {
        match self {
            Self::PrepareFailed { owner, .. }
            | Self::RegistryRejected { owner, .. }
            | Self::StartupFailed { owner, .. }
            | Self::RestartBudgetExhausted { owner, .. }
            | Self::ShutdownErrors { owner, .. } => owner,
        }
    }
}

impl fmt::Display for AdminEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrepareFailed { owner, extension, reason } => write!(
                f,
                "[{}] Extension {} could not be prepared, startup aborted: {}",
                owner, extension, reason
            ),
            Self::RegistryRejected { owner, extension, reason } => {
                write!(f, "[{}] Extension {} was not loaded: {}", owner, extension, reason)
            }
            Self::StartupFailed { owner, extension, reason, fatal: true } => write!(
                f,
                "[{}] Required extension {} failed to start, startup aborted: {}",
                owner, extension, reason
            ),
            Self::StartupFailed { owner, extension, reason, fatal: false } => write!(
                f,
                "[{}] Extension {} failed to start and was disabled: {}",
                owner, extension, reason
            ),
            Self::RestartBudgetExhausted { owner, extension, restarts, window } => write!(
                f,
                "[{}] Extension {} crashed again after {} restart(s) within {}s and was disabled",
                owner,
                extension,
                restarts,
                window.as_secs()
            ),
            Self::ShutdownErrors { owner, errors } => {
                write!(f, "[{}] {} extension(s) failed to shut down:", owner, errors.len())?;
                for (name, reason) in errors {
                    write!(f, "\n- {}: {}", name, reason)?;
                }
                Ok(())
            }
        }
    }
}

pub trait AdminNotifier: Send + Sync {
    fn notify(&self, event: AdminEvent);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl AdminNotifier for LogNotifier {
    fn notify(&self, event: AdminEvent) {
        match &event {
            AdminEvent::StartupFailed { fatal: false, .. } | AdminEvent::RegistryRejected { .. } => {
                tracing::warn!("{}", event)
            }
            _ => tracing::error!("{}", event),
        }
    }
}

/// Forwards events to a receiver (admin bot, tests). Also logs them.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<AdminEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AdminEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AdminNotifier for ChannelNotifier {
    fn notify(&self, event: AdminEvent) {
        LogNotifier.notify(event.clone());
        if self.tx.send(event).is_err() {
            tracing::debug!("Admin channel receiver dropped");
        }
    }
}
