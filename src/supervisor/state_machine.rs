use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Extension lifecycle phase.
///
/// `Unprepared → Prepared → Started → Monitoring ⇄ {Crashed → Restarting → Started} → Stopped`,
/// with `Disabled` as the terminal error state of one run. Shutdown ends the run
/// (`Disabled → Stopped`), so the next run starts clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecyclePhase {
    Unprepared,
    Prepared,
    Started,
    Monitoring,
    Crashed,
    Restarting,
    Stopped,
    Disabled,
}

impl LifecyclePhase {
    /// 모니터링 틱에서 생존 확인 대상인 단계
    pub fn is_live(self) -> bool {
        matches!(self, Self::Started | Self::Monitoring)
    }

    /// shutdown()을 호출해야 하는 단계
    pub fn needs_shutdown(self) -> bool {
        matches!(
            self,
            Self::Started | Self::Monitoring | Self::Crashed | Self::Restarting
        )
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition for '{name}': {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: LifecyclePhase,
        to: LifecyclePhase,
    },
}

/// Per-extension phase tracker
#[derive(Debug, Clone)]
pub struct StateMachine {
    name: String,
    phase: LifecyclePhase,
}

impl StateMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: LifecyclePhase::Unprepared,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn can_transition(&self, to: LifecyclePhase) -> bool {
        use LifecyclePhase::*;
        matches!(
            (self.phase, to),
            (Unprepared, Prepared)
                | (Unprepared, Disabled)
                | (Unprepared, Stopped)
                | (Prepared, Started)
                | (Prepared, Disabled)
                | (Prepared, Stopped)
                | (Started, Monitoring)
                | (Started, Crashed)
                | (Started, Stopped)
                | (Started, Disabled)
                | (Monitoring, Crashed)
                | (Monitoring, Stopped)
                | (Crashed, Restarting)
                | (Crashed, Disabled)
                | (Crashed, Stopped)
                | (Restarting, Started)
                | (Restarting, Crashed)
                | (Restarting, Disabled)
                | (Restarting, Stopped)
                // 실행 종료: 비활성화는 그 실행에만 적용
                | (Disabled, Stopped)
                // 노드 익스텐션 재연결: 새 실행 (prepare는 반복하지 않음)
                | (Stopped, Prepared)
        )
    }

    pub fn transition(&mut self, to: LifecyclePhase) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::info!("[{}] {} -> {}", self.name, self.phase, to);
            self.phase = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition {
                name: self.name.clone(),
                from: self.phase,
                to,
            })
        }
    }
}
