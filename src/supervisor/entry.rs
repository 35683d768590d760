//! One supervised extension: the extension object plus the state the supervisor keeps for it.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::extension::{
    EntryKey, Extension, ExtensionError, ExtensionKind, ExtensionSpec, ScheduledWork, StatusField,
};
use crate::utils::current_timestamp;

use super::notify::{AdminEvent, AdminNotifier};
use super::restart::{RestartBudget, RestartPolicy};
use super::state_machine::{LifecyclePhase, StateMachine};

/// Snapshot of what the supervisor knows about one extension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionState {
    pub spec: ExtensionSpec,
    pub phase: LifecyclePhase,
    pub last_error: Option<String>,
    pub restart_count: u32,
    /// Unix timestamp of the last successful startup
    pub last_started_at: Option<u64>,
    pub version: Option<String>,
    pub pid: Option<u32>,
}

/// Result of one liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Idle,
    Healthy,
    Restarted,
    RestartFailed,
    Disabled,
}

pub struct ExtensionEntry {
    spec: ExtensionSpec,
    machine: StateMachine,
    extension: Box<dyn Extension>,
    budget: RestartBudget,
    last_error: Option<String>,
    restart_count: u32,
    last_started_at: Option<u64>,
    version: Option<String>,
}

impl ExtensionEntry {
    pub fn new(spec: ExtensionSpec, extension: Box<dyn Extension>, policy: RestartPolicy) -> Self {
        Self {
            machine: StateMachine::new(spec.key().to_string()),
            spec,
            extension,
            budget: RestartBudget::new(policy),
            last_error: None,
            restart_count: 0,
            last_started_at: None,
            version: None,
        }
    }

    pub fn key(&self) -> EntryKey {
        self.spec.key()
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ExtensionSpec {
        &self.spec
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.machine.phase()
    }

    pub fn required(&self) -> bool {
        self.spec.required()
    }

    pub fn state(&self) -> ExtensionState {
        ExtensionState {
            spec: self.spec.clone(),
            phase: self.phase(),
            last_error: self.last_error.clone(),
            restart_count: self.restart_count,
            last_started_at: self.last_started_at,
            version: self.version.clone(),
            pid: self.extension.pid(),
        }
    }

    pub fn render(&self) -> Vec<StatusField> {
        self.extension.render()
    }

    pub fn scheduled_task(&self) -> Option<ScheduledWork> {
        self.extension.scheduled_task()
    }

    fn set_phase(&mut self, to: LifecyclePhase) {
        if let Err(e) = self.machine.transition(to) {
            tracing::warn!("{}", e);
        }
    }

    fn record_error(&mut self, err: &ExtensionError) {
        self.last_error = Some(err.to_string());
    }

    // ── lifecycle ──────────────────────────────────────────

    /// Runs the prepare hook once per run. Disabled specs are skipped.
    pub async fn prepare(&mut self) -> Result<(), ExtensionError> {
        let fresh = matches!(self.phase(), LifecyclePhase::Unprepared | LifecyclePhase::Stopped);
        if !self.spec.enabled || !fresh {
            return Ok(());
        }
        match self.extension.prepare().await {
            Ok(()) => {
                self.set_phase(LifecyclePhase::Prepared);
                Ok(())
            }
            Err(e) => {
                tracing::error!("[{}] prepare failed: {}", self.key(), e);
                self.record_error(&e);
                Err(e)
            }
        }
    }

    /// New run for an already prepared node extension.
    pub fn rearm(&mut self) {
        if self.phase() == LifecyclePhase::Stopped {
            self.set_phase(LifecyclePhase::Prepared);
        }
    }

    /// Start a prepared extension. The caller decides between fatal and [`disable`](Self::disable).
    pub async fn startup(&mut self) -> Result<bool, ExtensionError> {
        if !self.spec.enabled || self.phase() != LifecyclePhase::Prepared {
            return Ok(false);
        }
        match self.extension.startup().await {
            Ok(()) => {
                self.set_phase(LifecyclePhase::Started);
                self.last_started_at = Some(current_timestamp());
                self.last_error = None;
                Ok(true)
            }
            Err(e) => {
                self.record_error(&e);
                Err(e)
            }
        }
    }

    pub fn disable(&mut self, reason: &str) {
        tracing::warn!("[{}] disabled: {}", self.key(), reason);
        self.last_error = Some(reason.to_string());
        self.set_phase(LifecyclePhase::Disabled);
    }

    /// Cached after the first successful probe.
    pub async fn probe_version(&mut self, timeout: Duration) {
        if self.version.is_some() || !self.phase().is_live() {
            return;
        }
        match tokio::time::timeout(timeout, self.extension.version()).await {
            Ok(v) if !v.trim().is_empty() => {
                tracing::info!("[{}] version {}", self.key(), v.trim());
                self.version = Some(v.trim().to_string());
            }
            Ok(_) => {}
            Err(_) => tracing::debug!("[{}] version probe timed out", self.key()),
        }
    }

    /// Monitoring tick: liveness check for process-backed entries and crash recovery.
    pub async fn check(
        &mut self,
        now: Instant,
        notifier: &dyn AdminNotifier,
        owner: &str,
    ) -> CheckOutcome {
        match self.phase() {
            LifecyclePhase::Started | LifecyclePhase::Monitoring => {
                let alive = self.extension.kind() == ExtensionKind::Passive
                    || self.extension.is_running();
                if alive {
                    if self.phase() == LifecyclePhase::Started {
                        self.set_phase(LifecyclePhase::Monitoring);
                    }
                    return CheckOutcome::Healthy;
                }
                tracing::warn!("[{}] process is not running", self.key());
                self.set_phase(LifecyclePhase::Crashed);
                self.recover(now, notifier, owner).await
            }
            // 이전 재시작이 실패한 경우
            LifecyclePhase::Crashed => self.recover(now, notifier, owner).await,
            _ => CheckOutcome::Idle,
        }
    }

    async fn recover(
        &mut self,
        now: Instant,
        notifier: &dyn AdminNotifier,
        owner: &str,
    ) -> CheckOutcome {
        if !self.budget.try_acquire(now) {
            let policy = self.budget.policy();
            self.disable("restart budget exhausted");
            notifier.notify(AdminEvent::RestartBudgetExhausted {
                owner: owner.to_string(),
                extension: self.spec.name.clone(),
                restarts: self.restart_count,
                window: policy.window,
            });
            return CheckOutcome::Disabled;
        }

        self.set_phase(LifecyclePhase::Restarting);
        self.restart_count += 1;
        tracing::warn!("[{}] restarting (attempt {})", self.key(), self.restart_count);

        match self.extension.startup().await {
            Ok(()) => {
                self.set_phase(LifecyclePhase::Started);
                self.last_started_at = Some(current_timestamp());
                CheckOutcome::Restarted
            }
            Err(e) => {
                tracing::error!("[{}] restart failed: {}", self.key(), e);
                self.record_error(&e);
                self.set_phase(LifecyclePhase::Crashed);
                CheckOutcome::RestartFailed
            }
        }
    }

    /// Stop the extension and end the run. Never-started and disabled entries move
    /// straight to Stopped. Resets the restart counter and budget.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<(), ExtensionError> {
        let phase = self.phase();
        let result = if phase.needs_shutdown()
            || (phase == LifecyclePhase::Disabled && self.extension.is_running())
        {
            // grace 안에 끝나지 않으면 훅 자체를 포기
            let bound = grace + Duration::from_secs(5);
            match tokio::time::timeout(bound, self.extension.shutdown(grace)).await {
                Ok(r) => r,
                Err(_) => Err(ExtensionError::Timeout(bound)),
            }
        } else {
            Ok(())
        };

        if let Err(e) = &result {
            tracing::error!("[{}] shutdown failed: {}", self.key(), e);
            self.record_error(e);
        }
        if phase != LifecyclePhase::Stopped {
            self.set_phase(LifecyclePhase::Stopped);
        }
        self.restart_count = 0;
        self.budget.reset();
        result
    }
}
