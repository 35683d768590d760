//! Per-instance extension supervisor.
//!
//! 수명주기 순서:
//! 1. `prepare_all`  — 노드 스코프(노드당 1회) → 인스턴스 스코프, 선언 순서
//! 2. `startup_all`  — 같은 순서, optional 실패는 Disabled 처리 후 계속
//! 3. 모니터링 루프   — `tick`마다 liveness 체크 + 재시작 + 스케줄러
//! 4. `shutdown_all` — 역순, 에러는 모아서 한 번에 보고

pub mod notify;
pub mod process;
pub mod restart;
pub mod scheduler;
pub mod state_machine;

mod entry;
mod error;
mod node;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorSettings;
use crate::extension::{
    dedup_specs, ExtensionContext, ExtensionError, ExtensionRegistry, ExtensionSpec,
    InstanceInfo, Options, StatusField,
};

pub use entry::{CheckOutcome, ExtensionState};
pub use error::SupervisorError;
pub use node::NodeContext;
pub use notify::{AdminEvent, AdminNotifier, ChannelNotifier, LogNotifier};
pub use state_machine::LifecyclePhase;

use entry::ExtensionEntry;
use scheduler::Scheduler;

pub struct Supervisor {
    instance: InstanceInfo,
    node: Arc<NodeContext>,
    entries: Vec<ExtensionEntry>,
    scheduler: Scheduler,
    settings: SupervisorSettings,
    notifier: Arc<dyn AdminNotifier>,
    /// (name, reason) — 레지스트리가 거부한 스펙
    rejected: Vec<(String, String)>,
    attached: bool,
}

impl Supervisor {
    pub fn new(
        instance: InstanceInfo,
        node: Arc<NodeContext>,
        specs: Vec<ExtensionSpec>,
        registry: &ExtensionRegistry,
        settings: SupervisorSettings,
        notifier: Arc<dyn AdminNotifier>,
    ) -> Self {
        let specs = dedup_specs(specs);

        // 인스턴스 옵션이 같은 이름의 노드 옵션을 가림
        let mut peers: BTreeMap<String, Options> = node
            .specs()
            .iter()
            .map(|s| (s.name.clone(), s.options.clone()))
            .collect();
        for spec in &specs {
            peers.insert(spec.name.clone(), spec.options.clone());
        }

        let ctx = ExtensionContext {
            node: node.info().clone(),
            instance: Some(instance.clone()),
            ports: node.ports().clone(),
            peers: Arc::new(peers),
            log_buffer_lines: settings.log_buffer_lines,
        };

        let mut entries = Vec::new();
        let mut rejected = Vec::new();
        for spec in specs {
            match registry.instantiate(&spec, &ctx) {
                Ok(ext) => {
                    entries.push(ExtensionEntry::new(spec, ext, settings.restart_policy()))
                }
                Err(e) => {
                    notifier.notify(AdminEvent::RegistryRejected {
                        owner: instance.id.clone(),
                        extension: spec.name.clone(),
                        reason: e.to_string(),
                    });
                    rejected.push((spec.name, e.to_string()));
                }
            }
        }

        tracing::info!(
            "Supervisor for '{}' built with {} extension(s), {} rejected",
            instance.id,
            entries.len(),
            rejected.len()
        );

        Self {
            instance,
            node,
            entries,
            scheduler: Scheduler::new(settings.task_budget()),
            settings,
            notifier,
            rejected,
            attached: false,
        }
    }

    pub fn instance(&self) -> &InstanceInfo {
        &self.instance
    }

    pub fn node(&self) -> &Arc<NodeContext> {
        &self.node
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn rejected(&self) -> &[(String, String)] {
        &self.rejected
    }

    pub fn states(&self) -> Vec<ExtensionState> {
        self.entries.iter().map(|e| e.state()).collect()
    }

    pub fn state(&self, name: &str) -> Option<ExtensionState> {
        self.entries.iter().find(|e| e.name() == name).map(|e| e.state())
    }

    pub fn node_states(&self) -> Vec<ExtensionState> {
        self.node.states()
    }

    pub(crate) fn rendered(&self) -> Vec<(ExtensionState, Vec<StatusField>)> {
        self.entries.iter().map(|e| (e.state(), e.render())).collect()
    }

    /// 다음 스케줄 작업 예정 시각
    pub fn next_task_due(&self) -> Option<Instant> {
        self.scheduler.next_due()
    }

    // ── lifecycle ──────────────────────────────────────────

    /// Node scope first (once per node), then instance scope in declared order.
    /// Stops at the first failure.
    pub async fn prepare_all(&mut self) -> Result<(), SupervisorError> {
        self.node.prepare_once().await?;

        tracing::info!("Preparing extensions for '{}'", self.instance.id);
        for entry in self.entries.iter_mut() {
            if let Err(e) = entry.prepare().await {
                self.notifier.notify(AdminEvent::PrepareFailed {
                    owner: self.instance.id.clone(),
                    extension: entry.name().to_string(),
                    reason: e.to_string(),
                });
                return Err(SupervisorError::PrepareFailed {
                    extension: entry.name().to_string(),
                    source: e,
                });
            }
        }
        Ok(())
    }

    /// Starts node extensions (first attached instance only), then instance extensions.
    /// Optional failures disable that extension and startup continues.
    pub async fn startup_all(&mut self) -> Result<(), SupervisorError> {
        if !self.node.is_prepared() {
            return Err(SupervisorError::NotPrepared(self.instance.id.clone()));
        }
        self.node.attach(&self.instance.id).await?;
        self.attached = true;

        tracing::info!("Starting extensions for '{}'", self.instance.id);
        let now = Instant::now();
        for entry in self.entries.iter_mut() {
            match entry.startup().await {
                Ok(true) => {
                    if let Some(work) = entry.scheduled_task() {
                        self.scheduler.schedule(entry.key(), work, now);
                    }
                    entry.probe_version(self.settings.version_probe()).await;
                }
                Ok(false) => {}
                Err(e) if entry.required() => {
                    self.notifier.notify(AdminEvent::StartupFailed {
                        owner: self.instance.id.clone(),
                        extension: entry.name().to_string(),
                        reason: e.to_string(),
                        fatal: true,
                    });
                    return Err(SupervisorError::StartupFailed {
                        extension: entry.name().to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    self.notifier.notify(AdminEvent::StartupFailed {
                        owner: self.instance.id.clone(),
                        extension: entry.name().to_string(),
                        reason: e.to_string(),
                        fatal: false,
                    });
                    entry.disable(&e.to_string());
                }
            }
        }
        Ok(())
    }

    pub async fn tick(&mut self) {
        self.tick_at(Instant::now()).await
    }

    /// One monitoring pass: node extensions (leader only), instance liveness, due tasks.
    pub async fn tick_at(&mut self, now: Instant) {
        self.node.tick(&self.instance.id, now).await;

        for entry in self.entries.iter_mut() {
            match entry.check(now, self.notifier.as_ref(), &self.instance.id).await {
                CheckOutcome::Disabled => {
                    self.scheduler.cancel(&entry.key());
                }
                CheckOutcome::Restarted => {
                    entry.probe_version(self.settings.version_probe()).await;
                }
                _ => {}
            }
        }

        let ran = self.scheduler.run_due(now);
        if !ran.is_empty() {
            tracing::debug!("[{}] dispatched {} scheduled task(s)", self.instance.id, ran.len());
        }
    }

    /// Reverse declared order, best-effort. Errors are reported once as a batch.
    pub async fn shutdown_all(&mut self) -> Result<(), SupervisorError> {
        tracing::info!("Stopping extensions for '{}'", self.instance.id);
        self.scheduler.cancel_all();

        let grace = self.settings.shutdown_grace();
        let mut errors: Vec<(String, ExtensionError)> = Vec::new();
        for entry in self.entries.iter_mut().rev() {
            if let Err(e) = entry.shutdown(grace).await {
                errors.push((entry.name().to_string(), e));
            }
        }

        if self.attached {
            errors.extend(self.node.detach(&self.instance.id).await);
            self.attached = false;
        }

        let released = self.node.ports().release_owner(&self.instance.id);
        if released > 0 {
            tracing::debug!("[{}] released {} port claim(s)", self.instance.id, released);
        }

        if errors.is_empty() {
            return Ok(());
        }
        self.notifier.notify(AdminEvent::ShutdownErrors {
            owner: self.instance.id.clone(),
            errors: errors.iter().map(|(n, e)| (n.clone(), e.to_string())).collect(),
        });
        Err(SupervisorError::ShutdownFailed(errors))
    }
}

/// Runs `tick` every `interval` until `cancel` fires. A tick in progress is
/// never interrupted; cancellation is observed between ticks.
pub fn spawn_monitor(
    supervisor: Arc<Mutex<Supervisor>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 첫 tick은 즉시 완료되므로 건너뜀
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    supervisor.lock().await.tick().await;
                }
            }
        }
        tracing::debug!("Monitoring loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{
        Extension, ExtensionKind, NodeInfo, RegistryError, Scope,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Probe {
        running: Arc<AtomicBool>,
        starts: Arc<AtomicUsize>,
        fail_start: bool,
    }

    #[async_trait]
    impl Extension for Probe {
        fn name(&self) -> &str {
            "Probe"
        }
        fn kind(&self) -> ExtensionKind {
            ExtensionKind::ProcessBacked
        }
        async fn prepare(&mut self) -> Result<(), ExtensionError> {
            Ok(())
        }
        async fn startup(&mut self) -> Result<(), ExtensionError> {
            if self.fail_start {
                return Err(ExtensionError::failed("no binary"));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn shutdown(&mut self, _grace: Duration) -> Result<(), ExtensionError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        async fn version(&self) -> String {
            "1.2.3".into()
        }
        fn render(&self) -> Vec<StatusField> {
            vec![]
        }
    }

    fn setup(
        fail_start: bool,
    ) -> (ExtensionRegistry, Arc<AtomicBool>, Arc<AtomicUsize>) {
        let running = Arc::new(AtomicBool::new(false));
        let starts = Arc::new(AtomicUsize::new(0));
        let mut registry = ExtensionRegistry::new();
        let (r, s) = (running.clone(), starts.clone());
        registry.register("Probe", move |_spec, _ctx| -> Result<Box<dyn Extension>, RegistryError> {
            Ok(Box::new(Probe {
                running: r.clone(),
                starts: s.clone(),
                fail_start,
            }))
        });
        (registry, running, starts)
    }

    fn build(registry: &ExtensionRegistry, options: serde_json::Value) -> Supervisor {
        let settings = SupervisorSettings::default();
        let notifier: Arc<dyn AdminNotifier> = Arc::new(LogNotifier);
        let node = Arc::new(NodeContext::new(
            NodeInfo {
                id: "n1".into(),
                public_ip: "127.0.0.1".into(),
                listen_address: "0.0.0.0".into(),
            },
            vec![],
            registry,
            settings.clone(),
            notifier.clone(),
        ));
        let instance = InstanceInfo {
            id: "i1".into(),
            name: "i1".into(),
            home: PathBuf::from("/tmp/i1"),
        };
        let spec = ExtensionSpec::new("Probe", Scope::Instance, "i1", Options::from(options));
        Supervisor::new(instance, node, vec![spec], registry, settings, notifier)
    }

    #[tokio::test]
    async fn test_startup_requires_prepare() {
        let (registry, _, _) = setup(false);
        let mut sup = build(&registry, json!({}));
        let err = sup.startup_all().await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_PREPARED");
    }

    #[tokio::test]
    async fn test_full_cycle_probes_version() {
        let (registry, running, starts) = setup(false);
        let mut sup = build(&registry, json!({}));
        sup.prepare_all().await.unwrap();
        sup.startup_all().await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        let state = sup.state("Probe").unwrap();
        assert_eq!(state.phase, LifecyclePhase::Started);
        assert_eq!(state.version.as_deref(), Some("1.2.3"));
        assert!(state.last_started_at.is_some());

        sup.tick().await;
        assert_eq!(sup.state("Probe").unwrap().phase, LifecyclePhase::Monitoring);

        sup.shutdown_all().await.unwrap();
        assert!(!running.load(Ordering::SeqCst));
        assert_eq!(sup.state("Probe").unwrap().phase, LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn test_optional_startup_failure_disables() {
        let (registry, _, _) = setup(true);
        let mut sup = build(&registry, json!({}));
        sup.prepare_all().await.unwrap();
        sup.startup_all().await.unwrap();
        let state = sup.state("Probe").unwrap();
        assert_eq!(state.phase, LifecyclePhase::Disabled);
        assert_eq!(state.last_error.as_deref(), Some("no binary"));
    }

    #[tokio::test]
    async fn test_required_startup_failure_is_fatal() {
        let (registry, _, _) = setup(true);
        let mut sup = build(&registry, json!({"required": true}));
        sup.prepare_all().await.unwrap();
        let err = sup.startup_all().await.unwrap_err();
        assert_eq!(err.error_code(), "STARTUP_FAILED");
        assert_eq!(err.extension(), Some("Probe"));
    }

    #[tokio::test]
    async fn test_disabled_spec_never_starts() {
        let (registry, _, starts) = setup(false);
        let mut sup = build(&registry, json!({"enabled": false}));
        sup.prepare_all().await.unwrap();
        sup.startup_all().await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 0);
        assert_eq!(sup.state("Probe").unwrap().phase, LifecyclePhase::Unprepared);
        sup.shutdown_all().await.unwrap();
        assert_eq!(sup.state("Probe").unwrap().phase, LifecyclePhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_loop_stops_on_cancel() {
        let (registry, _, _) = setup(false);
        let mut sup = build(&registry, json!({}));
        sup.prepare_all().await.unwrap();
        sup.startup_all().await.unwrap();
        let sup = Arc::new(Mutex::new(sup));

        let cancel = CancellationToken::new();
        let handle = spawn_monitor(sup.clone(), Duration::from_secs(30), cancel.clone());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(
            sup.lock().await.state("Probe").unwrap().phase,
            LifecyclePhase::Monitoring
        );
        cancel.cancel();
        handle.await.unwrap();
    }
}
