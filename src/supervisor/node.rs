//! Node-scope extensions shared by every instance of one node.
//!
//! - prepared once per node lifetime (first `prepare_all` wins, later callers see its result)
//! - started when the first instance attaches, stopped when the last one detaches
//! - monitored by the earliest attached instance (the leader)
//! - each entry has its own lock, so a slow hook never stalls other instances' ticks

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use crate::config::SupervisorSettings;
use crate::extension::{
    dedup_specs, ExtensionContext, ExtensionError, ExtensionRegistry, ExtensionSpec, NodeInfo,
    Options, PortRegistry,
};

use super::entry::{CheckOutcome, ExtensionEntry, ExtensionState};
use super::notify::{AdminEvent, AdminNotifier};
use super::scheduler::Scheduler;
use super::SupervisorError;
use crate::extension::StatusField;

/// One node extension. The async lock is held only while that entry's own hook
/// runs; readers fall back to the last snapshot while it is busy.
struct NodeEntry {
    entry: Mutex<ExtensionEntry>,
    snapshot: StdMutex<(ExtensionState, Vec<StatusField>)>,
}

impl NodeEntry {
    fn new(entry: ExtensionEntry) -> Self {
        let snapshot = (entry.state(), entry.render());
        Self {
            entry: Mutex::new(entry),
            snapshot: StdMutex::new(snapshot),
        }
    }

    fn remember(&self, entry: &ExtensionEntry) {
        *relock(&self.snapshot) = (entry.state(), entry.render());
    }

    fn current(&self) -> (ExtensionState, Vec<StatusField>) {
        match self.entry.try_lock() {
            Ok(entry) => {
                self.remember(&entry);
                (entry.state(), entry.render())
            }
            Err(_) => relock(&self.snapshot).clone(),
        }
    }
}

fn relock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Node lock poisoned, continuing with inner state");
        poisoned.into_inner()
    })
}

pub struct NodeContext {
    info: NodeInfo,
    ports: Arc<PortRegistry>,
    specs: Vec<ExtensionSpec>,
    settings: SupervisorSettings,
    notifier: Arc<dyn AdminNotifier>,
    entries: Vec<NodeEntry>,
    scheduler: StdMutex<Scheduler>,
    /// 부착 순서 그대로, 첫 번째가 리더
    members: StdMutex<Vec<String>>,
    /// attach/detach의 시작·정지 패스를 직렬화 (tick과 상태 조회는 기다리지 않음)
    lifecycle: Mutex<()>,
    /// Err = (extension, reason)
    prepared: OnceCell<Result<(), (String, String)>>,
}

impl NodeContext {
    pub fn new(
        info: NodeInfo,
        specs: Vec<ExtensionSpec>,
        registry: &ExtensionRegistry,
        settings: SupervisorSettings,
        notifier: Arc<dyn AdminNotifier>,
    ) -> Self {
        let specs = dedup_specs(specs);
        let ports = Arc::new(PortRegistry::new());
        let peers: BTreeMap<String, Options> = specs
            .iter()
            .map(|s| (s.name.clone(), s.options.clone()))
            .collect();
        let ctx = ExtensionContext {
            node: info.clone(),
            instance: None,
            ports: ports.clone(),
            peers: Arc::new(peers),
            log_buffer_lines: settings.log_buffer_lines,
        };

        let owner = format!("node:{}", info.id);
        let mut entries = Vec::new();
        for spec in &specs {
            match registry.instantiate(spec, &ctx) {
                Ok(ext) => entries.push(NodeEntry::new(ExtensionEntry::new(
                    spec.clone(),
                    ext,
                    settings.restart_policy(),
                ))),
                Err(e) => notifier.notify(AdminEvent::RegistryRejected {
                    owner: owner.clone(),
                    extension: spec.name.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        Self {
            info,
            ports,
            specs,
            entries,
            scheduler: StdMutex::new(Scheduler::new(settings.task_budget())),
            members: StdMutex::new(Vec::new()),
            lifecycle: Mutex::new(()),
            settings,
            notifier,
            prepared: OnceCell::new(),
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn ports(&self) -> &Arc<PortRegistry> {
        &self.ports
    }

    pub fn specs(&self) -> &[ExtensionSpec] {
        &self.specs
    }

    fn owner(&self) -> String {
        format!("node:{}", self.info.id)
    }

    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        relock(&self.scheduler)
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self.prepared.get(), Some(Ok(())))
    }

    /// Prepare node extensions the first time it is called; afterwards returns the
    /// cached outcome without re-running any side effects.
    pub async fn prepare_once(&self) -> Result<(), SupervisorError> {
        let outcome = self
            .prepared
            .get_or_init(|| async {
                tracing::info!("Preparing node '{}' extensions", self.info.id);
                for slot in &self.entries {
                    let mut entry = slot.entry.lock().await;
                    let result = entry.prepare().await;
                    slot.remember(&entry);
                    if let Err(e) = result {
                        self.notifier.notify(AdminEvent::PrepareFailed {
                            owner: self.owner(),
                            extension: entry.name().to_string(),
                            reason: e.to_string(),
                        });
                        return Err((entry.name().to_string(), e.to_string()));
                    }
                }
                Ok(())
            })
            .await;

        match outcome {
            Ok(()) => Ok(()),
            Err((extension, reason)) => Err(SupervisorError::PrepareFailed {
                extension: extension.clone(),
                source: ExtensionError::failed(reason.clone()),
            }),
        }
    }

    /// Register `instance_id`; the first attached instance starts the node extensions.
    pub async fn attach(&self, instance_id: &str) -> Result<(), SupervisorError> {
        let _pass = self.lifecycle.lock().await;
        let first = {
            let mut members = relock(&self.members);
            if members.iter().any(|id| id == instance_id) {
                return Ok(());
            }
            members.push(instance_id.to_string());
            members.len() == 1
        };
        if !first {
            return Ok(());
        }

        tracing::info!("Starting node '{}' extensions for '{}'", self.info.id, instance_id);
        let now = Instant::now();
        for slot in &self.entries {
            let mut entry = slot.entry.lock().await;
            entry.rearm();
            let result = entry.startup().await;
            match result {
                Ok(true) => {
                    if let Some(work) = entry.scheduled_task() {
                        self.scheduler().schedule(entry.key(), work, now);
                    }
                    entry.probe_version(self.settings.version_probe()).await;
                }
                Ok(false) => {}
                Err(e) if entry.required() => {
                    self.notifier.notify(AdminEvent::StartupFailed {
                        owner: self.owner(),
                        extension: entry.name().to_string(),
                        reason: e.to_string(),
                        fatal: true,
                    });
                    let extension = entry.name().to_string();
                    slot.remember(&entry);
                    drop(entry);

                    // 이미 시작한 노드 익스텐션은 되돌림
                    relock(&self.members).retain(|id| id != instance_id);
                    for (name, err) in self.stop_entries().await {
                        tracing::warn!("[{}] {} failed to stop: {}", self.owner(), name, err);
                    }
                    return Err(SupervisorError::StartupFailed { extension, source: e });
                }
                Err(e) => {
                    self.notifier.notify(AdminEvent::StartupFailed {
                        owner: self.owner(),
                        extension: entry.name().to_string(),
                        reason: e.to_string(),
                        fatal: false,
                    });
                    entry.disable(&e.to_string());
                }
            }
            slot.remember(&entry);
        }
        Ok(())
    }

    /// Unregister `instance_id`; the last one out stops the node extensions.
    pub async fn detach(&self, instance_id: &str) -> Vec<(String, ExtensionError)> {
        let _pass = self.lifecycle.lock().await;
        let last = {
            let mut members = relock(&self.members);
            let before = members.len();
            members.retain(|id| id != instance_id);
            before != members.len() && members.is_empty()
        };
        if !last {
            return Vec::new();
        }

        tracing::info!("Last instance left node '{}', stopping node extensions", self.info.id);
        self.stop_entries().await
    }

    /// Reverse order shutdown of every node entry. Ends the run, including for
    /// entries that were disabled during it.
    async fn stop_entries(&self) -> Vec<(String, ExtensionError)> {
        self.scheduler().cancel_all();
        let mut errors = Vec::new();
        for slot in self.entries.iter().rev() {
            let mut entry = slot.entry.lock().await;
            if let Err(e) = entry.shutdown(self.settings.shutdown_grace()).await {
                errors.push((entry.name().to_string(), e));
            }
            slot.remember(&entry);
        }
        errors
    }

    /// Whether `instance_id` is the earliest attached instance.
    pub fn is_leader(&self, instance_id: &str) -> bool {
        relock(&self.members).first().map(String::as_str) == Some(instance_id)
    }

    pub fn attached(&self) -> Vec<String> {
        relock(&self.members).clone()
    }

    /// Leader-only monitoring + scheduling of node extensions. Non-leaders return
    /// immediately; an entry busy in a lifecycle hook is skipped for this tick.
    pub async fn tick(&self, instance_id: &str, now: Instant) {
        if !self.is_leader(instance_id) {
            return;
        }
        let owner = self.owner();
        for slot in &self.entries {
            let Ok(mut entry) = slot.entry.try_lock() else {
                continue;
            };
            let outcome = entry.check(now, self.notifier.as_ref(), &owner).await;
            match outcome {
                CheckOutcome::Disabled => {
                    self.scheduler().cancel(&entry.key());
                }
                CheckOutcome::Restarted => {
                    entry.probe_version(self.settings.version_probe()).await;
                }
                _ => {}
            }
            slot.remember(&entry);
        }
        self.scheduler().run_due(now);
    }

    pub fn states(&self) -> Vec<ExtensionState> {
        self.entries.iter().map(|slot| slot.current().0).collect()
    }

    pub(crate) fn rendered(&self) -> Vec<(ExtensionState, Vec<StatusField>)> {
        self.entries.iter().map(NodeEntry::current).collect()
    }
}
