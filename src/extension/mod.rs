//! 익스텐션 계약
//!
//! 익스텐션은 게임 서버 인스턴스(또는 노드)에 붙는 통합 단위입니다.
//! - **process-backed**: 외부 프로세스를 소유하고 감시 (SRS, Olympus, Lardoon, Sneaker, Program)
//! - **passive**: 프로세스 없이 파일/로그만 관찰 (LotAtc, Tacview, VoiceChat)
//!
//! 수명주기 상태는 Supervisor가 소유하고, [`Extension`] 구현체는 훅만 제공합니다.

pub mod builtin;
mod error;
mod launcher;
mod options;
mod ports;
mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::{ExtensionError, RegistryError};
pub use launcher::Launcher;
pub use options::{Options, BASE_KEYS};
pub use ports::{PortClaim, PortRegistry};
pub use registry::{dedup_specs, Constructor, ExtensionRegistry};

// ═══════════════════════════════════════════════════════════════
//  Spec / identity
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Node,
    Instance,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Instance => write!(f, "instance"),
        }
    }
}

/// (name, scope, owner_id) — 같은 키는 한 번만 인스턴스화됩니다.
/// 이름은 레지스트리 조회와 같이 대소문자를 무시하고 비교합니다.
#[derive(Debug, Clone, Serialize)]
pub struct EntryKey {
    pub name: String,
    pub scope: Scope,
    pub owner_id: String,
}

impl EntryKey {
    fn normalized(&self) -> (String, Scope, &str) {
        (self.name.to_lowercase(), self.scope, &self.owner_id)
    }
}

impl PartialEq for EntryKey {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for EntryKey {}

impl std::hash::Hash for EntryKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized().hash(state)
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.owner_id, self.scope, self.name)
    }
}

/// One declared extension. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionSpec {
    pub name: String,
    pub scope: Scope,
    pub owner_id: String,
    pub options: Options,
    pub enabled: bool,
}

impl ExtensionSpec {
    pub fn new(
        name: impl Into<String>,
        scope: Scope,
        owner_id: impl Into<String>,
        options: Options,
    ) -> Self {
        let enabled = options.enabled();
        Self {
            name: name.into(),
            scope,
            owner_id: owner_id.into(),
            options,
            enabled,
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey {
            name: self.name.clone(),
            scope: self.scope,
            owner_id: self.owner_id.clone(),
        }
    }

    pub fn required(&self) -> bool {
        self.options.required()
    }

    pub fn debug(&self) -> bool {
        self.options.debug()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Context handed to constructors
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: String,
    /// 클라이언트에게 보여줄 주소
    pub public_ip: String,
    /// 익스텐션 서버가 바인드할 주소
    pub listen_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: String,
    pub name: String,
    /// 인스턴스 홈 (DCS saved games 디렉토리)
    pub home: PathBuf,
}

#[derive(Clone)]
pub struct ExtensionContext {
    pub node: NodeInfo,
    /// 노드 스코프면 None
    pub instance: Option<InstanceInfo>,
    pub ports: Arc<PortRegistry>,
    /// 같은 소유자에게 보이는 다른 익스텐션 옵션 (LotAtc → SRS 참조)
    pub peers: Arc<BTreeMap<String, Options>>,
    pub log_buffer_lines: usize,
}

impl ExtensionContext {
    /// Port-claim owner: instance id, or `node:<id>` for node scope.
    pub fn owner(&self) -> String {
        match &self.instance {
            Some(instance) => instance.id.clone(),
            None => format!("node:{}", self.node.id),
        }
    }

    /// 인스턴스 홈, 노드 스코프면 None
    pub fn home(&self) -> Option<&PathBuf> {
        self.instance.as_ref().map(|i| &i.home)
    }

    pub fn peer(&self, name: &str) -> Option<&Options> {
        self.peers.get(name)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Extension trait
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtensionKind {
    ProcessBacked,
    Passive,
}

/// One label/value pair for the status display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusField {
    pub label: String,
    pub value: String,
}

impl StatusField {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// Body of a recurring task. Errors are logged by the scheduler, never propagated.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn run(&self) -> anyhow::Result<()>;
}

/// A recurring unit of work declared by an extension.
#[derive(Clone)]
pub struct ScheduledWork {
    pub interval: Duration,
    /// 없으면 `task_budget_secs`
    pub budget: Option<Duration>,
    pub job: Arc<dyn ScheduledJob>,
}

impl fmt::Debug for ScheduledWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledWork")
            .field("interval", &self.interval)
            .field("budget", &self.budget)
            .finish()
    }
}

/// Capability set every integration implements.
///
/// Calls for one extension are serialized by its supervisor; `render` and
/// `is_running` must return without I/O.
#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ExtensionKind;

    /// Side effects needed before the owning instance starts (config synthesis). Idempotent.
    async fn prepare(&mut self) -> Result<(), ExtensionError>;

    async fn startup(&mut self) -> Result<(), ExtensionError>;

    /// Graceful stop; safe from Started, Monitoring or Crashed.
    async fn shutdown(&mut self, grace: Duration) -> Result<(), ExtensionError>;

    fn is_running(&self) -> bool;

    /// Best-effort; empty when unknown.
    async fn version(&self) -> String {
        String::new()
    }

    fn render(&self) -> Vec<StatusField>;

    fn scheduled_task(&self) -> Option<ScheduledWork> {
        None
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}
