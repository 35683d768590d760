//! 인스턴스 수명주기 훅과 플릿 구성
//!
//! 인스턴스 매니저(게임 서버를 실제로 띄우는 쪽)는 서버 프로세스 시작 전후와
//! 종료 후에 [`ManagedInstance`]의 훅을 호출합니다.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GlobalConfig;
use crate::extension::ExtensionRegistry;
use crate::status::{ExtensionStatus, StatusAggregator};
use crate::supervisor::{
    spawn_monitor, AdminNotifier, ExtensionState, NodeContext, Supervisor, SupervisorError,
};

/// 익스텐션 Supervisor가 붙은 게임 서버 인스턴스
pub struct ManagedInstance {
    id: String,
    supervisor: Arc<Mutex<Supervisor>>,
    monitor: Option<(CancellationToken, JoinHandle<()>)>,
}

impl ManagedInstance {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            id: supervisor.instance().id.clone(),
            supervisor: Arc::new(Mutex::new(supervisor)),
            monitor: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn supervisor(&self) -> &Arc<Mutex<Supervisor>> {
        &self.supervisor
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_some()
    }

    /// 서버 프로세스 시작 전: 설정 합성 (노드 → 인스턴스)
    pub async fn on_before_instance_start(&self) -> Result<(), SupervisorError> {
        self.supervisor.lock().await.prepare_all().await
    }

    /// 서버 프로세스 시작 후: 익스텐션 기동 + 모니터링 루프
    pub async fn on_after_instance_start(&mut self) -> Result<(), SupervisorError> {
        let interval = {
            let mut sup = self.supervisor.lock().await;
            if let Err(e) = sup.startup_all().await {
                tracing::error!("[{}] startup aborted: {}", self.id, e);
                // 이미 뜬 익스텐션 정리 (best-effort)
                if let Err(stop_err) = sup.shutdown_all().await {
                    tracing::warn!("[{}] cleanup after failed startup: {}", self.id, stop_err);
                }
                return Err(e);
            }
            sup.settings().monitor_interval()
        };

        let cancel = CancellationToken::new();
        let handle = spawn_monitor(self.supervisor.clone(), interval, cancel.clone());
        self.monitor = Some((cancel, handle));
        Ok(())
    }

    /// 서버 종료 후: 루프 정지(진행 중 tick은 끝까지) → 역순 shutdown
    pub async fn on_after_instance_stop(&mut self) -> Result<(), SupervisorError> {
        if let Some((cancel, handle)) = self.monitor.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("[{}] monitoring loop ended abnormally: {}", self.id, e);
            }
        }
        self.supervisor.lock().await.shutdown_all().await
    }

    pub async fn states(&self) -> Vec<ExtensionState> {
        self.supervisor.lock().await.states()
    }

    pub async fn status(&self, aggregator: &StatusAggregator) -> Vec<ExtensionStatus> {
        aggregator.collect(&*self.supervisor.lock().await)
    }
}

/// 설정 파일의 모든 노드/인스턴스
pub struct Fleet {
    nodes: Vec<Arc<NodeContext>>,
    instances: Vec<ManagedInstance>,
    aggregator: StatusAggregator,
}

impl Fleet {
    pub fn from_config(
        config: &GlobalConfig,
        registry: &ExtensionRegistry,
        notifier: Arc<dyn AdminNotifier>,
    ) -> Self {
        let settings = &config.supervisor;
        let mut nodes = Vec::new();
        let mut instances = Vec::new();

        for node_cfg in &config.nodes {
            let node = Arc::new(NodeContext::new(
                node_cfg.info(),
                node_cfg.node_specs(),
                registry,
                settings.clone(),
                notifier.clone(),
            ));
            for instance_cfg in &node_cfg.instances {
                let supervisor = Supervisor::new(
                    instance_cfg.info(),
                    node.clone(),
                    node_cfg.instance_specs(instance_cfg),
                    registry,
                    settings.clone(),
                    notifier.clone(),
                );
                instances.push(ManagedInstance::new(supervisor));
            }
            nodes.push(node);
        }

        tracing::info!("Fleet: {} node(s), {} instance(s)", nodes.len(), instances.len());
        Self {
            nodes,
            instances,
            aggregator: StatusAggregator::new(settings.show_disabled),
        }
    }

    pub fn nodes(&self) -> &[Arc<NodeContext>] {
        &self.nodes
    }

    pub fn instances(&self) -> &[ManagedInstance] {
        &self.instances
    }

    pub fn instance(&self, id: &str) -> Option<&ManagedInstance> {
        self.instances.iter().find(|i| i.id() == id)
    }

    pub fn aggregator(&self) -> &StatusAggregator {
        &self.aggregator
    }

    /// 인스턴스별 시작; 하나가 실패해도 나머지는 계속
    pub async fn start_all(&mut self) -> Vec<(String, SupervisorError)> {
        let mut failures = Vec::new();
        for instance in self.instances.iter_mut() {
            let result = match instance.on_before_instance_start().await {
                Ok(()) => instance.on_after_instance_start().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!("[{}] failed to start: {}", instance.id(), e);
                failures.push((instance.id().to_string(), e));
            }
        }
        failures
    }

    /// 역순 정지
    pub async fn stop_all(&mut self) -> Vec<(String, SupervisorError)> {
        let mut failures = Vec::new();
        for instance in self.instances.iter_mut().rev() {
            if let Err(e) = instance.on_after_instance_stop().await {
                failures.push((instance.id().to_string(), e));
            }
        }
        failures
    }
}
