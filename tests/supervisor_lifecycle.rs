/// 수명주기 통합 테스트
/// 가짜 익스텐션으로 prepare → startup → 모니터링 → shutdown 흐름을 검증

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use extvisor::config::SupervisorSettings;
use extvisor::extension::{
    Extension, ExtensionError, ExtensionKind, ExtensionRegistry, ExtensionSpec, InstanceInfo,
    NodeInfo, Options, RegistryError, ScheduledJob, ScheduledWork, Scope, StatusField,
};
use extvisor::supervisor::{
    AdminEvent, AdminNotifier, ChannelNotifier, LifecyclePhase, LogNotifier, NodeContext,
    Supervisor,
};

/// 테스트에서 조작하는 공유 카운터
#[derive(Default)]
struct Counters {
    prepares: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    runs: AtomicUsize,
    running: AtomicBool,
}

struct Fake {
    name: String,
    counters: Arc<Counters>,
    task: Option<Duration>,
    slow_task: bool,
}

#[async_trait]
impl Extension for Fake {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ExtensionKind {
        ExtensionKind::ProcessBacked
    }

    async fn prepare(&mut self) -> Result<(), ExtensionError> {
        self.counters.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn startup(&mut self) -> Result<(), ExtensionError> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        self.counters.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&mut self, _grace: Duration) -> Result<(), ExtensionError> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        self.counters.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.counters.running.load(Ordering::SeqCst)
    }

    fn render(&self) -> Vec<StatusField> {
        vec![StatusField::new(self.name.clone(), "ok")]
    }

    fn scheduled_task(&self) -> Option<ScheduledWork> {
        self.task.map(|interval| ScheduledWork {
            interval,
            budget: None,
            job: Arc::new(CountingJob {
                counters: self.counters.clone(),
                slow: self.slow_task,
            }),
        })
    }
}

struct CountingJob {
    counters: Arc<Counters>,
    slow: bool,
}

#[async_trait]
impl ScheduledJob for CountingJob {
    async fn run(&self) -> anyhow::Result<()> {
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        if self.slow {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }
}

fn registry(name: &str, counters: Arc<Counters>, task: Option<Duration>, slow_task: bool) -> ExtensionRegistry {
    let mut registry = ExtensionRegistry::new();
    let owned = name.to_string();
    registry.register(name, move |_spec, _ctx| -> Result<Box<dyn Extension>, RegistryError> {
        Ok(Box::new(Fake {
            name: owned.clone(),
            counters: counters.clone(),
            task,
            slow_task,
        }))
    });
    registry
}

fn node_info() -> NodeInfo {
    NodeInfo {
        id: "n1".into(),
        public_ip: "127.0.0.1".into(),
        listen_address: "0.0.0.0".into(),
    }
}

fn instance(id: &str) -> InstanceInfo {
    InstanceInfo {
        id: id.into(),
        name: id.into(),
        home: PathBuf::from(format!("/tmp/{}", id)),
    }
}

fn settings(max_restarts: u32) -> SupervisorSettings {
    SupervisorSettings {
        max_restarts,
        ..SupervisorSettings::default()
    }
}

fn instance_supervisor(
    registry: &ExtensionRegistry,
    names: &[&str],
    settings: SupervisorSettings,
    notifier: Arc<dyn AdminNotifier>,
) -> Supervisor {
    let node = Arc::new(NodeContext::new(node_info(), vec![], registry, settings.clone(), notifier.clone()));
    let specs = names
        .iter()
        .map(|n| ExtensionSpec::new(*n, Scope::Instance, "i1", Options::new()))
        .collect();
    Supervisor::new(instance("i1"), node, specs, registry, settings, notifier)
}

#[tokio::test]
async fn test_prepare_then_shutdown_stops_everything() {
    let counters = Arc::new(Counters::default());
    let registry = registry("Fake", counters.clone(), None, false);
    let mut sup = instance_supervisor(&registry, &["Fake"], settings(3), Arc::new(LogNotifier));

    sup.prepare_all().await.unwrap();
    assert_eq!(sup.state("Fake").unwrap().phase, LifecyclePhase::Prepared);

    sup.shutdown_all().await.unwrap();
    assert!(sup.states().iter().all(|s| s.phase == LifecyclePhase::Stopped));
    // 시작된 적 없으니 훅도 호출되지 않음
    assert_eq!(counters.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_instance_restart_is_a_new_run() {
    let counters = Arc::new(Counters::default());
    let registry = registry("Fake", counters.clone(), None, false);
    let mut sup = instance_supervisor(&registry, &["Fake"], settings(3), Arc::new(LogNotifier));

    for run in 1..=2 {
        sup.prepare_all().await.unwrap();
        sup.startup_all().await.unwrap();
        assert_eq!(sup.state("Fake").unwrap().phase, LifecyclePhase::Started);
        sup.shutdown_all().await.unwrap();
        assert_eq!(counters.prepares.load(Ordering::SeqCst), run);
        assert_eq!(counters.stops.load(Ordering::SeqCst), run);
    }
}

#[tokio::test]
async fn test_crash_restart_until_budget_exhausted() {
    let counters = Arc::new(Counters::default());
    let registry = registry("Fake", counters.clone(), None, false);
    let (notifier, mut events) = ChannelNotifier::new();
    let mut sup = instance_supervisor(&registry, &["Fake"], settings(2), Arc::new(notifier));

    sup.prepare_all().await.unwrap();
    sup.startup_all().await.unwrap();
    let t0 = Instant::now();

    // 크래시 2번 → 재시작 2번
    for i in 1..=2u32 {
        counters.running.store(false, Ordering::SeqCst);
        sup.tick_at(t0 + Duration::from_secs(i as u64)).await;
        let state = sup.state("Fake").unwrap();
        assert_eq!(state.phase, LifecyclePhase::Started);
        assert_eq!(state.restart_count, i);
    }

    // 윈도우 안에서 세 번째 크래시 → Disabled
    counters.running.store(false, Ordering::SeqCst);
    sup.tick_at(t0 + Duration::from_secs(3)).await;
    let state = sup.state("Fake").unwrap();
    assert_eq!(state.phase, LifecyclePhase::Disabled);
    assert_eq!(state.restart_count, 2);
    assert_eq!(counters.starts.load(Ordering::SeqCst), 3);

    match events.try_recv().unwrap() {
        AdminEvent::RestartBudgetExhausted { owner, extension, restarts, .. } => {
            assert_eq!(owner, "i1");
            assert_eq!(extension, "Fake");
            assert_eq!(restarts, 2);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // Disabled 이후에는 더 이상 재시작하지 않음
    sup.tick_at(t0 + Duration::from_secs(4)).await;
    assert_eq!(counters.starts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_restart_budget_slides() {
    let counters = Arc::new(Counters::default());
    let registry = registry("Fake", counters.clone(), None, false);
    let mut sup = instance_supervisor(&registry, &["Fake"], settings(1), Arc::new(LogNotifier));
    sup.prepare_all().await.unwrap();
    sup.startup_all().await.unwrap();
    let t0 = Instant::now();

    counters.running.store(false, Ordering::SeqCst);
    sup.tick_at(t0).await;
    // 윈도우(300초)가 지난 뒤의 크래시는 새 예산으로 재시작
    counters.running.store(false, Ordering::SeqCst);
    sup.tick_at(t0 + Duration::from_secs(301)).await;
    let state = sup.state("Fake").unwrap();
    assert_eq!(state.phase, LifecyclePhase::Started);
    assert_eq!(state.restart_count, 2);
}

#[tokio::test]
async fn test_unknown_extension_is_rejected_not_fatal() {
    let counters = Arc::new(Counters::default());
    let registry = registry("Fake", counters.clone(), None, false);
    let (notifier, mut events) = ChannelNotifier::new();
    let mut sup = instance_supervisor(&registry, &["Fake", "Foo"], settings(3), Arc::new(notifier));

    assert_eq!(sup.rejected().len(), 1);
    assert_eq!(sup.rejected()[0].0, "Foo");
    assert!(matches!(
        events.try_recv().unwrap(),
        AdminEvent::RegistryRejected { ref extension, .. } if extension == "Foo"
    ));

    sup.prepare_all().await.unwrap();
    sup.startup_all().await.unwrap();
    assert_eq!(sup.states().len(), 1);
    assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
    sup.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_node_extension_shared_by_instances() {
    let counters = Arc::new(Counters::default());
    let registry = registry("Shared", counters.clone(), None, false);
    let notifier: Arc<dyn AdminNotifier> = Arc::new(LogNotifier);
    let node_spec = ExtensionSpec::new("Shared", Scope::Node, "n1", Options::new());
    let node = Arc::new(NodeContext::new(
        node_info(),
        vec![node_spec],
        &registry,
        settings(3),
        notifier.clone(),
    ));

    let mut first = Supervisor::new(instance("i1"), node.clone(), vec![], &registry, settings(3), notifier.clone());
    let mut second = Supervisor::new(instance("i2"), node.clone(), vec![], &registry, settings(3), notifier);

    first.prepare_all().await.unwrap();
    second.prepare_all().await.unwrap();
    assert_eq!(counters.prepares.load(Ordering::SeqCst), 1);

    first.startup_all().await.unwrap();
    second.startup_all().await.unwrap();
    assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
    assert!(node.is_leader("i1"));

    // 리더가 아닌 인스턴스의 tick은 노드 익스텐션을 건드리지 않음
    counters.running.store(false, Ordering::SeqCst);
    second.tick_at(Instant::now()).await;
    assert_eq!(counters.starts.load(Ordering::SeqCst), 1);
    first.tick_at(Instant::now()).await;
    assert_eq!(counters.starts.load(Ordering::SeqCst), 2);
    assert_eq!(first.node_states()[0].restart_count, 1);

    first.shutdown_all().await.unwrap();
    assert_eq!(counters.stops.load(Ordering::SeqCst), 0);
    assert!(node.is_leader("i2"));

    second.shutdown_all().await.unwrap();
    assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
    assert_eq!(node.states()[0].phase, LifecyclePhase::Stopped);

    // 재부착은 prepare 없이 새로 시작
    first.prepare_all().await.unwrap();
    first.startup_all().await.unwrap();
    assert_eq!(counters.prepares.load(Ordering::SeqCst), 1);
    assert_eq!(counters.starts.load(Ordering::SeqCst), 3);
    first.shutdown_all().await.unwrap();
}

async fn wait_for_runs(counters: &Counters, expected: usize) {
    for _ in 0..100 {
        if counters.runs.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} run(s), saw {}", expected, counters.runs.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_scheduled_task_runs_when_due() {
    let counters = Arc::new(Counters::default());
    let registry = registry("Fake", counters.clone(), Some(Duration::from_secs(60)), false);
    let mut sup = instance_supervisor(&registry, &["Fake"], settings(3), Arc::new(LogNotifier));
    sup.prepare_all().await.unwrap();
    sup.startup_all().await.unwrap();

    let due = sup.next_task_due().unwrap();
    sup.tick_at(due - Duration::from_secs(1)).await;
    tokio::task::yield_now().await;
    assert_eq!(counters.runs.load(Ordering::SeqCst), 0);

    sup.tick_at(due).await;
    wait_for_runs(&counters, 1).await;
    assert_eq!(sup.next_task_due().unwrap(), due + Duration::from_secs(60));

    sup.tick_at(due + Duration::from_secs(60)).await;
    wait_for_runs(&counters, 2).await;
    sup.shutdown_all().await.unwrap();
    assert!(sup.next_task_due().is_none());
}

#[tokio::test]
async fn test_scheduled_task_never_overlaps() {
    let counters = Arc::new(Counters::default());
    let registry = registry("Fake", counters.clone(), Some(Duration::from_secs(10)), true);
    let mut sup = instance_supervisor(&registry, &["Fake"], settings(3), Arc::new(LogNotifier));
    sup.prepare_all().await.unwrap();
    sup.startup_all().await.unwrap();

    let due = sup.next_task_due().unwrap();
    sup.tick_at(due).await;
    wait_for_runs(&counters, 1).await;

    // 첫 실행이 끝나지 않았으니 다음 슬롯은 건너뜀
    sup.tick_at(due + Duration::from_secs(10)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.runs.load(Ordering::SeqCst), 1);
    sup.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_required_node_failure_blocks_instance() {
    struct Broken;

    #[async_trait]
    impl Extension for Broken {
        fn name(&self) -> &str {
            "Broken"
        }
        fn kind(&self) -> ExtensionKind {
            ExtensionKind::ProcessBacked
        }
        async fn prepare(&mut self) -> Result<(), ExtensionError> {
            Err(ExtensionError::NotInstalled("broken.exe".into()))
        }
        async fn startup(&mut self) -> Result<(), ExtensionError> {
            Ok(())
        }
        async fn shutdown(&mut self, _grace: Duration) -> Result<(), ExtensionError> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            false
        }
        fn render(&self) -> Vec<StatusField> {
            vec![]
        }
    }

    let mut registry = ExtensionRegistry::new();
    registry.register("Broken", |_spec, _ctx| -> Result<Box<dyn Extension>, RegistryError> {
        Ok(Box::new(Broken))
    });
    let (notifier, mut events) = ChannelNotifier::new();
    let notifier: Arc<dyn AdminNotifier> = Arc::new(notifier);
    let spec = ExtensionSpec::new("Broken", Scope::Node, "n1", Options::from(json!({"required": true})));
    let node = Arc::new(NodeContext::new(node_info(), vec![spec], &registry, settings(3), notifier.clone()));

    let mut first = Supervisor::new(instance("i1"), node.clone(), vec![], &registry, settings(3), notifier.clone());
    let mut second = Supervisor::new(instance("i2"), node, vec![], &registry, settings(3), notifier);

    assert_eq!(first.prepare_all().await.unwrap_err().error_code(), "PREPARE_FAILED");
    // 캐시된 결과: 두 번째 인스턴스도 같은 실패를 보고
    assert_eq!(second.prepare_all().await.unwrap_err().error_code(), "PREPARE_FAILED");
    assert_eq!(first.startup_all().await.unwrap_err().error_code(), "NOT_PREPARED");

    let prepare_failures = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, AdminEvent::PrepareFailed { .. }))
        .count();
    assert!(prepare_failures >= 1);
}

#[tokio::test]
async fn test_disabled_extension_returns_on_next_run() {
    let counters = Arc::new(Counters::default());
    let registry = registry("Fake", counters.clone(), None, false);
    let mut sup = instance_supervisor(&registry, &["Fake"], settings(0), Arc::new(LogNotifier));

    sup.prepare_all().await.unwrap();
    sup.startup_all().await.unwrap();
    counters.running.store(false, Ordering::SeqCst);
    sup.tick().await;
    assert_eq!(sup.state("Fake").unwrap().phase, LifecyclePhase::Disabled);

    // 비활성화는 그 실행에만 적용
    sup.shutdown_all().await.unwrap();
    assert_eq!(sup.state("Fake").unwrap().phase, LifecyclePhase::Stopped);

    sup.prepare_all().await.unwrap();
    sup.startup_all().await.unwrap();
    let state = sup.state("Fake").unwrap();
    assert_eq!(state.phase, LifecyclePhase::Started);
    assert_eq!(state.restart_count, 0);
    assert_eq!(counters.starts.load(Ordering::SeqCst), 2);
    sup.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn test_disabled_node_extension_returns_on_reattach() {
    let counters = Arc::new(Counters::default());
    let registry = registry("Shared", counters.clone(), None, false);
    let notifier: Arc<dyn AdminNotifier> = Arc::new(LogNotifier);
    let node_spec = ExtensionSpec::new("Shared", Scope::Node, "n1", Options::new());
    let node = Arc::new(NodeContext::new(node_info(), vec![node_spec], &registry, settings(0), notifier.clone()));
    let mut sup = Supervisor::new(instance("i1"), node.clone(), vec![], &registry, settings(0), notifier);

    sup.prepare_all().await.unwrap();
    sup.startup_all().await.unwrap();
    counters.running.store(false, Ordering::SeqCst);
    sup.tick().await;
    assert_eq!(node.states()[0].phase, LifecyclePhase::Disabled);

    sup.shutdown_all().await.unwrap();
    assert_eq!(node.states()[0].phase, LifecyclePhase::Stopped);

    sup.prepare_all().await.unwrap();
    sup.startup_all().await.unwrap();
    assert_eq!(node.states()[0].phase, LifecyclePhase::Started);
    assert_eq!(counters.prepares.load(Ordering::SeqCst), 1);
    assert_eq!(counters.starts.load(Ordering::SeqCst), 2);
    sup.shutdown_all().await.unwrap();
}

/// 노드 익스텐션 startup이 오래 걸려도 다른 인스턴스의 tick과 상태 조회는 기다리지 않음
#[tokio::test(start_paused = true)]
async fn test_slow_node_startup_does_not_stall_other_instances() {
    struct SlowStart;

    #[async_trait]
    impl Extension for SlowStart {
        fn name(&self) -> &str {
            "SlowStart"
        }
        fn kind(&self) -> ExtensionKind {
            ExtensionKind::Passive
        }
        async fn prepare(&mut self) -> Result<(), ExtensionError> {
            Ok(())
        }
        async fn startup(&mut self) -> Result<(), ExtensionError> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        }
        async fn shutdown(&mut self, _grace: Duration) -> Result<(), ExtensionError> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            true
        }
        fn render(&self) -> Vec<StatusField> {
            vec![StatusField::new("SlowStart", "up")]
        }
    }

    let mut registry = ExtensionRegistry::new();
    registry.register("SlowStart", |_spec, _ctx| -> Result<Box<dyn Extension>, RegistryError> {
        Ok(Box::new(SlowStart))
    });
    let notifier: Arc<dyn AdminNotifier> = Arc::new(LogNotifier);
    let spec = ExtensionSpec::new("SlowStart", Scope::Node, "n1", Options::new());
    let node = Arc::new(NodeContext::new(node_info(), vec![spec], &registry, settings(3), notifier.clone()));

    let mut first = Supervisor::new(instance("i1"), node.clone(), vec![], &registry, settings(3), notifier.clone());
    let mut second = Supervisor::new(instance("i2"), node.clone(), vec![], &registry, settings(3), notifier);
    first.prepare_all().await.unwrap();
    second.prepare_all().await.unwrap();

    let starting = tokio::spawn(async move {
        first.startup_all().await.unwrap();
        first
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let began = Instant::now();
    second.tick().await;
    assert_eq!(node.states()[0].phase, LifecyclePhase::Prepared);
    assert!(began.elapsed() < Duration::from_millis(500), "blocked for {:?}", began.elapsed());

    let mut first = starting.await.unwrap();
    assert_eq!(node.states()[0].phase, LifecyclePhase::Started);
    first.shutdown_all().await.unwrap();
}
