//! Due-time scheduler driven by the monitoring tick.
//!
//! Tasks live in a min-heap keyed by `next_due_at`. [`Scheduler::run_due`] pops every
//! due task, spawns it off the monitoring task under its time budget and reschedules it
//! at `now + interval`. A task whose previous run is still in flight is skipped for
//! that slot (at most one run in flight per task).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::extension::{EntryKey, ScheduledJob, ScheduledWork};

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Scheduler bookkeeping for one extension's recurring task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub extension_id: EntryKey,
    pub interval: Duration,
    pub next_due_at: Instant,
}

struct TaskSlot {
    task: ScheduledTask,
    job: Arc<dyn ScheduledJob>,
    budget: Duration,
    seq: u64,
    in_flight: Option<JoinHandle<()>>,
}

pub struct Scheduler {
    heap: BinaryHeap<Reverse<(Instant, u64, EntryKey)>>,
    slots: HashMap<EntryKey, TaskSlot>,
    next_seq: u64,
    default_budget: Duration,
}

impl Scheduler {
    pub fn new(default_budget: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
            next_seq: 0,
            default_budget,
        }
    }

    /// (Re)schedule `work` for `key`; first run at `now + interval`.
    pub fn schedule(&mut self, key: EntryKey, work: ScheduledWork, now: Instant) {
        self.cancel(&key);

        let interval = work.interval.max(MIN_INTERVAL);
        let next_due_at = now + interval;
        let seq = self.bump_seq();
        tracing::debug!("Scheduled task for {} every {:?}", key, interval);

        self.heap.push(Reverse((next_due_at, seq, key.clone())));
        self.slots.insert(
            key.clone(),
            TaskSlot {
                task: ScheduledTask {
                    extension_id: key,
                    interval,
                    next_due_at,
                },
                job: work.job,
                budget: work.budget.unwrap_or(self.default_budget),
                seq,
                in_flight: None,
            },
        );
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Launch every task due at `now`. Returns the keys that were actually started.
    pub fn run_due(&mut self, now: Instant) -> Vec<EntryKey> {
        let mut started = Vec::new();

        while let Some(Reverse((due, seq, _))) = self.heap.peek() {
            if *due > now {
                break;
            }
            let seq = *seq;
            let Some(Reverse((_, _, key))) = self.heap.pop() else {
                break;
            };

            let new_seq = self.bump_seq();
            let Some(slot) = self.slots.get_mut(&key) else {
                continue;
            };
            if slot.seq != seq {
                // 취소/재등록된 과거 항목
                continue;
            }

            let busy = slot
                .in_flight
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false);
            if busy {
                tracing::debug!("Task for {} still running, skipping this slot", key);
            } else {
                slot.in_flight = Some(spawn_job(key.to_string(), slot.job.clone(), slot.budget));
                started.push(key.clone());
            }

            slot.task.next_due_at = now + slot.task.interval;
            slot.seq = new_seq;
            self.heap.push(Reverse((slot.task.next_due_at, new_seq, key)));
        }

        started
    }

    /// Drop the task for `key` and abort a run still in flight.
    pub fn cancel(&mut self, key: &EntryKey) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                if let Some(handle) = slot.in_flight {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (key, slot) in self.slots.drain() {
            if let Some(handle) = slot.in_flight {
                if !handle.is_finished() {
                    tracing::debug!("Aborting in-flight task for {}", key);
                }
                handle.abort();
            }
        }
        self.heap.clear();
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.slots.values().map(|s| s.task.next_due_at).min()
    }

    pub fn tasks(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.slots.values().map(|s| s.task.clone()).collect();
        tasks.sort_by_key(|t| t.next_due_at);
        tasks
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn spawn_job(name: String, job: Arc<dyn ScheduledJob>, budget: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::time::timeout(budget, job.run()).await {
            Ok(Ok(())) => tracing::debug!("Scheduled task for {} done", name),
            Ok(Err(e)) => tracing::warn!("Scheduled task for {} failed: {:#}", name, e),
            Err(_) => tracing::warn!("Scheduled task for {} exceeded its {:?} budget", name, budget),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::Scope;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        runs: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ScheduledJob for Counter {
        async fn run(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn key(name: &str) -> EntryKey {
        EntryKey {
            name: name.to_string(),
            scope: Scope::Instance,
            owner_id: "i1".to_string(),
        }
    }

    fn work(counter: &Arc<Counter>, interval: Duration) -> ScheduledWork {
        ScheduledWork {
            interval,
            budget: None,
            job: counter.clone(),
        }
    }

    #[tokio::test]
    async fn test_runs_at_most_once_per_interval() {
        let counter = Arc::new(Counter { runs: AtomicUsize::new(0), delay: Duration::ZERO });
        let mut sched = Scheduler::new(Duration::from_secs(5));
        let t0 = Instant::now();
        let interval = Duration::from_secs(60);
        sched.schedule(key("Lardoon"), work(&counter, interval), t0);

        // 아직 due 아님
        assert!(sched.run_due(t0 + Duration::from_secs(59)).is_empty());
        // 같은 윈도우 안에서 여러 번 틱 → 한 번만
        assert_eq!(sched.run_due(t0 + Duration::from_secs(60)).len(), 1);
        tokio::task::yield_now().await;
        assert!(sched.run_due(t0 + Duration::from_secs(61)).is_empty());
        assert!(sched.run_due(t0 + Duration::from_secs(119)).is_empty());
        // 다음 윈도우
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sched.run_due(t0 + Duration::from_secs(120)).len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.runs.load(Ordering::SeqCst), 2);
        assert_eq!(sched.next_due(), Some(t0 + Duration::from_secs(180)));
    }

    #[tokio::test]
    async fn test_late_tick_does_not_burst() {
        let counter = Arc::new(Counter { runs: AtomicUsize::new(0), delay: Duration::ZERO });
        let mut sched = Scheduler::new(Duration::from_secs(5));
        let t0 = Instant::now();
        sched.schedule(key("SRS"), work(&counter, Duration::from_secs(10)), t0);

        // 틱이 5 인터벌 늦어도 한 번만 실행
        assert_eq!(sched.run_due(t0 + Duration::from_secs(55)).len(), 1);
        assert_eq!(sched.tasks()[0].next_due_at, t0 + Duration::from_secs(65));
    }

    #[tokio::test]
    async fn test_slow_task_does_not_delay_others() {
        let slow = Arc::new(Counter { runs: AtomicUsize::new(0), delay: Duration::from_secs(30) });
        let fast = Arc::new(Counter { runs: AtomicUsize::new(0), delay: Duration::ZERO });
        let mut sched = Scheduler::new(Duration::from_secs(60));
        let t0 = Instant::now();
        let interval = Duration::from_millis(100);
        sched.schedule(key("Slow"), work(&slow, interval), t0);
        sched.schedule(key("Fast"), work(&fast, interval), t0);

        let started = std::time::Instant::now();
        assert_eq!(sched.run_due(t0 + interval).len(), 2);
        // run_due는 작업 완료를 기다리지 않음
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = sched.run_due(t0 + interval * 2);
        // 느린 작업은 아직 실행 중 → 건너뜀, 빠른 작업은 제시간
        assert_eq!(second, vec![key("Fast")]);
        let due: Vec<_> = sched.tasks().into_iter().map(|t| t.next_due_at).collect();
        assert!(due.iter().all(|d| *d == t0 + interval * 3));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(slow.runs.load(Ordering::SeqCst), 1);
        assert_eq!(fast.runs.load(Ordering::SeqCst), 2);
        sched.cancel_all();
        assert!(sched.is_empty());
    }

    #[tokio::test]
    async fn test_budget_bounds_task() {
        let slow = Arc::new(Counter { runs: AtomicUsize::new(0), delay: Duration::from_secs(30) });
        let mut sched = Scheduler::new(Duration::from_secs(60));
        let t0 = Instant::now();
        sched.schedule(
            key("Bounded"),
            ScheduledWork {
                interval: Duration::from_millis(10),
                budget: Some(Duration::from_millis(50)),
                job: slow.clone(),
            },
            t0,
        );
        sched.run_due(t0 + Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(200)).await;
        // 예산 초과로 끊김 → 다음 슬롯에서 다시 실행 가능
        assert_eq!(sched.run_due(t0 + Duration::from_millis(20)).len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_task() {
        let counter = Arc::new(Counter { runs: AtomicUsize::new(0), delay: Duration::ZERO });
        let mut sched = Scheduler::new(Duration::from_secs(5));
        let t0 = Instant::now();
        sched.schedule(key("Tacview"), work(&counter, Duration::from_secs(1)), t0);
        assert!(sched.cancel(&key("Tacview")));
        assert!(!sched.cancel(&key("Tacview")));
        assert!(sched.run_due(t0 + Duration::from_secs(5)).is_empty());
        assert_eq!(sched.next_due(), None);
    }
}
