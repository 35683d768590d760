//! Sliding-window restart budget.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            window: Duration::from_secs(300),
        }
    }
}

/// 윈도우 안에서 이미 사용한 재시작 시각들
#[derive(Debug, Clone)]
pub struct RestartBudget {
    policy: RestartPolicy,
    attempts: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: VecDeque::new(),
        }
    }

    /// Reserve one restart at `now`. Returns false when `max_restarts` attempts
    /// already happened within the trailing window.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.attempts.front() {
            if now.saturating_duration_since(oldest) >= self.policy.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        if self.attempts.len() >= self.policy.max_restarts as usize {
            return false;
        }
        self.attempts.push_back(now);
        true
    }

    pub fn used(&self) -> usize {
        self.attempts.len()
    }

    pub fn reset(&mut self) {
        self.attempts.clear();
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhausts_within_window() {
        let mut budget = RestartBudget::new(RestartPolicy {
            max_restarts: 2,
            window: Duration::from_secs(60),
        });
        let t0 = Instant::now();
        assert!(budget.try_acquire(t0));
        assert!(budget.try_acquire(t0 + Duration::from_secs(10)));
        assert!(!budget.try_acquire(t0 + Duration::from_secs(20)));
        assert_eq!(budget.used(), 2);
    }

    #[test]
    fn test_budget_slides() {
        let mut budget = RestartBudget::new(RestartPolicy {
            max_restarts: 1,
            window: Duration::from_secs(60),
        });
        let t0 = Instant::now();
        assert!(budget.try_acquire(t0));
        assert!(!budget.try_acquire(t0 + Duration::from_secs(59)));
        // 첫 시도가 윈도우 밖으로 빠짐
        assert!(budget.try_acquire(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        let mut budget = RestartBudget::new(RestartPolicy {
            max_restarts: 0,
            window: Duration::from_secs(1),
        });
        assert!(!budget.try_acquire(Instant::now()));
    }

    #[test]
    fn test_reset() {
        let mut budget = RestartBudget::new(RestartPolicy::default());
        let now = Instant::now();
        for _ in 0..3 {
            assert!(budget.try_acquire(now));
        }
        assert!(!budget.try_acquire(now));
        budget.reset();
        assert!(budget.try_acquire(now));
    }
}
