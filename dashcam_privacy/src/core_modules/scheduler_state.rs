// THEORY:
// The `SchedulerState` is the only mutable state the watcher and the workers share.
// It replaces ambient, process-wide counters with one object handed to every task.
//
// Key architectural principles:
// 1.  **One lock per logical map**: Retry counters, the claim set, the error counter and
//     the health monitor each sit behind their own mutex. No operation ever holds two
//     of them at once, so there is no lock ordering to get wrong.
// 2.  **Small, pure state machines**: `RetryTracker`, `ErrorEscalation`, `ClaimSet` and
//     `HealthMonitor` are plain structs with no I/O. They decide; the caller acts.
// 3.  **Poison is survivable**: A panicking worker must not wedge the whole pool, so
//     poisoned locks are recovered rather than propagated.

use crate::store::HealthStatus;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What to do with a frame after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Leave it pending; it will be claimed again.
    Retry { attempts: u32 },
    /// Give up: persist the error and stop retrying it in this process.
    Abandon { attempts: u32 },
}

/// Consecutive-failure counters keyed by frame name.
#[derive(Debug)]
pub struct RetryTracker {
    counters: HashMap<String, u32>,
    max_retries: u32,
}

impl RetryTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            counters: HashMap::new(),
            max_retries: max_retries.max(1),
        }
    }

    pub fn record_failure(&mut self, frame: &str) -> RetryOutcome {
        let attempts = {
            let counter = self.counters.entry(frame.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        if attempts >= self.max_retries {
            self.counters.remove(frame);
            RetryOutcome::Abandon { attempts }
        } else {
            RetryOutcome::Retry { attempts }
        }
    }

    pub fn record_success(&mut self, frame: &str) {
        self.counters.remove(frame);
    }

    pub fn attempts(&self, frame: &str) -> u32 {
        self.counters.get(frame).copied().unwrap_or(0)
    }

    /// Number of frames waiting for another attempt.
    pub fn pending(&self) -> usize {
        self.counters.len()
    }
}

/// Counts consecutive batch-level errors and decides when to report failure.
#[derive(Debug)]
pub struct ErrorEscalation {
    consecutive: u32,
    threshold: u32,
}

impl ErrorEscalation {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
        }
    }

    /// Returns true when this error pushed the count past the threshold. The count
    /// restarts from zero at that point.
    pub fn record_error(&mut self) -> bool {
        self.consecutive += 1;
        if self.consecutive > self.threshold {
            self.consecutive = 0;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn count(&self) -> u32 {
        self.consecutive
    }
}

/// Frames this process must not claim: those in flight and those it gave up on.
#[derive(Debug, Default)]
pub struct ClaimSet {
    in_flight: HashSet<String>,
    abandoned: HashSet<String>,
}

impl ClaimSet {
    /// Marks frames as in flight. Returns false if any of them already was, in which
    /// case nothing is marked.
    pub fn acquire<'a>(&mut self, frames: impl IntoIterator<Item = &'a str> + Clone) -> bool {
        if frames.clone().into_iter().any(|f| self.in_flight.contains(f)) {
            return false;
        }
        self.in_flight.extend(frames.into_iter().map(str::to_string));
        true
    }

    pub fn release(&mut self, frame: &str) {
        self.in_flight.remove(frame);
    }

    /// Releases the frame and excludes it for the rest of the process lifetime.
    pub fn abandon(&mut self, frame: &str) {
        self.in_flight.remove(frame);
        self.abandoned.insert(frame.to_string());
    }

    pub fn is_abandoned(&self, frame: &str) -> bool {
        self.abandoned.contains(frame)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Everything a claim must skip.
    pub fn excluded(&self) -> HashSet<String> {
        self.in_flight.union(&self.abandoned).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Errors,
    Backlog,
}

/// Tracks the published health value and why it was last set to failed.
#[derive(Debug)]
pub struct HealthMonitor {
    status: HealthStatus,
    cause: Option<FailureCause>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            cause: None,
        }
    }
}

impl HealthMonitor {
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn cause(&self) -> Option<FailureCause> {
        self.cause
    }

    pub fn mark_healthy(&mut self) {
        self.status = HealthStatus::Healthy;
        self.cause = None;
    }

    /// Error escalation always publishes `failed`, even if already failed.
    pub fn escalate_errors(&mut self) -> HealthStatus {
        self.status = HealthStatus::Failed;
        self.cause = Some(FailureCause::Errors);
        self.status
    }

    /// Returns a new value to publish, if the backlog changes the health.
    pub fn observe_backlog(&mut self, backlog: usize, threshold: Option<usize>) -> Option<HealthStatus> {
        let threshold = threshold?;
        if backlog > threshold {
            if self.status == HealthStatus::Healthy {
                self.status = HealthStatus::Failed;
                self.cause = Some(FailureCause::Backlog);
                return Some(self.status);
            }
        } else if self.cause == Some(FailureCause::Backlog) {
            self.mark_healthy();
            return Some(self.status);
        }
        None
    }
}

/// Scheduler-owned state shared by the watcher and every worker.
#[derive(Debug)]
pub struct SchedulerState {
    retries: Mutex<RetryTracker>,
    escalation: Mutex<ErrorEscalation>,
    claims: Mutex<ClaimSet>,
    health: Mutex<HealthMonitor>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SchedulerState {
    pub fn new(max_retries: u32, escalation_threshold: u32) -> Self {
        Self {
            retries: Mutex::new(RetryTracker::new(max_retries)),
            escalation: Mutex::new(ErrorEscalation::new(escalation_threshold)),
            claims: Mutex::new(ClaimSet::default()),
            health: Mutex::new(HealthMonitor::default()),
        }
    }

    pub fn retries(&self) -> MutexGuard<'_, RetryTracker> {
        lock(&self.retries)
    }

    pub fn escalation(&self) -> MutexGuard<'_, ErrorEscalation> {
        lock(&self.escalation)
    }

    pub fn claims(&self) -> MutexGuard<'_, ClaimSet> {
        lock(&self.claims)
    }

    pub fn health(&self) -> MutexGuard<'_, HealthMonitor> {
        lock(&self.health)
    }

    pub fn pending_retries(&self) -> usize {
        self.retries().pending()
    }

    pub fn excluded(&self) -> HashSet<String> {
        self.claims().excluded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn third_failure_abandons_and_clears_the_counter() {
        let mut retries = RetryTracker::new(3);
        assert_eq!(retries.record_failure("a.jpg"), RetryOutcome::Retry { attempts: 1 });
        assert_eq!(retries.record_failure("a.jpg"), RetryOutcome::Retry { attempts: 2 });
        assert_eq!(retries.pending(), 1);
        assert_eq!(retries.record_failure("a.jpg"), RetryOutcome::Abandon { attempts: 3 });
        assert_eq!(retries.attempts("a.jpg"), 0);
        assert_eq!(retries.pending(), 0);
    }

    #[test]
    fn success_resets_retries() {
        let mut retries = RetryTracker::new(3);
        retries.record_failure("a.jpg");
        retries.record_failure("a.jpg");
        retries.record_success("a.jpg");
        assert_eq!(retries.record_failure("a.jpg"), RetryOutcome::Retry { attempts: 1 });
    }

    #[test]
    fn eleventh_error_escalates_and_twelfth_counts_from_one() {
        let mut escalation = ErrorEscalation::new(10);
        for _ in 0..10 {
            assert!(!escalation.record_error());
        }
        assert_eq!(escalation.count(), 10);
        assert!(escalation.record_error());
        assert_eq!(escalation.count(), 0);
        assert!(!escalation.record_error());
        assert_eq!(escalation.count(), 1);
    }

    #[test]
    fn claim_set_refuses_double_acquire() {
        let mut claims = ClaimSet::default();
        assert!(claims.acquire(["a.jpg", "b.jpg"]));
        assert!(!claims.acquire(["b.jpg", "c.jpg"]));
        assert_eq!(claims.in_flight_count(), 2);

        claims.release("a.jpg");
        claims.abandon("b.jpg");
        assert_eq!(claims.in_flight_count(), 0);
        assert!(claims.is_abandoned("b.jpg"));
        assert_eq!(claims.excluded(), HashSet::from(["b.jpg".to_string()]));
    }

    #[test]
    fn backlog_failure_recovers_only_when_backlog_caused_it() {
        let mut health = HealthMonitor::default();
        assert_eq!(health.observe_backlog(100, None), None);
        assert_eq!(health.observe_backlog(100, Some(50)), Some(HealthStatus::Failed));
        assert_eq!(health.observe_backlog(120, Some(50)), None);
        assert_eq!(health.observe_backlog(10, Some(50)), Some(HealthStatus::Healthy));

        health.escalate_errors();
        assert_eq!(health.observe_backlog(10, Some(50)), None);
        assert_eq!(health.status(), HealthStatus::Failed);
        assert_eq!(health.cause(), Some(FailureCause::Errors));
    }

    #[test]
    fn concurrent_acquires_never_share_a_frame() {
        let state = Arc::new(SchedulerState::new(3, 10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    let names: Vec<String> = (0..50).map(|i| format!("{i}.jpg")).collect();
                    names
                        .iter()
                        .filter(|name| state.claims().acquire([name.as_str()]))
                        .count()
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().expect("thread")).sum();
        assert_eq!(total, 50);
    }
}
