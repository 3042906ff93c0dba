//! Circuit breakers guarding each backend and the enhancement service.
//!
//! ```text
//! Closed   → Open      consecutive_failures >= failure_threshold
//! Open     → HalfOpen  lazily, when a call arrives after recovery_timeout
//! HalfOpen → Closed    the single trial call succeeds
//! HalfOpen → Open      the trial call fails (restarts the recovery clock)
//! ```
//!
//! Admission and state changes happen under one lock, so exactly one
//! trial is admitted in HalfOpen no matter how many callers race.
//!
//! Every admission carries the breaker's epoch, which advances on each
//! state change. An outcome reported under an older epoch (a call admitted
//! before the circuit opened, or an abandoned trial) only feeds the
//! counters and never moves the state machine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;

use mh_domain::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Returned by [`CircuitBreaker::check`] when a call is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen {
    pub retry_after: Duration,
}

/// Proof of admission handed out by [`CircuitBreaker::check`]. Pass it
/// back to exactly one of `record_success` / `record_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "report the outcome with record_success or record_failure"]
pub struct Admission {
    epoch: u64,
    trial: bool,
}

impl Admission {
    /// Whether this call is the HalfOpen trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

#[derive(Debug)]
struct BreakerState {
    status: BreakerStatus,
    epoch: u64,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    /// Set while a HalfOpen trial is outstanding.
    trial_started: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
    stale: u64,
}

impl BreakerState {
    fn enter(&mut self, status: BreakerStatus) {
        self.status = status;
        self.epoch += 1;
    }

    /// True when `admission` was issued under the current epoch.
    fn is_current(&self, admission: Admission) -> bool {
        admission.epoch == self.epoch
    }
}

/// Point-in-time view of a breaker for the operational API.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub last_failure_secs_ago: Option<u64>,
    pub retry_after_secs: Option<u64>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected: u64,
    /// Outcomes that arrived after the breaker had moved on.
    pub stale_outcomes: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                status: BreakerStatus::Closed,
                epoch: 0,
                consecutive_failures: 0,
                last_failure: None,
                trial_started: None,
                total_successes: 0,
                total_failures: 0,
                rejected: 0,
                stale: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    pub fn status(&self) -> BreakerStatus {
        self.state.lock().status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Whether a call arriving now would be admitted. Read-only: use
    /// [`check`](Self::check) to actually claim admission.
    pub fn can_execute(&self) -> bool {
        let recovery = self.config.recovery_timeout();
        let now = Instant::now();
        let st = self.state.lock();
        match st.status {
            BreakerStatus::Closed => true,
            BreakerStatus::Open => st
                .last_failure
                .map_or(true, |t| now.saturating_duration_since(t) >= recovery),
            BreakerStatus::HalfOpen => st
                .trial_started
                .map_or(true, |t| now.saturating_duration_since(t) >= recovery),
        }
    }

    /// Claim admission for one protected call, or report how long to wait.
    pub fn check(&self) -> Result<Admission, CircuitOpen> {
        let recovery = self.config.recovery_timeout();
        let now = Instant::now();
        let mut st = self.state.lock();

        let status = st.status;
        match status {
            BreakerStatus::Closed => Ok(Admission {
                epoch: st.epoch,
                trial: false,
            }),
            BreakerStatus::Open => {
                let elapsed = st
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(recovery);
                if elapsed >= recovery {
                    st.enter(BreakerStatus::HalfOpen);
                    st.trial_started = Some(now);
                    tracing::info!(breaker = %self.name, "circuit half-open, admitting trial call");
                    Ok(Admission {
                        epoch: st.epoch,
                        trial: true,
                    })
                } else {
                    st.rejected += 1;
                    Err(CircuitOpen {
                        retry_after: recovery - elapsed,
                    })
                }
            }
            BreakerStatus::HalfOpen => match st.trial_started {
                Some(started) if now.saturating_duration_since(started) < recovery => {
                    st.rejected += 1;
                    Err(CircuitOpen {
                        retry_after: recovery - now.saturating_duration_since(started),
                    })
                }
                _ => {
                    tracing::warn!(breaker = %self.name, "trial call never reported back, admitting another");
                    // New epoch so the abandoned trial can no longer decide.
                    st.enter(BreakerStatus::HalfOpen);
                    st.trial_started = Some(now);
                    Ok(Admission {
                        epoch: st.epoch,
                        trial: true,
                    })
                }
            },
        }
    }

    pub fn record_success(&self, admission: Admission) {
        let mut st = self.state.lock();
        st.total_successes += 1;
        if !st.is_current(admission) {
            st.stale += 1;
            return;
        }
        let status = st.status;
        match status {
            BreakerStatus::HalfOpen if admission.trial => {
                st.enter(BreakerStatus::Closed);
                st.consecutive_failures = 0;
                st.trial_started = None;
                tracing::info!(breaker = %self.name, "circuit closed after successful trial");
            }
            BreakerStatus::Closed => st.consecutive_failures = 0,
            _ => st.stale += 1,
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        let now = Instant::now();
        let mut st = self.state.lock();
        st.total_failures += 1;
        if !st.is_current(admission) {
            st.stale += 1;
            return;
        }

        let status = st.status;
        match status {
            BreakerStatus::Closed => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                st.last_failure = Some(now);
                if st.consecutive_failures >= self.config.failure_threshold {
                    st.enter(BreakerStatus::Open);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = st.consecutive_failures,
                        recovery_secs = self.config.recovery_timeout_secs,
                        "circuit opened"
                    );
                }
            }
            BreakerStatus::HalfOpen if admission.trial => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                st.last_failure = Some(now);
                st.trial_started = None;
                st.enter(BreakerStatus::Open);
                tracing::warn!(breaker = %self.name, "trial call failed, circuit re-opened");
            }
            _ => st.stale += 1,
        }
    }

    /// Time until the next call would be admitted, `None` when admitting now.
    pub fn retry_after(&self) -> Option<Duration> {
        let recovery = self.config.recovery_timeout();
        let now = Instant::now();
        let st = self.state.lock();
        let since = match st.status {
            BreakerStatus::Closed => return None,
            BreakerStatus::Open => st.last_failure,
            BreakerStatus::HalfOpen => st.trial_started,
        }?;
        recovery
            .checked_sub(now.saturating_duration_since(since))
            .filter(|d| !d.is_zero())
    }

    /// Force the breaker back to Closed (operator action).
    pub fn reset(&self) {
        let mut st = self.state.lock();
        st.enter(BreakerStatus::Closed);
        st.consecutive_failures = 0;
        st.last_failure = None;
        st.trial_started = None;
        tracing::info!(breaker = %self.name, "circuit manually reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let retry_after_secs = self.retry_after().map(super::error::retry_after_secs);
        let st = self.state.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            status: st.status,
            consecutive_failures: st.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            recovery_timeout_secs: self.config.recovery_timeout_secs,
            last_failure_secs_ago: st.last_failure.map(|t| t.elapsed().as_secs()),
            retry_after_secs,
            total_successes: st.total_successes,
            total_failures: st.total_failures,
            rejected: st.rejected,
            stale_outcomes: st.stale,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Named breakers: one per backend server plus one for enhancement.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the named breaker, creating it with `config` on first use.
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(name) {
            return b.clone();
        }
        self.breakers
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.write().remove(name)
    }

    pub fn list(&self) -> Vec<BreakerSnapshot> {
        self.breakers.read().values().map(|b| b.snapshot()).collect()
    }

    /// Reset the named breaker. Returns `false` for unknown names.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new("test", BreakerConfig::new(threshold, Duration::from_secs(recovery_secs)))
    }

    fn fail(cb: &CircuitBreaker) {
        let admission = cb.check().unwrap();
        cb.record_failure(admission);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_recovers_through_half_open() {
        let cb = breaker(3, 30);
        for _ in 0..3 {
            assert!(cb.can_execute());
            fail(&cb);
        }
        assert_eq!(cb.status(), BreakerStatus::Open);
        assert!(!cb.can_execute());

        let open = cb.check().unwrap_err();
        assert_eq!(super::super::error::retry_after_secs(open.retry_after), 30);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.can_execute());
        let trial = cb.check().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.status(), BreakerStatus::HalfOpen);

        cb.record_success(trial);
        assert_eq!(cb.status(), BreakerStatus::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_threshold() {
        let cb = breaker(3, 30);
        fail(&cb);
        fail(&cb);
        let ok = cb.check().unwrap();
        cb.record_success(ok);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.status(), BreakerStatus::Closed);
        assert!(cb.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_trial() {
        let cb = breaker(1, 10);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(cb.check().is_ok());
        for _ in 0..5 {
            assert!(cb.check().is_err());
            assert!(!cb.can_execute());
        }
        assert_eq!(cb.snapshot().rejected, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_and_restarts_clock() {
        let cb = breaker(2, 30);
        fail(&cb);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        fail(&cb);
        assert_eq!(cb.status(), BreakerStatus::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        let open = cb.check().unwrap_err();
        assert_eq!(open.retry_after, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_from_closed_call_does_not_decide_trial() {
        let cb = breaker(1, 10);
        let slow = cb.check().unwrap();
        let failing = cb.check().unwrap();
        cb.record_failure(failing);
        assert_eq!(cb.status(), BreakerStatus::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        let trial = cb.check().unwrap();

        // The call admitted while Closed finishes while the trial is pending.
        cb.record_success(slow);
        assert_eq!(cb.status(), BreakerStatus::HalfOpen);
        for _ in 0..3 {
            assert!(cb.check().is_err());
        }

        cb.record_success(trial);
        assert_eq!(cb.status(), BreakerStatus::Closed);
        assert_eq!(cb.snapshot().stale_outcomes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_does_not_reopen_or_delay_recovery() {
        let cb = breaker(1, 10);
        let a = cb.check().unwrap();
        let b = cb.check().unwrap();
        let c = cb.check().unwrap();
        cb.record_failure(a);

        // A straggler failing while Open leaves the recovery clock alone.
        tokio::time::advance(Duration::from_secs(5)).await;
        cb.record_failure(b);
        assert_eq!(cb.check().unwrap_err().retry_after, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(5)).await;
        let trial = cb.check().unwrap();
        // Another straggler failing during the trial does not re-open.
        cb.record_failure(c);
        assert_eq!(cb.status(), BreakerStatus::HalfOpen);

        cb.record_success(trial);
        assert_eq!(cb.status(), BreakerStatus::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.snapshot().stale_outcomes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_is_replaced_after_recovery_timeout() {
        let cb = breaker(1, 5);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(5)).await;
        let abandoned = cb.check().unwrap();
        // The trial's caller goes quiet.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cb.check().is_err());
        tokio::time::advance(Duration::from_secs(1)).await;
        let replacement = cb.check().unwrap();
        assert_eq!(cb.status(), BreakerStatus::HalfOpen);

        // Only the replacement decides.
        cb.record_failure(abandoned);
        assert_eq!(cb.status(), BreakerStatus::HalfOpen);
        cb.record_success(replacement);
        assert_eq!(cb.status(), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_immediately() {
        let cb = breaker(1, 60);
        let before = cb.check().unwrap();
        fail(&cb);
        assert!(cb.check().is_err());
        cb.reset();
        assert!(cb.can_execute());
        assert_eq!(cb.snapshot().consecutive_failures, 0);
        assert!(cb.retry_after().is_none());

        // Outcomes from before the reset are ignored.
        cb.record_failure(before);
        assert_eq!(cb.status(), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_half_open_admission_is_exclusive() {
        let cb = Arc::new(breaker(1, 1));
        fail(&cb);
        tokio::time::advance(Duration::from_secs(1)).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cb = cb.clone();
                tokio::spawn(async move { cb.check().is_ok() })
            })
            .collect();
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[test]
    fn registry_creates_once_and_resets_by_name() {
        let reg = BreakerRegistry::new();
        let a = reg.get_or_create("fs", BreakerConfig::new(1, Duration::from_secs(60)));
        let again = reg.get_or_create("fs", BreakerConfig::default());
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(again.config().failure_threshold, 1);

        fail(&a);
        assert!(reg.reset("fs"));
        assert!(!reg.reset("missing"));
        assert_eq!(reg.list()[0].status, BreakerStatus::Closed);
    }
}
