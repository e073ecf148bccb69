//! Circuit breakers guarding the three backend operations.
//!
//! One breaker per external call site — initial load, change-feed subscribe,
//! update persist — so a failing persist path cannot blind the provider to a
//! perfectly healthy read path:
//!
//! ```text
//!            closed ──(failure rate ≥ threshold, ≥ min volume)──► open
//!              ▲                                                   │
//!   trial ok   │                                    reset interval │
//!              └─────────────── half-open ◄────────────────────────┘
//!                                   │
//!                     trial fails ──┴──► open (interval restarts)
//! ```
//!
//! Failure rate is computed over a rolling window of recent call outcomes.
//! Breaker state is deliberately never persisted: after a process restart
//! the provider should re-probe the backend, not trust a stale failure
//! history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Breaker mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker configuration, uniform across the triplet by default.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Fraction of calls in the rolling window that must fail to open.
    pub failure_rate_threshold: f64,
    /// Minimum calls in the window before the threshold is evaluated.
    pub min_volume: u32,
    /// Timeout for one guarded call; exceeding it counts as a failure.
    pub call_timeout: Duration,
    /// How long an open breaker waits before allowing one trial call.
    pub reset_interval: Duration,
    /// Rolling window size in call outcomes.
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.3,
            min_volume: 5,
            call_timeout: Duration::from_millis(5000),
            reset_interval: Duration::from_millis(20_000),
            window_size: 10,
        }
    }
}

impl BreakerConfig {
    /// Config for tests: short timeouts and reset interval.
    pub fn for_testing() -> Self {
        Self {
            failure_rate_threshold: 0.3,
            min_volume: 5,
            call_timeout: Duration::from_millis(250),
            reset_interval: Duration::from_millis(50),
            window_size: 10,
        }
    }
}

/// Snapshot of one breaker's call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerStats {
    /// Calls that reached the underlying operation.
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls rejected without execution because the breaker was open.
    pub rejections: u64,
}

/// Error returned by [`CircuitBreaker::fire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerError<E> {
    /// Breaker is open; the call was never attempted.
    Open,
    /// The call exceeded the configured timeout.
    Timeout(Duration),
    /// The underlying operation failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open => write!(f, "Circuit breaker is open"),
            BreakerError::Timeout(t) => write!(f, "Call timed out after {}ms", t.as_millis()),
            BreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BreakerError<E> {}

/// Observer invoked on every state transition with the new mode.
pub type StateObserver = Box<dyn Fn(BreakerState) + Send + Sync>;

struct BreakerCore {
    state: BreakerState,
    /// Recent call outcomes, true = success. Bounded by `window_size`.
    window: VecDeque<bool>,
    stats: BreakerStats,
    /// When the breaker last entered `Open`.
    opened_at: Option<Instant>,
    last_transition: Instant,
    /// Half-open admits exactly one in-flight trial call.
    probe_in_flight: bool,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            window: VecDeque::new(),
            stats: BreakerStats::default(),
            opened_at: None,
            last_transition: Instant::now(),
            probe_in_flight: false,
        }
    }

    fn transition(&mut self, to: BreakerState) {
        self.state = to;
        self.last_transition = Instant::now();
        match to {
            BreakerState::Open => {
                self.opened_at = Some(Instant::now());
                self.window.clear();
            }
            BreakerState::Closed => {
                self.opened_at = None;
                self.window.clear();
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn record_outcome(&mut self, success: bool, window_size: usize) {
        self.window.push_back(success);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }
}

/// A circuit breaker wrapping exactly one backend operation.
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    core: Mutex<BreakerCore>,
    observers: Mutex<Vec<StateObserver>>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            core: Mutex::new(BreakerCore::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register an observer called with the new mode on every transition.
    pub fn on_state_change(&self, observer: impl Fn(BreakerState) + Send + Sync + 'static) {
        self.observers
            .lock()
            .expect("breaker observer lock poisoned")
            .push(Box::new(observer));
    }

    pub fn state(&self) -> BreakerState {
        self.core.lock().expect("breaker lock poisoned").state
    }

    pub fn stats(&self) -> BreakerStats {
        self.core.lock().expect("breaker lock poisoned").stats
    }

    /// Time since the last state transition (diagnostic).
    pub fn time_in_state(&self) -> Duration {
        self.core
            .lock()
            .expect("breaker lock poisoned")
            .last_transition
            .elapsed()
    }

    fn notify(&self, state: BreakerState) {
        log::info!("breaker '{}' is now {}", self.name, state);
        let observers = self
            .observers
            .lock()
            .expect("breaker observer lock poisoned");
        for observer in observers.iter() {
            observer(state);
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// Lock-scoped and synchronous; the guarded future runs outside.
    fn admit(&self) -> Result<Option<BreakerState>, ()> {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        let mut transitioned = None;
        match core.state {
            BreakerState::Closed => {}
            BreakerState::Open => {
                let elapsed = core
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_interval {
                    core.transition(BreakerState::HalfOpen);
                    core.probe_in_flight = true;
                    transitioned = Some(BreakerState::HalfOpen);
                } else {
                    core.stats.rejections += 1;
                    return Err(());
                }
            }
            BreakerState::HalfOpen => {
                if core.probe_in_flight {
                    // Only one trial call is admitted while half-open
                    core.stats.rejections += 1;
                    return Err(());
                }
                core.probe_in_flight = true;
            }
        }
        core.stats.attempts += 1;
        Ok(transitioned)
    }

    fn settle(&self, success: bool) -> Option<BreakerState> {
        let mut core = self.core.lock().expect("breaker lock poisoned");
        if success {
            core.stats.successes += 1;
        } else {
            core.stats.failures += 1;
        }
        core.record_outcome(success, self.config.window_size);

        match core.state {
            BreakerState::HalfOpen => {
                core.probe_in_flight = false;
                let next = if success {
                    BreakerState::Closed
                } else {
                    BreakerState::Open
                };
                core.transition(next);
                Some(next)
            }
            BreakerState::Closed => {
                let volume = core.window.len() as u32;
                if !success
                    && volume >= self.config.min_volume
                    && core.failure_rate() >= self.config.failure_rate_threshold
                {
                    core.transition(BreakerState::Open);
                    Some(BreakerState::Open)
                } else {
                    None
                }
            }
            // A call admitted while closed can settle after the breaker
            // opened; the outcome is recorded, no transition.
            BreakerState::Open => None,
        }
    }

    /// Run one guarded call through the breaker.
    ///
    /// The call is raced against `call_timeout`; a timeout counts as a
    /// failure. Rejections while open never touch the underlying operation.
    pub async fn fire<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.fire_with_timeout(self.config.call_timeout, operation)
            .await
    }

    /// Like [`fire`](Self::fire), with an explicit timeout for this call.
    ///
    /// Used for the persist path, where the guarded future already contains
    /// a retry loop and needs a budget covering all attempts plus backoff.
    pub async fn fire_with_timeout<T, E, F, Fut>(
        &self,
        timeout: Duration,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        match self.admit() {
            Ok(Some(state)) => self.notify(state),
            Ok(None) => {}
            Err(()) => return Err(BreakerError::Open),
        }

        let outcome = tokio::time::timeout(timeout, operation()).await;

        let (success, result) = match outcome {
            Ok(Ok(value)) => (true, Ok(value)),
            Ok(Err(e)) => (false, Err(BreakerError::Inner(e))),
            Err(_) => (false, Err(BreakerError::Timeout(timeout))),
        };

        if let Some(state) = self.settle(success) {
            self.notify(state);
        }
        result
    }
}

/// The three breakers guarding a provider's backend operations.
///
/// An explicit value type: callers name the breaker they mean, there is no
/// aggregate facade pretending to be a single breaker.
#[derive(Clone)]
pub struct BreakerSet {
    pub load: Arc<CircuitBreaker>,
    pub subscribe: Arc<CircuitBreaker>,
    pub persist: Arc<CircuitBreaker>,
}

impl BreakerSet {
    /// Build the triplet with one shared configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            load: Arc::new(CircuitBreaker::new("load-initial-state", config.clone())),
            subscribe: Arc::new(CircuitBreaker::new("subscribe-remote", config.clone())),
            persist: Arc::new(CircuitBreaker::new("persist-update", config)),
        }
    }
}
