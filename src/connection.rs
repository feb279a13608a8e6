//! Reconnect and health-check loop shared by every long-lived connection

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::error::{BridgeError, Result};
use crate::events::{Event, EventSink};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const JITTER_FRACTION: f64 = 0.1;

/// The thing being kept alive
pub trait ConnectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn connect(&self) -> Result<()>;
    fn disconnect(&self);
    fn is_connected(&self) -> bool;
    fn health_check(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_consecutive_failures: u32,
    pub failure_cooldown: Duration,
    pub health_check_interval: Duration,
    pub max_failed_health_checks: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_consecutive_failures: 10,
            failure_cooldown: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
            max_failed_health_checks: 3,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay.is_zero() {
            return Err(BridgeError::config("initial delay must be positive"));
        }
        if self.max_delay < self.initial_delay {
            return Err(BridgeError::config("max delay must be >= initial delay"));
        }
        if !(self.backoff_multiplier > 1.0) {
            return Err(BridgeError::config("backoff multiplier must be > 1"));
        }
        if self.max_consecutive_failures == 0 || self.max_failed_health_checks == 0 {
            return Err(BridgeError::config("failure thresholds must be positive"));
        }
        if self.health_check_interval.is_zero() {
            return Err(BridgeError::config("health check interval must be positive"));
        }
        Ok(())
    }

    /// Delay before the next attempt after `failures` consecutive failures, without jitter.
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Nominal delay with ±10% uniform jitter.
    pub fn jittered_delay(&self, failures: u32) -> Duration {
        let nominal = self.nominal_delay(failures).as_secs_f64();
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        Duration::from_secs_f64((nominal * (1.0 + jitter)).max(0.0))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub consecutive_failures: u32,
    pub current_delay: Duration,
    pub total_reconnections: u64,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    HealthDegraded,
}

type StateCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct Shared {
    strategy: Arc<dyn ConnectionStrategy>,
    config: RetryConfig,
    stats: Mutex<RetryStats>,
    state: Mutex<ConnectionState>,
    failed_health_checks: Mutex<u32>,
    last_health_check: Mutex<Instant>,
    running: AtomicBool,
    force_reconnect: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
    callback: Mutex<Option<StateCallback>>,
    sink: Arc<dyn EventSink>,
    span: tracing::Span,
}

/// Keeps a [`ConnectionStrategy`] connected with exponential backoff.
pub struct ReconnectManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectManager {
    pub fn new(
        strategy: Arc<dyn ConnectionStrategy>,
        config: RetryConfig,
        sink: Arc<dyn EventSink>,
        span: tracing::Span,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                strategy,
                config,
                stats: Mutex::new(RetryStats::default()),
                state: Mutex::new(ConnectionState::Disconnected),
                failed_health_checks: Mutex::new(0),
                last_health_check: Mutex::new(Instant::now()),
                running: AtomicBool::new(false),
                force_reconnect: AtomicBool::new(false),
                wake_lock: Mutex::new(()),
                wake: Condvar::new(),
                callback: Mutex::new(None),
                sink,
                span,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Called with `true` on every successful connect and `false` on every loss.
    pub fn set_connection_callback(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        *self.shared.callback.lock() = Some(Arc::new(callback));
    }

    /// Tries one immediate connect, then hands over to the background loop.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        {
            let _enter = shared.span.enter();
            tracing::info!("Starting connection manager for {}", shared.strategy.name());
            shared.attempt_connect(Instant::now(), false);
        }

        let spawned = std::thread::Builder::new()
            .name(format!("reconnect-{}", shared.strategy.name()))
            .spawn(move || {
                let _enter = shared.span.enter();
                shared.run();
            });

        match spawned {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                tracing::error!("Failed to spawn reconnect worker: {}", e);
            }
        }
    }

    /// Stops the loop and disconnects; no background activity remains afterwards.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.wake_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Reconnect worker panicked");
            }
        }

        let was_connected = self.shared.strategy.is_connected();
        self.shared.strategy.disconnect();
        self.shared.set_state(ConnectionState::Disconnected);
        if was_connected {
            self.shared.notify(false);
        }
    }

    /// Drops the current connection and retries immediately, interrupting any backoff.
    pub fn force_reconnect(&self) {
        self.shared.force_reconnect.store(true, Ordering::SeqCst);
        self.shared.wake_all();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.strategy.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn stats(&self) -> RetryStats {
        self.shared.stats.lock().clone()
    }
}

impl Drop for ReconnectManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        // A failed attempt in start() already scheduled a backoff
        let pending_delay = self.stats.lock().current_delay;
        if !self.strategy.is_connected() && !pending_delay.is_zero() {
            self.sleep_interruptibly(pending_delay);
        }

        while self.running.load(Ordering::SeqCst) {
            if self.force_reconnect.swap(false, Ordering::SeqCst) {
                self.handle_force_reconnect();
            }

            let now = Instant::now();
            if self.strategy.is_connected() {
                self.maybe_health_check(now);
            } else {
                if self.current_state() != ConnectionState::Disconnected {
                    tracing::warn!("{} connection lost", self.strategy.name());
                    self.set_state(ConnectionState::Disconnected);
                    self.notify(false);
                }

                if self.reconnection_permitted(now) && !self.attempt_connect(now, true) {
                    let delay = self.stats.lock().current_delay;
                    tracing::debug!("Retrying {} in {:?}", self.strategy.name(), delay);
                    self.sleep_interruptibly(delay);
                    continue;
                }
            }

            self.sleep_interruptibly(POLL_INTERVAL);
        }
    }

    /// Returns whether the attempt succeeded.
    fn attempt_connect(&self, now: Instant, is_retry: bool) -> bool {
        self.set_state(ConnectionState::Connecting);

        match self.strategy.connect() {
            Ok(()) => {
                {
                    let mut stats = self.stats.lock();
                    stats.consecutive_failures = 0;
                    stats.current_delay = Duration::ZERO;
                    stats.last_success = Some(now);
                    if is_retry {
                        stats.total_reconnections = stats.total_reconnections.saturating_add(1);
                    }
                }
                *self.failed_health_checks.lock() = 0;
                *self.last_health_check.lock() = now;
                self.set_state(ConnectionState::Connected);
                tracing::info!("{} connected", self.strategy.name());
                self.notify(true);
                true
            }
            Err(e) => {
                let (failures, delay) = {
                    let mut stats = self.stats.lock();
                    stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                    stats.last_failure = Some(now);
                    stats.current_delay = self.config.jittered_delay(stats.consecutive_failures);
                    (stats.consecutive_failures, stats.current_delay)
                };
                self.set_state(ConnectionState::Disconnected);
                tracing::debug!(
                    "{} connect attempt {} failed: {} (next in {:?})",
                    self.strategy.name(),
                    failures,
                    e,
                    delay
                );
                if failures == self.config.max_consecutive_failures {
                    tracing::warn!(
                        "{} failed {} times in a row, cooling down for {:?}",
                        self.strategy.name(),
                        failures,
                        self.config.failure_cooldown
                    );
                }
                false
            }
        }
    }

    /// After too many failures, attempts pause until the cooldown has passed.
    fn reconnection_permitted(&self, now: Instant) -> bool {
        let mut stats = self.stats.lock();
        if stats.consecutive_failures < self.config.max_consecutive_failures {
            return true;
        }

        let cooled_down = stats.last_failure.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.config.failure_cooldown
        });
        if cooled_down {
            tracing::info!("Cooldown over for {}, resuming attempts", self.strategy.name());
            stats.consecutive_failures = 0;
            stats.current_delay = Duration::ZERO;
        }
        cooled_down
    }

    fn maybe_health_check(&self, now: Instant) {
        {
            let mut last = self.last_health_check.lock();
            if now.saturating_duration_since(*last) < self.config.health_check_interval {
                return;
            }
            *last = now;
        }

        match self.strategy.health_check() {
            Ok(()) => {
                *self.failed_health_checks.lock() = 0;
                self.set_state(ConnectionState::Connected);
                self.sink.publish(Event::HealthCheckSucceeded);
            }
            Err(e) => {
                let failed = {
                    let mut failed = self.failed_health_checks.lock();
                    *failed = failed.saturating_add(1);
                    *failed
                };
                tracing::warn!("{} health check failed ({}): {}", self.strategy.name(), failed, e);
                self.sink.publish(Event::HealthCheckFailed { consecutive: failed });
                self.set_state(ConnectionState::HealthDegraded);

                if failed >= self.config.max_failed_health_checks {
                    tracing::warn!("{} unhealthy, dropping connection", self.strategy.name());
                    *self.failed_health_checks.lock() = 0;
                    self.strategy.disconnect();
                    self.set_state(ConnectionState::Disconnected);
                    self.notify(false);
                }
            }
        }
    }

    fn handle_force_reconnect(&self) {
        tracing::info!("Forcing reconnect of {}", self.strategy.name());
        let was_connected = self.strategy.is_connected();
        self.strategy.disconnect();
        {
            let mut stats = self.stats.lock();
            *stats = RetryStats {
                total_reconnections: stats.total_reconnections,
                ..RetryStats::default()
            };
        }
        *self.failed_health_checks.lock() = 0;
        self.set_state(ConnectionState::Disconnected);
        if was_connected {
            self.notify(false);
        }
    }

    fn sleep_interruptibly(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut guard = self.wake_lock.lock();
        while self.running.load(Ordering::SeqCst) && !self.force_reconnect.load(Ordering::SeqCst) {
            if self.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
    }

    fn wake_all(&self) {
        let _guard = self.wake_lock.lock();
        self.wake.notify_all();
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn notify(&self, connected: bool) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(connected);
        }
    }
}
