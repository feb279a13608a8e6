//! Races every known address of a server and keeps the first live event stream

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::sse::{SseItem, SseParser};
use super::{PlexIdentity, PlexServer};
use crate::error::{BridgeError, Result};
use crate::http::HttpClient;

const NOT_PROMOTED: usize = usize::MAX;
const SLEEP_STEP: Duration = Duration::from_millis(50);

pub fn event_stream_url(uri: &str) -> String {
    format!(
        "{}/:/eventsource/notifications?filters=playing",
        uri.trim_end_matches('/')
    )
}

/// Receives the outcome of a race. Only the promoted attempt produces events.
pub trait RaceListener: Send + Sync {
    fn on_promoted(&self, server: &PlexServer, uri: &str);
    fn on_lost(&self, server: &PlexServer);
    fn on_event(&self, server: &PlexServer, body: &str);
}

#[derive(Debug, Clone)]
pub struct RacerConfig {
    pub monitor_interval: Duration,
    pub retry_delay: Duration,
    /// Initial connection tries per address before it drops out of the race
    pub max_initial_attempts: u32,
}

impl Default for RacerConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_millis(500),
            retry_delay: Duration::from_secs(2),
            max_initial_attempts: 5,
        }
    }
}

impl RacerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval.is_zero() {
            return Err(BridgeError::config("monitor interval must be positive"));
        }
        if self.max_initial_attempts == 0 {
            return Err(BridgeError::config("at least one connection attempt is required"));
        }
        Ok(())
    }
}

struct ConnectionAttempt {
    index: usize,
    uri: String,
    connected: AtomicBool,
    finished: AtomicBool,
    stop: AtomicBool,
}

struct Race {
    attempts: Vec<Arc<ConnectionAttempt>>,
    workers: Vec<JoinHandle<()>>,
    promoted: Arc<AtomicUsize>,
}

enum RaceOutcome {
    Stopped,
    PromotedLost,
    AllFailed,
}

struct Shared {
    server: PlexServer,
    uris: Vec<String>,
    headers: Vec<(String, String)>,
    http: Arc<dyn HttpClient>,
    listener: Arc<dyn RaceListener>,
    config: RacerConfig,
    running: AtomicBool,
    wake_lock: Mutex<()>,
    wake: Condvar,
    promoted_uri: Mutex<Option<String>>,
    span: tracing::Span,
}

pub struct EventStreamRacer {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

fn stream_headers(identity: &PlexIdentity, token: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = identity
        .headers(Some(token))
        .into_iter()
        .filter(|(name, _)| name != "Accept")
        .collect();
    headers.push(("Accept".to_string(), "text/event-stream".to_string()));
    headers.push(("Cache-Control".to_string(), "no-cache".to_string()));
    headers
}

impl EventStreamRacer {
    pub fn new(
        server: PlexServer,
        identity: &PlexIdentity,
        http: Arc<dyn HttpClient>,
        listener: Arc<dyn RaceListener>,
        config: RacerConfig,
        span: tracing::Span,
    ) -> Result<Self> {
        config.validate()?;
        let uris = server.candidate_uris();
        if uris.is_empty() {
            return Err(BridgeError::config(format!(
                "server {} has no connection addresses",
                server.name
            )));
        }
        let headers = stream_headers(identity, &server.access_token);

        Ok(Self {
            shared: Arc::new(Shared {
                server,
                uris,
                headers,
                http,
                listener,
                config,
                running: AtomicBool::new(false),
                wake_lock: Mutex::new(()),
                wake: Condvar::new(),
                promoted_uri: Mutex::new(None),
                span,
            }),
            monitor: Mutex::new(None),
        })
    }

    pub fn server(&self) -> &PlexServer {
        &self.shared.server
    }

    /// URI of the currently promoted attempt
    pub fn promoted_uri(&self) -> Option<String> {
        self.shared.promoted_uri.lock().clone()
    }

    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("race-{}", self.shared.server.name))
            .spawn(move || {
                let _enter = shared.span.enter();
                shared.run_monitor();
            });

        match spawned {
            Ok(handle) => *self.monitor.lock() = Some(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                tracing::error!("Failed to spawn race monitor: {}", e);
            }
        }
    }

    /// Stops the monitor and every attempt, joining all of them.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = self.shared.wake_lock.lock();
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.monitor.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Race monitor panicked");
            }
        }
    }
}

impl Drop for EventStreamRacer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns false if the racer is stopping.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.wake_lock.lock();
        while self.is_running() {
            if self.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_running()
    }

    fn run_monitor(self: &Arc<Self>) {
        while self.is_running() {
            tracing::info!(
                "Racing {} address(es) for {}",
                self.uris.len(),
                self.server.name
            );
            let race = self.start_race();
            let outcome = self.monitor_race(&race);
            self.teardown(race);
            *self.promoted_uri.lock() = None;

            match outcome {
                RaceOutcome::Stopped => break,
                RaceOutcome::PromotedLost => {
                    tracing::warn!("Event stream for {} dropped, restarting race", self.server.name);
                }
                RaceOutcome::AllFailed => {
                    tracing::warn!("No address of {} reachable, retrying", self.server.name);
                    if !self.sleep(self.config.retry_delay) {
                        break;
                    }
                }
            }
        }
    }

    fn start_race(self: &Arc<Self>) -> Race {
        let promoted = Arc::new(AtomicUsize::new(NOT_PROMOTED));
        let mut attempts = Vec::with_capacity(self.uris.len());
        let mut workers = Vec::with_capacity(self.uris.len());

        for (index, uri) in self.uris.iter().enumerate() {
            let attempt = Arc::new(ConnectionAttempt {
                index,
                uri: uri.clone(),
                connected: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            });

            let shared = Arc::clone(self);
            let worker_attempt = Arc::clone(&attempt);
            let worker_promoted = Arc::clone(&promoted);
            let spawned = std::thread::Builder::new()
                .name(format!("sse-{}-{index}", self.server.name))
                .spawn(move || {
                    let _enter = shared.span.enter();
                    shared.run_attempt(&worker_attempt, &worker_promoted);
                });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    tracing::error!("Failed to spawn stream worker for {}: {}", uri, e);
                    attempt.finished.store(true, Ordering::SeqCst);
                }
            }
            attempts.push(attempt);
        }

        Race {
            attempts,
            workers,
            promoted,
        }
    }

    fn monitor_race(&self, race: &Race) -> RaceOutcome {
        loop {
            if !self.sleep(self.config.monitor_interval) {
                return RaceOutcome::Stopped;
            }

            let promoted = race.promoted.load(Ordering::SeqCst);
            if promoted == NOT_PROMOTED {
                let winner = race
                    .attempts
                    .iter()
                    .find(|a| a.connected.load(Ordering::SeqCst));

                if let Some(winner) = winner {
                    race.promoted.store(winner.index, Ordering::SeqCst);
                    for other in race.attempts.iter().filter(|a| a.index != winner.index) {
                        other.stop.store(true, Ordering::SeqCst);
                    }
                    tracing::info!("Promoted {} for {}", winner.uri, self.server.name);
                    *self.promoted_uri.lock() = Some(winner.uri.clone());
                    self.listener.on_promoted(&self.server, &winner.uri);
                } else if race.attempts.iter().all(|a| a.finished.load(Ordering::SeqCst)) {
                    return RaceOutcome::AllFailed;
                }
            } else if let Some(current) = race.attempts.get(promoted) {
                if !current.connected.load(Ordering::SeqCst) {
                    self.listener.on_lost(&self.server);
                    return RaceOutcome::PromotedLost;
                }
            }
        }
    }

    fn teardown(&self, race: Race) {
        for attempt in &race.attempts {
            attempt.stop.store(true, Ordering::SeqCst);
        }
        for worker in race.workers {
            if worker.join().is_err() {
                tracing::error!("Stream worker panicked");
            }
        }
    }

    fn attempt_active(&self, attempt: &ConnectionAttempt) -> bool {
        self.is_running() && !attempt.stop.load(Ordering::SeqCst)
    }

    fn run_attempt(&self, attempt: &ConnectionAttempt, promoted: &AtomicUsize) {
        let url = event_stream_url(&attempt.uri);
        let mut failures = 0u32;

        while self.attempt_active(attempt) {
            tracing::debug!("Opening event stream {}", url);
            let mut parser = SseParser::new();
            let mut on_chunk = |chunk: &[u8]| {
                for item in parser.feed(chunk) {
                    match item {
                        SseItem::Connected => {
                            tracing::debug!("Event stream live on {}", attempt.uri);
                            attempt.connected.store(true, Ordering::SeqCst);
                        }
                        SseItem::Data(body) => {
                            if promoted.load(Ordering::SeqCst) == attempt.index {
                                self.listener.on_event(&self.server, &body);
                            }
                        }
                    }
                }
            };
            let result = self
                .http
                .stream_get(&url, &self.headers, &attempt.stop, &mut on_chunk);

            if attempt.connected.swap(false, Ordering::SeqCst) {
                if let Err(e) = result {
                    tracing::info!("Event stream {} ended: {}", attempt.uri, e);
                }
                break;
            }

            match result {
                Ok(()) => break,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::debug!(
                        "Connection attempt {}/{} to {} failed: {}",
                        failures,
                        self.config.max_initial_attempts,
                        attempt.uri,
                        e
                    );
                    if failures >= self.config.max_initial_attempts {
                        break;
                    }
                    self.pause_attempt(attempt, self.config.retry_delay);
                }
            }
        }

        attempt.finished.store(true, Ordering::SeqCst);
    }

    fn pause_attempt(&self, attempt: &ConnectionAttempt, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.attempt_active(attempt) && Instant::now() < deadline {
            std::thread::sleep(SLEEP_STEP.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}
