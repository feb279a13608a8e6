//! Delivers presence frames to Discord, coalescing anything that cannot go out yet

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use super::format::{format_media, FormatOptions};
use super::traits::{PresenceFrame, PresenceProvider};
use crate::connection::{ConnectionStrategy, ReconnectManager, RetryConfig};
use crate::discord::{DiscordConnectionStrategy, IpcClient, RateLimiter, RateLimiterConfig};
use crate::error::{BridgeError, Result};
use crate::events::{Event, EventSink};
use crate::plex::media::MediaInfo;

/// Sends activities over an established connection
pub trait ActivityTransport: Send + Sync {
    fn is_connected(&self) -> bool;
    /// `None` clears the activity
    fn send_activity(&self, activity: Option<&Value>) -> Result<()>;
}

impl ActivityTransport for IpcClient {
    fn is_connected(&self) -> bool {
        IpcClient::is_connected(self)
    }

    fn send_activity(&self, activity: Option<&Value>) -> Result<()> {
        match activity {
            Some(activity) => self.send_presence(activity),
            None => self.clear_presence(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub retry: RetryConfig,
    pub rate_limit: RateLimiterConfig,
    /// Upper bound on how long the delivery loop sleeps between checks
    pub update_interval: Duration,
    pub format: FormatOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            rate_limit: RateLimiterConfig::default(),
            update_interval: Duration::from_secs(1),
            format: FormatOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Outbound {
    Frame(PresenceFrame),
    Clear,
}

#[derive(Default)]
struct DeliveryState {
    /// Last state handed to the pipeline
    current: Option<Outbound>,
    requested: bool,
    /// Newest state not yet delivered
    pending: Option<Outbound>,
    deferral_reported: bool,
}

struct Shared {
    transport: Arc<dyn ActivityTransport>,
    limiter: Mutex<RateLimiter>,
    state: Mutex<DeliveryState>,
    format: Mutex<FormatOptions>,
    update_interval: Duration,
    running: AtomicBool,
    wake: Condvar,
    sink: Arc<dyn EventSink>,
    span: tracing::Span,
}

/// Turns presence requests into delivered SET_ACTIVITY commands.
///
/// Identical consecutive requests are dropped. While Discord is unreachable
/// or the rate limiter says no, only the newest request is kept.
pub struct PresenceDeliveryPipeline {
    shared: Arc<Shared>,
    connection: ReconnectManager,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceDeliveryPipeline {
    pub fn new(
        transport: Arc<dyn ActivityTransport>,
        strategy: Arc<dyn ConnectionStrategy>,
        config: PipelineConfig,
        sink: Arc<dyn EventSink>,
        span: tracing::Span,
    ) -> Result<Self> {
        if config.update_interval.is_zero() {
            return Err(BridgeError::config("update interval must be positive"));
        }
        let limiter = RateLimiter::new(config.rate_limit)?;
        let connection = ReconnectManager::new(strategy, config.retry, Arc::clone(&sink), span.clone())?;

        let shared = Arc::new(Shared {
            transport,
            limiter: Mutex::new(limiter),
            state: Mutex::new(DeliveryState::default()),
            format: Mutex::new(config.format),
            update_interval: config.update_interval,
            running: AtomicBool::new(false),
            wake: Condvar::new(),
            sink,
            span,
        });

        let callback_shared = Arc::clone(&shared);
        connection.set_connection_callback(move |connected| callback_shared.on_connection_change(connected));

        Ok(Self {
            shared,
            connection,
            worker: Mutex::new(None),
        })
    }

    /// Pipeline over the local Discord client
    pub fn discord(
        client: Arc<IpcClient>,
        config: PipelineConfig,
        sink: Arc<dyn EventSink>,
        span: tracing::Span,
    ) -> Result<Self> {
        let strategy = Arc::new(DiscordConnectionStrategy::new(Arc::clone(&client)));
        Self::new(client, strategy, config, sink, span)
    }

    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.start();

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("presence-delivery".to_string())
            .spawn(move || {
                let _enter = shared.span.enter();
                shared.run();
            });

        match spawned {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                tracing::error!("Failed to spawn presence worker: {}", e);
            }
        }
    }

    /// Joins the delivery worker, clears the activity and closes the connection.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = self.shared.state.lock();
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Presence worker panicked");
            }
        }

        if self.shared.transport.is_connected() {
            if let Err(e) = self.shared.transport.send_activity(None) {
                tracing::debug!("Could not clear presence on shutdown: {}", e);
            }
        }
        self.connection.stop();
    }

    pub fn set_format_options(&self, options: FormatOptions) {
        *self.shared.format.lock() = options;
    }

    /// Formats a snapshot and requests it; inactive playback clears the presence.
    pub fn update_from_media(&self, media: &MediaInfo) {
        if !media.state.is_active() {
            self.shared.request(Outbound::Clear);
            return;
        }
        let frame = {
            let options = self.shared.format.lock();
            format_media(media, &options, Utc::now())
        };
        self.shared.request(Outbound::Frame(frame));
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn force_reconnect(&self) {
        self.connection.force_reconnect();
    }
}

impl PresenceProvider for PresenceDeliveryPipeline {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn update_presence(&self, frame: PresenceFrame) {
        self.shared.request(Outbound::Frame(frame));
    }

    fn update_from_media(&self, media: &MediaInfo) {
        PresenceDeliveryPipeline::update_from_media(self, media);
    }

    fn clear_presence(&self) {
        self.shared.request(Outbound::Clear);
    }
}

impl Drop for PresenceDeliveryPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn request(&self, outbound: Outbound) {
        let mut state = self.state.lock();
        if state.current.as_ref() == Some(&outbound) {
            return;
        }
        state.current = Some(outbound);
        state.requested = true;
        state.deferral_reported = false;
        self.wake.notify_all();
    }

    fn on_connection_change(&self, connected: bool) {
        if connected {
            self.sink.publish(Event::DiscordConnected);
            // A fresh connection starts with no activity
            let mut state = self.state.lock();
            if state.current.is_some() {
                state.requested = true;
            }
            self.wake.notify_all();
        } else {
            self.sink.publish(Event::DiscordDisconnected);
        }
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            self.deliver_once();

            let mut state = self.state.lock();
            if !state.requested && self.running.load(Ordering::SeqCst) {
                self.wake.wait_for(&mut state, self.update_interval);
            }
        }
    }

    fn deliver_once(&self) {
        let outbound = {
            let mut state = self.state.lock();
            if state.requested {
                state.requested = false;
                state.pending = state.current.clone();
            }
            match &state.pending {
                Some(outbound) => outbound.clone(),
                None => return,
            }
        };

        if !self.transport.is_connected() || !self.limiter.lock().can_proceed() {
            self.report_deferral();
            return;
        }

        let result = match &outbound {
            Outbound::Frame(frame) => self.transport.send_activity(Some(&frame.to_activity_json())),
            Outbound::Clear => self.transport.send_activity(None),
        };
        self.limiter.lock().record_operation();

        match result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    if state.pending.as_ref() == Some(&outbound) {
                        state.pending = None;
                    }
                }
                match outbound {
                    Outbound::Frame(frame) => {
                        tracing::debug!("Presence delivered: {} | {}", frame.details, frame.state);
                        self.sink.publish(Event::PresenceUpdated {
                            details: frame.details,
                            state: frame.state,
                        });
                    }
                    Outbound::Clear => self.sink.publish(Event::PresenceCleared),
                }
            }
            Err(e) => {
                tracing::warn!("Presence delivery failed: {}", e);
                self.sink.publish(Event::DiscordError {
                    message: e.to_string(),
                });
            }
        }
    }

    fn report_deferral(&self) {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.deferral_reported, true)
        };
        if first {
            tracing::debug!("Presence update deferred");
            self.sink.publish(Event::PresenceDeferred);
        }
    }
}
