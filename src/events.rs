//! Connection and delivery notifications

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::plex::media::PlaybackState;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DiscordConnected,
    DiscordDisconnected,
    DiscordError { message: String },
    PresenceUpdated { details: String, state: String },
    PresenceCleared,
    /// A frame was held back by the rate limiter or a missing connection
    PresenceDeferred,
    HealthCheckSucceeded,
    HealthCheckFailed { consecutive: u32 },
    ServerConnectionEstablished { server_id: String, uri: String },
    ServerConnectionLost { server_id: String },
    MediaSessionChanged {
        session_key: String,
        state: PlaybackState,
        title: String,
    },
}

/// Anything that accepts published events
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

/// Sink that drops everything
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: Event) {}
}

type Listeners = Arc<RwLock<Vec<Arc<dyn EventListener>>>>;

/// Bounded queue drained by a fixed pool of worker threads.
pub struct EventBus {
    sender: Mutex<Option<SyncSender<Event>>>,
    listeners: Listeners,
    workers: Mutex<Vec<JoinHandle<()>>>,
    span: tracing::Span,
}

impl EventBus {
    pub fn new(capacity: usize, worker_count: usize, span: tracing::Span) -> Self {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));

        let workers = (0..worker_count.max(1))
            .filter_map(|i| {
                let receiver = Arc::clone(&receiver);
                let listeners = Arc::clone(&listeners);
                let span = span.clone();
                std::thread::Builder::new()
                    .name(format!("event-bus-{i}"))
                    .spawn(move || {
                        let _enter = span.enter();
                        worker_loop(&receiver, &listeners);
                    })
                    .map_err(|e| tracing::error!("Failed to spawn event worker: {}", e))
                    .ok()
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            listeners,
            workers: Mutex::new(workers),
            span,
        }
    }

    pub fn subscribe(&self, listener: impl EventListener + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Closes the queue and waits for every worker to drain it.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                self.span
                    .in_scope(|| tracing::error!("Event worker panicked during shutdown"));
            }
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Event>>, listeners: &RwLock<Vec<Arc<dyn EventListener>>>) {
    loop {
        // Only one worker waits on the receiver at a time
        let event = match receiver.lock().recv() {
            Ok(event) => event,
            Err(_) => break,
        };

        let listeners = listeners.read().clone();
        for listener in &listeners {
            listener.on_event(&event);
        }
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: Event) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return;
        };

        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.span
                    .in_scope(|| tracing::warn!("Event queue full, dropping {:?}", event));
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writes every event to the log
pub fn log_event(event: &Event) {
    match event {
        Event::DiscordConnected => tracing::info!("Discord connected"),
        Event::DiscordDisconnected => tracing::info!("Discord disconnected"),
        Event::DiscordError { message } => tracing::warn!("Discord error: {}", message),
        Event::PresenceUpdated { details, state } => {
            tracing::info!("Presence updated: {} | {}", details, state);
        }
        Event::PresenceCleared => tracing::info!("Presence cleared"),
        Event::PresenceDeferred => tracing::debug!("Presence update deferred"),
        Event::HealthCheckSucceeded => tracing::trace!("Health check ok"),
        Event::HealthCheckFailed { consecutive } => {
            tracing::warn!("Health check failed ({} in a row)", consecutive);
        }
        Event::ServerConnectionEstablished { server_id, uri } => {
            tracing::info!("Server {} streaming from {}", server_id, uri);
        }
        Event::ServerConnectionLost { server_id } => {
            tracing::warn!("Lost event stream for server {}", server_id);
        }
        Event::MediaSessionChanged {
            session_key,
            state,
            title,
        } => tracing::debug!("Session {} is {:?}: {}", session_key, state, title),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delivers_to_every_listener_before_shutdown_returns() {
        let bus = EventBus::new(16, 2, tracing::Span::none());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let also_seen = Arc::new(Mutex::new(0usize));

        let sink = Arc::clone(&seen);
        bus.subscribe(move |e: &Event| sink.lock().push(e.clone()));
        let counter = Arc::clone(&also_seen);
        bus.subscribe(move |_: &Event| *counter.lock() += 1);

        bus.publish(Event::DiscordConnected);
        bus.publish(Event::PresenceCleared);
        bus.shutdown();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&Event::DiscordConnected));
        assert!(seen.contains(&Event::PresenceCleared));
        assert_eq!(*also_seen.lock(), 2);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let bus = EventBus::new(1, 1, tracing::Span::none());
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let delivered = Arc::new(Mutex::new(0usize));

        let count = Arc::clone(&delivered);
        bus.subscribe(move |_: &Event| {
            let _ = gate_rx.lock().recv_timeout(Duration::from_secs(2));
            *count.lock() += 1;
        });

        for _ in 0..10 {
            bus.publish(Event::PresenceDeferred);
        }
        drop(gate_tx);
        bus.shutdown();

        let delivered = *delivered.lock();
        assert!(delivered >= 1 && delivered < 10, "delivered {delivered}");
    }

    #[test]
    fn publish_after_shutdown_is_ignored() {
        let bus = EventBus::new(4, 1, tracing::Span::none());
        bus.shutdown();
        bus.publish(Event::DiscordDisconnected);
    }
}
