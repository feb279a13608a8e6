//! Wires the Plex side (racers, session tracking) to the Discord side

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::discord::IpcClient;
use crate::error::Result;
use crate::events::{log_event, Event, EventBus, EventSink};
use crate::http::HttpClient;
use crate::plex::enrich::{JikanEnricher, TmdbEnricher};
use crate::plex::{
    EventStreamRacer, MediaFetcher, MediaInfo, MediaType, PlexIdentity, PlexServer, RaceListener,
    RacerConfig, ServerConnection, SessionTracker, SessionUpdate,
};
use crate::presence::{PresenceDeliveryPipeline, PresenceProvider};
use crate::settings::AppSettings;

const EVENT_QUEUE_CAPACITY: usize = 256;
const EVENT_WORKERS: usize = 2;

/// Which media types may be shown at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFilter {
    pub movies: bool,
    pub tv_shows: bool,
    pub music: bool,
}

impl Default for MediaFilter {
    fn default() -> Self {
        Self {
            movies: true,
            tv_shows: true,
            music: true,
        }
    }
}

impl MediaFilter {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            movies: settings.enable_movies,
            tv_shows: settings.enable_tv_shows,
            music: settings.enable_music,
        }
    }

    pub fn allows(&self, media_type: MediaType) -> bool {
        match media_type {
            MediaType::Movie => self.movies,
            MediaType::TvShow => self.tv_shows,
            MediaType::Music => self.music,
            MediaType::Unknown => true,
        }
    }
}

struct BridgeListener {
    tracker: Arc<SessionTracker>,
    providers: Vec<Arc<dyn PresenceProvider>>,
    sink: Arc<dyn EventSink>,
    filter: MediaFilter,
}

impl BridgeListener {
    fn apply(&self, update: SessionUpdate) {
        let SessionUpdate::Changed(media) = update else {
            return;
        };

        self.sink.publish(Event::MediaSessionChanged {
            session_key: media.session_key.clone(),
            state: media.state,
            title: media.title.clone(),
        });
        self.show(&media);
    }

    fn show(&self, media: &MediaInfo) {
        let visible = media.state.is_active() && self.filter.allows(media.media_type);
        for provider in &self.providers {
            if visible {
                tracing::debug!("Showing {} on {}", media.title, provider.name());
                provider.update_from_media(media);
            } else {
                tracing::debug!("Clearing {} presence", provider.name());
                provider.clear_presence();
            }
        }
    }
}

impl RaceListener for BridgeListener {
    fn on_promoted(&self, server: &PlexServer, uri: &str) {
        self.tracker.add_server(ServerConnection {
            server_id: server.client_identifier.clone(),
            name: server.name.clone(),
            preferred_uri: uri.to_string(),
            access_token: server.access_token.clone(),
            owned: server.owned,
        });
        self.sink.publish(Event::ServerConnectionEstablished {
            server_id: server.client_identifier.clone(),
            uri: uri.to_string(),
        });
    }

    fn on_lost(&self, server: &PlexServer) {
        self.sink.publish(Event::ServerConnectionLost {
            server_id: server.client_identifier.clone(),
        });
        let update = self.tracker.remove_server(&server.client_identifier);
        self.apply(update);
    }

    fn on_event(&self, server: &PlexServer, body: &str) {
        match self.tracker.handle_event(&server.client_identifier, body) {
            Ok(updates) => updates.into_iter().for_each(|u| self.apply(u)),
            Err(e) => tracing::warn!("Dropping event from {}: {}", server.name, e),
        }
    }
}

/// Everything between Plex notifications and Discord frames.
pub struct PresenceBridge {
    bus: Arc<EventBus>,
    pipeline: Option<Arc<PresenceDeliveryPipeline>>,
    listener: Arc<BridgeListener>,
    racers: Mutex<Vec<EventStreamRacer>>,
    http: Arc<dyn HttpClient>,
    identity: PlexIdentity,
    racer_config: RacerConfig,
    stopped: AtomicBool,
    span: tracing::Span,
}

impl PresenceBridge {
    pub fn new(settings: &AppSettings, http: Arc<dyn HttpClient>) -> Result<Self> {
        settings.validate()?;
        let span = tracing::info_span!("bridge");

        let bus = Arc::new(EventBus::new(
            EVENT_QUEUE_CAPACITY,
            EVENT_WORKERS,
            tracing::info_span!(parent: &span, "events"),
        ));
        bus.subscribe(log_event);
        let sink: Arc<dyn EventSink> = bus.clone();

        let identity = PlexIdentity::new(settings.plex_client_identifier.clone());
        let mut fetcher = MediaFetcher::new(Arc::clone(&http), identity.clone());
        if settings.enable_tmdb && !settings.tmdb_access_token.trim().is_empty() {
            fetcher.add_enricher(Box::new(TmdbEnricher::new(
                Arc::clone(&http),
                settings.tmdb_access_token.clone(),
            )?));
        }
        if settings.enable_jikan {
            fetcher.add_enricher(Box::new(JikanEnricher::new(Arc::clone(&http))));
        }

        let tracker = Arc::new(SessionTracker::new(
            Arc::clone(&http),
            identity.clone(),
            Arc::new(fetcher),
            tracing::info_span!(parent: &span, "sessions"),
        ));

        let mut providers: Vec<Arc<dyn PresenceProvider>> = Vec::new();
        let pipeline = if settings.discord_enabled {
            let client = Arc::new(IpcClient::new(
                settings.discord_client_id.clone(),
                tracing::info_span!(parent: &span, "ipc"),
            )?);
            let pipeline = Arc::new(PresenceDeliveryPipeline::discord(
                client,
                settings.pipeline_config(),
                Arc::clone(&sink),
                tracing::info_span!(parent: &span, "presence"),
            )?);
            tracing::info!("Adding presence provider: {}", pipeline.name());
            providers.push(pipeline.clone());
            Some(pipeline)
        } else {
            tracing::info!("Discord presence disabled");
            None
        };

        let listener = Arc::new(BridgeListener {
            tracker,
            providers,
            sink,
            filter: MediaFilter::from_settings(settings),
        });

        Ok(Self {
            bus,
            pipeline,
            listener,
            racers: Mutex::new(Vec::new()),
            http,
            identity,
            racer_config: RacerConfig::default(),
            stopped: AtomicBool::new(false),
            span,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.listener.tracker
    }

    pub fn set_target_username(&self, username: &str) {
        self.listener.tracker.set_target_username(username);
    }

    pub fn start(&self) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.start();
        }
    }

    /// Starts racing the server's addresses; its events flow in once one wins.
    pub fn add_server(&self, server: PlexServer) -> Result<()> {
        let racer = EventStreamRacer::new(
            server,
            &self.identity,
            Arc::clone(&self.http),
            self.listener.clone(),
            self.racer_config.clone(),
            tracing::info_span!(parent: &self.span, "server"),
        )?;
        racer.start();
        tracing::info!("Watching server {}", racer.server().name);
        self.racers.lock().push(racer);
        Ok(())
    }

    pub fn server_count(&self) -> usize {
        self.racers.lock().len()
    }

    /// Stops racers, then presence delivery, then the event bus.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _enter = self.span.enter();
        tracing::info!("Shutting down");

        let racers = std::mem::take(&mut *self.racers.lock());
        for racer in &racers {
            racer.stop();
        }
        drop(racers);

        if let Some(pipeline) = &self.pipeline {
            pipeline.stop();
        }
        self.bus.shutdown();
    }
}

impl Drop for PresenceBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
