//! Per-session playback state fed by server notifications

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use super::media::{MediaFetcher, MediaInfo, PlaybackState};
use super::{PlexIdentity, ServerConnection};
use crate::cache::TtlCache;
use crate::error::{BridgeError, Result};
use crate::http::HttpClient;

pub const USERNAME_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

const SESSIONS_ENDPOINT: &str = "/status/sessions";

/// One entry of a `PlaySessionStateNotification`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaySessionNotification {
    pub session_key: String,
    pub state: String,
    pub media_key: String,
    pub view_offset_ms: i64,
}

/// Plex sends keys as strings but older servers use numbers
fn loose_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

impl PlaySessionNotification {
    fn from_json(value: &Value) -> Option<Self> {
        let session_key = loose_string(value.get("sessionKey"));
        if session_key.is_empty() {
            return None;
        }
        Some(Self {
            session_key,
            state: loose_string(value.get("state")),
            media_key: loose_string(value.get("key")),
            view_offset_ms: value.get("viewOffset").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

/// Extracts play-session notifications from one event body.
/// Other notification kinds yield an empty list.
pub fn parse_notifications(body: &str) -> Result<Vec<PlaySessionNotification>> {
    let event: Value = serde_json::from_str(body)
        .map_err(|e| BridgeError::parse(format!("malformed event body: {e}")))?;

    let items = match event.get("PlaySessionStateNotification") {
        None => return Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().collect::<Vec<_>>(),
        Some(item @ Value::Object(_)) => vec![item],
        Some(_) => {
            return Err(BridgeError::parse(
                "PlaySessionStateNotification is neither an object nor a list",
            ))
        }
    };

    Ok(items
        .into_iter()
        .filter_map(|item| {
            let parsed = PlaySessionNotification::from_json(item);
            if parsed.is_none() {
                tracing::warn!("Session notification missing sessionKey");
            }
            parsed
        })
        .collect())
}

/// Outcome of applying a notification
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Ignored,
    /// What should now be shown: a session snapshot or the stopped sentinel
    Changed(MediaInfo),
}

pub struct SessionTracker {
    http: Arc<dyn HttpClient>,
    identity: PlexIdentity,
    fetcher: Arc<MediaFetcher>,
    sessions: Mutex<HashMap<String, MediaInfo>>,
    servers: Mutex<HashMap<String, ServerConnection>>,
    usernames: TtlCache<String>,
    target_username: Mutex<String>,
    span: tracing::Span,
}

impl SessionTracker {
    pub fn new(
        http: Arc<dyn HttpClient>,
        identity: PlexIdentity,
        fetcher: Arc<MediaFetcher>,
        span: tracing::Span,
    ) -> Self {
        Self {
            http,
            identity,
            fetcher,
            sessions: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            usernames: TtlCache::new("session-users", USERNAME_CACHE_TTL),
            target_username: Mutex::new(String::new()),
            span,
        }
    }

    /// Sessions on owned servers must belong to this user.
    /// An empty name disables the filter.
    pub fn set_target_username(&self, username: impl Into<String>) {
        let username = username.into();
        tracing::info!(parent: &self.span, "Target username set to: {}", username);
        *self.target_username.lock() = username;
    }

    pub fn target_username(&self) -> String {
        self.target_username.lock().clone()
    }

    pub fn add_server(&self, connection: ServerConnection) {
        tracing::debug!(
            parent: &self.span,
            "Server {} reachable at {}",
            connection.server_id,
            connection.preferred_uri
        );
        self.servers
            .lock()
            .insert(connection.server_id.clone(), connection);
    }

    pub fn server(&self, server_id: &str) -> Option<ServerConnection> {
        self.servers.lock().get(server_id).cloned()
    }

    /// Forgets a server and every session that came from it.
    pub fn remove_server(&self, server_id: &str) -> SessionUpdate {
        self.servers.lock().remove(server_id);

        let removed = {
            let mut sessions = self.sessions.lock();
            let before = sessions.len();
            sessions.retain(|_, media| media.server_id != server_id);
            before - sessions.len()
        };

        if removed == 0 {
            return SessionUpdate::Ignored;
        }
        tracing::info!(
            parent: &self.span,
            "Dropped {} session(s) from server {}",
            removed,
            server_id
        );
        SessionUpdate::Changed(self.get_current_media())
    }

    /// Parses an event body and applies every notification in order.
    pub fn handle_event(&self, server_id: &str, body: &str) -> Result<Vec<SessionUpdate>> {
        let notifications = parse_notifications(body)?;
        Ok(notifications
            .iter()
            .map(|n| self.process(server_id, n))
            .collect())
    }

    pub fn process(&self, server_id: &str, notification: &PlaySessionNotification) -> SessionUpdate {
        let _enter = self.span.enter();
        tracing::debug!(
            "Session {} on {}: {}",
            notification.session_key,
            server_id,
            notification.state
        );

        match PlaybackState::from_plex(&notification.state) {
            Some(PlaybackState::Stopped) => self.remove_session(&notification.session_key),
            Some(state) => self.upsert_session(server_id, notification, state),
            None => {
                tracing::warn!("Unknown playback state: {}", notification.state);
                SessionUpdate::Ignored
            }
        }
    }

    fn remove_session(&self, session_key: &str) -> SessionUpdate {
        let removed = self.sessions.lock().remove(session_key);
        match removed {
            Some(media) => {
                tracing::info!("Removing stopped session {}: {}", session_key, media.title);
                SessionUpdate::Changed(self.get_current_media())
            }
            None => SessionUpdate::Ignored,
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn upsert_session(
        &self,
        server_id: &str,
        notification: &PlaySessionNotification,
        state: PlaybackState,
    ) -> SessionUpdate {
        let Some(server) = self.server(server_id) else {
            tracing::warn!("No connection known for server {}", server_id);
            return SessionUpdate::Ignored;
        };

        let username = match self.check_user(&server, &notification.session_key) {
            Ok(username) => username,
            Err(e) => {
                tracing::debug!("Skipping session {}: {}", notification.session_key, e);
                return SessionUpdate::Ignored;
            }
        };

        let existing = self.sessions.lock().get(&notification.session_key).cloned();
        let is_new = existing.is_none();
        let mut media = match existing {
            Some(media) => media,
            None => match self.fetcher.fetch(&server, &notification.media_key) {
                Ok(mut media) => {
                    media.session_created_at = Some(Utc::now());
                    media
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to fetch media for session {}: {}",
                        notification.session_key,
                        e
                    );
                    return SessionUpdate::Ignored;
                }
            },
        };

        media.state = state;
        media.progress = notification.view_offset_ms as f64 / 1000.0;
        media.start_time =
            Some(Utc::now() - chrono::Duration::milliseconds(notification.view_offset_ms));
        media.session_key = notification.session_key.clone();
        media.server_id = server.server_id.clone();
        if let Some(username) = username {
            media.username = username;
        }

        tracing::info!(
            "{} session {}: {} ({:.0}/{:.0}s)",
            if is_new { "Added" } else { "Updated" },
            media.session_key,
            media.title,
            media.progress,
            media.duration
        );

        self.sessions
            .lock()
            .insert(notification.session_key.clone(), media.clone());
        SessionUpdate::Changed(media)
    }

    /// The session's user when it had to be resolved, or an error when it is someone else.
    fn check_user(&self, server: &ServerConnection, session_key: &str) -> Result<Option<String>> {
        if !server.owned {
            return Ok(None);
        }
        let target = self.target_username();
        if target.is_empty() {
            return Ok(None);
        }

        let username = self.session_username(server, session_key)?;
        if username == target {
            Ok(Some(username))
        } else {
            Err(BridgeError::Validation(format!(
                "session belongs to {username}, not {target}"
            )))
        }
    }

    fn session_username(&self, server: &ServerConnection, session_key: &str) -> Result<String> {
        let cache_key = format!("{}{}", server.preferred_uri, session_key);
        self.usernames.get_or_fetch(&cache_key, || {
            let url = format!("{}{}", server.preferred_uri, SESSIONS_ENDPOINT);
            let headers = self.identity.headers(Some(&server.access_token));
            let body: Value = self.http.get(&url, &headers)?.json()?;

            body.pointer("/MediaContainer/Metadata")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .find(|session| loose_string(session.get("sessionKey")) == session_key)
                .and_then(|session| session.pointer("/User/title"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    BridgeError::Validation(format!("no user found for session {session_key}"))
                })
        })
    }

    /// The active session that started most recently, or the stopped sentinel.
    pub fn get_current_media(&self) -> MediaInfo {
        self.sessions
            .lock()
            .values()
            .filter(|media| media.state.is_active())
            .max_by_key(|media| media.start_time)
            .cloned()
            .unwrap_or_else(MediaInfo::stopped)
    }

    pub fn active_sessions(&self) -> Vec<MediaInfo> {
        self.sessions
            .lock()
            .values()
            .filter(|media| media.state.is_active())
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.sessions.lock().clear();
        self.servers.lock().clear();
        self.usernames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::FakeHttpClient;
    use serde_json::json;

    const URI: &str = "http://10.0.0.2:32400";

    fn connection(owned: bool) -> ServerConnection {
        ServerConnection {
            server_id: "srv".into(),
            name: "Home".into(),
            preferred_uri: URI.into(),
            access_token: "tok".into(),
            owned,
        }
    }

    fn movie(http: &FakeHttpClient, key: &str, title: &str) {
        http.respond(
            &format!("{URI}{key}"),
            &json!({"MediaContainer": {"Metadata": [{
                "type": "movie",
                "title": title,
                "duration": 7_200_000
            }]}})
            .to_string(),
        );
    }

    fn notification(session_key: &str, state: &str, key: &str, offset: i64) -> PlaySessionNotification {
        PlaySessionNotification {
            session_key: session_key.into(),
            state: state.into(),
            media_key: key.into(),
            view_offset_ms: offset,
        }
    }

    fn tracker(http: Arc<FakeHttpClient>) -> SessionTracker {
        let identity = PlexIdentity::new("test");
        let fetcher = Arc::new(MediaFetcher::new(http.clone(), identity.clone()));
        SessionTracker::new(http, identity, fetcher, tracing::Span::none())
    }

    fn changed_title(update: &SessionUpdate) -> Option<&str> {
        match update {
            SessionUpdate::Changed(media) => Some(media.title.as_str()),
            SessionUpdate::Ignored => None,
        }
    }

    #[test]
    fn stopping_an_unknown_session_is_a_no_op() {
        let http = Arc::new(FakeHttpClient::new());
        movie(&http, "/library/metadata/1", "Heat");
        let tracker = tracker(http);
        tracker.add_server(connection(false));
        tracker.process("srv", &notification("1", "playing", "/library/metadata/1", 0));

        let update = tracker.process("srv", &notification("99", "stopped", "", 0));
        assert_eq!(update, SessionUpdate::Ignored);
        assert_eq!(tracker.get_current_media().title, "Heat");
    }

    #[test]
    fn stopping_falls_back_to_most_recent_then_sentinel() {
        let http = Arc::new(FakeHttpClient::new());
        movie(&http, "/library/metadata/1", "Heat");
        movie(&http, "/library/metadata/2", "Ronin");
        let tracker = tracker(http);
        tracker.add_server(connection(false));

        // Ronin started ten minutes earlier than Heat
        tracker.process("srv", &notification("a", "playing", "/library/metadata/1", 0));
        tracker.process("srv", &notification("b", "paused", "/library/metadata/2", 600_000));
        assert_eq!(tracker.get_current_media().title, "Heat");

        let update = tracker.process("srv", &notification("a", "stopped", "", 0));
        assert_eq!(changed_title(&update), Some("Ronin"));
        assert_eq!(tracker.get_current_media().state, PlaybackState::Paused);

        let update = tracker.process("srv", &notification("b", "stopped", "", 0));
        assert_eq!(update, SessionUpdate::Changed(MediaInfo::stopped()));
        assert_eq!(tracker.get_current_media().state, PlaybackState::Stopped);
    }

    #[test]
    fn existing_sessions_reuse_the_snapshot_and_update_progress() {
        let http = Arc::new(FakeHttpClient::new());
        movie(&http, "/library/metadata/1", "Heat");
        let tracker = tracker(http.clone());
        tracker.add_server(connection(false));

        tracker.process("srv", &notification("a", "playing", "/library/metadata/1", 1_000));
        let created = tracker.get_current_media().session_created_at;
        tracker.process("srv", &notification("a", "buffering", "/library/metadata/1", 61_500));

        let media = tracker.get_current_media();
        assert_eq!(media.state, PlaybackState::Buffering);
        assert!((media.progress - 61.5).abs() < f64::EPSILON);
        assert_eq!(media.session_created_at, created);
        assert_eq!(media.session_key, "a");
        assert_eq!(media.server_id, "srv");
        assert_eq!(http.requests_to(&format!("{URI}/library/metadata/1")), 1);
    }

    #[test]
    fn unknown_servers_are_dropped() {
        let http = Arc::new(FakeHttpClient::new());
        movie(&http, "/library/metadata/1", "Heat");
        let tracker = tracker(http);
        let update = tracker.process("other", &notification("a", "playing", "/library/metadata/1", 0));
        assert_eq!(update, SessionUpdate::Ignored);
        assert!(tracker.active_sessions().is_empty());
    }

    #[test]
    fn owned_servers_only_track_the_target_user() {
        let http = Arc::new(FakeHttpClient::new());
        movie(&http, "/library/metadata/1", "Heat");
        movie(&http, "/library/metadata/2", "Ronin");
        http.respond(
            &format!("{URI}/status/sessions"),
            &json!({"MediaContainer": {"size": 2, "Metadata": [
                {"sessionKey": "a", "User": {"title": "alice"}},
                {"sessionKey": "b", "User": {"title": "bob"}}
            ]}})
            .to_string(),
        );

        let tracker = tracker(http.clone());
        tracker.set_target_username("alice");
        tracker.add_server(connection(true));

        let mine = tracker.process("srv", &notification("a", "playing", "/library/metadata/1", 0));
        let theirs = tracker.process("srv", &notification("b", "playing", "/library/metadata/2", 0));
        assert_eq!(changed_title(&mine), Some("Heat"));
        assert_eq!(theirs, SessionUpdate::Ignored);

        tracker.process("srv", &notification("a", "paused", "/library/metadata/1", 5_000));
        // One lookup per session key, the repeat comes from the cache
        assert_eq!(http.requests_to(&format!("{URI}/status/sessions")), 2);
    }

    #[test]
    fn resolved_username_reaches_the_presence_text() {
        use crate::presence::{format_media, FormatOptions};

        let http = Arc::new(FakeHttpClient::new());
        movie(&http, "/library/metadata/1", "Heat");
        http.respond(
            &format!("{URI}/status/sessions"),
            &json!({"MediaContainer": {"Metadata": [
                {"sessionKey": "a", "User": {"title": "alice"}}
            ]}})
            .to_string(),
        );
        let tracker = tracker(http);
        tracker.set_target_username("alice");
        tracker.add_server(connection(true));

        tracker.process("srv", &notification("a", "playing", "/library/metadata/1", 0));
        // Later updates keep the name from the cached lookup
        tracker.process("srv", &notification("a", "paused", "/library/metadata/1", 1_000));
        let media = tracker.get_current_media();
        assert_eq!(media.username, "alice");

        let mut options = FormatOptions::default();
        options.templates.movie_state = "with {username}".into();
        let frame = format_media(&media, &options, chrono::Utc::now());
        assert_eq!(frame.state, "with alice");
    }

    #[test]
    fn shared_servers_are_not_filtered() {
        let http = Arc::new(FakeHttpClient::new());
        movie(&http, "/library/metadata/1", "Heat");
        let tracker = tracker(http.clone());
        tracker.set_target_username("alice");
        tracker.add_server(connection(false));

        let update = tracker.process("srv", &notification("a", "playing", "/library/metadata/1", 0));
        assert_eq!(changed_title(&update), Some("Heat"));
        assert_eq!(http.requests_to(&format!("{URI}/status/sessions")), 0);
    }

    #[test]
    fn removing_a_server_drops_its_sessions() {
        let http = Arc::new(FakeHttpClient::new());
        movie(&http, "/library/metadata/1", "Heat");
        let tracker = tracker(http);
        tracker.add_server(connection(false));
        tracker.process("srv", &notification("a", "playing", "/library/metadata/1", 0));

        assert_eq!(
            tracker.remove_server("srv"),
            SessionUpdate::Changed(MediaInfo::stopped())
        );
        assert!(tracker.server("srv").is_none());
        assert_eq!(tracker.remove_server("srv"), SessionUpdate::Ignored);
    }

    #[test]
    fn parses_object_and_list_notifications() {
        let list = r#"{"PlaySessionStateNotification":[{"sessionKey":"7","state":"playing","key":"/library/metadata/1","viewOffset":1500}]}"#;
        let object = r#"{"PlaySessionStateNotification":{"sessionKey":7,"state":"paused","key":"/library/metadata/1"}}"#;

        let parsed = parse_notifications(list).unwrap();
        assert_eq!(parsed, vec![notification("7", "playing", "/library/metadata/1", 1500)]);

        let parsed = parse_notifications(object).unwrap();
        assert_eq!(parsed, vec![notification("7", "paused", "/library/metadata/1", 0)]);

        assert!(parse_notifications(r#"{"ActivityNotification":[]}"#).unwrap().is_empty());
        assert!(matches!(parse_notifications("{nope"), Err(BridgeError::Parse(_))));
    }
}
