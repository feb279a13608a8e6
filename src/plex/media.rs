//! Playback model and Plex library metadata

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::enrich::MetadataEnricher;
use super::{PlexIdentity, ServerConnection};
use crate::cache::TtlCache;
use crate::error::{BridgeError, Result};
use crate::http::HttpClient;

pub const MEDIA_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Movie,
    TvShow,
    Music,
    #[default]
    Unknown,
}

impl MediaType {
    pub fn from_plex(kind: &str) -> Self {
        match kind {
            "movie" => Self::Movie,
            "episode" => Self::TvShow,
            "track" => Self::Music,
            _ => Self::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Movie => "Movie",
            Self::TvShow => "TV Show",
            Self::Music => "Music",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    Paused,
    Buffering,
    #[default]
    Stopped,
}

impl PlaybackState {
    /// Parses the `state` field of a play-session notification
    pub fn from_plex(state: &str) -> Option<Self> {
        match state {
            "playing" => Some(Self::Playing),
            "paused" => Some(Self::Paused),
            "buffering" => Some(Self::Buffering),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, Self::Stopped)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Playing => "Playing",
            Self::Paused => "Paused",
            Self::Buffering => "Buffering",
            Self::Stopped => "Stopped",
        }
    }
}

/// One playback snapshot: library metadata plus session progress
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub title: String,
    pub original_title: String,
    pub media_type: MediaType,
    /// Externally hosted artwork URL, usable as a presence image
    pub art_path: String,
    pub year: i32,
    pub summary: String,
    pub genres: Vec<String>,
    pub rating: f64,
    pub studio: String,
    pub thumb: String,
    pub art: String,

    pub imdb_id: String,
    pub tmdb_id: String,
    pub tvdb_id: String,
    pub mal_id: String,

    pub show_title: String,
    pub grandparent_key: String,
    pub season: i32,
    pub episode: i32,
    pub track: i32,
    pub album: String,
    pub artist: String,

    pub username: String,
    pub state: PlaybackState,
    /// Seconds
    pub progress: f64,
    /// Seconds
    pub duration: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub session_created_at: Option<DateTime<Utc>>,
    pub session_key: String,
    pub server_id: String,
}

impl MediaInfo {
    /// Placeholder reported when nothing is playing
    pub fn stopped() -> Self {
        Self::default()
    }
}

fn str_field(metadata: &Value, key: &str) -> String {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn int_field(metadata: &Value, key: &str) -> i32 {
    metadata
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or_default()
}

fn tags(metadata: &Value, key: &str) -> Vec<String> {
    metadata
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("tag").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn apply_guids(metadata: &Value, info: &mut MediaInfo) {
    let Some(guids) = metadata.get("Guid").and_then(Value::as_array) else {
        return;
    };

    for guid in guids.iter().filter_map(|g| g.get("id").and_then(Value::as_str)) {
        if let Some(id) = guid.strip_prefix("imdb://") {
            info.imdb_id = id.to_string();
        } else if let Some(id) = guid.strip_prefix("tmdb://") {
            info.tmdb_id = id.to_string();
        } else if let Some(id) = guid.strip_prefix("tvdb://") {
            info.tvdb_id = id.to_string();
        }
    }
}

/// First entry of `MediaContainer.Metadata`
pub fn first_metadata(body: &Value) -> Result<&Value> {
    body.pointer("/MediaContainer/Metadata/0")
        .ok_or_else(|| BridgeError::parse("response has no MediaContainer.Metadata entries"))
}

/// Builds a snapshot from one library metadata item.
#[allow(clippy::cast_precision_loss)]
pub fn parse_metadata(metadata: &Value) -> MediaInfo {
    let kind = metadata.get("type").and_then(Value::as_str).unwrap_or_default();
    let mut info = MediaInfo {
        title: str_field(metadata, "title"),
        original_title: str_field(metadata, "originalTitle"),
        media_type: MediaType::from_plex(kind),
        year: int_field(metadata, "year"),
        summary: str_field(metadata, "summary"),
        rating: metadata.get("rating").and_then(Value::as_f64).unwrap_or_default(),
        studio: str_field(metadata, "studio"),
        thumb: str_field(metadata, "thumb"),
        art: str_field(metadata, "art"),
        duration: metadata
            .get("duration")
            .and_then(Value::as_i64)
            .map_or(0.0, |ms| ms as f64 / 1000.0),
        ..MediaInfo::default()
    };

    match info.media_type {
        MediaType::Movie => {
            apply_guids(metadata, &mut info);
            info.genres = tags(metadata, "Genre");
        }
        MediaType::TvShow => {
            info.show_title = metadata
                .get("grandparentTitle")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string();
            info.season = int_field(metadata, "parentIndex");
            info.episode = int_field(metadata, "index");
            info.grandparent_key = str_field(metadata, "grandparentKey");
        }
        MediaType::Music => {
            info.album = str_field(metadata, "parentTitle");
            info.artist = str_field(metadata, "grandparentTitle");
            info.track = int_field(metadata, "index");
        }
        MediaType::Unknown => {}
    }

    info
}

/// Resolves library keys to [`MediaInfo`], caching by server and key.
pub struct MediaFetcher {
    http: Arc<dyn HttpClient>,
    identity: PlexIdentity,
    cache: TtlCache<MediaInfo>,
    enrichers: Vec<Box<dyn MetadataEnricher>>,
}

impl MediaFetcher {
    pub fn new(http: Arc<dyn HttpClient>, identity: PlexIdentity) -> Self {
        Self {
            http,
            identity,
            cache: TtlCache::new("media", MEDIA_CACHE_TTL),
            enrichers: Vec::new(),
        }
    }

    pub fn add_enricher(&mut self, enricher: Box<dyn MetadataEnricher>) {
        tracing::debug!("Adding metadata enricher: {}", enricher.name());
        self.enrichers.push(enricher);
    }

    pub fn fetch(&self, server: &ServerConnection, key: &str) -> Result<MediaInfo> {
        let cache_key = format!("{}{}", server.preferred_uri, key);
        self.cache
            .get_or_fetch(&cache_key, || self.fetch_uncached(server, key))
    }

    fn fetch_uncached(&self, server: &ServerConnection, key: &str) -> Result<MediaInfo> {
        let url = format!("{}{}", server.preferred_uri, key);
        let headers = self.identity.headers(Some(&server.access_token));
        let body: Value = self.http.get(&url, &headers)?.json()?;
        let mut info = parse_metadata(first_metadata(&body)?);

        if info.media_type == MediaType::TvShow && !info.grandparent_key.is_empty() {
            if let Err(e) = self.merge_show_metadata(server, &mut info) {
                tracing::warn!("Could not load show metadata for {}: {}", info.show_title, e);
            }
        }

        for enricher in &self.enrichers {
            if let Err(e) = enricher.enrich(&mut info) {
                tracing::debug!("{} enrichment failed for {}: {}", enricher.name(), info.title, e);
            }
        }

        tracing::info!("Fetched media: {}", info.title);
        Ok(info)
    }

    /// Episodes carry no external ids or genres; the show does.
    fn merge_show_metadata(&self, server: &ServerConnection, info: &mut MediaInfo) -> Result<()> {
        let url = format!("{}{}", server.preferred_uri, info.grandparent_key);
        let headers = self.identity.headers(Some(&server.access_token));
        let body: Value = self.http.get(&url, &headers)?.json()?;
        let show = first_metadata(&body)?;

        apply_guids(show, info);
        let genres = tags(show, "Genre");
        if !genres.is_empty() {
            info.genres = genres;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::FakeHttpClient;
    use serde_json::json;

    fn server() -> ServerConnection {
        ServerConnection {
            server_id: "srv".into(),
            name: "Home".into(),
            preferred_uri: "http://10.0.0.2:32400".into(),
            access_token: "tok".into(),
            owned: true,
        }
    }

    #[test]
    fn parses_movie_guids_and_genres() {
        let metadata = json!({
            "type": "movie",
            "title": "Heat",
            "year": 1995,
            "duration": 10_200_000,
            "rating": 8.3,
            "Genre": [{"tag": "Crime"}, {"tag": "Thriller"}],
            "Guid": [{"id": "imdb://tt0113277"}, {"id": "tmdb://949"}]
        });
        let info = parse_metadata(&metadata);
        assert_eq!(info.media_type, MediaType::Movie);
        assert_eq!(info.year, 1995);
        assert!((info.duration - 10_200.0).abs() < f64::EPSILON);
        assert_eq!(info.imdb_id, "tt0113277");
        assert_eq!(info.tmdb_id, "949");
        assert_eq!(info.genres, vec!["Crime", "Thriller"]);
    }

    #[test]
    fn parses_tracks() {
        let metadata = json!({
            "type": "track",
            "title": "Windowlicker",
            "parentTitle": "Windowlicker EP",
            "grandparentTitle": "Aphex Twin",
            "index": 1
        });
        let info = parse_metadata(&metadata);
        assert_eq!(info.media_type, MediaType::Music);
        assert_eq!(info.artist, "Aphex Twin");
        assert_eq!(info.album, "Windowlicker EP");
        assert_eq!(info.track, 1);
    }

    #[test]
    fn episode_fetch_merges_show_metadata_and_caches() {
        let http = Arc::new(FakeHttpClient::new());
        http.respond(
            "http://10.0.0.2:32400/library/metadata/77",
            &json!({"MediaContainer": {"Metadata": [{
                "type": "episode",
                "title": "Pilot",
                "grandparentTitle": "Twin Peaks",
                "grandparentKey": "/library/metadata/70",
                "parentIndex": 1,
                "index": 1
            }]}})
            .to_string(),
        );
        http.respond(
            "http://10.0.0.2:32400/library/metadata/70",
            &json!({"MediaContainer": {"Metadata": [{
                "type": "show",
                "Guid": [{"id": "tmdb://1920"}, {"id": "tvdb://70533"}],
                "Genre": [{"tag": "Drama"}, {"tag": "Mystery"}]
            }]}})
            .to_string(),
        );

        let fetcher = MediaFetcher::new(http.clone(), PlexIdentity::new("test"));
        let info = fetcher.fetch(&server(), "/library/metadata/77").unwrap();
        assert_eq!(info.show_title, "Twin Peaks");
        assert_eq!((info.season, info.episode), (1, 1));
        assert_eq!(info.tmdb_id, "1920");
        assert_eq!(info.tvdb_id, "70533");
        assert_eq!(info.genres, vec!["Drama", "Mystery"]);

        fetcher.fetch(&server(), "/library/metadata/77").unwrap();
        assert_eq!(http.requests_to("http://10.0.0.2:32400/library/metadata/77"), 1);

        let headers = http
            .headers_for("http://10.0.0.2:32400/library/metadata/77")
            .unwrap();
        assert!(headers.contains(&("X-Plex-Token".to_string(), "tok".to_string())));
    }

    #[test]
    fn empty_container_is_a_parse_error() {
        let http = Arc::new(FakeHttpClient::new());
        http.respond(
            "http://10.0.0.2:32400/library/metadata/1",
            r#"{"MediaContainer": {"Metadata": []}}"#,
        );
        let fetcher = MediaFetcher::new(http, PlexIdentity::new("test"));
        assert!(matches!(
            fetcher.fetch(&server(), "/library/metadata/1"),
            Err(BridgeError::Parse(_))
        ));
    }
}
