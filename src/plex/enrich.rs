//! External artwork and catalog-id lookups

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::media::{MediaInfo, MediaType};
use crate::cache::TtlCache;
use crate::error::{BridgeError, Result};
use crate::http::HttpClient;

pub const EXTERNAL_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const TMDB_API: &str = "https://api.themoviedb.org/3";
const TMDB_IMAGE_BASE: &str = "https://image.tmdb.org/t/p/w500";
const JIKAN_API: &str = "https://api.jikan.moe/v4/anime";

/// Runs after library metadata is parsed and before it is cached
pub trait MetadataEnricher: Send + Sync {
    fn name(&self) -> &'static str;
    fn enrich(&self, media: &mut MediaInfo) -> Result<()>;
}

pub struct TmdbEnricher {
    http: Arc<dyn HttpClient>,
    access_token: String,
    artwork: TtlCache<String>,
}

impl TmdbEnricher {
    pub fn new(http: Arc<dyn HttpClient>, access_token: impl Into<String>) -> Result<Self> {
        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(BridgeError::config("TMDB access token must not be empty"));
        }
        Ok(Self {
            http,
            access_token,
            artwork: TtlCache::new("tmdb-artwork", EXTERNAL_CACHE_TTL),
        })
    }

    fn fetch_artwork(&self, tmdb_id: &str, media_type: MediaType) -> Result<String> {
        let kind = if media_type == MediaType::Movie { "movie" } else { "tv" };
        let url = format!("{TMDB_API}/{kind}/{tmdb_id}/images");
        let headers = [
            ("Authorization".to_string(), format!("Bearer {}", self.access_token)),
            ("Accept".to_string(), "application/json".to_string()),
        ];
        let body: Value = self.http.get(&url, &headers)?.json()?;

        ["posters", "backdrops"]
            .iter()
            .find_map(|kind| body.pointer(&format!("/{kind}/0/file_path")).and_then(Value::as_str))
            .map(|path| format!("{TMDB_IMAGE_BASE}{path}"))
            .ok_or_else(|| BridgeError::parse(format!("no TMDB images for {tmdb_id}")))
    }
}

impl MetadataEnricher for TmdbEnricher {
    fn name(&self) -> &'static str {
        "tmdb"
    }

    fn enrich(&self, media: &mut MediaInfo) -> Result<()> {
        if media.tmdb_id.is_empty() {
            return Ok(());
        }

        let cache_key = format!("{:?}:{}", media.media_type, media.tmdb_id);
        let url = self.artwork.get_or_fetch(&cache_key, || {
            self.fetch_artwork(&media.tmdb_id, media.media_type)
        })?;
        tracing::debug!("TMDB artwork for {}: {}", media.title, url);
        media.art_path = url;
        Ok(())
    }
}

/// MyAnimeList ids and artwork via the Jikan API, for titles tagged as anime
pub struct JikanEnricher {
    http: Arc<dyn HttpClient>,
    ids_by_title: TtlCache<String>,
    artwork: TtlCache<String>,
}

impl JikanEnricher {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            ids_by_title: TtlCache::new("mal-ids", EXTERNAL_CACHE_TTL),
            artwork: TtlCache::new("mal-artwork", EXTERNAL_CACHE_TTL),
        }
    }

    fn search_url(title: &str, year: i32) -> Result<url::Url> {
        let mut url = url::Url::parse(JIKAN_API).map_err(|e| BridgeError::parse(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("q", title);
            query.append_pair("limit", "1");
            if year > 0 {
                query.append_pair("start_date", &format!("{year}-01-01"));
                query.append_pair("end_date", &format!("{year}-12-31"));
            }
        }
        Ok(url)
    }

    fn search_id(&self, title: &str, year: i32) -> Result<String> {
        let url = Self::search_url(title, year)?;
        let body: Value = self.http.get(url.as_str(), &[])?.json()?;
        body.pointer("/data/0/mal_id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .ok_or_else(|| BridgeError::parse(format!("no MyAnimeList match for {title}")))
    }

    fn fetch_artwork(&self, mal_id: &str) -> Result<String> {
        let url = format!("{JIKAN_API}/{mal_id}");
        let body: Value = self.http.get(&url, &[])?.json()?;
        body.pointer("/data/images/jpg/large_image_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BridgeError::parse(format!("no artwork for MAL id {mal_id}")))
    }
}

impl MetadataEnricher for JikanEnricher {
    fn name(&self) -> &'static str {
        "jikan"
    }

    fn enrich(&self, media: &mut MediaInfo) -> Result<()> {
        if !media.genres.iter().any(|g| g == "Anime") {
            return Ok(());
        }

        if media.mal_id.is_empty() {
            let title = if media.media_type == MediaType::TvShow && !media.show_title.is_empty() {
                media.show_title.clone()
            } else {
                media.title.clone()
            };
            let year = media.year;
            media.mal_id = self
                .ids_by_title
                .get_or_fetch(&title, || self.search_id(&title, year))?;
        }

        if media.art_path.is_empty() {
            let mal_id = media.mal_id.clone();
            media.art_path = self
                .artwork
                .get_or_fetch(&mal_id, || self.fetch_artwork(&mal_id))?;
        }
        Ok(())
    }
}
