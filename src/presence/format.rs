//! Turns playback snapshots into presence frames

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::traits::{ActivityType, PresenceFrame};
use crate::plex::media::{MediaInfo, MediaType, PlaybackState};

/// While paused, both timestamps sit this far ahead so Discord shows no countdown
pub const PAUSED_TIMESTAMP_OFFSET_SECS: i64 = 9999 * 60 * 60;

const DEFAULT_LARGE_IMAGE: &str = "plex_logo";
const PAUSED_IMAGE: &str = "paused";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatTemplates {
    pub tv_details: String,
    pub tv_state: String,
    pub tv_large_image_text: String,
    pub movie_details: String,
    pub movie_state: String,
    pub movie_large_image_text: String,
    pub music_details: String,
    pub music_state: String,
    pub music_large_image_text: String,
}

impl Default for FormatTemplates {
    fn default() -> Self {
        Self {
            tv_details: "{show}".to_string(),
            tv_state: "{se} - {title}".to_string(),
            tv_large_image_text: "{title}".to_string(),
            movie_details: "{title} ({year})".to_string(),
            movie_state: "{genres}".to_string(),
            movie_large_image_text: "{title}".to_string(),
            music_details: "{title}".to_string(),
            music_state: "{artist} - {album}".to_string(),
            music_large_image_text: "{title}".to_string(),
        }
    }
}

impl FormatTemplates {
    fn for_type(&self, media_type: MediaType) -> (&str, &str, &str) {
        match media_type {
            MediaType::TvShow => (&self.tv_details, &self.tv_state, &self.tv_large_image_text),
            MediaType::Movie => (
                &self.movie_details,
                &self.movie_state,
                &self.movie_large_image_text,
            ),
            MediaType::Music => (
                &self.music_details,
                &self.music_state,
                &self.music_large_image_text,
            ),
            MediaType::Unknown => ("{title}", "Playing media", "{title}"),
        }
    }

    pub fn all(&self) -> [&str; 9] {
        [
            &self.tv_details,
            &self.tv_state,
            &self.tv_large_image_text,
            &self.movie_details,
            &self.movie_state,
            &self.movie_large_image_text,
            &self.music_details,
            &self.music_state,
            &self.music_large_image_text,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub show_progress: bool,
    pub show_buttons: bool,
    pub show_artwork: bool,
    pub templates: FormatTemplates,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            show_progress: true,
            show_buttons: true,
            show_artwork: true,
            templates: FormatTemplates::default(),
        }
    }
}

/// `h:mm:ss` above an hour, `m:ss` below
#[allow(clippy::cast_possible_truncation)]
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as i64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

fn progress_percentage(progress: f64, duration: f64) -> String {
    if duration <= 0.0 {
        return "0%".to_string();
    }
    format!("{:.0}%", progress / duration * 100.0)
}

fn positive(value: i32) -> String {
    if value > 0 {
        value.to_string()
    } else {
        String::new()
    }
}

fn padded(value: i32) -> String {
    if value > 0 {
        format!("{value:02}")
    } else {
        String::new()
    }
}

fn placeholder_value(name: &str, media: &MediaInfo) -> Option<String> {
    let has_episode = media.season > 0 && media.episode > 0;
    let value = match name {
        "title" => media.title.clone(),
        "original_title" => media.original_title.clone(),
        "year" => positive(media.year),
        "studio" => media.studio.clone(),
        "summary" => media.summary.clone(),
        "show" | "show_title" => media.show_title.clone(),
        "season" => positive(media.season),
        "episode" => positive(media.episode),
        "season_padded" => padded(media.season),
        "episode_padded" => padded(media.episode),
        "se" if has_episode => format!("S{} • E{}", media.season, media.episode),
        "SxE" if has_episode => format!("S{:02}E{:02}", media.season, media.episode),
        "se" | "SxE" => String::new(),
        "artist" => media.artist.clone(),
        "album" => media.album.clone(),
        "track" => positive(media.track),
        "state" => media.state.label().to_string(),
        "type" => match media.media_type {
            MediaType::Unknown => "Media".to_string(),
            other => other.label().to_string(),
        },
        "progress" => format_duration(media.progress),
        "duration" => format_duration(media.duration),
        "progress_percentage" => progress_percentage(media.progress, media.duration),
        "remaining" => format_duration(media.duration - media.progress),
        "username" => media.username.clone(),
        "genres" => media.genres.join(", "),
        "genre" => media.genres.first().cloned().unwrap_or_default(),
        "rating" if media.rating > 0.0 => format!("{:.1}", media.rating),
        "rating" => String::new(),
        _ => return None,
    };
    Some(value)
}

/// Substitutes `{name}` placeholders in one pass. Unknown names are kept verbatim.
pub fn replace_placeholders(template: &str, media: &MediaInfo) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match placeholder_value(name, media) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn activity_type(media_type: MediaType) -> ActivityType {
    match media_type {
        MediaType::Music => ActivityType::Listening,
        MediaType::Movie | MediaType::TvShow => ActivityType::Watching,
        MediaType::Unknown => ActivityType::Playing,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn apply_timestamps(frame: &mut PresenceFrame, media: &MediaInfo, options: &FormatOptions, now: DateTime<Utc>) {
    if !options.show_progress {
        frame.start_ts = media.session_created_at.map(|t| t.timestamp());
        return;
    }

    let duration = media.duration.max(0.0) as i64;
    match media.state {
        PlaybackState::Playing => {
            let start = media
                .start_time
                .map_or_else(|| now.timestamp() - media.progress as i64, |t| t.timestamp());
            frame.start_ts = Some(start);
            frame.end_ts = Some(start + duration);
        }
        PlaybackState::Paused | PlaybackState::Buffering => {
            let start = now.timestamp() + PAUSED_TIMESTAMP_OFFSET_SECS;
            frame.start_ts = Some(start);
            frame.end_ts = Some(start + duration);
        }
        PlaybackState::Stopped => {}
    }
}

fn apply_buttons(frame: &mut PresenceFrame, media: &MediaInfo) {
    if !media.mal_id.is_empty() {
        frame.push_button(
            "View on MyAnimeList",
            format!("https://myanimelist.net/anime/{}", media.mal_id),
        );
    }
    if !media.imdb_id.is_empty() {
        frame.push_button(
            "View on IMDb",
            format!("https://www.imdb.com/title/{}", media.imdb_id),
        );
    }
}

/// Builds the frame for one snapshot at `now`.
pub fn format_media(media: &MediaInfo, options: &FormatOptions, now: DateTime<Utc>) -> PresenceFrame {
    let (details, state, large_text) = options.templates.for_type(media.media_type);

    let mut frame = PresenceFrame {
        details: replace_placeholders(details, media),
        state: replace_placeholders(state, media),
        large_text: if large_text.is_empty() {
            media.title.clone()
        } else {
            replace_placeholders(large_text, media)
        },
        large_image: if options.show_artwork && !media.art_path.is_empty() {
            media.art_path.clone()
        } else {
            DEFAULT_LARGE_IMAGE.to_string()
        },
        activity_type: activity_type(media.media_type),
        ..PresenceFrame::default()
    };

    match media.state {
        PlaybackState::Buffering => frame.state = "🔄 Buffering...".to_string(),
        PlaybackState::Paused => {
            frame.small_image = PAUSED_IMAGE.to_string();
            frame.small_text = "Paused".to_string();
        }
        PlaybackState::Stopped => frame.state = "Stopped".to_string(),
        PlaybackState::Playing => {}
    }

    apply_timestamps(&mut frame, media, options, now);
    if options.show_buttons {
        apply_buttons(&mut frame, media);
    }

    if frame.details.is_empty() {
        frame.details = "Watching something...".to_string();
    }
    if frame.state.is_empty() {
        frame.state = "Idle".to_string();
    }
    frame
}
