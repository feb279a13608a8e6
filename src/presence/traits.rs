use serde_json::{json, Map, Value};

use crate::plex::media::MediaInfo;

/// Maximum number of buttons Discord shows on an activity
pub const MAX_BUTTONS: usize = 2;

/// Discord activity type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActivityType {
    #[default]
    Playing = 0,
    Listening = 2,
    Watching = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub id: String,
    pub current_size: u32,
    pub max_size: u32,
}

/// One complete presence update. Timestamps are unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceFrame {
    pub details: String,
    pub state: String,
    pub large_image: String,
    pub large_text: String,
    pub small_image: String,
    pub small_text: String,
    pub activity_type: ActivityType,
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
    pub buttons: Vec<Button>,
    pub party: Option<Party>,
}

impl PresenceFrame {
    /// Adds a button unless the limit is reached.
    pub fn push_button(&mut self, label: impl Into<String>, url: impl Into<String>) -> bool {
        if self.buttons.len() >= MAX_BUTTONS {
            return false;
        }
        self.buttons.push(Button {
            label: label.into(),
            url: url.into(),
        });
        true
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty() && self.state.is_empty() && self.large_image.is_empty()
    }

    /// The `activity` object of a SET_ACTIVITY command
    pub fn to_activity_json(&self) -> Value {
        let mut activity = Map::new();
        if self.is_empty() {
            return Value::Object(activity);
        }

        activity.insert("type".into(), json!(self.activity_type as u8));
        activity.insert("status_display_type".into(), json!(2));
        activity.insert("instance".into(), json!(true));
        if !self.details.is_empty() {
            activity.insert("details".into(), json!(self.details));
        }
        if !self.state.is_empty() {
            activity.insert("state".into(), json!(self.state));
        }

        let mut assets = Map::new();
        if !self.large_image.is_empty() {
            assets.insert("large_image".into(), json!(self.large_image));
            if !self.large_text.is_empty() {
                assets.insert("large_text".into(), json!(self.large_text));
            }
        }
        if !self.small_image.is_empty() {
            assets.insert("small_image".into(), json!(self.small_image));
            if !self.small_text.is_empty() {
                assets.insert("small_text".into(), json!(self.small_text));
            }
        }
        if !assets.is_empty() {
            activity.insert("assets".into(), Value::Object(assets));
        }

        let mut timestamps = Map::new();
        if let Some(start) = self.start_ts {
            timestamps.insert("start".into(), json!(start));
        }
        if let Some(end) = self.end_ts {
            timestamps.insert("end".into(), json!(end));
        }
        if !timestamps.is_empty() {
            activity.insert("timestamps".into(), Value::Object(timestamps));
        }

        if !self.buttons.is_empty() {
            let buttons: Vec<Value> = self
                .buttons
                .iter()
                .take(MAX_BUTTONS)
                .map(|b| json!({ "label": b.label, "url": b.url }))
                .collect();
            activity.insert("buttons".into(), Value::Array(buttons));
        }

        if let Some(party) = &self.party {
            let mut party_json = json!({ "id": party.id });
            if party.current_size > 0 && party.max_size > 0 {
                party_json["size"] = json!([party.current_size, party.max_size]);
            }
            activity.insert("party".into(), party_json);
        }

        Value::Object(activity)
    }
}

/// A place playback gets shown, such as Discord
pub trait PresenceProvider: Send + Sync {
    /// Short label used in log lines
    fn name(&self) -> &'static str;

    /// Shows a prebuilt frame; repeats of the current frame are no-ops.
    fn update_presence(&self, frame: PresenceFrame);

    /// Shows a playback snapshot, formatted the provider's way
    fn update_from_media(&self, media: &MediaInfo);

    fn clear_presence(&self);
}
