mod format;
mod manager;
mod traits;

pub use format::{format_duration, format_media, replace_placeholders, FormatOptions, FormatTemplates};
pub use manager::{ActivityTransport, PipelineConfig, PresenceDeliveryPipeline};
pub use traits::{ActivityType, Button, Party, PresenceFrame, PresenceProvider};
