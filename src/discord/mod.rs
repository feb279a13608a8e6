mod ipc;
mod rate_limiter;
mod strategy;

pub use ipc::{default_endpoints, IpcClient};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use strategy::DiscordConnectionStrategy;

/// Application id of the public "Plex" rich presence app
pub const DEFAULT_CLIENT_ID: &str = "1359742002618564618";
