pub mod account;
pub mod enrich;
pub mod media;
pub mod racer;
pub mod session;
pub mod sse;

pub use account::PlexAccount;
pub use media::{MediaFetcher, MediaInfo, MediaType, PlaybackState};
pub use racer::{EventStreamRacer, RaceListener, RacerConfig};
pub use session::{SessionTracker, SessionUpdate};

pub const PRODUCT: &str = "Presence For Plex";
pub const PLEX_TV_API: &str = "https://plex.tv/api/v2";

/// How this client identifies itself to plex.tv and media servers
#[derive(Debug, Clone)]
pub struct PlexIdentity {
    pub client_identifier: String,
    pub version: String,
}

impl PlexIdentity {
    pub fn new(client_identifier: impl Into<String>) -> Self {
        Self {
            client_identifier: client_identifier.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Standard `X-Plex-*` headers, plus the token when one is given
    pub fn headers(&self, token: Option<&str>) -> Vec<(String, String)> {
        let mut headers = vec![
            ("X-Plex-Product".to_string(), PRODUCT.to_string()),
            ("X-Plex-Version".to_string(), self.version.clone()),
            (
                "X-Plex-Client-Identifier".to_string(),
                self.client_identifier.clone(),
            ),
            (
                "X-Plex-Platform".to_string(),
                std::env::consts::OS.to_string(),
            ),
            ("X-Plex-Device".to_string(), "PC".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ];
        if let Some(token) = token {
            headers.push(("X-Plex-Token".to_string(), token.to_string()));
        }
        headers
    }
}

/// A media server known from discovery or manual configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlexServer {
    pub name: String,
    pub client_identifier: String,
    pub access_token: String,
    pub owned: bool,
    pub local_uris: Vec<String>,
    pub public_uris: Vec<String>,
}

impl PlexServer {
    /// Local addresses first, then public ones, without duplicates
    pub fn candidate_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = Vec::new();
        for uri in self.local_uris.iter().chain(&self.public_uris) {
            let uri = uri.trim_end_matches('/');
            if !uri.is_empty() && !uris.iter().any(|u| u == uri) {
                uris.push(uri.to_string());
            }
        }
        uris
    }
}

/// The promoted route to a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConnection {
    pub server_id: String,
    pub name: String,
    pub preferred_uri: String,
    pub access_token: String,
    pub owned: bool,
}
