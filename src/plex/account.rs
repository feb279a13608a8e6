//! plex.tv account: PIN sign-in, username and server discovery

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;

use super::{PlexIdentity, PlexServer, PLEX_TV_API, PRODUCT};
use crate::error::{BridgeError, Result, TransportError};
use crate::http::HttpClient;

const PIN_POLL_INTERVAL: Duration = Duration::from_secs(2);
const PIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const AUTH_APP_URL: &str = "https://app.plex.tv/auth#";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pin {
    pub id: i64,
    pub code: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserResponse {
    username: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Resource {
    #[serde(default)]
    name: String,
    #[serde(default)]
    client_identifier: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    owned: bool,
    #[serde(default)]
    provides: String,
    #[serde(default)]
    connections: Vec<ResourceConnection>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResourceConnection {
    uri: String,
    #[serde(default)]
    local: bool,
    #[serde(default)]
    relay: bool,
}

impl Resource {
    fn is_server(&self) -> bool {
        self.provides.split(',').any(|p| p.trim() == "server")
    }

    fn into_server(self, include_relay: bool) -> PlexServer {
        let mut local_uris = Vec::new();
        let mut public_uris = Vec::new();
        for connection in self.connections {
            if connection.uri.is_empty() || (connection.relay && !include_relay) {
                continue;
            }
            if connection.local {
                local_uris.push(connection.uri);
            } else {
                public_uris.push(connection.uri);
            }
        }

        PlexServer {
            name: if self.name.is_empty() { "Unknown".to_string() } else { self.name },
            client_identifier: self.client_identifier,
            access_token: self.access_token.unwrap_or_default(),
            owned: self.owned,
            local_uris,
            public_uris,
        }
    }
}

pub struct PlexAccount {
    http: Arc<dyn HttpClient>,
    identity: PlexIdentity,
}

impl PlexAccount {
    pub fn new(http: Arc<dyn HttpClient>, identity: PlexIdentity) -> Self {
        Self { http, identity }
    }

    pub fn request_pin(&self) -> Result<Pin> {
        let url = format!("{PLEX_TV_API}/pins?strong=true");
        let pin: Pin = self
            .http
            .post(&url, &self.identity.headers(None), None)?
            .json()?;
        tracing::debug!("Requested PIN {}", pin.id);
        Ok(pin)
    }

    /// Browser page where the user approves the PIN
    pub fn auth_url(&self, pin: &Pin) -> String {
        let product = url::form_urlencoded::byte_serialize(PRODUCT.as_bytes())
            .collect::<String>()
            .replace('+', "%20");
        format!(
            "{AUTH_APP_URL}?clientID={}&code={}&context%5Bdevice%5D%5Bproduct%5D={}",
            self.identity.client_identifier, pin.code, product
        )
    }

    /// The token once the PIN has been approved
    pub fn check_pin(&self, pin_id: i64) -> Result<Option<String>> {
        let url = format!("{PLEX_TV_API}/pins/{pin_id}");
        let pin: Pin = self.http.get(&url, &self.identity.headers(None))?.json()?;
        Ok(pin.auth_token.filter(|t| !t.is_empty()))
    }

    pub fn wait_for_token(&self, pin: &Pin, stop: &AtomicBool) -> Result<String> {
        self.wait_for_token_with(pin, PIN_POLL_INTERVAL, PIN_TIMEOUT, stop)
    }

    fn wait_for_token_with(
        &self,
        pin: &Pin,
        poll_interval: Duration,
        timeout: Duration,
        stop: &AtomicBool,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.check_pin(pin.id) {
                Ok(Some(token)) => {
                    tracing::info!("Plex sign-in approved");
                    return Ok(token);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("PIN check failed: {}", e),
            }

            if Instant::now() + poll_interval > deadline {
                return Err(TransportError::Timeout("waiting for Plex sign-in".to_string()).into());
            }
            std::thread::sleep(poll_interval);
            if stop.load(Ordering::SeqCst) {
                return Err(TransportError::Closed.into());
            }
        }
    }

    /// Full interactive sign-in: request a PIN, open the browser, wait for approval.
    pub fn sign_in(&self, stop: &AtomicBool) -> Result<String> {
        let pin = self.request_pin()?;
        let url = self.auth_url(&pin);
        tracing::info!("Sign in to Plex at {}", url);
        if let Err(e) = open::that(&url) {
            tracing::warn!("Could not open browser: {}", e);
        }
        self.wait_for_token(&pin, stop)
    }

    pub fn fetch_username(&self, token: &str) -> Result<String> {
        let url = format!("{PLEX_TV_API}/user");
        let user: UserResponse = self
            .http
            .get(&url, &self.identity.headers(Some(token)))?
            .json()?;
        Ok(user.username)
    }

    pub fn discover_servers(&self, token: &str, include_relay: bool) -> Result<Vec<PlexServer>> {
        let mut url = format!("{PLEX_TV_API}/resources?includeHttps=1");
        if include_relay {
            url.push_str("&includeRelay=1");
        }
        let resources: Vec<Resource> = self
            .http
            .get(&url, &self.identity.headers(Some(token)))?
            .json()?;

        let servers: Vec<PlexServer> = resources
            .into_iter()
            .filter(Resource::is_server)
            .map(|r| r.into_server(include_relay))
            .filter(|s| !s.candidate_uris().is_empty())
            .collect();

        for server in &servers {
            tracing::info!(
                "Found server: {} ({}) [{}]",
                server.name,
                server.client_identifier,
                if server.owned { "owned" } else { "shared" }
            );
        }
        Ok(servers)
    }
}

/// Servers configured by address, treated as owned by the signed-in account
pub fn manual_servers(urls: &[String], token: &str) -> Result<Vec<PlexServer>> {
    urls.iter()
        .map(|raw| {
            let parsed = url::Url::parse(raw)
                .map_err(|e| BridgeError::config(format!("invalid server url {raw}: {e}")))?;
            let uri = raw.trim_end_matches('/').to_string();
            Ok(PlexServer {
                name: parsed.host_str().unwrap_or(raw).to_string(),
                client_identifier: uri.clone(),
                access_token: token.to_string(),
                owned: true,
                local_uris: vec![uri],
                public_uris: Vec::new(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::FakeHttpClient;
    use serde_json::json;

    fn account(http: Arc<FakeHttpClient>) -> PlexAccount {
        PlexAccount::new(http, PlexIdentity::new("client-1"))
    }

    #[test]
    fn pin_flow_returns_token_once_approved() {
        let http = Arc::new(FakeHttpClient::new());
        http.respond(
            "https://plex.tv/api/v2/pins?strong=true",
            &json!({"id": 42, "code": "abcd"}).to_string(),
        );
        http.respond(
            "https://plex.tv/api/v2/pins/42",
            &json!({"id": 42, "code": "abcd", "authToken": "secret"}).to_string(),
        );
        let account = account(http);

        let pin = account.request_pin().unwrap();
        assert_eq!(pin.id, 42);
        assert_eq!(
            account.auth_url(&pin),
            "https://app.plex.tv/auth#?clientID=client-1&code=abcd&context%5Bdevice%5D%5Bproduct%5D=Presence%20For%20Plex"
        );

        let stop = AtomicBool::new(false);
        let token = account
            .wait_for_token_with(&pin, Duration::from_millis(10), Duration::from_secs(1), &stop)
            .unwrap();
        assert_eq!(token, "secret");
    }

    #[test]
    fn unapproved_pin_times_out() {
        let http = Arc::new(FakeHttpClient::new());
        http.respond(
            "https://plex.tv/api/v2/pins/7",
            &json!({"id": 7, "code": "x", "authToken": null}).to_string(),
        );
        let account = account(http.clone());
        let pin = Pin {
            id: 7,
            code: "x".into(),
            auth_token: None,
        };

        let stop = AtomicBool::new(false);
        let result =
            account.wait_for_token_with(&pin, Duration::from_millis(10), Duration::from_millis(50), &stop);
        assert!(matches!(
            result,
            Err(BridgeError::Transport(TransportError::Timeout(_)))
        ));
        assert!(http.requests_to("https://plex.tv/api/v2/pins/7") >= 2);
    }

    #[test]
    fn discovery_keeps_servers_and_splits_connections() {
        let http = Arc::new(FakeHttpClient::new());
        http.respond(
            "https://plex.tv/api/v2/resources?includeHttps=1",
            &json!([
                {
                    "name": "Home",
                    "clientIdentifier": "abc",
                    "accessToken": "srv-token",
                    "owned": true,
                    "provides": "server",
                    "connections": [
                        {"uri": "https://1-2-3-4.plex.direct:32400", "local": false},
                        {"uri": "https://10-0-0-2.plex.direct:32400", "local": true},
                        {"uri": "https://relay.plex.direct:8443", "local": false, "relay": true}
                    ]
                },
                {"name": "Phone", "clientIdentifier": "p", "provides": "player,controller"},
                {"name": "Empty", "clientIdentifier": "e", "provides": "server", "connections": []}
            ])
            .to_string(),
        );

        let servers = account(http).discover_servers("tok", false).unwrap();
        assert_eq!(servers.len(), 1);
        let home = &servers[0];
        assert!(home.owned);
        assert_eq!(home.access_token, "srv-token");
        assert_eq!(
            home.candidate_uris(),
            vec![
                "https://10-0-0-2.plex.direct:32400",
                "https://1-2-3-4.plex.direct:32400",
            ]
        );
    }

    #[test]
    fn fetches_username_with_token() {
        let http = Arc::new(FakeHttpClient::new());
        http.respond(
            "https://plex.tv/api/v2/user",
            &json!({"id": 1, "username": "alice"}).to_string(),
        );
        assert_eq!(account(http.clone()).fetch_username("tok").unwrap(), "alice");
        let headers = http.headers_for("https://plex.tv/api/v2/user").unwrap();
        assert!(headers.contains(&("X-Plex-Token".to_string(), "tok".to_string())));
    }

    #[test]
    fn manual_servers_are_owned_single_address() {
        let servers =
            manual_servers(&["http://192.168.1.5:32400/".to_string()], "tok").unwrap();
        assert_eq!(servers[0].name, "192.168.1.5");
        assert_eq!(servers[0].candidate_uris(), vec!["http://192.168.1.5:32400"]);
        assert!(servers[0].owned);

        assert!(manual_servers(&["not a url".to_string()], "tok").is_err());
    }
}
