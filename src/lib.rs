pub mod bridge;
pub mod cache;
pub mod connection;
pub mod discord;
pub mod error;
pub mod events;
pub mod http;
mod logging;
pub mod plex;
pub mod presence;
pub mod settings;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use bridge::{MediaFilter, PresenceBridge};
pub use error::{BridgeError, Result};
pub use settings::AppSettings;

use http::{HttpClient, ReqwestHttpClient};
use plex::account::manual_servers;
use plex::{PlexAccount, PlexIdentity, PlexServer};

fn user_agent() -> String {
    format!("PresenceForPlex/{}", env!("CARGO_PKG_VERSION"))
}

/// Token from settings, or a fresh browser sign-in that gets saved.
fn ensure_token(settings: &mut AppSettings, account: &PlexAccount) -> Result<String> {
    if let Some(token) = settings.token() {
        return Ok(token.to_string());
    }

    tracing::info!("No Plex token saved, starting sign-in");
    let token = account.sign_in(&AtomicBool::new(false))?;
    settings.plex_token = Some(token.clone());
    if let Err(e) = settings::save_settings(settings) {
        tracing::warn!("Failed to save Plex token: {}", e);
    }
    Ok(token)
}

fn collect_servers(settings: &AppSettings, account: &PlexAccount, token: &str) -> Result<Vec<PlexServer>> {
    let mut servers = Vec::new();

    if settings.auto_discover {
        match account.discover_servers(token, settings.include_relay) {
            Ok(found) => {
                tracing::info!("Discovered {} Plex servers", found.len());
                servers.extend(found);
            }
            Err(e) => tracing::error!("Server discovery failed: {}", e),
        }
    }

    for server in manual_servers(&settings.server_urls, token)? {
        if servers.iter().any(|s| s.candidate_uris() == server.candidate_uris()) {
            continue;
        }
        servers.push(server);
    }

    Ok(servers)
}

fn start(settings: &mut AppSettings) -> Result<()> {
    let http = Arc::new(ReqwestHttpClient::new(&user_agent())?);
    let runtime = http.runtime_handle();
    let http: Arc<dyn HttpClient> = http;

    let identity = PlexIdentity::new(settings.plex_client_identifier.clone());
    let account = PlexAccount::new(Arc::clone(&http), identity);

    let token = ensure_token(settings, &account)?;

    let username = match settings.plex_username.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(name) => name.to_string(),
        None => account.fetch_username(&token).unwrap_or_else(|e| {
            tracing::warn!("Could not look up Plex username, sessions will not be filtered: {}", e);
            String::new()
        }),
    };

    let servers = collect_servers(settings, &account, &token)?;
    if servers.is_empty() {
        return Err(BridgeError::config(
            "no Plex servers found; enable auto_discover or set server_urls",
        ));
    }

    let bridge = PresenceBridge::new(settings, http)?;
    bridge.set_target_username(&username);
    bridge.start();
    for server in servers {
        let name = server.name.clone();
        if let Err(e) = bridge.add_server(server) {
            tracing::error!("Skipping server {}: {}", name, e);
        }
    }
    if bridge.server_count() == 0 {
        return Err(BridgeError::config("no usable Plex servers"));
    }

    tracing::info!("Running, press Ctrl+C to quit");
    if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
        tracing::error!("Failed to wait for Ctrl+C: {}", e);
    }

    bridge.shutdown();
    Ok(())
}

pub fn run() {
    let mut settings = match settings::load_settings() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to load settings: {e}");
            AppSettings::default()
        }
    };

    let log_guard = logging::init_logging(&settings.log_level);

    if let Err(e) = settings.validate() {
        tracing::error!("Invalid settings: {}", e);
        std::process::exit(1);
    }
    // Persists generated defaults such as the client identifier
    if let Err(e) = settings::save_settings(&settings) {
        tracing::warn!("Failed to save settings: {}", e);
    }

    if let Err(e) = start(&mut settings) {
        tracing::error!("{}", e);
        drop(log_guard);
        std::process::exit(1);
    }
}
