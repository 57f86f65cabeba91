//! Session configuration and TURN credential provisioning.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::candidate::Protocol;
use crate::peer::Platform;

/// Errors acquiring a session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The provisioning endpoint was unreachable or answered with a
    /// non-success status.
    #[error("TURN request failed: {0}")]
    Fetch(String),

    /// The provisioning response was not the expected JSON document.
    #[error("malformed TURN response: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Malformed(e.to_string())
    }
}

/// One relay/STUN server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs, e.g. `turn:203.0.113.7:3478?transport=udp`.
    pub urls: Vec<String>,
    /// Username for the server.
    pub username: String,
    /// Credential for the server.
    pub credential: String,
}

/// Configuration handed to the negotiation capability when creating
/// endpoints.
///
/// Probes are allowed to mutate their copy, e.g. to narrow the relay
/// transport. For that reason cached configurations are always cloned
/// out, never shared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Relay/STUN servers, in priority order.
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<IceServer>,
}

impl SessionConfig {
    /// Builds a configuration from static settings: a comma-separated
    /// URI list plus credentials.
    pub fn from_static(uris: &str, username: &str, credential: &str) -> SessionConfig {
        SessionConfig {
            ice_servers: vec![IceServer {
                urls: uris
                    .split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(String::from)
                    .collect(),
                username: username.to_string(),
                credential: credential.to_string(),
            }],
        }
    }

    /// Whether any server URL is a STUN URI.
    pub fn has_stun_server(&self) -> bool {
        self.ice_servers
            .iter()
            .flat_map(|s| s.urls.iter())
            .any(|u| u.starts_with("stun"))
    }

    /// Narrows the configuration to relay URLs using the given transport.
    ///
    /// URLs already carrying a `transport=` parameter are kept only when
    /// it matches. Bare `turn` URLs get the parameter appended. Servers
    /// left without URLs are dropped.
    pub fn filter_transport(&mut self, proto: Protocol) {
        let transport = format!("transport={proto}");

        self.ice_servers.retain_mut(|server| {
            server.urls = server
                .urls
                .iter()
                .filter_map(|url| {
                    if url.contains(&transport) {
                        Some(url.clone())
                    } else if !url.contains("?transport=") && url.starts_with("turn") {
                        Some(format!("{url}?{transport}"))
                    } else {
                        None
                    }
                })
                .collect();
            !server.urls.is_empty()
        });
    }
}

/// The JSON document returned by the TURN provisioning endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedTurn {
    /// Provisioned username.
    pub username: String,
    /// Provisioned credential.
    pub password: String,
    /// Relay server URIs the credentials are valid for.
    pub uris: Vec<String>,
    /// Credential lifetime, in seconds.
    pub lifetime_duration: u64,
}

impl ProvisionedTurn {
    /// Parses a provisioning response body.
    pub fn from_json(body: &str) -> Result<ProvisionedTurn, ConfigError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Credential lifetime.
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_duration)
    }

    /// Converts the provisioned credentials into a session configuration.
    pub fn to_config(&self) -> SessionConfig {
        SessionConfig {
            ice_servers: vec![IceServer {
                urls: self.uris.clone(),
                username: self.username.clone(),
                credential: self.password.clone(),
            }],
        }
    }
}

/// Process-wide cache of the provisioned TURN configuration.
///
/// Fetched credentials are reused until their remaining lifetime drops
/// below the expected duration of the next probe run, then refreshed
/// lazily. A static configuration bypasses provisioning entirely.
#[derive(Debug, Default)]
pub struct TurnCache {
    static_config: Option<SessionConfig>,
    cached: Option<CachedEntry>,
}

#[derive(Debug)]
struct CachedEntry {
    config: SessionConfig,
    expires_at: Instant,
}

impl TurnCache {
    /// Creates an empty cache that provisions on first use.
    pub fn new() -> TurnCache {
        TurnCache::default()
    }

    /// Creates a cache that always hands out `config` without ever
    /// contacting the provisioning endpoint.
    pub fn with_static(config: SessionConfig) -> TurnCache {
        TurnCache {
            static_config: Some(config),
            cached: None,
        }
    }

    /// Returns a configuration valid for at least `expected_run`.
    ///
    /// The returned value is always a fresh copy; callers may mutate it
    /// freely without affecting the cache.
    pub fn get(
        &mut self,
        now: Instant,
        expected_run: Duration,
        platform: &mut dyn Platform,
    ) -> Result<SessionConfig, ConfigError> {
        if let Some(s) = &self.static_config {
            return Ok(s.clone());
        }

        if let Some(entry) = &self.cached {
            if entry.expires_at >= now + expected_run {
                return Ok(entry.config.clone());
            }
            debug!("Cached TURN config expires too soon, refreshing");
        }

        let provisioned = platform.provision_turn()?;
        let config = provisioned.to_config();
        debug!(
            "Provisioned TURN config with {} uri(s), lifetime {}s",
            provisioned.uris.len(),
            provisioned.lifetime_duration
        );
        self.cached = Some(CachedEntry {
            config: config.clone(),
            expires_at: now + provisioned.lifetime(),
        });

        Ok(config)
    }
}
