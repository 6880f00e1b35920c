//! ICE server configuration.
//!
//! The provisioning endpoint returns short-lived STUN/TURN credentials; if
//! that call fails the session falls back to a STUN-only default so
//! matchmaking still works for peers with friendly NATs.

use serde::{Deserialize, Serialize};

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use aparte_shared::constants::DEFAULT_STUN_URL;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    pub ice_servers: Vec<IceServerEntry>,
}

impl IceConfig {
    /// STUN-only fallback configuration.
    pub fn default_stun() -> Self {
        Self {
            ice_servers: vec![IceServerEntry {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                username: String::new(),
                credential: String::new(),
            }],
        }
    }

    pub fn into_rtc(self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .into_iter()
                .map(|entry| RTCIceServer {
                    urls: entry.urls,
                    username: entry.username,
                    credential: entry.credential,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self::default_stun()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_payload() {
        let json = r#"{
            "iceServers": [
                {"urls": ["stun:stun.example.org:3478"]},
                {"urls": ["turn:turn.example.org:3478"], "username": "u", "credential": "c"}
            ]
        }"#;
        let config: IceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username, "u");
    }

    #[test]
    fn fallback_is_stun_only() {
        let config = IceConfig::default_stun();
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
        assert!(config.ice_servers[0].credential.is_empty());
    }
}
