//! WebRTC configuration

use serde::{Deserialize, Serialize};

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs, multiple URLs allow UDP/TCP fallback
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    /// Create a TurnServer with a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_stun() {
        let config = WebRtcConfig::default();
        assert_eq!(config.stun_servers.len(), 1);
        assert!(config.stun_servers[0].starts_with("stun:"));
        assert!(config.turn_servers.is_empty());
    }
}
