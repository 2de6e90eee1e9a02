//! WebSocket handshake authentication.
//!
//! Signed wires compute an HMAC-SHA256 signature over
//! `timestamp + method + path` with the private key from the feed's key
//! resolver (`{FEED}_PRIVATE_KEY` or `{FEED}_PRIVATE_KEY_PATH`); static-key
//! wires send the API key header alone. Credential problems are fatal so
//! the orchestrator can rotate the secret and restart.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::{AuthSchemeKind, FeedConfig};

use super::FeedError;

type HmacSha256 = Hmac<Sha256>;

/// Resolved signing material for one feed.
pub enum Signer {
    None,
    ApiKey {
        key: String,
    },
    Signed {
        key_id: String,
        secret: Vec<u8>,
    },
}

impl Signer {
    /// Resolves credentials for the configured scheme. Missing or unreadable
    /// material is a credential error, fatal at startup.
    pub fn from_config(config: &FeedConfig) -> Result<Self, FeedError> {
        match config.auth {
            AuthSchemeKind::None => Ok(Signer::None),
            AuthSchemeKind::ApiKey => {
                let key = config
                    .api_key()
                    .map_err(|e| FeedError::Auth(e.to_string()))?;
                Ok(Signer::ApiKey { key })
            }
            AuthSchemeKind::Signed => {
                let key_id = config
                    .api_key()
                    .map_err(|e| FeedError::Auth(e.to_string()))?;
                let secret = config
                    .private_key()
                    .map_err(|e| FeedError::Auth(e.to_string()))?;
                Ok(Signer::Signed {
                    key_id,
                    secret: secret.into_bytes(),
                })
            }
        }
    }

    pub fn key_id(&self) -> Option<&str> {
        match self {
            Signer::None => None,
            Signer::ApiKey { key } => Some(key),
            Signer::Signed { key_id, .. } => Some(key_id),
        }
    }

    /// Base64 signature over `{timestamp_ms}{method}{path}`.
    pub fn sign(&self, timestamp_ms: u64, method: &str, path: &str) -> Result<String, FeedError> {
        let secret = match self {
            Signer::Signed { secret, .. } => secret,
            _ => return Err(FeedError::Auth("signer has no private key".into())),
        };
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| FeedError::Auth("private key unusable for HMAC".into()))?;
        mac.update(timestamp_ms.to_string().as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
