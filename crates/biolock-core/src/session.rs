use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::crypto::{asymmetric_wrap, TransportKey};
use crate::error::CryptoError;
use crate::protocol::{HandshakeResponse, CMD_SETUP_ENCRYPTION};

/// Handshake bookkeeping for one extension instance.
#[derive(Debug, Clone)]
pub struct AppSession {
    pub handshakes: u32,
    pub first_handshake: DateTime<Utc>,
    pub last_handshake: DateTime<Utc>,
    seq: u64,
}

/// Distinct app ids tracked at once. The least recently seen is dropped
/// to make room, which under strict binding forces it to re-handshake.
pub const MAX_TRACKED_APPS: usize = 32;

/// Owns the process-lifetime transport key. One per host process.
pub struct Session {
    transport_key: TransportKey,
    apps: HashMap<String, AppSession>,
    handshake_seq: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::with_key(TransportKey::generate())
    }

    pub fn with_key(transport_key: TransportKey) -> Self {
        Self {
            transport_key,
            apps: HashMap::new(),
            handshake_seq: 0,
        }
    }

    pub fn transport_key(&self) -> &TransportKey {
        &self.transport_key
    }

    /// Wrap the transport key for `app_id` under its base64 DER public key.
    /// Repeated calls each wrap the same key afresh.
    pub fn handle_setup_encryption(
        &mut self,
        app_id: &str,
        public_key_b64: &str,
    ) -> Result<HandshakeResponse, CryptoError> {
        let der = general_purpose::STANDARD.decode(public_key_b64.trim())?;
        let wrapped = asymmetric_wrap(&der, self.transport_key.as_bytes())?;

        let now = Utc::now();
        if !self.apps.contains_key(app_id) && self.apps.len() >= MAX_TRACKED_APPS {
            self.evict_stalest();
        }
        let app = self.apps.entry(app_id.to_string()).or_insert(AppSession {
            handshakes: 0,
            first_handshake: now,
            last_handshake: now,
            seq: 0,
        });
        self.handshake_seq += 1;
        app.handshakes += 1;
        app.last_handshake = now;
        app.seq = self.handshake_seq;
        info!(app_id, handshakes = app.handshakes, "secure channel established");

        Ok(HandshakeResponse {
            command: CMD_SETUP_ENCRYPTION.to_string(),
            app_id: app_id.to_string(),
            shared_secret: general_purpose::STANDARD.encode(wrapped),
        })
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .apps
            .iter()
            .min_by_key(|(_, app)| app.seq)
            .map(|(id, _)| id.clone());
        if let Some(id) = stalest {
            debug!(app_id = %id, "forgetting least recent app");
            self.apps.remove(&id);
        }
    }

    pub fn is_established(&self, app_id: &str) -> bool {
        self.apps.contains_key(app_id)
    }

    pub fn app(&self, app_id: &str) -> Option<&AppSession> {
        self.apps.get(app_id)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
