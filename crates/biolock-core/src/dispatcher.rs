//! Per-frame protocol state machine.
//!
//! Received -> Classified (plaintext | ciphertext) -> Decrypted -> Dispatched
//! -> Responded. Every frame gets exactly one reply; nothing here is fatal.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::biometrics::BiometricGate;
use crate::crypto::{symmetric_decrypt, symmetric_encrypt};
use crate::error::{CryptoError, ProtocolError, SecretStoreError};
use crate::protocol::{
    clip_echo, parse_envelope, sniff_app_id, EncryptedEnvelope, EncryptedMessage, InboundMessage,
    OutboundMessage, PayloadRequest, PayloadResponse, PlaintextMessage, ResponseStatus,
    CMD_BIOMETRIC_UNLOCK, CMD_ERROR, CMD_SETUP_ENCRYPTION,
};
use crate::secret_store::SecretStore;
use crate::session::Session;
use crate::settings::HostSettings;

pub struct Broker {
    session: Session,
    gate: Arc<dyn BiometricGate>,
    store: Arc<dyn SecretStore>,
    strict_app_binding: bool,
}

impl Broker {
    pub fn new(session: Session, gate: Arc<dyn BiometricGate>, store: Arc<dyn SecretStore>) -> Self {
        Self {
            session,
            gate,
            store,
            strict_app_binding: false,
        }
    }

    pub fn from_settings(
        settings: &HostSettings,
        gate: Arc<dyn BiometricGate>,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        Self::new(Session::new(), gate, store).with_strict_app_binding(settings.strict_app_binding)
    }

    pub fn with_strict_app_binding(mut self, strict: bool) -> Self {
        self.strict_app_binding = strict;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn handle_frame(&mut self, frame: &[u8]) -> OutboundMessage {
        let envelope = match parse_envelope(frame) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "rejecting malformed frame");
                return OutboundMessage::error(CMD_ERROR, sniff_app_id(frame), e);
            }
        };
        let app_id = envelope.app_id.clone();
        match envelope.classify() {
            Ok((app_id, InboundMessage::Plaintext(msg))) => {
                debug!(app_id = %app_id, command = %clip_echo(&msg.command), "plaintext message");
                self.handle_plaintext(app_id, msg)
            }
            Ok((app_id, InboundMessage::Ciphertext(msg))) => {
                debug!(app_id = %app_id, "encrypted message");
                self.handle_ciphertext(app_id, msg).await
            }
            Err(e) => {
                let app_id = clip_echo(&app_id);
                warn!(app_id = %app_id, error = %e, "rejecting unclassifiable message");
                OutboundMessage::error(CMD_ERROR, Some(app_id), e)
            }
        }
    }

    fn handle_plaintext(&mut self, app_id: String, msg: PlaintextMessage) -> OutboundMessage {
        match msg.command.as_str() {
            CMD_SETUP_ENCRYPTION => {
                let Some(public_key) = msg.public_key.as_deref() else {
                    let err = ProtocolError::MissingField("publicKey");
                    warn!(app_id = %app_id, error = %err, "handshake rejected");
                    return OutboundMessage::error(CMD_SETUP_ENCRYPTION, Some(app_id), err);
                };
                match self.session.handle_setup_encryption(&app_id, public_key) {
                    Ok(resp) => OutboundMessage::Handshake(resp),
                    Err(e) => {
                        warn!(app_id = %app_id, error = %e, "handshake rejected");
                        OutboundMessage::error(CMD_SETUP_ENCRYPTION, Some(app_id), e)
                    }
                }
            }
            other => {
                let command = clip_echo(other);
                warn!(app_id = %app_id, command = %command, "rejecting plaintext command");
                OutboundMessage::error(&command, Some(app_id), ProtocolError::UnknownCommand)
            }
        }
    }

    async fn handle_ciphertext(&mut self, app_id: String, msg: EncryptedMessage) -> OutboundMessage {
        if self.strict_app_binding && !self.session.is_established(&app_id) {
            warn!(app_id = %app_id, "encrypted message before handshake");
            return OutboundMessage::invalidate_encryption(app_id);
        }

        let decrypted = msg
            .to_ciphertext()
            .and_then(|ct| symmetric_decrypt(self.session.transport_key(), &ct));
        let plaintext = match decrypted {
            Ok(p) => p,
            Err(e @ (CryptoError::Authentication | CryptoError::Decrypt)) => {
                // Sender does not hold the current transport key.
                warn!(app_id = %app_id, error = %e, "payload failed to decrypt");
                return OutboundMessage::invalidate_encryption(app_id);
            }
            Err(e) => {
                warn!(app_id = %app_id, error = %e, "malformed encrypted message");
                return OutboundMessage::error(CMD_ERROR, Some(app_id), e);
            }
        };

        let request: PayloadRequest = match serde_json::from_slice(&plaintext) {
            Ok(r) => r,
            Err(e) => {
                warn!(app_id = %app_id, error = %e, "malformed payload");
                let resp = PayloadResponse::new(CMD_ERROR, ResponseStatus::InvalidRequest, Value::Null);
                return self.encrypted_reply(app_id, resp);
            }
        };

        let response = match request.command.as_str() {
            CMD_BIOMETRIC_UNLOCK => self.biometric_unlock(&app_id, request).await,
            other => {
                let command = clip_echo(other);
                warn!(app_id = %app_id, command = %command, "rejecting payload command");
                PayloadResponse::new(command, ResponseStatus::UnsupportedCommand, request.timestamp)
            }
        };
        self.encrypted_reply(app_id, response)
    }

    async fn biometric_unlock(&self, app_id: &str, request: PayloadRequest) -> PayloadResponse {
        let PayloadRequest {
            command,
            user_id,
            timestamp,
        } = request;
        let Some(user_id) = user_id.filter(|u| !u.is_empty()) else {
            warn!(app_id, "biometric unlock without userId");
            return PayloadResponse::new(command, ResponseStatus::InvalidRequest, timestamp);
        };

        info!(app_id, user_id = %user_id, "biometric unlock requested");
        if !self.gate.check_biometrics().await {
            info!(app_id, user_id = %user_id, "biometric unlock denied");
            return PayloadResponse::new(command, ResponseStatus::Canceled, timestamp);
        }

        match self.store.get_secret(&user_id) {
            Ok(secret) => {
                info!(app_id, user_id = %user_id, "unlock key released");
                PayloadResponse::unlocked(timestamp, (*secret).clone())
            }
            Err(e @ SecretStoreError::NotFound(_)) => {
                warn!(app_id, error = %e, "no unlock key enrolled");
                PayloadResponse::new(command, ResponseStatus::NotEnabled, timestamp)
            }
            Err(e) => {
                error!(app_id, error = %e, "secret store failure");
                PayloadResponse::new(command, ResponseStatus::NotAvailable, timestamp)
            }
        }
    }

    fn encrypted_reply(&self, app_id: String, response: PayloadResponse) -> OutboundMessage {
        let plaintext = match serde_json::to_vec(&response) {
            Ok(bytes) => Zeroizing::new(bytes),
            Err(e) => {
                error!(app_id = %app_id, error = %e, "cannot encode response");
                return OutboundMessage::error(&response.command, Some(app_id), e);
            }
        };
        match symmetric_encrypt(self.session.transport_key(), &plaintext) {
            Ok(ct) => OutboundMessage::Encrypted(EncryptedEnvelope {
                app_id,
                message: EncryptedMessage::from_ciphertext(&ct),
            }),
            Err(e) => {
                error!(app_id = %app_id, error = %e, "cannot encrypt response");
                OutboundMessage::error(&response.command, Some(app_id), e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TransportKey;
    use crate::secret_store::MemorySecretStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedGate(bool);

    #[async_trait]
    impl BiometricGate for FixedGate {
        async fn check_biometrics(&self) -> bool {
            self.0
        }
    }

    struct BrokenStore;

    impl SecretStore for BrokenStore {
        fn get_secret(&self, _: &str) -> Result<Zeroizing<String>, SecretStoreError> {
            Err(SecretStoreError::Unavailable("dbus down".into()))
        }
        fn set_secret(&self, _: &str, _: &str) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("dbus down".into()))
        }
        fn delete_secret(&self, _: &str) -> Result<(), SecretStoreError> {
            Err(SecretStoreError::Unavailable("dbus down".into()))
        }
    }

    fn broker(allow: bool, store: Arc<dyn SecretStore>) -> Broker {
        Broker::new(Session::new(), Arc::new(FixedGate(allow)), store)
    }

    fn seeded_store() -> Arc<dyn SecretStore> {
        let store = MemorySecretStore::new();
        store.set_secret("user-1", "bWFzdGVyLWtleQ==").unwrap();
        Arc::new(store)
    }

    fn encrypted_frame(key: &TransportKey, app_id: &str, payload: Value) -> Vec<u8> {
        let ct = symmetric_encrypt(key, payload.to_string().as_bytes()).unwrap();
        json!({"appID": app_id, "message": EncryptedMessage::from_ciphertext(&ct)})
            .to_string()
            .into_bytes()
    }

    fn decrypt_reply(key: &TransportKey, out: &OutboundMessage) -> Value {
        let OutboundMessage::Encrypted(env) = out else {
            panic!("expected encrypted reply, got {out:?}");
        };
        let ct = env.message.to_ciphertext().unwrap();
        serde_json::from_slice(&symmetric_decrypt(key, &ct).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn unlock_releases_secret_and_echoes_timestamp() {
        let mut broker = broker(true, seeded_store());
        let key = broker.session().transport_key().clone();
        let frame = encrypted_frame(
            &key,
            "x",
            json!({"command": "biometricUnlock", "userId": "user-1", "timestamp": 1717171717}),
        );
        let reply = decrypt_reply(&key, &broker.handle_frame(&frame).await);
        assert_eq!(reply["response"], "unlocked");
        assert_eq!(reply["keyB64"], "bWFzdGVyLWtleQ==");
        assert_eq!(reply["timestamp"], 1717171717);
    }

    #[tokio::test]
    async fn denied_gate_yields_canceled() {
        let mut broker = broker(false, seeded_store());
        let key = broker.session().transport_key().clone();
        let frame = encrypted_frame(
            &key,
            "x",
            json!({"command": "biometricUnlock", "userId": "user-1", "timestamp": 5}),
        );
        let reply = decrypt_reply(&key, &broker.handle_frame(&frame).await);
        assert_eq!(reply["response"], "canceled");
        assert!(reply.get("keyB64").is_none());
    }

    #[tokio::test]
    async fn unknown_user_is_not_enabled() {
        let mut broker = broker(true, seeded_store());
        let key = broker.session().transport_key().clone();
        let frame = encrypted_frame(
            &key,
            "x",
            json!({"command": "biometricUnlock", "userId": "someone-else", "timestamp": 5}),
        );
        let reply = decrypt_reply(&key, &broker.handle_frame(&frame).await);
        assert_eq!(reply["response"], "not enabled");
    }

    #[tokio::test]
    async fn store_failure_is_not_available() {
        let mut broker = broker(true, Arc::new(BrokenStore));
        let key = broker.session().transport_key().clone();
        let frame = encrypted_frame(
            &key,
            "x",
            json!({"command": "biometricUnlock", "userId": "user-1"}),
        );
        let reply = decrypt_reply(&key, &broker.handle_frame(&frame).await);
        assert_eq!(reply["response"], "not available");
    }

    #[tokio::test]
    async fn missing_user_id_is_invalid() {
        let mut broker = broker(true, seeded_store());
        let key = broker.session().transport_key().clone();
        let frame = encrypted_frame(&key, "x", json!({"command": "biometricUnlock"}));
        let reply = decrypt_reply(&key, &broker.handle_frame(&frame).await);
        assert_eq!(reply["response"], "invalid request");
    }

    #[tokio::test]
    async fn foreign_key_gets_invalidate_encryption() {
        let mut broker = broker(true, seeded_store());
        let frame = encrypted_frame(
            &TransportKey::generate(),
            "x",
            json!({"command": "biometricUnlock", "userId": "user-1"}),
        );
        let out = serde_json::to_value(broker.handle_frame(&frame).await).unwrap();
        assert_eq!(out, json!({"command": "invalidateEncryption", "appID": "x"}));
    }

    #[tokio::test]
    async fn unknown_encrypted_command_is_unsupported() {
        let mut broker = broker(true, seeded_store());
        let key = broker.session().transport_key().clone();
        let frame = encrypted_frame(&key, "x", json!({"command": "frobnicate", "timestamp": 9}));
        let reply = decrypt_reply(&key, &broker.handle_frame(&frame).await);
        assert_eq!(reply["command"], "frobnicate");
        assert_eq!(reply["response"], "unsupported command");
        assert_eq!(reply["timestamp"], 9);
    }

    #[tokio::test]
    async fn unknown_plaintext_command_is_error() {
        let mut broker = broker(true, seeded_store());
        let frame = json!({"appID": "x", "message": {"command": "frobnicate"}}).to_string();
        let out = serde_json::to_value(broker.handle_frame(frame.as_bytes()).await).unwrap();
        assert_eq!(out["command"], "frobnicate");
        assert_eq!(out["appID"], "x");
        assert!(out["error"].as_str().unwrap().contains("unknown command"));
    }

    #[tokio::test]
    async fn handshake_without_key_is_error() {
        let mut broker = broker(true, seeded_store());
        let frame = json!({"appID": "x", "message": {"command": "setupEncryption"}}).to_string();
        let out = serde_json::to_value(broker.handle_frame(frame.as_bytes()).await).unwrap();
        assert_eq!(out["command"], "setupEncryption");
        assert!(out["error"].as_str().unwrap().contains("publicKey"));
    }

    #[tokio::test]
    async fn garbage_frame_is_error() {
        let mut broker = broker(true, seeded_store());
        let out = serde_json::to_value(broker.handle_frame(b"\x00\x01not json").await).unwrap();
        assert_eq!(out["command"], "error");
        assert!(out.get("appID").is_none());
    }

    #[tokio::test]
    async fn enc_string_only_message_is_accepted() {
        let mut broker = broker(true, seeded_store());
        let key = broker.session().transport_key().clone();
        let payload = json!({"command": "biometricUnlock", "userId": "user-1", "timestamp": 1});
        let ct = symmetric_encrypt(&key, payload.to_string().as_bytes()).unwrap();
        let frame = json!({
            "appId": "x",
            "message": {"encryptionType": 2, "encryptedString": ct.to_enc_string()}
        })
        .to_string();
        let reply = decrypt_reply(&key, &broker.handle_frame(frame.as_bytes()).await);
        assert_eq!(reply["response"], "unlocked");
    }

    #[tokio::test]
    async fn strict_binding_serves_after_handshake() {
        use crate::crypto::tests::test_public_der;
        use base64::{engine::general_purpose, Engine as _};

        let mut broker = broker(true, seeded_store()).with_strict_app_binding(true);
        let key = broker.session().transport_key().clone();
        let handshake = json!({
            "appID": "x",
            "message": {
                "command": "setupEncryption",
                "publicKey": general_purpose::STANDARD.encode(test_public_der())
            }
        })
        .to_string();
        let out = broker.handle_frame(handshake.as_bytes()).await;
        assert_eq!(out.command(), Some("setupEncryption"));

        let frame = encrypted_frame(
            &key,
            "x",
            json!({"command": "biometricUnlock", "userId": "user-1", "timestamp": 3}),
        );
        let reply = decrypt_reply(&key, &broker.handle_frame(&frame).await);
        assert_eq!(reply["response"], "unlocked");

        // Another app id sharing the key is still refused.
        let other = encrypted_frame(
            &key,
            "y",
            json!({"command": "biometricUnlock", "userId": "user-1"}),
        );
        let out = serde_json::to_value(broker.handle_frame(&other).await).unwrap();
        assert_eq!(out["command"], "invalidateEncryption");
    }

    #[tokio::test]
    async fn foreign_encryption_type_is_error() {
        let mut broker = broker(true, seeded_store());
        let key = broker.session().transport_key().clone();
        let ct = symmetric_encrypt(&key, br#"{"command":"biometricUnlock","userId":"user-1"}"#).unwrap();
        let mut message = EncryptedMessage::from_ciphertext(&ct);
        message.encryption_type = Some(0);
        let frame = json!({"appID": "x", "message": message}).to_string();
        let out = serde_json::to_value(broker.handle_frame(frame.as_bytes()).await).unwrap();
        assert_eq!(out["command"], "error");
        assert_eq!(out["appID"], "x");
        assert!(out["error"].as_str().unwrap().contains("unsupported encryption type 0"));
    }

    #[tokio::test]
    async fn long_unknown_command_is_clipped() {
        let mut broker = broker(true, seeded_store());
        let frame = json!({"appID": "x", "message": {"command": "A".repeat(10_000)}}).to_string();
        let out = serde_json::to_value(broker.handle_frame(frame.as_bytes()).await).unwrap();
        assert_eq!(out["command"].as_str().unwrap().len(), crate::protocol::MAX_ECHO_LEN);
        assert_eq!(out["error"], "unknown command");
    }

    #[tokio::test]
    async fn strict_binding_requires_handshake() {
        let mut broker = broker(true, seeded_store()).with_strict_app_binding(true);
        let key = broker.session().transport_key().clone();
        let frame = encrypted_frame(
            &key,
            "x",
            json!({"command": "biometricUnlock", "userId": "user-1"}),
        );
        let out = serde_json::to_value(broker.handle_frame(&frame).await).unwrap();
        assert_eq!(out["command"], "invalidateEncryption");
    }
}
