use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroize;

use crate::crypto::{SymmetricCiphertext, ENC_TYPE_AES_CBC_HMAC};
use crate::error::{CryptoError, ProtocolError};

pub const CMD_CONNECTED: &str = "connected";
pub const CMD_SETUP_ENCRYPTION: &str = "setupEncryption";
pub const CMD_BIOMETRIC_UNLOCK: &str = "biometricUnlock";
pub const CMD_INVALIDATE_ENCRYPTION: &str = "invalidateEncryption";
pub const CMD_ERROR: &str = "error";

/// Longest `appID` accepted on an inbound envelope.
pub const MAX_APP_ID_LEN: usize = 256;

/// Client-supplied strings copied into plaintext replies are cut to this.
pub const MAX_ECHO_LEN: usize = 128;

/// Outer shape of every frame the extension sends.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "appID", alias = "appId")]
    pub app_id: String,
    pub message: Value,
}

#[derive(Debug, Clone)]
pub enum InboundMessage {
    Plaintext(PlaintextMessage),
    Ciphertext(EncryptedMessage),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaintextMessage {
    pub command: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Encrypted `message` body. Senders may provide the split fields, the
/// combined `encryptedString`, or both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl EncryptedMessage {
    pub fn from_ciphertext(ct: &SymmetricCiphertext) -> Self {
        Self {
            encryption_type: Some(ENC_TYPE_AES_CBC_HMAC),
            encrypted_string: Some(ct.to_enc_string()),
            iv: Some(ct.iv_b64()),
            data: Some(ct.data_b64()),
            mac: Some(ct.mac_b64()),
        }
    }

    pub fn to_ciphertext(&self) -> Result<SymmetricCiphertext, CryptoError> {
        if let Some(kind) = self.encryption_type {
            if kind != ENC_TYPE_AES_CBC_HMAC {
                return Err(CryptoError::UnsupportedEncryptionType(kind));
            }
        }
        match (&self.iv, &self.data, &self.mac, &self.encrypted_string) {
            (Some(iv), Some(data), Some(mac), _) => {
                SymmetricCiphertext::from_b64_parts(iv, data, mac)
            }
            (_, _, _, Some(enc)) => SymmetricCiphertext::parse_enc_string(enc),
            (Some(_), Some(_), None, None) => {
                Err(CryptoError::Malformed("missing mac".into()))
            }
            _ => Err(CryptoError::Malformed("missing iv or data".into())),
        }
    }
}

pub fn parse_envelope(frame: &[u8]) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Best-effort recovery of `appID` from a frame that failed envelope parsing,
/// so the error reply can still be addressed.
pub fn sniff_app_id(frame: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(frame).ok()?;
    value
        .get("appID")
        .or_else(|| value.get("appId"))
        .and_then(Value::as_str)
        .map(clip_echo)
}

/// Truncate `s` to at most `MAX_ECHO_LEN` bytes on a char boundary.
pub fn clip_echo(s: &str) -> String {
    if s.len() <= MAX_ECHO_LEN {
        return s.to_owned();
    }
    let mut end = MAX_ECHO_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

impl Envelope {
    /// A `message` that is an object holding a `command` key is plaintext;
    /// anything else must decode as an encrypted body.
    pub fn classify(self) -> Result<(String, InboundMessage), ProtocolError> {
        if self.app_id.len() > MAX_APP_ID_LEN {
            return Err(ProtocolError::Malformed(format!(
                "appID longer than {MAX_APP_ID_LEN} bytes"
            )));
        }
        let is_plaintext = self
            .message
            .as_object()
            .is_some_and(|m| m.contains_key("command"));
        let inbound = if is_plaintext {
            InboundMessage::Plaintext(serde_json::from_value(self.message)?)
        } else {
            InboundMessage::Ciphertext(serde_json::from_value(self.message)?)
        };
        Ok((self.app_id, inbound))
    }
}

/// Decrypted request body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadRequest {
    pub command: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub timestamp: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[serde(rename = "unlocked")]
    Unlocked,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "not enabled")]
    NotEnabled,
    #[serde(rename = "not available")]
    NotAvailable,
    #[serde(rename = "invalid request")]
    InvalidRequest,
    #[serde(rename = "unsupported command")]
    UnsupportedCommand,
}

/// Plaintext of an encrypted reply. The key is wiped when the value drops.
#[derive(Serialize)]
pub struct PayloadResponse {
    pub command: String,
    pub response: ResponseStatus,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub timestamp: Value,
    #[serde(rename = "keyB64", skip_serializing_if = "Option::is_none")]
    pub key_b64: Option<String>,
}

impl PayloadResponse {
    pub fn new(command: impl Into<String>, response: ResponseStatus, timestamp: Value) -> Self {
        Self {
            command: command.into(),
            response,
            timestamp,
            key_b64: None,
        }
    }

    pub fn unlocked(timestamp: Value, key_b64: String) -> Self {
        Self {
            command: CMD_BIOMETRIC_UNLOCK.to_string(),
            response: ResponseStatus::Unlocked,
            timestamp,
            key_b64: Some(key_b64),
        }
    }
}

impl Drop for PayloadResponse {
    fn drop(&mut self) {
        if let Some(key) = self.key_b64.as_mut() {
            key.zeroize();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub command: String,
    #[serde(rename = "appID", skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HandshakeResponse {
    pub command: String,
    #[serde(rename = "appID")]
    pub app_id: String,
    #[serde(rename = "sharedSecret")]
    pub shared_secret: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EncryptedEnvelope {
    #[serde(rename = "appID")]
    pub app_id: String,
    pub message: EncryptedMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Notice(Notice),
    Handshake(HandshakeResponse),
    Encrypted(EncryptedEnvelope),
}

impl OutboundMessage {
    pub fn connected(app_id: &str) -> Self {
        OutboundMessage::Notice(Notice {
            command: CMD_CONNECTED.to_string(),
            app_id: Some(app_id.to_string()),
            error: None,
        })
    }

    /// Error notice. Parser messages can quote client input, so the text is
    /// clipped like any other echo.
    pub fn error(command: &str, app_id: Option<String>, err: impl ToString) -> Self {
        OutboundMessage::Notice(Notice {
            command: clip_echo(command),
            app_id,
            error: Some(clip_echo(&err.to_string())),
        })
    }

    pub fn invalidate_encryption(app_id: String) -> Self {
        OutboundMessage::Notice(Notice {
            command: CMD_INVALIDATE_ENCRYPTION.to_string(),
            app_id: Some(app_id),
            error: None,
        })
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            OutboundMessage::Notice(n) => Some(&n.command),
            OutboundMessage::Handshake(h) => Some(&h.command),
            OutboundMessage::Encrypted(_) => None,
        }
    }
}
