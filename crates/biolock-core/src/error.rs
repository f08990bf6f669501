use thiserror::Error;

/// Failures on the native-messaging pipe. These are fatal: once the stream
/// is desynchronised there is no way to find the next frame boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("stream closed after {read} of {expected} bytes")]
    Truncated { expected: usize, read: usize },

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("i/o error on native messaging pipe: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("public key too small: {bits} bits, need at least {min}")]
    WeakPublicKey { bits: usize, min: usize },

    #[error("key wrap failed: {0}")]
    Wrap(String),

    #[error("unsupported encryption type {0}")]
    UnsupportedEncryptionType(u8),

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("message authentication failed")]
    Authentication,

    #[error("decryption failed")]
    Decrypt,

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown command")]
    UnknownCommand,

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("no secret stored for user {0}")]
    NotFound(String),

    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot determine configuration directory")]
    NoConfigDir,

    #[error("read settings {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse settings {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setting: {0}")]
    Invalid(String),
}
