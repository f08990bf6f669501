//! Native-messaging unlock broker.
//!
//! A browser extension talks to this host over length-prefixed JSON frames.
//! The host wraps a per-process transport key for the extension, then
//! releases a cached vault key only after a biometric check passes.

pub mod biometrics;
pub mod crypto;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod frame;
pub mod paths;
pub mod protocol;
pub mod secret_store;
pub mod session;
pub mod settings;

pub use dispatcher::Broker;
pub use error::{CryptoError, ProtocolError, SecretStoreError, SettingsError, TransportError};
pub use session::Session;
pub use settings::HostSettings;
