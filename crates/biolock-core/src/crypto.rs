//! Channel cryptography.
//!
//! - Transport key: 64 random bytes, `enc_key (32) || mac_key (32)`.
//! - Key wrap: RSA-OAEP/SHA-1 under the extension's public key.
//! - Payloads: AES-256-CBC/PKCS#7, then HMAC-SHA256 over `iv || data`.
//!
//! Text form of a payload ciphertext (encryption type 2):
//! ```text
//! 2.<b64 iv>|<b64 data>|<b64 mac>
//! ```

use aes::Aes256;
use base64::{engine::general_purpose, Engine as _};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const TRANSPORT_KEY_LEN: usize = 64;
pub const IV_LEN: usize = 16;
pub const MAC_LEN: usize = 32;
pub const MIN_RSA_BITS: usize = 2048;

/// AES-256-CBC with HMAC-SHA256, base64 parts.
pub const ENC_TYPE_AES_CBC_HMAC: u8 = 2;

/// Process-lifetime symmetric key. Wiped when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TransportKey {
    bytes: [u8; TRANSPORT_KEY_LEN],
}

impl TransportKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TRANSPORT_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; TRANSPORT_KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn enc_key(&self) -> &[u8] {
        &self.bytes[..32]
    }

    fn mac_key(&self) -> &[u8] {
        &self.bytes[32..]
    }
}

impl std::fmt::Debug for TransportKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransportKey(<redacted>)")
    }
}

/// Parse an extension public key. SubjectPublicKeyInfo DER is what browsers
/// export; bare PKCS#1 is accepted as well.
pub fn parse_public_key(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    let key = RsaPublicKey::from_public_key_der(der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let bits = key.size() * 8;
    if bits < MIN_RSA_BITS {
        return Err(CryptoError::WeakPublicKey {
            bits,
            min: MIN_RSA_BITS,
        });
    }
    Ok(key)
}

/// Encrypt `plaintext` under a DER-encoded RSA public key with OAEP padding.
pub fn asymmetric_wrap(public_key_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = parse_public_key(public_key_der)?;
    key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), plaintext)
        .map_err(|e| CryptoError::Wrap(e.to_string()))
}

#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricCiphertext {
    pub iv: [u8; IV_LEN],
    pub data: Vec<u8>,
    pub mac: [u8; MAC_LEN],
}

impl SymmetricCiphertext {
    /// Build from the base64 fields carried in a wire message.
    pub fn from_b64_parts(iv: &str, data: &str, mac: &str) -> Result<Self, CryptoError> {
        let iv = decode_fixed::<IV_LEN>(iv, "iv")?;
        let data = general_purpose::STANDARD.decode(data)?;
        let mac = decode_fixed::<MAC_LEN>(mac, "mac")?;
        Ok(Self { iv, data, mac })
    }

    pub fn parse_enc_string(s: &str) -> Result<Self, CryptoError> {
        let (kind, rest) = s
            .split_once('.')
            .ok_or_else(|| CryptoError::Malformed("missing encryption type".into()))?;
        let kind: u8 = kind
            .parse()
            .map_err(|_| CryptoError::Malformed(format!("bad encryption type {kind:?}")))?;
        if kind != ENC_TYPE_AES_CBC_HMAC {
            return Err(CryptoError::UnsupportedEncryptionType(kind));
        }
        let mut parts = rest.split('|');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(iv), Some(data), Some(mac), None) => Self::from_b64_parts(iv, data, mac),
            _ => Err(CryptoError::Malformed("expected iv|data|mac".into())),
        }
    }

    pub fn iv_b64(&self) -> String {
        general_purpose::STANDARD.encode(self.iv)
    }

    pub fn data_b64(&self) -> String {
        general_purpose::STANDARD.encode(&self.data)
    }

    pub fn mac_b64(&self) -> String {
        general_purpose::STANDARD.encode(self.mac)
    }

    pub fn to_enc_string(&self) -> String {
        format!(
            "{}.{}|{}|{}",
            ENC_TYPE_AES_CBC_HMAC,
            self.iv_b64(),
            self.data_b64(),
            self.mac_b64()
        )
    }
}

impl std::fmt::Debug for SymmetricCiphertext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricCiphertext")
            .field("data_len", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// Encrypt with a fresh random IV. Every call draws a new IV.
pub fn symmetric_encrypt(
    key: &TransportKey,
    plaintext: &[u8],
) -> Result<SymmetricCiphertext, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let data = Aes256CbcEnc::new_from_slices(key.enc_key(), &iv)
        .map_err(|_| CryptoError::Malformed("cipher key length".into()))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mac = compute_mac(key, &iv, &data)?;
    Ok(SymmetricCiphertext { iv, data, mac })
}

/// Verify the MAC, then decrypt. A ciphertext made under any other key fails
/// with `CryptoError::Authentication` before the cipher is touched.
pub fn symmetric_decrypt(
    key: &TransportKey,
    ciphertext: &SymmetricCiphertext,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key.mac_key())
        .map_err(|_| CryptoError::Authentication)?;
    mac.update(&ciphertext.iv);
    mac.update(&ciphertext.data);
    mac.verify_slice(&ciphertext.mac)
        .map_err(|_| CryptoError::Authentication)?;

    let plaintext = Aes256CbcDec::new_from_slices(key.enc_key(), &ciphertext.iv)
        .map_err(|_| CryptoError::Decrypt)?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext.data)
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(Zeroizing::new(plaintext))
}

fn compute_mac(key: &TransportKey, iv: &[u8], data: &[u8]) -> Result<[u8; MAC_LEN], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key.mac_key())
        .map_err(|_| CryptoError::Authentication)?;
    mac.update(iv);
    mac.update(data);
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn decode_fixed<const N: usize>(b64: &str, field: &str) -> Result<[u8; N], CryptoError> {
    let raw = general_purpose::STANDARD.decode(b64)?;
    raw.try_into().map_err(|raw: Vec<u8>| {
        CryptoError::Malformed(format!("{field} must be {N} bytes, got {}", raw.len()))
    })
}
