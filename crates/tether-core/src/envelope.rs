//! Authenticated encryption of data-plane payloads.
//!
//! Wire format: AES-256-CBC with PKCS#7 padding, authenticated by
//! HMAC-SHA256 over ciphertext ‖ iv. All three fields travel hex-encoded
//! inside a JSON object. Cipher and MAC both key off the same 32-byte
//! pairing secret.

use std::fmt;

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Length of the pairing secret in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the CBC initialization vector in bytes.
pub const IV_LEN: usize = 16;

/// Errors from sealing or opening an [`Envelope`].
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// A hex field failed to decode.
    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Key material was not exactly 32 bytes.
    #[error("pairing key must be {KEY_LEN} bytes, got {len}")]
    BadKey {
        /// Actual decoded length.
        len: usize,
    },

    /// The iv field was not exactly 16 bytes.
    #[error("iv must be {IV_LEN} bytes, got {len}")]
    BadIv {
        /// Actual decoded length.
        len: usize,
    },

    /// MAC verification failed; the envelope was not decrypted.
    #[error("hmac verification failed")]
    Auth,

    /// Decryption produced invalid PKCS#7 padding.
    #[error("invalid padding")]
    Padding,
}

/// The 32-byte shared pairing secret.
///
/// Immutable once constructed; set exactly once per pairing.
#[derive(Clone, PartialEq, Eq)]
pub struct PairingKey([u8; KEY_LEN]);

impl PairingKey {
    /// Generate a fresh key from the process CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode a key from its hex wire form.
    pub fn from_hex(hex_str: &str) -> Result<Self, EnvelopeError> {
        let raw = hex::decode(hex_str)?;
        let bytes: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|raw: Vec<u8>| EnvelopeError::BadKey { len: raw.len() })?;
        Ok(Self(bytes))
    }

    /// Hex wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for PairingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material.
        f.write_str("PairingKey(..)")
    }
}

/// Authenticated-encrypted wire form of a data-plane message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Hex-encoded 16-byte CBC iv.
    pub iv: String,
    /// Hex-encoded ciphertext.
    pub data: String,
    /// Hex-encoded HMAC-SHA256 over ciphertext ‖ iv.
    pub hmac: String,
}

/// HMAC accepts keys of any length, so construction cannot fail here.
fn keyed_mac(key: &PairingKey) -> HmacSha256 {
    HmacSha256::new_from_slice(key.as_bytes()).expect("32-byte hmac key")
}

/// Encrypt and authenticate `plaintext` under `key`.
pub fn seal(plaintext: &[u8], key: &PairingKey) -> Envelope {
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    seal_with_iv(plaintext, key, iv)
}

/// Seal with a caller-provided iv. Exposed for deterministic tests only;
/// production paths go through [`seal`].
fn seal_with_iv(plaintext: &[u8], key: &PairingKey, iv: [u8; IV_LEN]) -> Envelope {
    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    // MAC input order is ciphertext then iv; peers reject anything else.
    let mut mac = keyed_mac(key);
    mac.update(&ciphertext);
    mac.update(&iv);
    let tag = mac.finalize().into_bytes();

    Envelope {
        iv: hex::encode(iv),
        data: hex::encode(&ciphertext),
        hmac: hex::encode(tag),
    }
}

/// Verify and decrypt an envelope.
///
/// The MAC is checked over ciphertext ‖ iv before any decryption is
/// attempted; a mismatch fails closed with [`EnvelopeError::Auth`].
pub fn open(envelope: &Envelope, key: &PairingKey) -> Result<Vec<u8>, EnvelopeError> {
    let iv_raw = hex::decode(&envelope.iv)?;
    let iv: [u8; IV_LEN] = iv_raw
        .try_into()
        .map_err(|raw: Vec<u8>| EnvelopeError::BadIv { len: raw.len() })?;
    let ciphertext = hex::decode(&envelope.data)?;
    let tag = hex::decode(&envelope.hmac)?;

    let mut mac = keyed_mac(key);
    mac.update(&ciphertext);
    mac.update(&iv);
    mac.verify_slice(&tag).map_err(|_| EnvelopeError::Auth)?;

    Aes256CbcDec::new(key.as_bytes().into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| EnvelopeError::Padding)
}
