//! The out-of-band pairing string.
//!
//! `wc:<handshakeId>@<version>?bridge=<urlencoded relay address>&key=<hex key>`
//!
//! The requesting application displays or deep-links this string; the
//! approving application decodes it to learn the handshake topic, the relay
//! address, and the shared pairing secret.

use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::envelope::{EnvelopeError, PairingKey};

/// Characters escaped the way `encodeURIComponent` escapes them, so wire
/// strings match peers produced by other stacks byte for byte.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Errors from parsing a pairing string.
#[derive(Debug, thiserror::Error)]
pub enum PairingUriError {
    /// The string does not start with `wc:`.
    #[error("pairing string must start with 'wc:'")]
    BadScheme,

    /// The `<handshakeId>@<version>` head is malformed.
    #[error("malformed pairing string head")]
    Malformed,

    /// A required query parameter is absent.
    #[error("pairing string missing '{0}' parameter")]
    MissingParam(&'static str),

    /// The bridge address is not valid percent-encoded UTF-8.
    #[error("bridge address is not valid UTF-8")]
    BadBridge,

    /// The key parameter failed to decode.
    #[error("invalid pairing key: {0}")]
    BadKey(#[from] EnvelopeError),
}

/// Decoded form of the pairing string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingUri {
    /// Topic used during initial pairing, before a peer id is known.
    pub handshake_id: String,
    /// Protocol version tag (currently `"1"`).
    pub version: String,
    /// Relay address, e.g. `ws://relay.example:3000`.
    pub bridge: String,
    /// Shared 32-byte pairing secret.
    pub key: PairingKey,
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wc:{}@{}?bridge={}&key={}",
            self.handshake_id,
            self.version,
            utf8_percent_encode(&self.bridge, COMPONENT),
            self.key.to_hex(),
        )
    }
}

impl FromStr for PairingUri {
    type Err = PairingUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("wc:").ok_or(PairingUriError::BadScheme)?;
        let (handshake_id, tail) = rest.split_once('@').ok_or(PairingUriError::Malformed)?;
        let (version, query) = tail.split_once('?').ok_or(PairingUriError::Malformed)?;
        if handshake_id.is_empty() || version.is_empty() {
            return Err(PairingUriError::Malformed);
        }

        let mut bridge = None;
        let mut key = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("bridge", v)) => {
                    let decoded = percent_decode_str(v)
                        .decode_utf8()
                        .map_err(|_| PairingUriError::BadBridge)?;
                    bridge = Some(decoded.into_owned());
                }
                Some(("key", v)) => key = Some(PairingKey::from_hex(v)?),
                _ => {}
            }
        }

        Ok(Self {
            handshake_id: handshake_id.to_owned(),
            version: version.to_owned(),
            bridge: bridge.ok_or(PairingUriError::MissingParam("bridge"))?,
            key: key.ok_or(PairingUriError::MissingParam("key"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PairingUri {
        PairingUri {
            handshake_id: "8304034072194249".into(),
            version: "1".into(),
            bridge: "ws://relay.example:3000/?env=browser&protocol=wc".into(),
            key: PairingKey::from_bytes([0x42; 32]),
        }
    }

    #[test]
    fn display_parse_roundtrip() {
        let uri = sample();
        let rendered = uri.to_string();
        let back: PairingUri = rendered.parse().unwrap();
        assert_eq!(back, uri);
    }

    #[test]
    fn display_shape() {
        let rendered = sample().to_string();
        assert!(rendered.starts_with("wc:8304034072194249@1?bridge="));
        assert!(rendered.ends_with(&format!("&key={}", "42".repeat(32))));
    }

    #[test]
    fn bridge_query_string_is_escaped() {
        let rendered = sample().to_string();
        // The bridge's own '?' and '&' must not leak into the outer query.
        let query = rendered.split_once('?').unwrap().1;
        assert_eq!(query.matches('&').count(), 1);
        assert!(rendered.contains("ws%3A%2F%2Frelay.example%3A3000%2F%3Fenv%3Dbrowser%26protocol%3Dwc"));
    }

    #[test]
    fn parse_params_in_any_order() {
        let uri = format!(
            "wc:abc@1?key={}&bridge=ws%3A%2F%2Fhost%3A3000",
            "11".repeat(32)
        );
        let parsed: PairingUri = uri.parse().unwrap();
        assert_eq!(parsed.handshake_id, "abc");
        assert_eq!(parsed.bridge, "ws://host:3000");
    }

    #[test]
    fn parse_ignores_unknown_params() {
        let uri = format!(
            "wc:abc@1?bridge=ws%3A%2F%2Fh&extra=zzz&key={}",
            "11".repeat(32)
        );
        assert!(uri.parse::<PairingUri>().is_ok());
    }

    #[test]
    fn rejects_wrong_scheme() {
        assert!(matches!(
            "http:abc@1?bridge=b&key=k".parse::<PairingUri>(),
            Err(PairingUriError::BadScheme)
        ));
    }

    #[test]
    fn rejects_missing_version() {
        assert!(matches!(
            "wc:abc?bridge=b&key=k".parse::<PairingUri>(),
            Err(PairingUriError::Malformed)
        ));
    }

    #[test]
    fn rejects_missing_bridge() {
        let uri = format!("wc:abc@1?key={}", "11".repeat(32));
        assert!(matches!(
            uri.parse::<PairingUri>(),
            Err(PairingUriError::MissingParam("bridge"))
        ));
    }

    #[test]
    fn rejects_missing_key() {
        assert!(matches!(
            "wc:abc@1?bridge=ws%3A%2F%2Fh".parse::<PairingUri>(),
            Err(PairingUriError::MissingParam("key"))
        ));
    }

    #[test]
    fn rejects_short_key() {
        let uri = format!("wc:abc@1?bridge=ws%3A%2F%2Fh&key={}", "11".repeat(8));
        assert!(matches!(
            uri.parse::<PairingUri>(),
            Err(PairingUriError::BadKey(_))
        ));
    }

    #[test]
    fn rejects_empty_handshake_id() {
        let uri = format!("wc:@1?bridge=b&key={}", "11".repeat(32));
        assert!(matches!(
            uri.parse::<PairingUri>(),
            Err(PairingUriError::Malformed)
        ));
    }
}
