//! Application metadata exchanged during the handshake.

use serde::{Deserialize, Serialize};

/// Identity card an application presents to its peer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PeerMeta {
    /// Human-readable application name.
    pub name: String,
    /// Short description shown in approval UIs.
    pub description: String,
    /// Application home URL.
    pub url: String,
    /// Icon URLs, largest first.
    #[serde(default)]
    pub icons: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_roundtrip() {
        let meta = PeerMeta {
            name: "Example Wallet".into(),
            description: "Approves requests".into(),
            url: "https://wallet.example".into(),
            icons: vec!["https://wallet.example/icon.png".into()],
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: PeerMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn icons_default_to_empty() {
        let raw = r#"{"name":"n","description":"d","url":"u"}"#;
        let meta: PeerMeta = serde_json::from_str(raw).unwrap();
        assert!(meta.icons.is_empty());
    }
}
