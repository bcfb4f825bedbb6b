//! Deep-link launch of the peer application.

/// Opens the approving application out of band.
///
/// Injected into the bridge so that platform-specific launch mechanics
/// (URL schemes, intents) stay out of the protocol code. The launch is
/// fire and forget; failures are the launcher's problem.
pub trait AppLauncher: Send + Sync {
    /// Launch the peer application with the given pairing string.
    fn launch(&self, pairing_uri: &str);
}
