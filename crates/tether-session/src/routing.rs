//! Phase-tagged method routing.
//!
//! Which methods a session accepts depends on where it is in its
//! lifecycle. Routing is a pure function of (phase, method), so there
//! is no registry to mutate and no window where a handler is missing.

/// Method that opens a pairing handshake.
pub const METHOD_SESSION_REQUEST: &str = "wc_sessionRequest";
/// Method that updates or tears down a live session.
pub const METHOD_SESSION_UPDATE: &str = "wc_sessionUpdate";

/// Where the session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, bridge not open yet.
    Idle,
    /// Responder subscribed on the handshake topic, awaiting the
    /// pairing request.
    Subscribed,
    /// Responder received the pairing request, awaiting local approval.
    AwaitingApproval,
    /// Initiator sent the pairing request, awaiting the peer's reply.
    AwaitingPeerReply,
    /// Pairing approved; data-plane traffic flows.
    Active,
    /// Terminal.
    Destroyed,
}

/// Destination for an inbound request or notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodRoute {
    /// Handle as the incoming pairing request.
    SessionRequest,
    /// Handle as a session update (approval change or teardown).
    SessionUpdate,
    /// Surface to the application as a peer request.
    PeerDefault,
    /// Not accepted in this phase.
    NotFound,
}

/// Route a method name for the given phase.
pub fn route(phase: SessionPhase, method: &str) -> MethodRoute {
    match (phase, method) {
        (SessionPhase::Subscribed, METHOD_SESSION_REQUEST) => MethodRoute::SessionRequest,
        // Accepting the pairing request also makes updates routable, so
        // the peer can still cancel while approval is pending.
        (SessionPhase::AwaitingApproval | SessionPhase::Active, METHOD_SESSION_UPDATE) => {
            MethodRoute::SessionUpdate
        }
        (SessionPhase::Active, _) => MethodRoute::PeerDefault,
        _ => MethodRoute::NotFound,
    }
}
