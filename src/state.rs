use std::fmt;

/// Connection progress shared by both roles.
///
/// Client and server walk the same states with mirrored triggers: what one
/// side enters on send, the other enters on receipt. `Aborted` is terminal
/// and reachable from every other state on a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing exchanged yet. The cookie exchange happens without leaving
    /// this state and allocates no session material.
    Start,
    /// ClientHello/ServerHello agreed on version, suite and randoms.
    HelloExchanged,
    /// The server's key exchange flight (certificate, key share, optional
    /// certificate request) is in transit.
    KeyExchangePending,
    /// Both key halves are known; the premaster secret can be derived.
    KeyExchangeComplete,
    /// A client certificate was presented and its CertificateVerify
    /// signature is still outstanding.
    CertificateVerifyPending,
    /// ChangeCipherSpec seen or sent; waiting for the peer's Finished.
    FinishedPending,
    /// Handshake done. The session context is frozen from here on.
    Established,
    /// Fatal error or exhausted retransmission budget. Terminal.
    Aborted,
}

impl HandshakeState {
    pub fn is_established(&self) -> bool {
        *self == HandshakeState::Established
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Established | HandshakeState::Aborted)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
