use thiserror::Error;

use crate::message::AlertDescription;

/// Fatal errors. Any of these terminates the connection.
///
/// Apart from `Timeout` (retransmission budget exhausted, eligible for a
/// retry from scratch) every variant corresponds to a protocol or crypto
/// failure and maps to the alert description sent to the peer before the
/// state machine moves to `Aborted`. Single bad records never surface here,
/// see [`RecordFault`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Incomplete input")]
    ParseIncomplete,

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Illegal parameter: {0}")]
    IllegalParameter(String),

    #[error("Handshake failure: {0}")]
    HandshakeFailure(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Verification failed: {0}")]
    VerificationFailed(&'static str),

    #[error("Unknown PSK identity")]
    UnknownPskIdentity,

    #[error("Peer sent alert: {0}")]
    PeerAlert(AlertDescription),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Renegotiation attempt")]
    RenegotiationAttempt,

    #[error("Sequence number space exhausted")]
    SequenceExhausted,

    #[error("Receive queue full")]
    ReceiveQueueFull,

    #[error("Transmit queue full")]
    TransmitQueueFull,

    #[error("Timeout: {0}")]
    Timeout(&'static str),
}

impl Error {
    /// The alert to send to the peer for this error, if any.
    ///
    /// `Timeout` and `PeerAlert`/`PeerClosed` send nothing: the former is a
    /// local decision about a peer that is not answering, the latter two are
    /// reactions to an alert already on the wire.
    pub(crate) fn alert_description(&self) -> Option<AlertDescription> {
        let desc = match self {
            Error::ParseError(_) | Error::ParseIncomplete => AlertDescription::DecodeError,
            Error::UnexpectedMessage(_) | Error::RenegotiationAttempt => {
                AlertDescription::UnexpectedMessage
            }
            Error::IllegalParameter(_) => AlertDescription::IllegalParameter,
            Error::HandshakeFailure(_) => AlertDescription::HandshakeFailure,
            Error::SecurityError(_) => AlertDescription::InsufficientSecurity,
            Error::CertificateError(_) => AlertDescription::BadCertificate,
            Error::CryptoError(_) => AlertDescription::InternalError,
            Error::VerificationFailed(_) => AlertDescription::DecryptError,
            Error::UnknownPskIdentity => AlertDescription::UnknownPskIdentity,
            Error::SequenceExhausted
            | Error::ReceiveQueueFull
            | Error::TransmitQueueFull => AlertDescription::InternalError,
            Error::PeerAlert(_) | Error::PeerClosed | Error::Timeout(_) => return None,
        };
        Some(desc)
    }

    /// True for the retry-eligible timeout outcome, as opposed to a
    /// protocol/security abort.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        match err {
            nom::Err::Incomplete(_) => Error::ParseIncomplete,
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                Error::ParseError(format!("{:?}", e.code))
            }
        }
    }
}

/// Faults on a single record.
///
/// These are deliberately not `Error`s: the offending record is logged and
/// dropped, no alert is sent and the connection carries on. A lone
/// corrupted or duplicated datagram must never tear down a session, and
/// answering unauthenticated garbage would hand an attacker an oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecordFault {
    #[error("bad record mac")]
    BadRecordMac,

    #[error("duplicate sequence number")]
    Replayed,

    #[error("sequence number below replay window")]
    TooOld,

    #[error("record for unknown epoch")]
    UnknownEpoch,

    #[error("truncated record")]
    Truncated,

    #[error("record length exceeds maximum")]
    Oversize,
}
