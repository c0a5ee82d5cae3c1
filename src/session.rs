//! Established-session state.
//!
//! Once a handshake completes, the negotiated secrets and the peer's identity
//! live in a [`SessionContext`]. The context drives two features:
//!
//! * Abbreviated handshakes. A serialized context handed back to
//!   [`Client::with_session`][crate::Client::with_session] or
//!   [`Server::with_session`][crate::Server::with_session] lets the peers skip
//!   key exchange entirely when the server still recognizes the session id.
//! * Security context identifiers, a stable 16-byte value both sides derive
//!   from the master secret for keying layers above the connection.

use std::fmt;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u24, be_u8};
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::Error;
use crate::message::SessionId;
use crate::suite::CipherSuite;

const EXPORT_MAGIC: u8 = 0x53;
const EXPORT_VERSION: u8 = 1;

const FLAG_EXTENDED_MASTER_SECRET: u8 = 0x01;

const IDENTITY_NONE: u8 = 0;
const IDENTITY_CERTIFICATE: u8 = 1;
const IDENTITY_PSK: u8 = 2;

/// What we learned about the peer during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// The peer presented a certificate and proved possession of its key.
    Certificate {
        /// Leaf certificate in DER format.
        der: Vec<u8>,
        /// SHA-256 over the DER encoding.
        fingerprint: [u8; 32],
    },
    /// The peer authenticated with a pre-shared key under this identity.
    PskIdentity(Vec<u8>),
    /// No peer credential was exchanged. This is the server side of a
    /// certificate handshake that did not request client authentication.
    Unauthenticated,
}

impl PeerIdentity {
    pub(crate) fn from_certificate(der: &[u8]) -> PeerIdentity {
        PeerIdentity::Certificate {
            der: der.to_vec(),
            fingerprint: crate::certificate::fingerprint(der),
        }
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerIdentity::Certificate { der, fingerprint } => f
                .debug_struct("Certificate")
                .field("der", &der.len())
                .field("fingerprint", &hex(&fingerprint[..8]))
                .finish(),
            PeerIdentity::PskIdentity(identity) => f
                .debug_tuple("PskIdentity")
                .field(&String::from_utf8_lossy(identity))
                .finish(),
            PeerIdentity::Unauthenticated => write!(f, "Unauthenticated"),
        }
    }
}

/// Stable identifier for the keys protecting one epoch of one session.
///
/// Both sides derive the same value without exchanging it. Protocols layered
/// on top can use it to name their security association.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecurityContextId([u8; 16]);

impl SecurityContextId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for SecurityContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityContextId({})", hex(&self.0))
    }
}

/// Negotiated state of one established connection.
///
/// Obtained from [`Client::session`][crate::Client::session] or
/// [`Server::session`][crate::Server::session] once the handshake is done.
/// [`export`][SessionContext::export] turns it into bytes the embedder can
/// persist across restarts. The export holds the master secret in the clear,
/// so it must be stored with the same care as a private key.
#[derive(Clone)]
pub struct SessionContext {
    suite: CipherSuite,
    session_id: SessionId,
    master_secret: Zeroizing<[u8; 48]>,
    extended_master_secret: bool,
    peer_identity: PeerIdentity,
    client_random: [u8; 32],
    server_random: [u8; 32],
}

impl SessionContext {
    pub(crate) fn new(
        suite: CipherSuite,
        session_id: SessionId,
        master_secret: &[u8],
        extended_master_secret: bool,
        peer_identity: PeerIdentity,
        client_random: [u8; 32],
        server_random: [u8; 32],
    ) -> SessionContext {
        let mut secret = Zeroizing::new([0_u8; 48]);
        secret.copy_from_slice(master_secret);
        SessionContext {
            suite,
            session_id,
            master_secret: secret,
            extended_master_secret,
            peer_identity,
            client_random,
            server_random,
        }
    }

    /// The cipher suite the session was negotiated under. A resumed
    /// connection keeps using it.
    pub fn cipher_suite(&self) -> CipherSuite {
        self.suite
    }

    /// The id the server assigned. Empty when the server declined to make
    /// the session resumable.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Whether the master secret was bound to the handshake transcript
    /// (RFC 7627).
    pub fn extended_master_secret(&self) -> bool {
        self.extended_master_secret
    }

    pub fn peer_identity(&self) -> &PeerIdentity {
        &self.peer_identity
    }

    pub(crate) fn master_secret(&self) -> &[u8; 48] {
        &self.master_secret
    }

    pub(crate) fn set_randoms(&mut self, client_random: [u8; 32], server_random: [u8; 32]) {
        self.client_random = client_random;
        self.server_random = server_random;
    }

    /// Derive the security context identifier for the given epoch.
    ///
    /// The value changes with every epoch and with every (re)handshake since
    /// it mixes in both hello randoms.
    pub fn security_context_id(&self, epoch: u16) -> Result<SecurityContextId, Error> {
        let id = crypto::security_context_id(
            &self.master_secret[..],
            &self.client_random,
            &self.server_random,
            epoch,
            self.suite.hash_algorithm(),
        )?;
        Ok(SecurityContextId(id))
    }

    /// Serialize for persistence.
    ///
    /// The hello randoms are deliberately not included. They belong to the
    /// connection, not the session, and a resumed handshake replaces them.
    pub fn export(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.push(EXPORT_MAGIC);
        out.push(EXPORT_VERSION);
        out.extend_from_slice(&self.suite.as_u16().to_be_bytes());
        out.push(self.session_id.len() as u8);
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(&self.master_secret[..]);

        let mut flags = 0;
        if self.extended_master_secret {
            flags |= FLAG_EXTENDED_MASTER_SECRET;
        }
        out.push(flags);

        match &self.peer_identity {
            PeerIdentity::Unauthenticated => {
                out.push(IDENTITY_NONE);
            }
            PeerIdentity::Certificate { der, fingerprint } => {
                out.push(IDENTITY_CERTIFICATE);
                let len = der.len() as u32;
                out.extend_from_slice(&len.to_be_bytes()[1..]);
                out.extend_from_slice(der);
                out.extend_from_slice(fingerprint);
            }
            PeerIdentity::PskIdentity(identity) => {
                out.push(IDENTITY_PSK);
                out.extend_from_slice(&(identity.len() as u16).to_be_bytes());
                out.extend_from_slice(identity);
            }
        }

        out
    }

    /// Deserialize a previously exported session.
    pub fn import(data: &[u8]) -> Result<SessionContext, Error> {
        let (rest, context) = parse_export(data)?;
        if !rest.is_empty() {
            return Err(Error::ParseError(format!(
                "{} trailing bytes after session export",
                rest.len()
            )));
        }
        Ok(context)
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("suite", &self.suite)
            .field("session_id", &self.session_id)
            .field("extended_master_secret", &self.extended_master_secret)
            .field("peer_identity", &self.peer_identity)
            .finish()
    }
}

fn parse_export(input: &[u8]) -> Result<(&[u8], SessionContext), Error> {
    let (input, magic) = be_u8(input)?;
    if magic != EXPORT_MAGIC {
        return Err(Error::ParseError("not a session export".to_string()));
    }
    let (input, version) = be_u8(input)?;
    if version != EXPORT_VERSION {
        return Err(Error::ParseError(format!(
            "unsupported session export version {}",
            version
        )));
    }

    let (input, suite) = be_u16(input)?;
    let suite = CipherSuite::from_u16(suite);
    if !suite.is_known() {
        return Err(Error::ParseError(format!(
            "session export names unknown cipher suite 0x{:04x}",
            suite.as_u16()
        )));
    }

    let (input, id_len) = be_u8(input)?;
    let (input, id_bytes) = take(id_len as usize)(input)?;
    let session_id =
        SessionId::try_new(id_bytes).map_err(|e| Error::ParseError(e.to_string()))?;

    let (input, master_secret) = take(48_usize)(input)?;
    let (input, flags) = be_u8(input)?;
    let extended_master_secret = flags & FLAG_EXTENDED_MASTER_SECRET != 0;

    let (input, identity_tag) = be_u8(input)?;
    let (input, peer_identity) = match identity_tag {
        IDENTITY_NONE => (input, PeerIdentity::Unauthenticated),
        IDENTITY_CERTIFICATE => {
            let (input, der_len) = be_u24(input)?;
            let (input, der) = take(der_len as usize)(input)?;
            let (input, fingerprint_bytes) = take(32_usize)(input)?;
            let mut fingerprint = [0_u8; 32];
            fingerprint.copy_from_slice(fingerprint_bytes);
            (
                input,
                PeerIdentity::Certificate {
                    der: der.to_vec(),
                    fingerprint,
                },
            )
        }
        IDENTITY_PSK => {
            let (input, id_len) = be_u16(input)?;
            let (input, identity) = take(id_len as usize)(input)?;
            (input, PeerIdentity::PskIdentity(identity.to_vec()))
        }
        other => {
            return Err(Error::ParseError(format!(
                "unknown peer identity tag {} in session export",
                other
            )))
        }
    };

    // Randoms are connection state. An imported session gets fresh ones
    // from the abbreviated handshake before they are ever used.
    Ok((
        input,
        SessionContext::new(
            suite,
            session_id,
            master_secret,
            extended_master_secret,
            peer_identity,
            [0; 32],
            [0; 32],
        ),
    ))
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}
