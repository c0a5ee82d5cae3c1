#![forbid(unsafe_code)]
#![warn(clippy::all)]
//! Sans-I/O DTLS 1.2 engine for datagram transports.
//!
//! The crate drives one secured connection per [`Client`] or [`Server`]
//! value. It owns no sockets, threads or clocks: the embedder feeds inbound
//! datagrams via `handle_packet`, delivers timer expiry via `handle_timeout`
//! and drains work via `poll_output`. Everything in between (cookie
//! exchange, key exchange, certificate negotiation, retransmission, record
//! protection) happens inside the state machines.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Instant;
//! use scrim::{Client, Config, Output};
//!
//! let config = Arc::new(Config::default());
//! let cert = scrim::generate_self_signed_certificate().unwrap();
//! let mut client = Client::new(config, cert);
//!
//! let mut buf = vec![0; 2048];
//! loop {
//!     match client.poll_output(&mut buf, Instant::now()) {
//!         Output::Packet(p) => { /* send p on the socket */ }
//!         Output::ApplicationData(d) => { /* deliver d upwards */ }
//!         Output::Connected => { /* handshake done */ }
//!         Output::Timeout(at) => break, // call handle_timeout(at) later
//!     }
//! }
//! ```

#[macro_use]
extern crate log;

mod buffer;
mod certificate;
mod client;
mod config;
mod crypto;
mod engine;
mod error;
mod message;
mod psk;
mod rng;
mod server;
mod session;
mod state;
mod suite;
mod timer;
mod util;
mod window;

use std::time::Instant;

pub use certificate::{generate_self_signed_certificate, EndpointCertificate};
pub use client::Client;
pub use config::{ClientAuth, Config, ConfigBuilder};
pub use crypto::CertVerifier;
pub use error::{Error, RecordFault};
pub use message::{HashAlgorithm, SignatureAlgorithm, SignatureAndHashAlgorithm};
pub use psk::{PskStore, StaticPskStore};
pub use server::Server;
pub use session::{PeerIdentity, SecurityContextId, SessionContext};
pub use state::HandshakeState;
pub use suite::{CipherSuite, KeyExchangeKind, NamedGroup};

pub(crate) use rng::SeededRng;

/// Output from `poll_output`.
///
/// The variants are drained in priority order: decrypted application data
/// first, then datagrams to transmit, then the next timeout to schedule.
#[derive(Debug, PartialEq, Eq)]
pub enum Output<'a> {
    /// A datagram to send to the remote peer.
    Packet(&'a [u8]),
    /// Decrypted application data released after the handshake completed.
    ApplicationData(&'a [u8]),
    /// The handshake completed. Emitted exactly once.
    Connected,
    /// Nothing to do until this instant (or until a packet arrives).
    Timeout(Instant),
}
