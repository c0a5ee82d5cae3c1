//! Client side of the handshake.
//!
//! [`Client`] drives an [`Engine`] through the client state machine: it
//! sends the initial ClientHello from the constructor, reacts to the
//! server's flights from [`Client::handle_packet`], and hands the
//! embedder datagrams and events through [`Client::poll_output`].

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::buffer::Buf;
use crate::certificate::EndpointCertificate;
use crate::config::Config;
use crate::crypto::{self, EphemeralKey, Iv, KeyBlock, SigningKey};
use crate::engine::{Engine, MAX_FRAGMENT_LEN};
use crate::error::Error;
use crate::message::{
    select_signature_algorithm, Alert, AlertDescription, Asn1Cert, Body, Certificate,
    ClientCertificateType, ClientEcdhKeys, ClientHello, ClientKeyExchange, CompressionMethod,
    ContentType, Cookie, CurveType, DigitallySigned, EcPointFormatsExtension, EcdhParams,
    ExchangeKeys, Extension, ExtensionType, Finished, KeyAlgorithm, MessageType, ProtocolVersion,
    Random, ServerKeyExchangeParams, SessionId, SignatureAlgorithmsExtension,
    SignatureAndHashAlgorithm, SupportedGroupsExtension,
};
use crate::session::{PeerIdentity, SessionContext};
use crate::state::HandshakeState;
use crate::suite::{CipherSuite, KeyExchangeKind};
use crate::Output;

/// A certificate request the server made, reduced to what the reply
/// flight needs.
struct CertificateRequestSummary {
    certificate_types: Vec<ClientCertificateType>,
    algorithms: Vec<SignatureAndHashAlgorithm>,
}

/// Client endpoint of a connection.
///
/// The constructor queues the first ClientHello, so a fresh client
/// already has a datagram to emit from [`Client::poll_output`]. From
/// then on the embedder feeds incoming datagrams to
/// [`Client::handle_packet`] and fires [`Client::handle_timeout`] when
/// the polled [`Output::Timeout`] instant passes.
pub struct Client {
    engine: Engine,
    state: HandshakeState,
    certificate: EndpointCertificate,
    defragment_buffer: Buf,
    alert_sent: bool,

    /// Client random for the whole handshake. A ClientHello repeated in
    /// answer to a HelloVerifyRequest carries the same random.
    hello_random: Random,
    client_random: [u8; 32],
    server_random: [u8; 32],
    cookie: Cookie,

    /// Session we offered for resumption, until the ServerHello settles
    /// whether the server takes it.
    offered_session: Option<SessionContext>,
    resumed: bool,
    read_promoted: bool,

    session_id: SessionId,
    extended_master_secret: bool,

    ephemeral: Option<EphemeralKey>,
    peer_public_key: Option<Vec<u8>>,
    psk_identity_hint: Option<Vec<u8>>,
    psk_identity: Option<Vec<u8>>,
    certificate_request: Option<CertificateRequestSummary>,
    peer_certificate: Option<Vec<u8>>,

    master_secret: Option<Zeroizing<Vec<u8>>>,
    session: Option<SessionContext>,
}

impl Client {
    /// Create a client and queue the initial ClientHello.
    pub fn new(config: Arc<Config>, certificate: EndpointCertificate) -> Client {
        Client::start(config, certificate, None)
    }

    /// Create a client that offers `session` for an abbreviated
    /// handshake. Falls back to a full handshake when the session is
    /// not resumable under the configuration or the server declines.
    pub fn with_session(
        config: Arc<Config>,
        certificate: EndpointCertificate,
        session: SessionContext,
    ) -> Client {
        Client::start(config, certificate, Some(session))
    }

    fn start(
        config: Arc<Config>,
        certificate: EndpointCertificate,
        session: Option<SessionContext>,
    ) -> Client {
        let mut engine = Engine::new(config);
        let hello_random = Random::new(engine.rng());

        let mut client = Client {
            engine,
            state: HandshakeState::Start,
            certificate,
            defragment_buffer: Buf::new(),
            alert_sent: false,
            hello_random,
            client_random: hello_random.to_bytes(),
            server_random: [0; 32],
            cookie: Cookie::empty(),
            offered_session: None,
            resumed: false,
            read_promoted: false,
            session_id: SessionId::empty(),
            extended_master_secret: false,
            ephemeral: None,
            peer_public_key: None,
            psk_identity_hint: None,
            psk_identity: None,
            certificate_request: None,
            peer_certificate: None,
            master_secret: None,
            session: None,
        };

        let offer = session.filter(|s| client.can_offer(s));
        client.offered_session = offer;

        // A fresh engine has an empty queue and full sequence space, so
        // this only fails on a zero-capacity transmit queue.
        if let Err(e) = client.send_client_hello() {
            debug!("Failed to queue initial ClientHello: {}", e);
            client.state = HandshakeState::Aborted;
        }

        client
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The established session, for export and later resumption.
    ///
    /// `None` until the handshake completes.
    pub fn session(&self) -> Option<&SessionContext> {
        if self.state.is_established() {
            self.session.as_ref()
        } else {
            None
        }
    }

    /// Identity the server proved during the handshake.
    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.session().map(|s| s.peer_identity())
    }

    /// Process one incoming datagram.
    ///
    /// An `Err` means the connection is dead: a fatal alert is queued
    /// where the protocol calls for one, and every later call becomes a
    /// no-op. Poll remaining output before dropping the client.
    pub fn handle_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        if self.state == HandshakeState::Aborted {
            debug!("Dropping packet on aborted connection");
            return Ok(());
        }
        if let Err(e) = self.engine.parse_packet(packet) {
            return Err(self.fatal(e));
        }
        if let Err(e) = self.process_input() {
            return Err(self.fatal(e));
        }
        Ok(())
    }

    /// Drive retransmission and handshake deadlines.
    ///
    /// Call when the instant from [`Output::Timeout`] has passed.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        if self.state == HandshakeState::Aborted {
            return Ok(());
        }
        if let Err(e) = self.engine.handle_timeout(now) {
            return Err(self.fatal(e));
        }
        Ok(())
    }

    /// Poll for the next thing to do or emit.
    pub fn poll_output<'a>(&mut self, buffer: &'a mut [u8], now: Instant) -> Output<'a> {
        self.engine.poll_output(buffer, now)
    }

    /// Queue application data for sending.
    ///
    /// Only valid once established. Each call becomes one record, so
    /// `data` must fit a single record.
    pub fn send_application_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.state != HandshakeState::Established {
            return Err(Error::UnexpectedMessage(
                "application data before the handshake completed".into(),
            ));
        }
        if data.len() > MAX_FRAGMENT_LEN {
            return Err(Error::IllegalParameter(format!(
                "application data exceeds the {} byte record limit",
                MAX_FRAGMENT_LEN
            )));
        }
        self.engine
            .create_record(ContentType::ApplicationData, 1, false, |out| {
                out.extend_from_slice(data);
            })
    }

    /// Close the connection, queueing a close_notify for the peer.
    pub fn close(&mut self) {
        if self.state == HandshakeState::Aborted {
            return;
        }
        if !self.alert_sent {
            self.alert_sent = true;
            if let Err(e) = self.engine.send_alert(Alert::close_notify()) {
                debug!("Failed to queue close_notify: {}", e);
            }
        }
        self.state = HandshakeState::Aborted;
        self.engine.flight_stop_resend_timers();
    }

    /// Turn a protocol failure into the terminal state, queueing the
    /// matching fatal alert at most once.
    fn fatal(&mut self, error: Error) -> Error {
        if let Some(description) = error.alert_description() {
            if !self.alert_sent {
                self.alert_sent = true;
                if let Err(e) = self.engine.send_alert(Alert::fatal(description)) {
                    debug!("Failed to queue fatal alert: {}", e);
                }
            }
        }
        debug!("Connection aborted: {}", error);
        self.state = HandshakeState::Aborted;
        self.engine.flight_stop_resend_timers();
        error
    }

    /// Consume queued input until nothing more advances the state
    /// machine.
    fn process_input(&mut self) -> Result<(), Error> {
        loop {
            self.check_incoming_alerts()?;

            if self.state == HandshakeState::Aborted {
                return Ok(());
            }

            let before = self.state;
            self.do_process_input()?;
            if self.state == before {
                return self.check_stray_ccs();
            }
        }
    }

    fn check_incoming_alerts(&mut self) -> Result<(), Error> {
        while let Some(alert) = self.engine.next_alert() {
            if alert.description == AlertDescription::CloseNotify {
                debug!("Peer closed the connection");
                if !self.alert_sent {
                    self.alert_sent = true;
                    if let Err(e) = self.engine.send_alert(Alert::close_notify()) {
                        debug!("Failed to queue close_notify: {}", e);
                    }
                }
                return Err(Error::PeerClosed);
            }
            if alert.is_fatal() {
                return Err(Error::PeerAlert(alert.description));
            }
            debug!("Ignoring warning alert: {:?}", alert.description);
        }
        Ok(())
    }

    /// A ChangeCipherSpec is only welcome right before the peer's
    /// Finished. One still queued after processing settled in any other
    /// state is a protocol violation.
    fn check_stray_ccs(&mut self) -> Result<(), Error> {
        match self.state {
            HandshakeState::FinishedPending | HandshakeState::Established => Ok(()),
            _ => {
                if self.engine.next_ccs()? {
                    return Err(Error::UnexpectedMessage(
                        "ChangeCipherSpec before the exchange of keys".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn do_process_input(&mut self) -> Result<(), Error> {
        match self.state {
            HandshakeState::FinishedPending if !self.read_promoted => {
                // The server's ChangeCipherSpec moves our read side to
                // epoch 1, which releases its buffered Finished.
                if self.engine.next_ccs()? {
                    self.engine.promote_read_epoch()?;
                    self.read_promoted = true;
                }
            }
            HandshakeState::FinishedPending | HandshakeState::Established => {
                // Retransmitted cipher spec changes are stale once the
                // read epoch moved.
                self.engine.drop_pending_ccs();
            }
            // A queued ChangeCipherSpec can sit behind handshake
            // messages from the same datagram. Leave it alone until
            // processing settles; check_stray_ccs rejects leftovers.
            _ => {}
        }

        let Some(msg_type) = self.engine.complete_handshake_type() else {
            return Ok(());
        };

        let mut buffer = mem::take(&mut self.defragment_buffer);
        let result = self.dispatch_handshake(msg_type, &mut buffer);
        self.defragment_buffer = buffer;
        result
    }

    fn dispatch_handshake(&mut self, msg_type: MessageType, buffer: &mut Buf) -> Result<(), Error> {
        match (self.state, msg_type) {
            (HandshakeState::Start, MessageType::HelloVerifyRequest) => {
                self.on_hello_verify_request(buffer)
            }
            (HandshakeState::Start, MessageType::ServerHello) => self.on_server_hello(buffer),
            (HandshakeState::HelloExchanged, MessageType::Certificate) => {
                self.on_server_certificate(buffer)
            }
            (
                HandshakeState::HelloExchanged | HandshakeState::KeyExchangePending,
                MessageType::ServerKeyExchange,
            ) => self.on_server_key_exchange(buffer),
            (HandshakeState::KeyExchangeComplete, MessageType::CertificateRequest) => {
                self.on_certificate_request(buffer)
            }
            (
                HandshakeState::HelloExchanged
                | HandshakeState::KeyExchangeComplete
                | HandshakeState::CertificateVerifyPending,
                MessageType::ServerHelloDone,
            ) => self.on_server_hello_done(buffer),
            (HandshakeState::FinishedPending, MessageType::Finished) => {
                self.on_server_finished(buffer)
            }
            (state, msg_type) => Err(Error::UnexpectedMessage(format!(
                "{:?} in state {}",
                msg_type, state
            ))),
        }
    }

    // ClientHello

    fn can_offer(&self, session: &SessionContext) -> bool {
        let config = self.engine.config();
        if session.session_id().is_empty() {
            debug!("Session has no id, full handshake");
            return false;
        }
        if !config.session_resumption() {
            debug!("Session resumption disabled, full handshake");
            return false;
        }
        let suite = session.cipher_suite();
        if !config.cipher_suites().contains(&suite) {
            debug!("Session suite {:?} not configured, full handshake", suite);
            return false;
        }
        if suite.key_exchange().uses_psk() && config.psk_store().is_none() {
            debug!("Session suite {:?} needs a PSK store, full handshake", suite);
            return false;
        }
        if session.extended_master_secret() && !config.with_extended_master_secret() {
            debug!("Session bound to extended master secret, full handshake");
            return false;
        }
        true
    }

    /// Suites we can actually complete: PSK kinds need a key store.
    fn offered_suites(&self) -> Vec<CipherSuite> {
        let config = self.engine.config();
        config
            .cipher_suites()
            .iter()
            .copied()
            .filter(|suite| suite.is_known())
            .filter(|suite| !suite.key_exchange().uses_psk() || config.psk_store().is_some())
            .collect()
    }

    fn send_client_hello(&mut self) -> Result<(), Error> {
        self.engine.flight_begin();

        let offered = self.offered_suites();
        let session_id = match &self.offered_session {
            Some(session) => session.session_id(),
            None => SessionId::empty(),
        };

        let offer_ephemeral = offered.iter().any(|s| s.key_exchange().uses_ephemeral());
        let offer_signatures = offered
            .iter()
            .any(|s| s.key_exchange().requires_certificate());

        let mut body = Vec::new();
        {
            let config = self.engine.config();

            let mut groups_data = Vec::new();
            let mut formats_data = Vec::new();
            let mut algorithms_data = Vec::new();

            let mut hello = ClientHello::new(self.hello_random, session_id, self.cookie);
            hello.cipher_suites.clear();
            hello.cipher_suites.extend(offered.iter().copied());

            if offer_ephemeral {
                SupportedGroupsExtension::new(config.named_groups()).serialize(&mut groups_data);
                hello
                    .extensions
                    .push(Extension::new(ExtensionType::SupportedGroups, &groups_data));

                EcPointFormatsExtension::uncompressed().serialize(&mut formats_data);
                hello
                    .extensions
                    .push(Extension::new(ExtensionType::EcPointFormats, &formats_data));
            }

            if offer_signatures {
                SignatureAlgorithmsExtension::new(config.signature_algorithms())
                    .serialize(&mut algorithms_data);
                hello.extensions.push(Extension::new(
                    ExtensionType::SignatureAlgorithms,
                    &algorithms_data,
                ));
            }

            if config.with_extended_master_secret() {
                hello
                    .extensions
                    .push(Extension::new(ExtensionType::ExtendedMasterSecret, &[]));
            }

            hello.serialize(&mut body);
        }

        debug!(
            "Sending ClientHello with {} suites, cookie of {} bytes",
            offered.len(),
            self.cookie.len()
        );

        self.send_handshake(MessageType::ClientHello, &body)
    }

    // Server flight 1

    fn on_hello_verify_request(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        if !self.cookie.is_empty() {
            return Err(Error::UnexpectedMessage("second HelloVerifyRequest".into()));
        }

        let cookie = {
            let handshake = self.engine.next_handshake(buffer)?;
            let Body::HelloVerifyRequest(verify) = handshake.body else {
                return Err(Error::UnexpectedMessage(
                    "expected HelloVerifyRequest".into(),
                ));
            };
            if !verify.server_version.is_acceptable() {
                return Err(Error::HandshakeFailure(format!(
                    "bad HelloVerifyRequest version {:?}",
                    verify.server_version
                )));
            }
            verify.cookie
        };

        if cookie.is_empty() {
            return Err(Error::IllegalParameter(
                "empty HelloVerifyRequest cookie".into(),
            ));
        }

        debug!("Repeating hello with a {} byte cookie", cookie.len());

        // The verify request and first hello are dropped from the
        // handshake hashes, the repeated hello starts them over.
        self.engine.reset_client_for_hello_verify_request();
        self.cookie = cookie;
        self.send_client_hello()
    }

    fn on_server_hello(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        let (version, random, session_id, suite, compression, ems) = {
            let handshake = self.engine.next_handshake(buffer)?;
            let Body::ServerHello(hello) = handshake.body else {
                return Err(Error::UnexpectedMessage("expected ServerHello".into()));
            };
            (
                hello.server_version,
                hello.random,
                hello.session_id,
                hello.cipher_suite,
                hello.compression_method,
                hello.confirms_extended_master_secret(),
            )
        };

        if version != ProtocolVersion::DTLS1_2 {
            return Err(Error::HandshakeFailure(format!(
                "server selected version {:?}",
                version
            )));
        }
        if !self.offered_suites().contains(&suite) {
            return Err(Error::IllegalParameter(format!(
                "server selected unoffered suite {:?}",
                suite
            )));
        }
        if compression != CompressionMethod::Null {
            return Err(Error::IllegalParameter(
                "server selected non-null compression".into(),
            ));
        }
        if ems && !self.engine.config().with_extended_master_secret() {
            return Err(Error::IllegalParameter(
                "unsolicited extended master secret extension".into(),
            ));
        }

        debug!("Server selected {:?}", suite);

        self.server_random = random.to_bytes();
        self.session_id = session_id;
        self.extended_master_secret = ems;
        self.engine.set_cipher_suite(suite);

        if let Some(session) = self.offered_session.take() {
            if !session_id.is_empty() && session_id == session.session_id() {
                return self.accept_resumption(session, suite, ems);
            }
            debug!("Server declined session resumption");
        }

        self.state = HandshakeState::HelloExchanged;
        Ok(())
    }

    fn accept_resumption(
        &mut self,
        mut session: SessionContext,
        suite: CipherSuite,
        ems: bool,
    ) -> Result<(), Error> {
        if suite != session.cipher_suite() {
            return Err(Error::IllegalParameter(
                "resumption under a different cipher suite".into(),
            ));
        }
        if session.extended_master_secret() != ems {
            return Err(Error::HandshakeFailure(
                "extended master secret changed on resumption".into(),
            ));
        }

        debug!("Server accepted session resumption");

        let key_block = KeyBlock::derive(
            suite,
            &session.master_secret()[..],
            &self.client_random,
            &self.server_random,
        )?;
        self.engine.enable_read_encryption(
            suite,
            &key_block.server_write_key,
            Iv::new(&key_block.server_write_iv),
        )?;

        self.master_secret = Some(Zeroizing::new(session.master_secret().to_vec()));
        session.set_randoms(self.client_random, self.server_random);
        self.session = Some(session);
        self.resumed = true;

        // The server sends ChangeCipherSpec and Finished next; our own
        // flight follows once its Finished verifies.
        self.state = HandshakeState::FinishedPending;
        Ok(())
    }

    // Server flight 2

    fn on_server_certificate(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        let suite = self.negotiated_suite()?;
        if !suite.key_exchange().requires_certificate() {
            return Err(Error::UnexpectedMessage(
                "Certificate under a PSK key exchange".into(),
            ));
        }

        let leaf = {
            let handshake = self.engine.next_handshake(buffer)?;
            let Body::Certificate(certificate) = handshake.body else {
                return Err(Error::UnexpectedMessage("expected Certificate".into()));
            };

            let leaf = certificate.leaf().ok_or_else(|| {
                Error::CertificateError("server sent an empty certificate chain".into())
            })?;

            if let Some(verifier) = self.engine.config().cert_verifier() {
                let chain: Vec<&[u8]> = certificate.certificate_list.iter().map(|c| c.0).collect();
                verifier.verify_chain(&chain)?;
            }

            leaf.0.to_vec()
        };

        if crypto::peer_key_algorithm(&leaf)? != KeyAlgorithm::Ec {
            return Err(Error::CertificateError(
                "server certificate key does not match the ECDSA suite".into(),
            ));
        }
        if !crypto::can_sign(&leaf)? {
            return Err(Error::CertificateError(
                "server certificate is not fit for signing".into(),
            ));
        }

        self.peer_certificate = Some(leaf);
        self.state = HandshakeState::KeyExchangePending;
        Ok(())
    }

    fn on_server_key_exchange(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        let suite = self.negotiated_suite()?;
        let kind = suite.key_exchange();

        // A certificate suite signs its key share, so the Certificate
        // must come first. PSK kinds have nothing to sign with.
        match (self.state, kind) {
            (HandshakeState::KeyExchangePending, KeyExchangeKind::EcdheCertificate) => {}
            (HandshakeState::HelloExchanged, KeyExchangeKind::Psk | KeyExchangeKind::EcdhePsk) => {}
            _ => {
                return Err(Error::UnexpectedMessage(format!(
                    "ServerKeyExchange in state {}",
                    self.state
                )))
            }
        }

        let (ecdh, hint) = {
            let handshake = self.engine.next_handshake(buffer)?;
            let Body::ServerKeyExchange(exchange) = handshake.body else {
                return Err(Error::UnexpectedMessage(
                    "expected ServerKeyExchange".into(),
                ));
            };

            let mut ecdh = None;
            let mut hint = None;

            match &exchange.params {
                ServerKeyExchangeParams::Ecdh(params, signature) => {
                    self.check_ecdh_params(params)?;
                    let signature = signature
                        .as_ref()
                        .ok_or_else(|| Error::HandshakeFailure("unsigned server key share".into()))?;
                    self.verify_server_key_signature(params, signature)?;
                    ecdh = Some((params.named_group, params.public_key.to_vec()));
                }
                ServerKeyExchangeParams::EcdhPsk(psk, params) => {
                    self.check_ecdh_params(params)?;
                    hint = Some(psk.identity_hint.to_vec());
                    ecdh = Some((params.named_group, params.public_key.to_vec()));
                }
                ServerKeyExchangeParams::Psk(psk) => {
                    hint = Some(psk.identity_hint.to_vec());
                }
            }

            (ecdh, hint)
        };

        if let Some((group, public_key)) = ecdh {
            debug!("Server key share on {:?}", group);
            self.ephemeral = Some(EphemeralKey::generate(group)?);
            self.peer_public_key = Some(public_key);
        }
        if hint.is_some() {
            self.psk_identity_hint = hint;
        }

        self.state = HandshakeState::KeyExchangeComplete;
        Ok(())
    }

    fn check_ecdh_params(&self, params: &EcdhParams) -> Result<(), Error> {
        if params.curve_type != CurveType::NamedCurve {
            return Err(Error::HandshakeFailure(
                "server key share is not on a named curve".into(),
            ));
        }
        let group = params.named_group;
        if !group.is_usable() || !self.engine.config().named_groups().contains(&group) {
            return Err(Error::IllegalParameter(format!(
                "server selected unusable group {:?}",
                group
            )));
        }
        Ok(())
    }

    /// Check the server signature over both randoms and the key share
    /// parameters, with the certificate received earlier.
    fn verify_server_key_signature(
        &self,
        params: &EcdhParams,
        signature: &DigitallySigned,
    ) -> Result<(), Error> {
        let certificate = self
            .peer_certificate
            .as_deref()
            .ok_or_else(|| Error::UnexpectedMessage("ServerKeyExchange before Certificate".into()))?;

        if !self
            .engine
            .config()
            .signature_algorithms()
            .contains(&signature.algorithm)
        {
            return Err(Error::IllegalParameter(format!(
                "server signed with unoffered algorithm {:?}",
                signature.algorithm
            )));
        }

        let mut signed_data = Vec::with_capacity(64 + 4 + params.public_key.len());
        signed_data.extend_from_slice(&self.client_random);
        signed_data.extend_from_slice(&self.server_random);
        params.serialize(&mut signed_data);

        crypto::verify_signature(
            certificate,
            &signed_data,
            signature.algorithm,
            signature.signature,
        )
    }

    fn on_certificate_request(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        let suite = self.negotiated_suite()?;
        if !suite.key_exchange().requires_certificate() {
            return Err(Error::UnexpectedMessage(
                "CertificateRequest under a PSK key exchange".into(),
            ));
        }

        let summary = {
            let handshake = self.engine.next_handshake(buffer)?;
            let Body::CertificateRequest(request) = handshake.body else {
                return Err(Error::UnexpectedMessage(
                    "expected CertificateRequest".into(),
                ));
            };
            CertificateRequestSummary {
                certificate_types: request.certificate_types.to_vec(),
                algorithms: request.supported_signature_algorithms.to_vec(),
            }
        };

        debug!("Server requests client authentication");

        self.certificate_request = Some(summary);
        self.state = HandshakeState::CertificateVerifyPending;
        Ok(())
    }

    fn on_server_hello_done(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        {
            let handshake = self.engine.next_handshake(buffer)?;
            if !matches!(handshake.body, Body::ServerHelloDone) {
                return Err(Error::UnexpectedMessage("expected ServerHelloDone".into()));
            }
        }

        // Only a plain PSK exchange without an identity hint skips
        // straight from the hellos to the done marker.
        let suite = self.negotiated_suite()?;
        if self.state == HandshakeState::HelloExchanged
            && suite.key_exchange() != KeyExchangeKind::Psk
        {
            return Err(Error::UnexpectedMessage(
                "ServerHelloDone before the server key exchange".into(),
            ));
        }

        self.send_client_flight()
    }

    // Client flight 2

    fn send_client_flight(&mut self) -> Result<(), Error> {
        let suite = self.negotiated_suite()?;
        let kind = suite.key_exchange();
        let hash = suite.hash_algorithm();

        debug!("Sending client key exchange flight");

        self.engine.flight_begin();

        // Certificate, when asked for one. An empty chain goes out when
        // nothing we hold matches the request.
        let mut signing: Option<(SigningKey, SignatureAndHashAlgorithm)> = None;
        if let Some(request) = self.certificate_request.take() {
            let key = SigningKey::from_pkcs8_der(&self.certificate.private_key)?;

            let type_ok = request
                .certificate_types
                .iter()
                .any(|t| t.compatible_with_key(KeyAlgorithm::Ec));
            // A certificate whose key usage bars signing cannot answer
            // CertificateVerify, the same as holding no credential.
            let usage_ok = crypto::can_sign(&self.certificate.certificate).unwrap_or(false);

            let selected = if type_ok && usage_ok {
                select_signature_algorithm(
                    &request.algorithms,
                    &[key.algorithm()],
                    KeyAlgorithm::Ec,
                )
            } else {
                None
            };

            let message = if let Some(algorithm) = selected {
                signing = Some((key, algorithm));
                let mut list = SmallVec::new();
                list.push(Asn1Cert(&self.certificate.certificate));
                Certificate::new(list)
            } else {
                debug!("Nothing matches the certificate request, sending an empty chain");
                Certificate::empty()
            };

            let mut body = Vec::new();
            message.serialize(&mut body);
            drop(message);
            self.send_handshake(MessageType::Certificate, &body)?;
        }

        let (premaster, body) = self.build_client_key_exchange(kind)?;
        self.send_handshake(MessageType::ClientKeyExchange, &body)?;

        // The session hash covers everything up to and including the
        // ClientKeyExchange (rfc7627).
        let session_hash = self.engine.transcript_hash()?;

        let master = if self.extended_master_secret {
            crypto::extended_master_secret(&premaster, &session_hash, hash)?
        } else {
            crypto::master_secret(&premaster, &self.client_random, &self.server_random, hash)?
        };

        let key_block = KeyBlock::derive(suite, &master, &self.client_random, &self.server_random)?;
        self.engine.enable_read_encryption(
            suite,
            &key_block.server_write_key,
            Iv::new(&key_block.server_write_iv),
        )?;

        if let Some((key, algorithm)) = signing {
            let signature = key.sign(self.engine.transcript())?;
            let signed = DigitallySigned::new(algorithm, &signature);
            let mut body = Vec::new();
            signed.serialize(&mut body);
            self.send_handshake(MessageType::CertificateVerify, &body)?;
        }

        self.send_change_cipher_spec(suite, &key_block)?;

        let verify = crypto::verify_data(&master, true, &self.engine.transcript_hash()?, hash)?;
        self.send_finished(&verify)?;

        self.master_secret = Some(master);
        self.state = HandshakeState::FinishedPending;
        Ok(())
    }

    fn build_client_key_exchange(
        &mut self,
        kind: KeyExchangeKind,
    ) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), Error> {
        match kind {
            KeyExchangeKind::EcdheCertificate => {
                let (premaster, public_key) = self.ecdh_shared_secret()?;
                let exchange =
                    ClientKeyExchange::new(ExchangeKeys::Ecdh(ClientEcdhKeys::new(&public_key)));
                let mut body = Vec::new();
                exchange.serialize(&mut body);
                Ok((premaster, body))
            }
            KeyExchangeKind::Psk => {
                let (identity, key) = self.client_psk()?;
                let premaster = crypto::psk_premaster(&key);
                let exchange = ClientKeyExchange::new(ExchangeKeys::Psk {
                    identity: &identity,
                });
                let mut body = Vec::new();
                exchange.serialize(&mut body);
                self.psk_identity = Some(identity);
                Ok((premaster, body))
            }
            KeyExchangeKind::EcdhePsk => {
                let (identity, key) = self.client_psk()?;
                let (shared, public_key) = self.ecdh_shared_secret()?;
                let premaster = crypto::ecdhe_psk_premaster(&shared, &key);
                let exchange = ClientKeyExchange::new(ExchangeKeys::EcdhPsk {
                    identity: &identity,
                    public_key: &public_key,
                });
                let mut body = Vec::new();
                exchange.serialize(&mut body);
                self.psk_identity = Some(identity);
                Ok((premaster, body))
            }
            KeyExchangeKind::Static => Err(Error::HandshakeFailure(
                "static key exchange is not supported".into(),
            )),
        }
    }

    fn ecdh_shared_secret(&mut self) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), Error> {
        let peer = self
            .peer_public_key
            .take()
            .ok_or_else(|| Error::UnexpectedMessage("no server key share received".into()))?;
        let ephemeral = self
            .ephemeral
            .as_mut()
            .ok_or_else(|| Error::CryptoError("no ephemeral key generated".into()))?;
        let public_key = ephemeral.public_key().to_vec();
        let shared = ephemeral.diffie_hellman(&peer)?;
        Ok((shared, public_key))
    }

    fn client_psk(&self) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), Error> {
        let store = self
            .engine
            .config()
            .psk_store()
            .ok_or_else(|| Error::HandshakeFailure("no PSK store configured".into()))?;
        store
            .client_identity(self.psk_identity_hint.as_deref())
            .ok_or_else(|| Error::HandshakeFailure("PSK store offered no identity".into()))
    }

    fn send_change_cipher_spec(
        &mut self,
        suite: CipherSuite,
        key_block: &KeyBlock,
    ) -> Result<(), Error> {
        self.engine
            .create_record(ContentType::ChangeCipherSpec, 0, true, |out| {
                out.push(1);
            })?;
        self.engine.enable_write_encryption(
            suite,
            &key_block.client_write_key,
            Iv::new(&key_block.client_write_iv),
        )
    }

    fn send_finished(&mut self, verify_data: &[u8]) -> Result<(), Error> {
        let finished = Finished::new(verify_data);
        let mut body = Vec::new();
        finished.serialize(&mut body);
        self.send_handshake(MessageType::Finished, &body)
    }

    fn send_handshake(&mut self, msg_type: MessageType, body: &[u8]) -> Result<(), Error> {
        self.engine.create_handshake(msg_type, |out, _| {
            out.extend_from_slice(body);
            Ok(())
        })
    }

    // Server Finished

    fn on_server_finished(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        let suite = self.negotiated_suite()?;
        let hash = suite.hash_algorithm();

        // Hash snapshot before the message itself enters the handshake
        // hashes.
        let expected_transcript = self.engine.transcript_hash()?;
        let master = self
            .master_secret
            .as_ref()
            .ok_or_else(|| Error::CryptoError("no master secret derived".into()))?;
        let expected = crypto::verify_data(master, false, &expected_transcript, hash)?;

        {
            let handshake = self.engine.next_handshake(buffer)?;
            let Body::Finished(finished) = handshake.body else {
                return Err(Error::UnexpectedMessage("expected Finished".into()));
            };
            if !bool::from(expected.as_slice().ct_eq(finished.verify_data)) {
                return Err(Error::VerificationFailed("peer Finished verification"));
            }
        }

        debug!("Server Finished verified");

        if self.resumed {
            self.send_resumed_finished()?;
        }

        self.establish()
    }

    /// In an abbreviated handshake the server finishes first and our
    /// flight closes the exchange, over hashes that include the server
    /// Finished.
    fn send_resumed_finished(&mut self) -> Result<(), Error> {
        let suite = self.negotiated_suite()?;
        let hash = suite.hash_algorithm();

        let master = self
            .master_secret
            .clone()
            .ok_or_else(|| Error::CryptoError("no master secret derived".into()))?;

        self.engine.flight_begin();

        let key_block = KeyBlock::derive(suite, &master, &self.client_random, &self.server_random)?;
        self.send_change_cipher_spec(suite, &key_block)?;

        let verify = crypto::verify_data(&master, true, &self.engine.transcript_hash()?, hash)?;
        self.send_finished(&verify)
    }

    fn establish(&mut self) -> Result<(), Error> {
        let suite = self.negotiated_suite()?;

        if self.session.is_none() {
            let master = self
                .master_secret
                .as_ref()
                .ok_or_else(|| Error::CryptoError("no master secret derived".into()))?;

            let peer_identity = match suite.key_exchange() {
                KeyExchangeKind::EcdheCertificate => match &self.peer_certificate {
                    Some(der) => PeerIdentity::from_certificate(der),
                    None => PeerIdentity::Unauthenticated,
                },
                KeyExchangeKind::Psk | KeyExchangeKind::EcdhePsk => match &self.psk_identity {
                    Some(identity) => PeerIdentity::PskIdentity(identity.clone()),
                    None => PeerIdentity::Unauthenticated,
                },
                KeyExchangeKind::Static => PeerIdentity::Unauthenticated,
            };

            self.session = Some(SessionContext::new(
                suite,
                self.session_id,
                &master[..],
                self.extended_master_secret,
                peer_identity,
                self.client_random,
                self.server_random,
            ));
        }

        debug!("Handshake complete");

        self.state = HandshakeState::Established;
        self.engine.flight_stop_resend_timers();
        self.engine.push_connected();
        self.engine.release_application_data();
        Ok(())
    }

    fn negotiated_suite(&self) -> Result<CipherSuite, Error> {
        self.engine
            .cipher_suite()
            .ok_or_else(|| Error::CryptoError("no cipher suite negotiated".into()))
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state)
            .field("resumed", &self.resumed)
            .finish()
    }
}
