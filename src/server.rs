//! Server side of the handshake.
//!
//! [`Server`] drives an [`Engine`] through the server state machine. A
//! fresh server is silent until a ClientHello arrives through
//! [`Server::handle_packet`]; from there it answers with the verify
//! request and hello flights, checks the client's key exchange and
//! Finished, and hands the embedder datagrams and events through
//! [`Server::poll_output`].

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::buffer::Buf;
use crate::certificate::EndpointCertificate;
use crate::config::{ClientAuth, Config};
use crate::crypto::{self, EphemeralKey, Iv, KeyBlock, SigningKey};
use crate::engine::{Engine, MAX_FRAGMENT_LEN};
use crate::error::Error;
use crate::message::{
    Alert, AlertDescription, Asn1Cert, Body, Certificate, CertificateRequest,
    ClientCertificateType, CompressionMethod, ContentType, Cookie, DigitallySigned,
    EcPointFormatsExtension, EcdhParams, ExchangeKeys, Extension, ExtensionType, Finished,
    HelloVerifyRequest, KeyAlgorithm, MessageType, ProtocolVersion, PskParams, Random,
    ServerHello, ServerKeyExchange, ServerKeyExchangeParams, SessionId,
    SignatureAlgorithmsExtension, SignatureAndHashAlgorithm, SupportedGroupsExtension,
    select_named_group, select_signature_algorithm,
};
use crate::session::{PeerIdentity, SessionContext};
use crate::state::HandshakeState;
use crate::suite::{CipherSuite, KeyExchangeKind, NamedGroup};
use crate::Output;

/// A ClientHello reduced to the owned data negotiation needs.
struct ClientHelloSummary {
    version: ProtocolVersion,
    client_random: [u8; 32],
    session_id: SessionId,
    cookie: Cookie,
    suites: Vec<CipherSuite>,
    offers_null_compression: bool,
    offers_extended_master_secret: bool,
    /// Supported groups extension, when the client sent one.
    groups: Option<Vec<NamedGroup>>,
    /// Signature algorithms extension, when the client sent one.
    algorithms: Option<Vec<SignatureAndHashAlgorithm>>,
    /// Point formats extension, reduced to whether uncompressed is in it.
    point_formats: Option<bool>,
}

/// Server endpoint of a connection.
///
/// The server is reactive: the constructor queues nothing, and the first
/// flight goes out in answer to a ClientHello fed to
/// [`Server::handle_packet`]. The embedder polls
/// [`Server::poll_output`] for datagrams and fires
/// [`Server::handle_timeout`] when the polled [`Output::Timeout`]
/// instant passes, which bounds the lifetime of a handshake the client
/// abandoned.
pub struct Server {
    engine: Engine,
    state: HandshakeState,
    certificate: EndpointCertificate,
    defragment_buffer: Buf,
    alert_sent: bool,

    /// Secret for the stateless cookie exchange, drawn per instance.
    cookie_secret: [u8; 32],
    hello_verify_sent: bool,

    client_random: [u8; 32],
    server_random: [u8; 32],

    /// Session available for an abbreviated handshake, until the
    /// ClientHello settles whether the client asks for it.
    held_session: Option<SessionContext>,
    resumed: bool,
    read_promoted: bool,

    session_id: SessionId,
    extended_master_secret: bool,
    certificate_requested: bool,
    expect_certificate_verify: bool,

    ephemeral: Option<EphemeralKey>,
    client_certificate: Option<Vec<u8>>,
    psk_identity: Option<Vec<u8>>,

    master_secret: Option<Zeroizing<Vec<u8>>>,
    session: Option<SessionContext>,
}

impl Server {
    /// Create a server that waits for a ClientHello.
    pub fn new(config: Arc<Config>, certificate: EndpointCertificate) -> Server {
        Server::start(config, certificate, None)
    }

    /// Create a server that accepts an abbreviated handshake for
    /// `session`, falling back to a full handshake when the client does
    /// not offer it or the configuration rules it out.
    ///
    /// The embedder is the session store: it keeps exported sessions per
    /// peer and hands the right one to the server for that peer.
    pub fn with_session(
        config: Arc<Config>,
        certificate: EndpointCertificate,
        session: SessionContext,
    ) -> Server {
        Server::start(config, certificate, Some(session))
    }

    fn start(
        config: Arc<Config>,
        certificate: EndpointCertificate,
        session: Option<SessionContext>,
    ) -> Server {
        let mut engine = Engine::new(config);
        let cookie_secret: [u8; 32] = engine.rng().random();

        Server {
            engine,
            state: HandshakeState::Start,
            certificate,
            defragment_buffer: Buf::new(),
            alert_sent: false,
            cookie_secret,
            hello_verify_sent: false,
            client_random: [0; 32],
            server_random: [0; 32],
            held_session: session,
            resumed: false,
            read_promoted: false,
            session_id: SessionId::empty(),
            extended_master_secret: false,
            certificate_requested: false,
            expect_certificate_verify: false,
            ephemeral: None,
            client_certificate: None,
            psk_identity: None,
            master_secret: None,
            session: None,
        }
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

    /// Identity the client proved during the handshake.
    pub fn peer_identity(&self) -> Option<&PeerIdentity> {
        self.session().map(|s| s.peer_identity())
    }

    /// Process one incoming datagram.
    ///
    /// An `Err` means the connection is dead: a fatal alert is queued
    /// where the protocol calls for one, and every later call becomes a
    /// no-op. Poll remaining output before dropping the server.
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
                // The client's ChangeCipherSpec moves our read side to
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
            (HandshakeState::Start, MessageType::ClientHello) => self.on_client_hello(buffer),
            (HandshakeState::HelloExchanged, MessageType::Certificate) => {
                self.on_client_certificate(buffer)
            }
            (
                HandshakeState::HelloExchanged | HandshakeState::KeyExchangePending,
                MessageType::ClientKeyExchange,
            ) => self.on_client_key_exchange(buffer),
            (HandshakeState::CertificateVerifyPending, MessageType::CertificateVerify) => {
                self.on_certificate_verify(buffer)
            }
            (HandshakeState::FinishedPending, MessageType::Finished) => {
                self.on_client_finished(buffer)
            }
            (state, msg_type) => Err(Error::UnexpectedMessage(format!(
                "{:?} in state {}",
                msg_type, state
            ))),
        }
    }

    // ClientHello

    fn on_client_hello(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        let summary = self.read_client_hello(buffer)?;

        if summary.version != ProtocolVersion::DTLS1_2 {
            return Err(Error::HandshakeFailure(format!(
                "unsupported client version {:?}",
                summary.version
            )));
        }
        if !summary.offers_null_compression {
            return Err(Error::HandshakeFailure(
                "client does not offer null compression".into(),
            ));
        }

        self.client_random = summary.client_random;

        if self.engine.config().cookie_exchange() {
            let expected = compute_cookie(&self.cookie_secret, &summary.client_random)?;
            if !bool::from(expected[..].ct_eq(&summary.cookie[..])) {
                if self.hello_verify_sent {
                    return Err(Error::HandshakeFailure("cookie verification failed".into()));
                }
                debug!("ClientHello without a valid cookie, sending HelloVerifyRequest");
                return self.send_hello_verify_request(expected);
            }
        }

        if let Some(session) = self.held_session.take() {
            if self.can_resume(&session, &summary) {
                return self.send_abbreviated_flight(session);
            }
            debug!("Declining session resumption, running a full handshake");
        }

        self.accept_client_hello(&summary)
    }

    fn read_client_hello(&mut self, buffer: &mut Buf) -> Result<ClientHelloSummary, Error> {
        let handshake = self.engine.next_handshake(buffer)?;
        let Body::ClientHello(hello) = handshake.body else {
            return Err(Error::UnexpectedMessage("expected ClientHello".into()));
        };

        let groups = match hello.extension_data(ExtensionType::SupportedGroups) {
            Some(data) => {
                let (_, ext) = SupportedGroupsExtension::parse(data)?;
                Some(ext.groups.to_vec())
            }
            None => None,
        };
        let algorithms = match hello.extension_data(ExtensionType::SignatureAlgorithms) {
            Some(data) => {
                let (_, ext) = SignatureAlgorithmsExtension::parse(data)?;
                Some(ext.supported_signature_algorithms.to_vec())
            }
            None => None,
        };
        let point_formats = match hello.extension_data(ExtensionType::EcPointFormats) {
            Some(data) => {
                let (_, ext) = EcPointFormatsExtension::parse(data)?;
                Some(ext.supports_uncompressed())
            }
            None => None,
        };

        Ok(ClientHelloSummary {
            version: hello.client_version,
            client_random: hello.random.to_bytes(),
            session_id: hello.session_id,
            cookie: hello.cookie,
            suites: hello.cipher_suites.to_vec(),
            offers_null_compression: hello
                .compression_methods
                .contains(&CompressionMethod::Null),
            offers_extended_master_secret: hello.offers_extended_master_secret(),
            groups,
            algorithms,
            point_formats,
        })
    }

    fn send_hello_verify_request(&mut self, cookie: Cookie) -> Result<(), Error> {
        self.engine.flight_begin();

        let mut body = Vec::new();
        HelloVerifyRequest::new(cookie).serialize(&mut body);
        self.send_handshake(MessageType::HelloVerifyRequest, &body)?;

        // The verify request and the first hello stay out of the
        // handshake hashes; the repeated hello starts them over.
        self.engine.reset_server_for_hello_verify_request();
        self.hello_verify_sent = true;
        Ok(())
    }

    /// Whether the held session matches what the ClientHello asks for.
    fn can_resume(&self, session: &SessionContext, summary: &ClientHelloSummary) -> bool {
        let config = self.engine.config();
        if !config.session_resumption() {
            debug!("Session resumption disabled by configuration");
            return false;
        }
        if summary.session_id.is_empty() || summary.session_id != session.session_id() {
            return false;
        }
        if !summary.suites.contains(&session.cipher_suite()) {
            debug!("Client no longer offers the session cipher suite");
            return false;
        }
        let extended = summary.offers_extended_master_secret && config.with_extended_master_secret();
        if session.extended_master_secret() != extended {
            debug!("Extended master secret changed since the session, declining");
            return false;
        }
        true
    }

    fn accept_client_hello(&mut self, summary: &ClientHelloSummary) -> Result<(), Error> {
        // A key we cannot parse just means the certificate suites drop
        // out of negotiation.
        let signing_algorithm = SigningKey::from_pkcs8_der(&self.certificate.private_key)
            .ok()
            .map(|key| key.algorithm());

        let Some((suite, group)) = self.select_suite(summary, signing_algorithm) else {
            return Err(Error::HandshakeFailure(
                "no mutually acceptable cipher suite".into(),
            ));
        };

        debug!("Negotiated {:?}", suite);

        let (resumption, extended) = {
            let config = self.engine.config();
            (
                config.session_resumption(),
                summary.offers_extended_master_secret && config.with_extended_master_secret(),
            )
        };

        self.extended_master_secret = extended;
        self.engine.set_cipher_suite(suite);
        self.session_id = if resumption {
            SessionId::random(32, self.engine.rng())
        } else {
            SessionId::empty()
        };

        self.send_server_flight(suite, group, summary.point_formats.is_some())?;
        self.state = HandshakeState::HelloExchanged;
        Ok(())
    }

    /// Pick the first configured suite the client offers and this
    /// endpoint can actually run, along with the ECDH group for the
    /// ephemeral kinds.
    fn select_suite(
        &self,
        summary: &ClientHelloSummary,
        signing_algorithm: Option<SignatureAndHashAlgorithm>,
    ) -> Option<(CipherSuite, Option<NamedGroup>)> {
        let config = self.engine.config();

        for &suite in config.cipher_suites() {
            if !suite.is_known() || !summary.suites.contains(&suite) {
                continue;
            }

            let kind = suite.key_exchange();

            if kind.uses_psk() && config.psk_store().is_none() {
                continue;
            }

            let mut group = None;
            if kind.uses_ephemeral() {
                if summary.point_formats == Some(false) {
                    continue;
                }
                group = match &summary.groups {
                    Some(peer) => select_named_group(peer, config.named_groups()),
                    // No extension leaves the choice to us (rfc8422
                    // treats it as no restriction).
                    None => config.named_groups().iter().copied().find(|g| g.is_usable()),
                };
                if group.is_none() {
                    continue;
                }
            }

            if kind.requires_certificate() {
                let Some(algorithm) = signing_algorithm else {
                    continue;
                };
                // No extension leaves the choice to us as well.
                if let Some(peer) = &summary.algorithms {
                    if select_signature_algorithm(peer, &[algorithm], KeyAlgorithm::Ec).is_none() {
                        continue;
                    }
                }
            }

            return Some((suite, group));
        }

        None
    }

    // Server flight 1

    fn send_server_flight(
        &mut self,
        suite: CipherSuite,
        group: Option<NamedGroup>,
        echo_point_formats: bool,
    ) -> Result<(), Error> {
        let kind = suite.key_exchange();

        debug!("Sending server hello flight");

        self.engine.flight_begin();

        let random = Random::new(self.engine.rng());
        self.server_random = random.to_bytes();

        let mut body = Vec::new();
        {
            let mut formats_data = Vec::new();
            let mut hello = ServerHello::new(random, self.session_id, suite);
            if self.extended_master_secret {
                hello
                    .extensions
                    .push(Extension::new(ExtensionType::ExtendedMasterSecret, &[]));
            }
            if echo_point_formats && kind.uses_ephemeral() {
                EcPointFormatsExtension::uncompressed().serialize(&mut formats_data);
                hello
                    .extensions
                    .push(Extension::new(ExtensionType::EcPointFormats, &formats_data));
            }
            hello.serialize(&mut body);
        }
        self.send_handshake(MessageType::ServerHello, &body)?;

        match kind {
            KeyExchangeKind::EcdheCertificate => {
                let group =
                    group.ok_or_else(|| Error::CryptoError("no ECDH group selected".into()))?;
                self.send_server_certificate()?;
                self.send_signed_key_exchange(group)?;
                if self.engine.config().client_auth() != ClientAuth::None {
                    self.send_certificate_request()?;
                }
            }
            KeyExchangeKind::EcdhePsk => {
                let group =
                    group.ok_or_else(|| Error::CryptoError("no ECDH group selected".into()))?;
                self.send_psk_key_exchange(Some(group))?;
            }
            KeyExchangeKind::Psk => {
                self.send_psk_key_exchange(None)?;
            }
            KeyExchangeKind::Static => {
                return Err(Error::HandshakeFailure(
                    "static key exchange is not supported".into(),
                ))
            }
        }

        self.send_handshake(MessageType::ServerHelloDone, &[])
    }

    fn send_server_certificate(&mut self) -> Result<(), Error> {
        let mut body = Vec::new();
        {
            let mut list = SmallVec::new();
            list.push(Asn1Cert(&self.certificate.certificate));
            Certificate::new(list).serialize(&mut body);
        }
        self.send_handshake(MessageType::Certificate, &body)
    }

    /// Key share on `group`, signed over both randoms and the serialized
    /// parameters with the endpoint key.
    fn send_signed_key_exchange(&mut self, group: NamedGroup) -> Result<(), Error> {
        let key = SigningKey::from_pkcs8_der(&self.certificate.private_key)?;
        let ephemeral = EphemeralKey::generate(group)?;

        let mut body = Vec::new();
        {
            let params = EcdhParams::new(group, ephemeral.public_key());

            let mut signed_data = Vec::with_capacity(64 + 4 + ephemeral.public_key().len());
            signed_data.extend_from_slice(&self.client_random);
            signed_data.extend_from_slice(&self.server_random);
            params.serialize(&mut signed_data);

            let signature = key.sign(&signed_data)?;
            let signed = DigitallySigned::new(key.algorithm(), &signature);

            let exchange = ServerKeyExchange {
                params: ServerKeyExchangeParams::Ecdh(params, Some(signed)),
            };
            exchange.serialize(&mut body);
        }
        self.send_handshake(MessageType::ServerKeyExchange, &body)?;

        self.ephemeral = Some(ephemeral);
        Ok(())
    }

    fn send_psk_key_exchange(&mut self, group: Option<NamedGroup>) -> Result<(), Error> {
        let hint = self
            .engine
            .config()
            .psk_store()
            .and_then(|store| store.identity_hint());

        match group {
            Some(group) => {
                let ephemeral = EphemeralKey::generate(group)?;
                let mut body = Vec::new();
                {
                    let exchange = ServerKeyExchange {
                        params: ServerKeyExchangeParams::EcdhPsk(
                            PskParams {
                                identity_hint: hint.as_deref().unwrap_or(&[]),
                            },
                            EcdhParams::new(group, ephemeral.public_key()),
                        ),
                    };
                    exchange.serialize(&mut body);
                }
                self.send_handshake(MessageType::ServerKeyExchange, &body)?;
                self.ephemeral = Some(ephemeral);
            }
            None => {
                // Plain PSK skips the message entirely without a hint to
                // give.
                if let Some(hint) = hint {
                    let mut body = Vec::new();
                    {
                        let exchange = ServerKeyExchange {
                            params: ServerKeyExchangeParams::Psk(PskParams {
                                identity_hint: &hint,
                            }),
                        };
                        exchange.serialize(&mut body);
                    }
                    self.send_handshake(MessageType::ServerKeyExchange, &body)?;
                }
            }
        }

        Ok(())
    }

    fn send_certificate_request(&mut self) -> Result<(), Error> {
        let mut body = Vec::new();
        {
            let config = self.engine.config();
            let request = CertificateRequest::new(
                &[ClientCertificateType::ECDSA_SIGN],
                config.signature_algorithms(),
            );
            request.serialize(&mut body);
        }
        self.certificate_requested = true;
        self.send_handshake(MessageType::CertificateRequest, &body)
    }

    /// Abbreviated handshake: echo the session id and finish first, over
    /// keys derived from the stored master secret and this handshake's
    /// randoms.
    fn send_abbreviated_flight(&mut self, mut session: SessionContext) -> Result<(), Error> {
        let suite = session.cipher_suite();
        let hash = suite.hash_algorithm();

        debug!("Resuming session, sending abbreviated flight");

        self.engine.set_cipher_suite(suite);
        self.extended_master_secret = session.extended_master_secret();
        self.session_id = session.session_id();
        self.resumed = true;

        self.engine.flight_begin();

        let random = Random::new(self.engine.rng());
        self.server_random = random.to_bytes();

        let mut body = Vec::new();
        {
            let mut hello = ServerHello::new(random, self.session_id, suite);
            if self.extended_master_secret {
                hello
                    .extensions
                    .push(Extension::new(ExtensionType::ExtendedMasterSecret, &[]));
            }
            hello.serialize(&mut body);
        }
        self.send_handshake(MessageType::ServerHello, &body)?;

        let master = Zeroizing::new(session.master_secret().to_vec());
        let key_block = KeyBlock::derive(suite, &master, &self.client_random, &self.server_random)?;

        self.engine.enable_read_encryption(
            suite,
            &key_block.client_write_key,
            Iv::new(&key_block.client_write_iv),
        )?;

        self.send_change_cipher_spec(suite, &key_block)?;

        let verify = crypto::verify_data(&master, false, &self.engine.transcript_hash()?, hash)?;
        self.send_finished(&verify)?;

        session.set_randoms(self.client_random, self.server_random);
        self.master_secret = Some(master);
        self.session = Some(session);
        self.state = HandshakeState::FinishedPending;
        Ok(())
    }

    // Client flight 2

    fn on_client_certificate(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        if !self.certificate_requested {
            return Err(Error::UnexpectedMessage(
                "unsolicited client Certificate".into(),
            ));
        }

        let leaf = {
            let handshake = self.engine.next_handshake(buffer)?;
            let Body::Certificate(certificate) = handshake.body else {
                return Err(Error::UnexpectedMessage("expected Certificate".into()));
            };

            match certificate.leaf() {
                Some(leaf) => {
                    if let Some(verifier) = self.engine.config().cert_verifier() {
                        let chain: Vec<&[u8]> =
                            certificate.certificate_list.iter().map(|c| c.0).collect();
                        verifier.verify_chain(&chain)?;
                    }
                    Some(leaf.0.to_vec())
                }
                None => None,
            }
        };

        match leaf {
            Some(leaf) => {
                if crypto::peer_key_algorithm(&leaf)? != KeyAlgorithm::Ec {
                    return Err(Error::CertificateError(
                        "client certificate key does not match the requested type".into(),
                    ));
                }
                if !crypto::can_sign(&leaf)? {
                    return Err(Error::CertificateError(
                        "client certificate is not fit for signing".into(),
                    ));
                }
                self.client_certificate = Some(leaf);
                self.expect_certificate_verify = true;
            }
            None => {
                if self.engine.config().client_auth() == ClientAuth::Require {
                    return Err(Error::HandshakeFailure(
                        "client certificate required".into(),
                    ));
                }
                debug!("Client declined to authenticate");
            }
        }

        self.state = HandshakeState::KeyExchangePending;
        Ok(())
    }

    fn on_client_key_exchange(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        // A requested Certificate comes first, even as an empty chain.
        if self.certificate_requested && self.state == HandshakeState::HelloExchanged {
            return Err(Error::UnexpectedMessage(
                "ClientKeyExchange before the requested Certificate".into(),
            ));
        }

        let suite = self.negotiated_suite()?;
        let hash = suite.hash_algorithm();

        let premaster = {
            let handshake = self.engine.next_handshake(buffer)?;
            let Body::ClientKeyExchange(exchange) = handshake.body else {
                return Err(Error::UnexpectedMessage("expected ClientKeyExchange".into()));
            };

            match &exchange.exchange_keys {
                ExchangeKeys::Ecdh(keys) => self.ecdh_premaster(keys.public_key)?,
                ExchangeKeys::Psk { identity } => {
                    let key = self.psk_for_identity(identity)?;
                    self.psk_identity = Some(identity.to_vec());
                    crypto::psk_premaster(&key)
                }
                ExchangeKeys::EcdhPsk {
                    identity,
                    public_key,
                } => {
                    let key = self.psk_for_identity(identity)?;
                    let shared = self.ecdh_premaster(public_key)?;
                    self.psk_identity = Some(identity.to_vec());
                    crypto::ecdhe_psk_premaster(&shared, &key)
                }
            }
        };

        // The session hash covers everything up to and including the
        // ClientKeyExchange (rfc7627).
        let session_hash = self.engine.transcript_hash()?;

        let master = if self.extended_master_secret {
            crypto::extended_master_secret(&premaster, &session_hash, hash)?
        } else {
            crypto::master_secret(&premaster, &self.client_random, &self.server_random, hash)?
        };

        // Read keys now; the client's Finished arrives under them. Our
        // write side moves after its Finished checks out.
        let key_block = KeyBlock::derive(suite, &master, &self.client_random, &self.server_random)?;
        self.engine.enable_read_encryption(
            suite,
            &key_block.client_write_key,
            Iv::new(&key_block.client_write_iv),
        )?;

        self.master_secret = Some(master);
        self.state = if self.expect_certificate_verify {
            HandshakeState::CertificateVerifyPending
        } else {
            HandshakeState::FinishedPending
        };
        Ok(())
    }

    fn ecdh_premaster(&mut self, public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let ephemeral = self
            .ephemeral
            .as_mut()
            .ok_or_else(|| Error::UnexpectedMessage("no ECDH exchange in progress".into()))?;
        ephemeral.diffie_hellman(public_key)
    }

    fn psk_for_identity(&self, identity: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let store = self
            .engine
            .config()
            .psk_store()
            .ok_or_else(|| Error::HandshakeFailure("no PSK store configured".into()))?;
        store
            .key_for_identity(identity)
            .ok_or(Error::UnknownPskIdentity)
    }

    fn on_certificate_verify(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        let certificate = self.client_certificate.as_deref().ok_or_else(|| {
            Error::UnexpectedMessage("CertificateVerify without a client certificate".into())
        })?;

        // The signature covers the transcript up to, not including, this
        // message.
        let transcript = self.engine.transcript().to_vec();

        {
            let handshake = self.engine.next_handshake(buffer)?;
            let Body::CertificateVerify(signed) = handshake.body else {
                return Err(Error::UnexpectedMessage("expected CertificateVerify".into()));
            };

            if !self
                .engine
                .config()
                .signature_algorithms()
                .contains(&signed.algorithm)
            {
                return Err(Error::IllegalParameter(format!(
                    "client signed with unoffered algorithm {:?}",
                    signed.algorithm
                )));
            }

            crypto::verify_signature(certificate, &transcript, signed.algorithm, signed.signature)?;
        }

        debug!("Client CertificateVerify verified");

        self.state = HandshakeState::FinishedPending;
        Ok(())
    }

    // Client Finished

    fn on_client_finished(&mut self, buffer: &mut Buf) -> Result<(), Error> {
        let suite = self.negotiated_suite()?;
        let hash = suite.hash_algorithm();

        // Hash snapshot before the message itself enters the handshake
        // hashes.
        let expected_transcript = self.engine.transcript_hash()?;
        let master = self
            .master_secret
            .as_ref()
            .ok_or_else(|| Error::CryptoError("no master secret derived".into()))?;
        let expected = crypto::verify_data(master, true, &expected_transcript, hash)?;

        {
            let handshake = self.engine.next_handshake(buffer)?;
            let Body::Finished(finished) = handshake.body else {
                return Err(Error::UnexpectedMessage("expected Finished".into()));
            };
            if !bool::from(expected.as_slice().ct_eq(finished.verify_data)) {
                return Err(Error::VerificationFailed("peer Finished verification"));
            }
        }

        debug!("Client Finished verified");

        if !self.resumed {
            self.send_server_ccs_and_finished()?;
        }

        self.establish()
    }

    /// In a full handshake the server finishes second, over hashes that
    /// include the client Finished.
    fn send_server_ccs_and_finished(&mut self) -> Result<(), Error> {
        let suite = self.negotiated_suite()?;
        let hash = suite.hash_algorithm();

        let master = self
            .master_secret
            .clone()
            .ok_or_else(|| Error::CryptoError("no master secret derived".into()))?;

        self.engine.flight_begin();

        let key_block = KeyBlock::derive(suite, &master, &self.client_random, &self.server_random)?;
        self.send_change_cipher_spec(suite, &key_block)?;

        let verify = crypto::verify_data(&master, false, &self.engine.transcript_hash()?, hash)?;
        self.send_finished(&verify)
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
            &key_block.server_write_key,
            Iv::new(&key_block.server_write_iv),
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

    fn establish(&mut self) -> Result<(), Error> {
        let suite = self.negotiated_suite()?;

        if self.session.is_none() {
            let master = self
                .master_secret
                .as_ref()
                .ok_or_else(|| Error::CryptoError("no master secret derived".into()))?;

            let peer_identity = if let Some(der) = &self.client_certificate {
                PeerIdentity::from_certificate(der)
            } else if let Some(identity) = &self.psk_identity {
                PeerIdentity::PskIdentity(identity.clone())
            } else {
                PeerIdentity::Unauthenticated
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

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("resumed", &self.resumed)
            .finish()
    }
}

/// Stateless cookie: the HMAC of the client random under a per-instance
/// secret, so a repeated hello proves the client saw our answer without
/// the server keeping state for unverified peers.
fn compute_cookie(secret: &[u8; 32], client_random: &[u8; 32]) -> Result<Cookie, Error> {
    let tag = crypto::hmac_sha256(secret, client_random)?;
    Cookie::try_new(&tag).map_err(|_| Error::CryptoError("cookie construction failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::generate_self_signed_certificate;
    use crate::client::Client;
    use crate::message::{DtlsRecord, Handshake};

    fn config() -> Arc<Config> {
        Arc::new(Config::builder().rng_seed(11).build())
    }

    fn client_config() -> Arc<Config> {
        Arc::new(Config::builder().rng_seed(7).build())
    }

    fn certificate() -> EndpointCertificate {
        generate_self_signed_certificate().unwrap()
    }

    fn poll_packet(server: &mut Server, now: Instant) -> Option<Vec<u8>> {
        let mut buffer = vec![0; 2048];
        match server.poll_output(&mut buffer, now) {
            Output::Packet(packet) => Some(packet.to_vec()),
            _ => None,
        }
    }

    fn client_packet(client: &mut Client, now: Instant) -> Option<Vec<u8>> {
        let mut buffer = vec![0; 2048];
        match client.poll_output(&mut buffer, now) {
            Output::Packet(packet) => Some(packet.to_vec()),
            _ => None,
        }
    }

    fn parse_first_handshake(packet: &[u8]) -> (DtlsRecord, Vec<u8>) {
        let (_, record) = DtlsRecord::parse(packet, 0).unwrap();
        assert_eq!(record.content_type, ContentType::Handshake);
        assert_eq!(record.sequence.epoch, 0);
        let body = packet[record.fragment_range.clone()].to_vec();
        (record, body)
    }

    #[test]
    fn fresh_server_is_quiet() {
        let mut server = Server::new(config(), certificate());
        assert_eq!(server.state(), HandshakeState::Start);

        let mut buffer = vec![0; 2048];
        match server.poll_output(&mut buffer, Instant::now()) {
            Output::Timeout(_) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[test]
    fn hello_without_cookie_draws_a_verify_request() {
        let now = Instant::now();
        let mut client = Client::new(client_config(), certificate());
        let mut server = Server::new(config(), certificate());

        let hello = client_packet(&mut client, now).unwrap();
        server.handle_packet(&hello).unwrap();

        // Still in Start: the cookie exchange runs before negotiation.
        assert_eq!(server.state(), HandshakeState::Start);

        let packet = poll_packet(&mut server, now).unwrap();
        let (_, body) = parse_first_handshake(&packet);
        let (_, handshake) = Handshake::parse(&body, None, false).unwrap();
        let Body::HelloVerifyRequest(request) = handshake.body else {
            panic!("not a HelloVerifyRequest");
        };
        assert_eq!(request.cookie.len(), 32);
    }

    #[test]
    fn valid_cookie_releases_the_server_flight() {
        let now = Instant::now();
        let mut client = Client::new(client_config(), certificate());
        let mut server = Server::new(config(), certificate());

        let hello = client_packet(&mut client, now).unwrap();
        server.handle_packet(&hello).unwrap();
        let verify = poll_packet(&mut server, now).unwrap();

        client.handle_packet(&verify).unwrap();
        let repeat = client_packet(&mut client, now).unwrap();
        server.handle_packet(&repeat).unwrap();

        assert_eq!(server.state(), HandshakeState::HelloExchanged);

        let packet = poll_packet(&mut server, now).unwrap();
        let (_, body) = parse_first_handshake(&packet);
        let (_, handshake) = Handshake::parse(&body, None, false).unwrap();
        let Body::ServerHello(hello) = handshake.body else {
            panic!("not a ServerHello");
        };
        assert_eq!(
            hello.cipher_suite,
            CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256
        );
        // Resumption is on by default, so a session id is issued.
        assert_eq!(hello.session_id.len(), 32);
    }

    #[test]
    fn cookie_exchange_disabled_goes_straight_to_server_hello() {
        let now = Instant::now();
        let mut client = Client::new(
            Arc::new(Config::builder().rng_seed(7).cookie_exchange(false).build()),
            certificate(),
        );
        let mut server = Server::new(
            Arc::new(Config::builder().rng_seed(11).cookie_exchange(false).build()),
            certificate(),
        );

        let hello = client_packet(&mut client, now).unwrap();
        server.handle_packet(&hello).unwrap();

        assert_eq!(server.state(), HandshakeState::HelloExchanged);

        let packet = poll_packet(&mut server, now).unwrap();
        let (_, body) = parse_first_handshake(&packet);
        let (_, handshake) = Handshake::parse(&body, None, false).unwrap();
        assert!(matches!(handshake.body, Body::ServerHello(_)));
    }

    #[test]
    fn no_shared_suite_fails_the_handshake() {
        let now = Instant::now();
        let mut client = Client::new(
            Arc::new(
                Config::builder()
                    .rng_seed(7)
                    .cookie_exchange(false)
                    .cipher_suites(vec![CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384])
                    .build(),
            ),
            certificate(),
        );
        let mut server = Server::new(
            Arc::new(
                Config::builder()
                    .rng_seed(11)
                    .cookie_exchange(false)
                    .cipher_suites(vec![CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256])
                    .build(),
            ),
            certificate(),
        );

        let hello = client_packet(&mut client, now).unwrap();
        let err = server.handle_packet(&hello).unwrap_err();
        assert!(matches!(err, Error::HandshakeFailure(_)));
        assert_eq!(server.state(), HandshakeState::Aborted);

        // The failure leaves with a fatal alert.
        let packet = poll_packet(&mut server, now).unwrap();
        let (_, record) = DtlsRecord::parse(&packet, 0).unwrap();
        assert_eq!(record.content_type, ContentType::Alert);
    }

    #[test]
    fn replayed_hello_is_ignored() {
        let now = Instant::now();
        let mut client = Client::new(client_config(), certificate());
        let mut server = Server::new(config(), certificate());

        let hello = client_packet(&mut client, now).unwrap();
        server.handle_packet(&hello).unwrap();
        let _verify = poll_packet(&mut server, now).unwrap();

        // The identical datagram again: the record sequence was already
        // seen, so the replay window swallows it whole.
        server.handle_packet(&hello).unwrap();
        assert_eq!(server.state(), HandshakeState::Start);
        assert!(poll_packet(&mut server, now).is_none());
    }

    #[test]
    fn tampered_cookie_is_fatal() {
        let now = Instant::now();
        let mut client = Client::new(client_config(), certificate());
        let mut server = Server::new(config(), certificate());

        let hello = client_packet(&mut client, now).unwrap();
        server.handle_packet(&hello).unwrap();
        let verify = poll_packet(&mut server, now).unwrap();

        client.handle_packet(&verify).unwrap();
        let mut repeat = client_packet(&mut client, now).unwrap();
        // First cookie byte: record header (13), handshake header (12),
        // version (2), random (32), empty session id (1), cookie length
        // (1).
        repeat[61] ^= 0xff;

        let err = server.handle_packet(&repeat).unwrap_err();
        assert!(matches!(err, Error::HandshakeFailure(_)));
        assert_eq!(server.state(), HandshakeState::Aborted);
    }

    #[test]
    fn cookie_is_deterministic_per_secret_and_random() {
        let secret = [7u8; 32];
        let random = [1u8; 32];

        let first = compute_cookie(&secret, &random).unwrap();
        let again = compute_cookie(&secret, &random).unwrap();
        assert_eq!(&first[..], &again[..]);

        let other_secret = compute_cookie(&[8u8; 32], &random).unwrap();
        assert_ne!(&first[..], &other_secret[..]);

        let other_random = compute_cookie(&secret, &[2u8; 32]).unwrap();
        assert_ne!(&first[..], &other_random[..]);
    }

    #[test]
    fn application_data_requires_establishment() {
        let mut server = Server::new(config(), certificate());
        let err = server.send_application_data(b"too early").unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)));
    }
}
