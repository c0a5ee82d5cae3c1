use std::sync::Arc;
use std::time::Duration;

use crate::crypto::CertVerifier;
use crate::message::SignatureAndHashAlgorithm;
use crate::psk::PskStore;
use crate::suite::{CipherSuite, NamedGroup, DEFAULT_GROUPS, DEFAULT_SIGNATURE_ALGORITHMS};

/// Client certificate policy for servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    /// Never ask for a client certificate.
    #[default]
    None,
    /// Send a CertificateRequest but accept an empty reply.
    Request,
    /// Send a CertificateRequest and fail the handshake if the client
    /// does not present a certificate.
    Require,
}

/// DTLS configuration
#[derive(Clone)]
pub struct Config {
    mtu: usize,
    max_queue_rx: usize,
    max_queue_tx: usize,
    flight_start_rto: Duration,
    flight_retries: usize,
    handshake_timeout: Duration,
    epoch_grace: Duration,
    cipher_suites: Vec<CipherSuite>,
    named_groups: Vec<NamedGroup>,
    signature_algorithms: Vec<SignatureAndHashAlgorithm>,
    client_auth: ClientAuth,
    cookie_exchange: bool,
    session_resumption: bool,
    with_extended_master_secret: bool,
    psk_store: Option<Arc<dyn PskStore>>,
    cert_verifier: Option<Arc<dyn CertVerifier>>,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            mtu: 1150,
            max_queue_rx: 30,
            max_queue_tx: 10,
            flight_start_rto: Duration::from_secs(1),
            flight_retries: 4,
            handshake_timeout: Duration::from_secs(40),
            epoch_grace: Duration::from_secs(5),
            cipher_suites: CipherSuite::all().to_vec(),
            named_groups: DEFAULT_GROUPS.clone(),
            signature_algorithms: DEFAULT_SIGNATURE_ALGORITHMS.clone(),
            client_auth: ClientAuth::None,
            cookie_exchange: true,
            session_resumption: true,
            with_extended_master_secret: true,
            psk_store: None,
            cert_verifier: None,
            rng_seed: None,
        }
    }

    /// Max transmission unit.
    ///
    /// The largest size UDP packets we will produce.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Max amount of incoming packets to buffer before rejecting more input.
    #[inline(always)]
    pub fn max_queue_rx(&self) -> usize {
        self.max_queue_rx
    }

    /// Max amount of outgoing packets to buffer.
    #[inline(always)]
    pub fn max_queue_tx(&self) -> usize {
        self.max_queue_tx
    }

    /// Time of first retry.
    ///
    /// Every flight restarts with this value.
    /// Doubled for every retry with a ±25% jitter.
    #[inline(always)]
    pub fn flight_start_rto(&self) -> Duration {
        self.flight_start_rto
    }

    /// Max number of retries per flight.
    #[inline(always)]
    pub fn flight_retries(&self) -> usize {
        self.flight_retries
    }

    /// Timeout for the entire handshake, regardless of flights.
    #[inline(always)]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// How long records from the previous read epoch stay acceptable after
    /// a key change.
    ///
    /// Covers the peer's retransmissions that were in flight when the new
    /// epoch took effect.
    #[inline(always)]
    pub fn epoch_grace(&self) -> Duration {
        self.epoch_grace
    }

    /// Cipher suites offered (client) or accepted (server), in preference
    /// order.
    #[inline(always)]
    pub fn cipher_suites(&self) -> &[CipherSuite] {
        &self.cipher_suites
    }

    /// Elliptic curve groups for ECDHE, in preference order.
    #[inline(always)]
    pub fn named_groups(&self) -> &[NamedGroup] {
        &self.named_groups
    }

    /// Signature and hash algorithm pairs for certificate signatures, in
    /// preference order.
    #[inline(always)]
    pub fn signature_algorithms(&self) -> &[SignatureAndHashAlgorithm] {
        &self.signature_algorithms
    }

    /// For a server, whether to request a client certificate.
    #[inline(always)]
    pub fn client_auth(&self) -> ClientAuth {
        self.client_auth
    }

    /// Whether a server demands a HelloVerifyRequest round trip before
    /// allocating handshake state.
    #[inline(always)]
    pub fn cookie_exchange(&self) -> bool {
        self.cookie_exchange
    }

    /// Whether to offer (client) or accept (server) abbreviated handshakes
    /// from a saved session.
    #[inline(always)]
    pub fn session_resumption(&self) -> bool {
        self.session_resumption
    }

    /// Whether to enable Extended Master Secret extension (rfc7627).
    #[inline(always)]
    pub fn with_extended_master_secret(&self) -> bool {
        self.with_extended_master_secret
    }

    /// Pre-shared key lookup, required for the PSK suites.
    #[inline(always)]
    pub fn psk_store(&self) -> Option<&dyn PskStore> {
        self.psk_store.as_deref()
    }

    /// Certificate chain validation hook.
    ///
    /// Without one, peer certificates are accepted as presented and only
    /// proof of key possession is checked.
    #[inline(always)]
    pub fn cert_verifier(&self) -> Option<&dyn CertVerifier> {
        self.cert_verifier.as_deref()
    }

    /// Seed for deterministic randomness in tests.
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

/// Builder for DTLS configuration.
pub struct ConfigBuilder {
    mtu: usize,
    max_queue_rx: usize,
    max_queue_tx: usize,
    flight_start_rto: Duration,
    flight_retries: usize,
    handshake_timeout: Duration,
    epoch_grace: Duration,
    cipher_suites: Vec<CipherSuite>,
    named_groups: Vec<NamedGroup>,
    signature_algorithms: Vec<SignatureAndHashAlgorithm>,
    client_auth: ClientAuth,
    cookie_exchange: bool,
    session_resumption: bool,
    with_extended_master_secret: bool,
    psk_store: Option<Arc<dyn PskStore>>,
    cert_verifier: Option<Arc<dyn CertVerifier>>,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the max transmission unit (MTU).
    ///
    /// The largest size UDP packets we will produce.
    /// Defaults to 1150.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the max amount of incoming packets to buffer before rejecting more input.
    ///
    /// Defaults to 30.
    pub fn max_queue_rx(mut self, max_queue_rx: usize) -> Self {
        self.max_queue_rx = max_queue_rx;
        self
    }

    /// Set the max amount of outgoing packets to buffer.
    ///
    /// Defaults to 10.
    pub fn max_queue_tx(mut self, max_queue_tx: usize) -> Self {
        self.max_queue_tx = max_queue_tx;
        self
    }

    /// Set the time of first retry.
    ///
    /// Every flight restarts with this value.
    /// Doubled for every retry with a ±25% jitter.
    /// Defaults to 1 second.
    pub fn flight_start_rto(mut self, rto: Duration) -> Self {
        self.flight_start_rto = rto;
        self
    }

    /// Set the max number of retries per flight.
    ///
    /// Defaults to 4.
    pub fn flight_retries(mut self, retries: usize) -> Self {
        self.flight_retries = retries;
        self
    }

    /// Set the timeout for the entire handshake, regardless of flights.
    ///
    /// Defaults to 40 seconds.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set how long the previous read epoch stays acceptable after a key
    /// change.
    ///
    /// Defaults to 5 seconds.
    pub fn epoch_grace(mut self, grace: Duration) -> Self {
        self.epoch_grace = grace;
        self
    }

    /// Set the cipher suites to offer or accept, in preference order.
    ///
    /// Defaults to all supported suites, certificate suites first.
    pub fn cipher_suites(mut self, suites: Vec<CipherSuite>) -> Self {
        self.cipher_suites = suites;
        self
    }

    /// Set the elliptic curve groups for ECDHE, in preference order.
    ///
    /// Defaults to secp256r1, x25519, secp384r1.
    pub fn named_groups(mut self, groups: Vec<NamedGroup>) -> Self {
        self.named_groups = groups;
        self
    }

    /// Set the signature algorithm pairs to advertise, in preference order.
    ///
    /// Defaults to ECDSA with SHA-256 and SHA-384.
    pub fn signature_algorithms(mut self, algorithms: Vec<SignatureAndHashAlgorithm>) -> Self {
        self.signature_algorithms = algorithms;
        self
    }

    /// Set the client certificate policy (for servers).
    ///
    /// Defaults to `ClientAuth::None`.
    pub fn client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = client_auth;
        self
    }

    /// Set whether a server performs the HelloVerifyRequest cookie exchange.
    ///
    /// Defaults to true.
    pub fn cookie_exchange(mut self, enabled: bool) -> Self {
        self.cookie_exchange = enabled;
        self
    }

    /// Set whether to offer or accept abbreviated handshakes.
    ///
    /// Defaults to true.
    pub fn session_resumption(mut self, enabled: bool) -> Self {
        self.session_resumption = enabled;
        self
    }

    /// Set whether to enable Extended Master Secret extension (rfc7627)
    ///
    /// Defaults to true.
    pub fn with_extended_master_secret(mut self, require: bool) -> Self {
        self.with_extended_master_secret = require;
        self
    }

    /// Set the pre-shared key store.
    ///
    /// Required for the PSK cipher suites. Defaults to none, which limits
    /// the connection to certificate suites.
    pub fn psk_store(mut self, store: impl PskStore + 'static) -> Self {
        self.psk_store = Some(Arc::new(store));
        self
    }

    /// Set the certificate chain verifier.
    ///
    /// Defaults to none: peer certificates are then taken at face value and
    /// only possession of the matching private key is proven. The embedder
    /// is expected to pin the peer fingerprint instead.
    pub fn cert_verifier(mut self, verifier: impl CertVerifier + 'static) -> Self {
        self.cert_verifier = Some(Arc::new(verifier));
        self
    }

    /// Seed the internal RNG for reproducible runs.
    ///
    /// Only meant for tests. Defaults to unseeded.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Config {
        Config {
            mtu: self.mtu,
            max_queue_rx: self.max_queue_rx,
            max_queue_tx: self.max_queue_tx,
            flight_start_rto: self.flight_start_rto,
            flight_retries: self.flight_retries,
            handshake_timeout: self.handshake_timeout,
            epoch_grace: self.epoch_grace,
            cipher_suites: self.cipher_suites,
            named_groups: self.named_groups,
            signature_algorithms: self.signature_algorithms,
            client_auth: self.client_auth,
            cookie_exchange: self.cookie_exchange,
            session_resumption: self.session_resumption,
            with_extended_master_secret: self.with_extended_master_secret,
            psk_store: self.psk_store,
            cert_verifier: self.cert_verifier,
            rng_seed: self.rng_seed,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}
