#![allow(unused)]

use std::sync::Arc;
use std::time::Instant;

use rcgen::{CertificateParams, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256};
use scrim::{
    generate_self_signed_certificate, Client, ClientAuth, Config, EndpointCertificate, Error,
    HandshakeState, HashAlgorithm, Output, PeerIdentity, Server, SignatureAlgorithm,
    SignatureAndHashAlgorithm,
};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pump(client: &mut Client, server: &mut Server, now: Instant) -> (bool, bool) {
    let mut client_connected = false;
    let mut server_connected = false;
    let mut buf = vec![0u8; 4096];

    loop {
        let mut progressed = false;

        loop {
            match client.poll_output(&mut buf, now) {
                Output::Packet(p) => {
                    server.handle_packet(p).expect("server handle_packet");
                    progressed = true;
                }
                Output::Connected => client_connected = true,
                Output::Timeout(_) => break,
                _ => {}
            }
        }
        loop {
            match server.poll_output(&mut buf, now) {
                Output::Packet(p) => {
                    client.handle_packet(p).expect("client handle_packet");
                    progressed = true;
                }
                Output::Connected => server_connected = true,
                Output::Timeout(_) => break,
                _ => {}
            }
        }

        if !progressed {
            return (client_connected, server_connected);
        }
    }
}

/// Drive until the server rejects a packet, returning its error.
fn pump_until_server_error(client: &mut Client, server: &mut Server, now: Instant) -> Error {
    let mut buf = vec![0u8; 4096];

    loop {
        let mut progressed = false;

        loop {
            match client.poll_output(&mut buf, now) {
                Output::Packet(p) => match server.handle_packet(p) {
                    Ok(()) => progressed = true,
                    Err(e) => return e,
                },
                Output::Timeout(_) => break,
                _ => {}
            }
        }
        loop {
            match server.poll_output(&mut buf, now) {
                Output::Packet(p) => {
                    client.handle_packet(p).expect("client handle_packet");
                    progressed = true;
                }
                Output::Timeout(_) => break,
                _ => {}
            }
        }

        assert!(progressed, "handshake stalled before the expected failure");
    }
}

#[test]
fn requested_client_certificate_is_verified() {
    init_log();

    let client_cert = generate_self_signed_certificate().unwrap();
    let client_fingerprint = client_cert.fingerprint();

    let mut client = Client::new(
        Arc::new(Config::builder().rng_seed(81).build()),
        client_cert,
    );
    let mut server = Server::new(
        Arc::new(
            Config::builder()
                .rng_seed(82)
                .client_auth(ClientAuth::Request)
                .build(),
        ),
        generate_self_signed_certificate().unwrap(),
    );

    let (client_connected, server_connected) = pump(&mut client, &mut server, Instant::now());
    assert!(client_connected && server_connected);

    // The client presented its certificate and proved the key via
    // CertificateVerify; the server session pins the identity.
    match server.peer_identity().expect("server peer identity") {
        PeerIdentity::Certificate { fingerprint, .. } => {
            assert_eq!(fingerprint, &client_fingerprint);
        }
        other => panic!("unexpected identity {:?}", other),
    }
}

#[test]
fn incompatible_request_yields_an_empty_chain() {
    init_log();

    // The server's request only admits SHA384/ECDSA credentials; the
    // client key signs SHA256/ECDSA. Nothing matches, so the client
    // declines with an empty chain, which Request-level policy accepts.
    let mut client = Client::new(
        Arc::new(Config::builder().rng_seed(83).build()),
        generate_self_signed_certificate().unwrap(),
    );
    let mut server = Server::new(
        Arc::new(
            Config::builder()
                .rng_seed(84)
                .client_auth(ClientAuth::Request)
                .signature_algorithms(vec![SignatureAndHashAlgorithm::new(
                    HashAlgorithm::SHA384,
                    SignatureAlgorithm::ECDSA,
                )])
                .build(),
        ),
        generate_self_signed_certificate().unwrap(),
    );

    let (client_connected, server_connected) = pump(&mut client, &mut server, Instant::now());
    assert!(client_connected && server_connected);
    assert_eq!(
        server.peer_identity().unwrap(),
        &PeerIdentity::Unauthenticated
    );
}

/// An identity whose KeyUsage extension permits key agreement only,
/// never digitalSignature.
fn key_agreement_only_certificate() -> EndpointCertificate {
    let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = CertificateParams::new(vec!["agreement-only.test".to_string()]);
    params.key_pair = Some(key_pair);
    params.key_usages = vec![KeyUsagePurpose::KeyAgreement];

    let cert = rcgen::Certificate::from_params(params).unwrap();
    EndpointCertificate::new(
        cert.serialize_der().unwrap(),
        cert.serialize_private_key_der(),
    )
}

#[test]
fn unfit_key_usage_yields_an_empty_chain() {
    init_log();

    // The request itself matches the client's key, but the certificate
    // cannot back a CertificateVerify. The client declines rather than
    // present a credential it cannot use.
    let mut client = Client::new(
        Arc::new(Config::builder().rng_seed(87).build()),
        key_agreement_only_certificate(),
    );
    let mut server = Server::new(
        Arc::new(
            Config::builder()
                .rng_seed(88)
                .client_auth(ClientAuth::Request)
                .build(),
        ),
        generate_self_signed_certificate().unwrap(),
    );

    let (client_connected, server_connected) = pump(&mut client, &mut server, Instant::now());
    assert!(client_connected && server_connected);
    assert_eq!(
        server.peer_identity().unwrap(),
        &PeerIdentity::Unauthenticated
    );
}

#[test]
fn required_client_certificate_missing_is_fatal() {
    init_log();

    // Same mismatch, but the policy requires authentication.
    let mut client = Client::new(
        Arc::new(Config::builder().rng_seed(85).build()),
        generate_self_signed_certificate().unwrap(),
    );
    let mut server = Server::new(
        Arc::new(
            Config::builder()
                .rng_seed(86)
                .client_auth(ClientAuth::Require)
                .signature_algorithms(vec![SignatureAndHashAlgorithm::new(
                    HashAlgorithm::SHA384,
                    SignatureAlgorithm::ECDSA,
                )])
                .build(),
        ),
        generate_self_signed_certificate().unwrap(),
    );

    let now = Instant::now();
    let err = pump_until_server_error(&mut client, &mut server, now);
    assert!(matches!(err, Error::HandshakeFailure(_)));
    assert!(!err.is_timeout());
    assert_eq!(server.state(), HandshakeState::Aborted);

    // The fatal alert terminates the client as well.
    let mut buf = vec![0u8; 4096];
    let mut alerted = false;
    loop {
        match server.poll_output(&mut buf, now) {
            Output::Packet(p) => {
                let err = client.handle_packet(p).expect_err("fatal alert");
                assert!(matches!(err, Error::PeerAlert(_)));
                alerted = true;
            }
            Output::Timeout(_) => break,
            _ => {}
        }
    }
    assert!(alerted);
    assert_eq!(client.state(), HandshakeState::Aborted);
}
