#![allow(unused)]

use std::sync::Arc;
use std::time::Instant;

use scrim::{
    generate_self_signed_certificate, Client, Config, EndpointCertificate, HandshakeState, Output,
    PeerIdentity, Server, SessionContext,
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

/// Full handshake between fresh peers; returns both sides' session
/// exports and the certificates for the follow-up connection.
fn first_connection(
    seed: u64,
) -> (
    Vec<u8>,
    Vec<u8>,
    EndpointCertificate,
    EndpointCertificate,
) {
    let client_cert = generate_self_signed_certificate().unwrap();
    let server_cert = generate_self_signed_certificate().unwrap();

    let mut client = Client::new(
        Arc::new(Config::builder().rng_seed(seed).build()),
        client_cert.clone(),
    );
    let mut server = Server::new(
        Arc::new(Config::builder().rng_seed(seed + 1).build()),
        server_cert.clone(),
    );

    let (client_connected, server_connected) = pump(&mut client, &mut server, Instant::now());
    assert!(client_connected && server_connected);

    (
        client.session().unwrap().export(),
        server.session().unwrap().export(),
        client_cert,
        server_cert,
    )
}

#[test]
fn abbreviated_handshake_after_export_import() {
    init_log();

    let (client_export, server_export, client_cert, server_cert) = first_connection(31);

    let offered = SessionContext::import(&client_export).unwrap();
    let held = SessionContext::import(&server_export).unwrap();
    let original_id = offered.session_id();
    assert!(!original_id.is_empty());

    let mut client = Client::with_session(
        Arc::new(Config::builder().rng_seed(33).build()),
        client_cert,
        offered,
    );
    let mut server = Server::with_session(
        Arc::new(Config::builder().rng_seed(34).build()),
        server_cert,
        held,
    );

    let (client_connected, server_connected) = pump(&mut client, &mut server, Instant::now());
    assert!(client_connected && server_connected);
    assert_eq!(client.state(), HandshakeState::Established);
    assert_eq!(server.state(), HandshakeState::Established);

    // A full handshake assigns a fresh random id; keeping the old one is
    // the mark of the abbreviated path.
    assert_eq!(client.session().unwrap().session_id(), original_id);
    assert_eq!(server.session().unwrap().session_id(), original_id);

    // The peer identity rides along from the original handshake even
    // though no Certificate message flew this time.
    assert!(matches!(
        client.peer_identity().unwrap(),
        PeerIdentity::Certificate { .. }
    ));
}

#[test]
fn resumed_connection_changes_the_security_context() {
    init_log();

    let (client_export, server_export, client_cert, server_cert) = first_connection(41);

    let old_id = SessionContext::import(&client_export)
        .unwrap()
        .security_context_id(1)
        .unwrap();

    let mut client = Client::with_session(
        Arc::new(Config::builder().rng_seed(43).build()),
        client_cert,
        SessionContext::import(&client_export).unwrap(),
    );
    let mut server = Server::with_session(
        Arc::new(Config::builder().rng_seed(44).build()),
        server_cert,
        SessionContext::import(&server_export).unwrap(),
    );
    pump(&mut client, &mut server, Instant::now());

    let client_id = client.session().unwrap().security_context_id(1).unwrap();
    let server_id = server.session().unwrap().security_context_id(1).unwrap();

    // Both ends of the new connection agree, and fresh hello randoms
    // separate it from the original connection.
    assert_eq!(client_id, server_id);
    assert_ne!(client_id, old_id);
}

#[test]
fn server_without_the_session_runs_a_full_handshake() {
    init_log();

    let (client_export, _, client_cert, server_cert) = first_connection(51);
    let offered = SessionContext::import(&client_export).unwrap();
    let original_id = offered.session_id();

    // This server never saw the session.
    let mut client = Client::with_session(
        Arc::new(Config::builder().rng_seed(53).build()),
        client_cert,
        offered,
    );
    let mut server = Server::new(
        Arc::new(Config::builder().rng_seed(54).build()),
        server_cert,
    );

    let (client_connected, server_connected) = pump(&mut client, &mut server, Instant::now());
    assert!(client_connected && server_connected);
    assert_ne!(client.session().unwrap().session_id(), original_id);
}

#[test]
fn resumption_disabled_falls_back_to_full_handshake() {
    init_log();

    let (client_export, server_export, client_cert, server_cert) = first_connection(61);
    let original_id = SessionContext::import(&client_export).unwrap().session_id();

    // The client is configured not to resume, so the offer never goes out.
    let mut client = Client::with_session(
        Arc::new(
            Config::builder()
                .rng_seed(63)
                .session_resumption(false)
                .build(),
        ),
        client_cert,
        SessionContext::import(&client_export).unwrap(),
    );
    let mut server = Server::with_session(
        Arc::new(Config::builder().rng_seed(64).build()),
        server_cert,
        SessionContext::import(&server_export).unwrap(),
    );

    let (client_connected, server_connected) = pump(&mut client, &mut server, Instant::now());
    assert!(client_connected && server_connected);
    assert_ne!(client.session().unwrap().session_id(), original_id);
}
