#![allow(unused)]

use std::sync::Arc;
use std::time::Instant;

use scrim::{
    generate_self_signed_certificate, CipherSuite, Client, Config, HandshakeState, Output,
    PeerIdentity, Server,
};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Default)]
struct Exchange {
    client_connected: bool,
    server_connected: bool,
    client_received: Vec<Vec<u8>>,
    server_received: Vec<Vec<u8>>,
}

/// Shuttle datagrams between the peers until neither produces any more.
fn pump(client: &mut Client, server: &mut Server, now: Instant) -> Exchange {
    let mut out = Exchange::default();
    let mut buf = vec![0u8; 4096];

    loop {
        let mut progressed = false;

        loop {
            match client.poll_output(&mut buf, now) {
                Output::Packet(p) => {
                    server.handle_packet(p).expect("server handle_packet");
                    progressed = true;
                }
                Output::ApplicationData(d) => out.client_received.push(d.to_vec()),
                Output::Connected => out.client_connected = true,
                Output::Timeout(_) => break,
            }
        }

        loop {
            match server.poll_output(&mut buf, now) {
                Output::Packet(p) => {
                    client.handle_packet(p).expect("client handle_packet");
                    progressed = true;
                }
                Output::ApplicationData(d) => out.server_received.push(d.to_vec()),
                Output::Connected => out.server_connected = true,
                Output::Timeout(_) => break,
            }
        }

        if !progressed {
            return out;
        }
    }
}

fn established_pair(
    config_client: Arc<Config>,
    config_server: Arc<Config>,
) -> (Client, Server, Vec<u8>) {
    let client_cert = generate_self_signed_certificate().expect("gen client cert");
    let server_cert = generate_self_signed_certificate().expect("gen server cert");
    let server_fingerprint = server_cert.fingerprint().to_vec();

    let mut client = Client::new(config_client, client_cert);
    let mut server = Server::new(config_server, server_cert);

    let exchange = pump(&mut client, &mut server, Instant::now());
    assert!(exchange.client_connected, "client must emit Connected");
    assert!(exchange.server_connected, "server must emit Connected");

    (client, server, server_fingerprint)
}

#[test]
fn full_handshake_with_cookie_exchange() {
    init_log();

    let config_client = Arc::new(Config::builder().rng_seed(1).build());
    let config_server = Arc::new(Config::builder().rng_seed(2).build());
    let (client, server, server_fingerprint) = established_pair(config_client, config_server);

    assert_eq!(client.state(), HandshakeState::Established);
    assert_eq!(server.state(), HandshakeState::Established);

    let client_session = client.session().expect("client session");
    let server_session = server.session().expect("server session");
    assert_eq!(
        client_session.cipher_suite(),
        server_session.cipher_suite()
    );

    // The client authenticated the server certificate; nothing was asked
    // of the client.
    match client.peer_identity().expect("client peer identity") {
        PeerIdentity::Certificate { fingerprint, .. } => {
            assert_eq!(&fingerprint[..], &server_fingerprint[..]);
        }
        other => panic!("unexpected identity {:?}", other),
    }
    assert_eq!(
        server.peer_identity().expect("server peer identity"),
        &PeerIdentity::Unauthenticated
    );
}

#[test]
fn security_context_ids_agree() {
    init_log();

    let config_client = Arc::new(Config::builder().rng_seed(3).build());
    let config_server = Arc::new(Config::builder().rng_seed(4).build());
    let (client, server, _) = established_pair(config_client, config_server);

    let client_session = client.session().unwrap();
    let server_session = server.session().unwrap();

    // Derived independently, equal for a given epoch, distinct between
    // epochs.
    let client_id = client_session.security_context_id(1).unwrap();
    let server_id = server_session.security_context_id(1).unwrap();
    assert_eq!(client_id, server_id);
    assert_ne!(client_id, client_session.security_context_id(2).unwrap());
}

#[test]
fn server_preference_picks_the_suite() {
    init_log();

    // The client would prefer AES128; the server is configured the other
    // way around and has the pick.
    let config_client = Arc::new(Config::builder().rng_seed(5).build());
    let config_server = Arc::new(
        Config::builder()
            .rng_seed(6)
            .cipher_suites(vec![
                CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384,
                CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256,
            ])
            .build(),
    );
    let (client, _, _) = established_pair(config_client, config_server);

    assert_eq!(
        client.session().unwrap().cipher_suite(),
        CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384
    );
}

#[test]
fn application_data_both_ways() {
    init_log();

    let config_client = Arc::new(Config::builder().rng_seed(7).build());
    let config_server = Arc::new(Config::builder().rng_seed(8).build());
    let (mut client, mut server, _) = established_pair(config_client, config_server);

    client
        .send_application_data(b"from the client")
        .expect("client send");
    server
        .send_application_data(b"from the server")
        .expect("server send");

    let exchange = pump(&mut client, &mut server, Instant::now());
    assert_eq!(exchange.server_received, vec![b"from the client".to_vec()]);
    assert_eq!(exchange.client_received, vec![b"from the server".to_vec()]);
}

#[test]
fn replayed_application_record_is_dropped() {
    init_log();

    let config_client = Arc::new(Config::builder().rng_seed(9).build());
    let config_server = Arc::new(Config::builder().rng_seed(10).build());
    let (mut client, mut server, _) = established_pair(config_client, config_server);

    client.send_application_data(b"once only").expect("send");

    let mut buf = vec![0u8; 4096];
    let now = Instant::now();
    let Output::Packet(p) = client.poll_output(&mut buf, now) else {
        panic!("expected the protected record");
    };
    let datagram = p.to_vec();

    // The duplicate trips the replay window, which is not an error.
    server.handle_packet(&datagram).expect("first delivery");
    server.handle_packet(&datagram).expect("replayed delivery");

    let mut received = Vec::new();
    loop {
        match server.poll_output(&mut buf, now) {
            Output::ApplicationData(d) => received.push(d.to_vec()),
            Output::Timeout(_) => break,
            _ => {}
        }
    }
    assert_eq!(received, vec![b"once only".to_vec()]);
    assert_eq!(server.state(), HandshakeState::Established);
}

#[test]
fn unknown_epoch_record_is_dropped_silently() {
    init_log();

    let config_client = Arc::new(Config::builder().rng_seed(11).build());
    let config_server = Arc::new(Config::builder().rng_seed(12).build());
    let (mut client, mut server, _) = established_pair(config_client, config_server);

    // Well-formed header, nonsense epoch. Must not terminate anything.
    let mut record = vec![
        23, 0xfe, 0xfd, // application data, DTLS 1.2
        0x00, 0x07, // epoch 7
        0, 0, 0, 0, 0, 1, // sequence
        0x00, 0x05, // length
    ];
    record.extend_from_slice(&[1, 2, 3, 4, 5]);

    client.handle_packet(&record).expect("client drop");
    server.handle_packet(&record).expect("server drop");
    assert_eq!(client.state(), HandshakeState::Established);
    assert_eq!(server.state(), HandshakeState::Established);
}

#[test]
fn duplicated_client_hello_triggers_a_resend() {
    init_log();

    let client_cert = generate_self_signed_certificate().unwrap();
    let server_cert = generate_self_signed_certificate().unwrap();

    let mut client = Client::new(Arc::new(Config::builder().rng_seed(13).build()), client_cert);
    let mut server = Server::new(Arc::new(Config::builder().rng_seed(14).build()), server_cert);

    let mut buf = vec![0u8; 4096];
    let now = Instant::now();

    let Output::Packet(p) = client.poll_output(&mut buf, now) else {
        panic!("expected the initial ClientHello");
    };
    let hello = p.to_vec();

    // A duplicate hello means the client never saw the verify request;
    // the server answers it again instead of staying silent.
    server.handle_packet(&hello).expect("first hello");
    server.handle_packet(&hello).expect("duplicate hello");

    let mut answers = 0;
    loop {
        match server.poll_output(&mut buf, now) {
            Output::Packet(_) => answers += 1,
            Output::Timeout(_) => break,
            _ => {}
        }
    }
    assert_eq!(answers, 2, "one HelloVerifyRequest per hello received");

    // Single delivery from here on still completes the handshake.
    let exchange = pump(&mut client, &mut server, now);
    assert!(exchange.client_connected);
    assert!(exchange.server_connected);
    assert_eq!(client.state(), HandshakeState::Established);
    assert_eq!(server.state(), HandshakeState::Established);
}

#[test]
fn small_mtu_fragments_and_reassembles() {
    init_log();

    // A 300 byte MTU forces the Certificate message into fragments. The
    // handshake completes all the same and data still flows.
    let config_client = Arc::new(Config::builder().rng_seed(17).mtu(300).build());
    let config_server = Arc::new(Config::builder().rng_seed(18).mtu(300).build());
    let (mut client, mut server, _) = established_pair(config_client, config_server);

    client.send_application_data(b"fits in one record").unwrap();
    let exchange = pump(&mut client, &mut server, Instant::now());
    assert_eq!(exchange.server_received, vec![b"fits in one record".to_vec()]);
}

#[test]
fn close_notify_terminates_the_peer() {
    init_log();

    let config_client = Arc::new(Config::builder().rng_seed(15).build());
    let config_server = Arc::new(Config::builder().rng_seed(16).build());
    let (mut client, mut server, _) = established_pair(config_client, config_server);

    client.close();
    assert_eq!(client.state(), HandshakeState::Aborted);

    let mut buf = vec![0u8; 4096];
    let Output::Packet(p) = client.poll_output(&mut buf, Instant::now()) else {
        panic!("expected the close_notify datagram");
    };

    let err = server.handle_packet(p).expect_err("peer closed");
    assert_eq!(err, scrim::Error::PeerClosed);
    assert!(!err.is_timeout());
    assert_eq!(server.state(), HandshakeState::Aborted);
}
