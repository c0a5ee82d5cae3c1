#![no_main]

//! Fuzz target for DTLS packet handling.
//!
//! Feeds arbitrary byte sequences to both connection roles to find parsing
//! bugs, panics or other issues in the packet processing path.

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use std::time::Instant;

use scrim::{generate_self_signed_certificate, Client, Config, Output, Server};

fuzz_target!(|data: &[u8]| {
    let cert = match generate_self_signed_certificate() {
        Ok(c) => c,
        Err(_) => return, // Skip if certificate generation fails
    };

    let config = Arc::new(Config::default());

    // Test as server: servers accept packets from the start.
    {
        let mut server = Server::new(Arc::clone(&config), cert.clone());
        // Ignore errors - we're looking for panics, not handling errors
        let _ = server.handle_packet(data);
    }

    // Test as client: drain the initial ClientHello first so the input
    // lands on a client that is mid-handshake.
    {
        let mut client = Client::new(Arc::clone(&config), cert);
        let mut buf = vec![0u8; 4096];
        for _ in 0..10 {
            match client.poll_output(&mut buf, Instant::now()) {
                Output::Packet(_) => continue,
                _ => break,
            }
        }

        let _ = client.handle_packet(data);
    }
});
