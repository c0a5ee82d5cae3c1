//! Pre-shared key lookup for the PSK cipher suites.

use std::fmt;

use zeroize::Zeroizing;

/// Key material store for the PSK suites (RFC 4279).
///
/// The engine never holds PSKs beyond the handshake that uses them. Both
/// sides of the lookup live on this trait since a single deployment often
/// plays both roles.
pub trait PskStore: fmt::Debug + Send + Sync {
    /// Client side: the identity and key to offer. The server's identity
    /// hint, when it sent one, may steer the choice. `None` means no
    /// usable key, which fails the handshake before anything is sent.
    fn client_identity(&self, hint: Option<&[u8]>) -> Option<(Vec<u8>, Zeroizing<Vec<u8>>)>;

    /// Server side: the key for an identity offered by a client. `None`
    /// aborts the handshake with an unknown-psk-identity alert.
    fn key_for_identity(&self, identity: &[u8]) -> Option<Zeroizing<Vec<u8>>>;

    /// Server side: an identity hint to announce in the ServerKeyExchange.
    /// `None` omits the message entirely for the plain PSK suites.
    fn identity_hint(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Single fixed identity/key pair, enough for tests and for deployments
/// with one provisioned credential per device.
pub struct StaticPskStore {
    identity: Vec<u8>,
    key: Zeroizing<Vec<u8>>,
}

impl StaticPskStore {
    pub fn new(identity: impl Into<Vec<u8>>, key: &[u8]) -> Self {
        StaticPskStore {
            identity: identity.into(),
            key: Zeroizing::new(key.to_vec()),
        }
    }
}

impl fmt::Debug for StaticPskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The key stays out of logs.
        f.debug_struct("StaticPskStore")
            .field("identity", &self.identity)
            .finish()
    }
}

impl PskStore for StaticPskStore {
    fn client_identity(&self, _hint: Option<&[u8]>) -> Option<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        Some((self.identity.clone(), self.key.clone()))
    }

    fn key_for_identity(&self, identity: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        if identity == self.identity.as_slice() {
            Some(self.key.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_store_matches_identity() {
        let store = StaticPskStore::new(&b"device-17"[..], b"secret");

        let (identity, key) = store.client_identity(None).unwrap();
        assert_eq!(identity, b"device-17");
        assert_eq!(key.as_slice(), b"secret");

        assert!(store.key_for_identity(b"device-17").is_some());
        assert!(store.key_for_identity(b"device-18").is_none());
    }

    #[test]
    fn debug_does_not_print_the_key() {
        let store = StaticPskStore::new(&b"id"[..], b"very secret");
        let rendered = format!("{:?}", store);
        assert!(!rendered.contains("very secret"));
    }
}
