//! Ephemeral ECDH on the negotiated named group, plus the premaster
//! layouts for the PSK suites (RFC 4279/5489).

use elliptic_curve::sec1::ToEncodedPoint;
use p256::ecdh::EphemeralSecret as P256EphemeralSecret;
use p384::ecdh::EphemeralSecret as P384EphemeralSecret;
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret as X25519EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

use crate::suite::NamedGroup;
use crate::Error;

/// Ephemeral key-exchange material for one handshake.
///
/// The private half is consumed at shared-secret derivation and never
/// serialized. The NIST backends zeroize their scalars on drop, x25519
/// takes the secret by value.
pub(crate) struct EphemeralKey {
    group: NamedGroup,
    public_key: Vec<u8>,
    secret: Option<Secret>,
}

enum Secret {
    P256(P256EphemeralSecret),
    P384(P384EphemeralSecret),
    X25519(X25519EphemeralSecret),
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("group", &self.group)
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

impl EphemeralKey {
    /// Generate a fresh keypair on `group`. Ephemeral keys always draw
    /// from OS randomness, never from the seedable test RNG.
    pub(crate) fn generate(group: NamedGroup) -> Result<EphemeralKey, Error> {
        let (secret, public_key) = match group {
            NamedGroup::Secp256r1 => {
                let secret = P256EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (Secret::P256(secret), public)
            }
            NamedGroup::Secp384r1 => {
                let secret = P384EphemeralSecret::random(&mut OsRng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (Secret::P384(secret), public)
            }
            NamedGroup::X25519 => {
                let secret = X25519EphemeralSecret::random_from_rng(OsRng);
                let public = X25519PublicKey::from(&secret).as_bytes().to_vec();
                (Secret::X25519(secret), public)
            }
            _ => {
                return Err(Error::IllegalParameter(format!(
                    "no key exchange backend for {:?}",
                    group
                )))
            }
        };

        Ok(EphemeralKey {
            group,
            public_key,
            secret: Some(secret),
        })
    }

    pub(crate) fn group(&self) -> NamedGroup {
        self.group
    }

    /// Public half in the group's wire format: uncompressed SEC1 point
    /// for the NIST curves, raw 32 bytes for x25519.
    pub(crate) fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub(crate) fn is_consumed(&self) -> bool {
        self.secret.is_none()
    }

    /// Derive the shared secret against the peer's public half. This
    /// consumes the private key, also when derivation fails.
    pub(crate) fn diffie_hellman(&mut self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let secret = self
            .secret
            .take()
            .ok_or_else(|| Error::CryptoError("ephemeral key already consumed".into()))?;

        match secret {
            Secret::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| Error::IllegalParameter("invalid P-256 public key".into()))?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            Secret::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| Error::IllegalParameter("invalid P-384 public key".into()))?;
                let shared = secret.diffie_hellman(&peer);
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            Secret::X25519(secret) => {
                let peer: [u8; 32] = peer_public
                    .try_into()
                    .map_err(|_| Error::IllegalParameter("invalid x25519 public key".into()))?;
                let shared = secret.diffie_hellman(&X25519PublicKey::from(peer));
                if !shared.was_contributory() {
                    return Err(Error::IllegalParameter(
                        "non-contributory x25519 exchange".into(),
                    ));
                }
                Ok(Zeroizing::new(shared.as_bytes().to_vec()))
            }
        }
    }
}

/// RFC 4279 §2: other_secret is N zero bytes where N is the PSK length.
pub(crate) fn psk_premaster(psk: &[u8]) -> Zeroizing<Vec<u8>> {
    let n = psk.len();
    let mut out = Zeroizing::new(Vec::with_capacity(4 + 2 * n));
    out.extend_from_slice(&(n as u16).to_be_bytes());
    out.extend(std::iter::repeat(0).take(n));
    out.extend_from_slice(&(n as u16).to_be_bytes());
    out.extend_from_slice(psk);
    out
}

/// RFC 5489 §2: the ECDH shared secret takes the other_secret slot.
pub(crate) fn ecdhe_psk_premaster(shared: &[u8], psk: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(4 + shared.len() + psk.len()));
    out.extend_from_slice(&(shared.len() as u16).to_be_bytes());
    out.extend_from_slice(shared);
    out.extend_from_slice(&(psk.len() as u16).to_be_bytes());
    out.extend_from_slice(psk);
    out
}
