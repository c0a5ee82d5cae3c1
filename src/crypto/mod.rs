//! Cryptographic backends for the handshake and the record layer.

mod aead;
mod key_exchange;
mod prf;
mod sign;

pub(crate) use aead::{Aad, AeadCipher, Iv, Nonce, AEAD_OVERHEAD, GCM_TAG_LEN};
pub(crate) use key_exchange::{ecdhe_psk_premaster, psk_premaster, EphemeralKey};
pub(crate) use prf::{
    extended_master_secret, hmac_sha256, key_expansion, master_secret, prf, security_context_id,
    transcript_hash, verify_data, KeyBlock,
};
pub(crate) use sign::{
    can_sign, peer_key_algorithm, subject_der, verify_signature, SigningKey,
};

pub use sign::CertVerifier;
