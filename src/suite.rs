use nom::number::complete::be_u16;
use nom::IResult;
use once_cell::sync::Lazy;
use tinyvec::ArrayVec;

use crate::message::{HashAlgorithm, SignatureAlgorithm, SignatureAndHashAlgorithm};

/// How a suite establishes its premaster secret.
///
/// `Static` exists for certificate-type compatibility decisions (fixed-DH
/// certificate types are never signing-capable); no shipped suite uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeKind {
    Psk,
    EcdhePsk,
    EcdheCertificate,
    Static,
}

impl KeyExchangeKind {
    pub fn uses_psk(&self) -> bool {
        matches!(self, KeyExchangeKind::Psk | KeyExchangeKind::EcdhePsk)
    }

    pub fn uses_ephemeral(&self) -> bool {
        matches!(
            self,
            KeyExchangeKind::EcdhePsk | KeyExchangeKind::EcdheCertificate
        )
    }

    pub fn requires_certificate(&self) -> bool {
        matches!(
            self,
            KeyExchangeKind::EcdheCertificate | KeyExchangeKind::Static
        )
    }
}

/// Cipher geometry for the record layer, sized from the suite registry.
///
/// `mac_key_len` is zero for the AEAD suites shipped here; a CBC+HMAC entry
/// would carry its HMAC key length in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherParams {
    pub enc_key_len: usize,
    pub fixed_iv_len: usize,
    pub explicit_nonce_len: usize,
    pub tag_len: usize,
    pub mac_key_len: usize,
}

const AES_128_GCM: CipherParams = CipherParams {
    enc_key_len: 16,
    fixed_iv_len: 4,
    explicit_nonce_len: 8,
    tag_len: 16,
    mac_key_len: 0,
};

const AES_256_GCM: CipherParams = CipherParams {
    enc_key_len: 32,
    fixed_iv_len: 4,
    explicit_nonce_len: 8,
    tag_len: 16,
    mac_key_len: 0,
};

/// The supported cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum CipherSuite {
    /// TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
    ECDHE_ECDSA_AES128_GCM_SHA256,
    /// TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
    ECDHE_ECDSA_AES256_GCM_SHA384,
    /// TLS_PSK_WITH_AES_128_GCM_SHA256
    PSK_AES128_GCM_SHA256,
    /// TLS_ECDHE_PSK_WITH_AES_128_GCM_SHA256
    ECDHE_PSK_AES128_GCM_SHA256,
    Unknown(u16),
}

impl Default for CipherSuite {
    fn default() -> Self {
        CipherSuite::Unknown(0)
    }
}

impl CipherSuite {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0xC02B => CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256,
            0xC02C => CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384,
            0x00A8 => CipherSuite::PSK_AES128_GCM_SHA256,
            0xD001 => CipherSuite::ECDHE_PSK_AES128_GCM_SHA256,
            _ => CipherSuite::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256 => 0xC02B,
            CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384 => 0xC02C,
            CipherSuite::PSK_AES128_GCM_SHA256 => 0x00A8,
            CipherSuite::ECDHE_PSK_AES128_GCM_SHA256 => 0xD001,
            CipherSuite::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], CipherSuite> {
        let (input, value) = be_u16(input)?;
        Ok((input, CipherSuite::from_u16(value)))
    }

    /// All suites this build can actually run, in default preference order.
    pub fn all() -> ArrayVec<[CipherSuite; 8]> {
        let mut suites = ArrayVec::default();
        suites.push(CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256);
        suites.push(CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384);
        suites.push(CipherSuite::ECDHE_PSK_AES128_GCM_SHA256);
        suites.push(CipherSuite::PSK_AES128_GCM_SHA256);
        suites
    }

    pub fn key_exchange(&self) -> KeyExchangeKind {
        match self {
            CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256
            | CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384 => KeyExchangeKind::EcdheCertificate,
            CipherSuite::PSK_AES128_GCM_SHA256 => KeyExchangeKind::Psk,
            CipherSuite::ECDHE_PSK_AES128_GCM_SHA256 => KeyExchangeKind::EcdhePsk,
            CipherSuite::Unknown(_) => KeyExchangeKind::Static,
        }
    }

    /// Hash used by the PRF, the transcript and the Finished computation.
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        match self {
            CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384 => HashAlgorithm::SHA384,
            _ => HashAlgorithm::SHA256,
        }
    }

    pub fn params(&self) -> CipherParams {
        match self {
            CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384 => AES_256_GCM,
            _ => AES_128_GCM,
        }
    }

    /// Length of the RFC 5246 key block: MAC keys, write keys and fixed IVs
    /// for both directions.
    pub fn key_block_len(&self) -> usize {
        let p = self.params();
        2 * (p.mac_key_len + p.enc_key_len + p.fixed_iv_len)
    }

    pub fn verify_data_length(&self) -> usize {
        12
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, CipherSuite::Unknown(_))
    }
}

/// Elliptic curve groups by IANA number.
///
/// The table is wider than what we can run: `is_usable` marks the groups
/// with a key-exchange backend. Known-but-unusable groups exist so a peer
/// proposing one gets an illegal-parameter rejection rather than a parse
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedGroup {
    Secp256r1,
    Secp384r1,
    Secp521r1,
    X25519,
    X448,
    Unknown(u16),
}

impl Default for NamedGroup {
    fn default() -> Self {
        NamedGroup::Unknown(0)
    }
}

impl NamedGroup {
    pub fn from_u16(value: u16) -> Self {
        match value {
            23 => NamedGroup::Secp256r1,
            24 => NamedGroup::Secp384r1,
            25 => NamedGroup::Secp521r1,
            29 => NamedGroup::X25519,
            30 => NamedGroup::X448,
            _ => NamedGroup::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            NamedGroup::Secp256r1 => 23,
            NamedGroup::Secp384r1 => 24,
            NamedGroup::Secp521r1 => 25,
            NamedGroup::X25519 => 29,
            NamedGroup::X448 => 30,
            NamedGroup::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], NamedGroup> {
        let (input, value) = be_u16(input)?;
        Ok((input, NamedGroup::from_u16(value)))
    }

    /// True when an ECDH backend exists for the group.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            NamedGroup::Secp256r1 | NamedGroup::Secp384r1 | NamedGroup::X25519
        )
    }

    /// Length of the encoded public point: uncompressed SEC1 for the NIST
    /// curves, raw u-coordinate for x25519.
    pub fn point_len(&self) -> usize {
        match self {
            NamedGroup::Secp256r1 => 65,
            NamedGroup::Secp384r1 => 97,
            NamedGroup::X25519 => 32,
            _ => 0,
        }
    }
}

/// Groups offered and accepted by default, preference order.
pub static DEFAULT_GROUPS: Lazy<Vec<NamedGroup>> = Lazy::new(|| {
    vec![
        NamedGroup::Secp256r1,
        NamedGroup::X25519,
        NamedGroup::Secp384r1,
    ]
});

/// Locally preferred signature/hash pairs, preference order.
///
/// ECDSA only: that is the extent of the signing backends shipped. This
/// list is what goes out in the hello and certificate request; the
/// peer's answer is picked per credential in
/// `message::certificate_request::select_signature_algorithm`.
pub static DEFAULT_SIGNATURE_ALGORITHMS: Lazy<Vec<SignatureAndHashAlgorithm>> = Lazy::new(|| {
    vec![
        SignatureAndHashAlgorithm::new(HashAlgorithm::SHA256, SignatureAlgorithm::ECDSA),
        SignatureAndHashAlgorithm::new(HashAlgorithm::SHA384, SignatureAlgorithm::ECDSA),
    ]
});
