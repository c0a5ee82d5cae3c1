//! TLS 1.2 PRF (RFC 5246 section 5) and the key derivations built on it.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};
use zeroize::Zeroizing;

use crate::message::HashAlgorithm;
use crate::suite::CipherSuite;
use crate::Error;

const MASTER_SECRET_LEN: usize = 48;
const VERIFY_DATA_LEN: usize = 12;
const SECURITY_CONTEXT_ID_LEN: usize = 16;

/// PRF(secret, label, seed) = P_hash(secret, label + seed).
///
/// `seed` is the bare seed. The label is prepended here.
pub(crate) fn prf(
    secret: &[u8],
    label: &str,
    seed: &[u8],
    output_len: usize,
    hash: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    // Labels are protocol constants.
    assert!(label.is_ascii());

    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label.as_bytes());
    full_seed.extend_from_slice(seed);

    let mut out = Zeroizing::new(vec![0; output_len]);
    match hash {
        HashAlgorithm::SHA256 => p_hash_sha256(secret, &full_seed, &mut out)?,
        HashAlgorithm::SHA384 => p_hash_sha384(secret, &full_seed, &mut out)?,
        _ => {
            return Err(Error::CryptoError(format!(
                "unsupported PRF hash: {:?}",
                hash
            )))
        }
    }

    Ok(out)
}

fn p_hash_sha256(secret: &[u8], full_seed: &[u8], out: &mut [u8]) -> Result<(), Error> {
    // A(1) = HMAC_hash(secret, A(0)) where A(0) = seed
    let mut a = new_mac_sha256(secret)?.chain_update(full_seed).finalize().into_bytes();

    let mut filled = 0;
    while filled < out.len() {
        // HMAC_hash(secret, A(i) + seed)
        let output = new_mac_sha256(secret)?
            .chain_update(&a)
            .chain_update(full_seed)
            .finalize()
            .into_bytes();

        let to_copy = (out.len() - filled).min(output.len());
        out[filled..filled + to_copy].copy_from_slice(&output[..to_copy]);
        filled += to_copy;

        if filled < out.len() {
            // A(i+1) = HMAC_hash(secret, A(i))
            a = new_mac_sha256(secret)?.chain_update(&a).finalize().into_bytes();
        }
    }

    Ok(())
}

fn p_hash_sha384(secret: &[u8], full_seed: &[u8], out: &mut [u8]) -> Result<(), Error> {
    let mut a = new_mac_sha384(secret)?.chain_update(full_seed).finalize().into_bytes();

    let mut filled = 0;
    while filled < out.len() {
        let output = new_mac_sha384(secret)?
            .chain_update(&a)
            .chain_update(full_seed)
            .finalize()
            .into_bytes();

        let to_copy = (out.len() - filled).min(output.len());
        out[filled..filled + to_copy].copy_from_slice(&output[..to_copy]);
        filled += to_copy;

        if filled < out.len() {
            a = new_mac_sha384(secret)?.chain_update(&a).finalize().into_bytes();
        }
    }

    Ok(())
}

fn new_mac_sha256(key: &[u8]) -> Result<Hmac<Sha256>, Error> {
    Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| Error::CryptoError("invalid HMAC key length".into()))
}

fn new_mac_sha384(key: &[u8]) -> Result<Hmac<Sha384>, Error> {
    Hmac::<Sha384>::new_from_slice(key)
        .map_err(|_| Error::CryptoError("invalid HMAC key length".into()))
}

/// One-shot HMAC-SHA256, used for the stateless cookie exchange.
pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], Error> {
    let bytes = new_mac_sha256(key)?.chain_update(data).finalize().into_bytes();
    Ok(bytes.into())
}

/// master_secret = PRF(pre_master_secret, "master secret",
/// client_random + server_random, 48).
pub(crate) fn master_secret(
    pre_master_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    hash: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(client_random);
    seed[32..].copy_from_slice(server_random);

    prf(
        pre_master_secret,
        "master secret",
        &seed,
        MASTER_SECRET_LEN,
        hash,
    )
}

/// RFC 7627 variant. The seed is the transcript hash up to and including
/// ClientKeyExchange, which binds the master secret to this handshake.
pub(crate) fn extended_master_secret(
    pre_master_secret: &[u8],
    session_hash: &[u8],
    hash: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    prf(
        pre_master_secret,
        "extended master secret",
        session_hash,
        MASTER_SECRET_LEN,
        hash,
    )
}

/// Key block per RFC 5246 section 6.3. Note the swapped random order
/// compared to the master secret computation.
pub(crate) fn key_expansion(
    master_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    key_material_len: usize,
    hash: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let mut seed = [0u8; 64];
    seed[..32].copy_from_slice(server_random);
    seed[32..].copy_from_slice(client_random);

    prf(master_secret, "key expansion", &seed, key_material_len, hash)
}

/// Finished verify_data over the transcript hash.
pub(crate) fn verify_data(
    master_secret: &[u8],
    is_client: bool,
    session_hash: &[u8],
    hash: HashAlgorithm,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let label = if is_client {
        "client finished"
    } else {
        "server finished"
    };

    prf(master_secret, label, session_hash, VERIFY_DATA_LEN, hash)
}

/// Public identifier for an established association. Derived so both
/// sides agree on it without extra round trips, and safe to export since
/// the PRF is one-way. The epoch is part of the seed, so every key
/// change yields a fresh identifier.
pub(crate) fn security_context_id(
    master_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
    epoch: u16,
    hash: HashAlgorithm,
) -> Result<[u8; 16], Error> {
    let mut seed = [0u8; 66];
    seed[..32].copy_from_slice(client_random);
    seed[32..64].copy_from_slice(server_random);
    seed[64..].copy_from_slice(&epoch.to_be_bytes());

    let out = prf(
        master_secret,
        "security context id",
        &seed,
        SECURITY_CONTEXT_ID_LEN,
        hash,
    )?;

    // unwrap: is ok because prf returned exactly SECURITY_CONTEXT_ID_LEN bytes.
    Ok(out.as_slice().try_into().unwrap())
}

/// Hash of the raw handshake transcript with the suite's PRF hash.
pub(crate) fn transcript_hash(transcript: &[u8], hash: HashAlgorithm) -> Vec<u8> {
    match hash {
        HashAlgorithm::SHA384 => Sha384::digest(transcript).to_vec(),
        _ => Sha256::digest(transcript).to_vec(),
    }
}

/// Write keys and fixed IVs for both directions, split out of the key
/// block. The AEAD suites carry no MAC keys.
pub(crate) struct KeyBlock {
    pub client_write_key: Zeroizing<Vec<u8>>,
    pub server_write_key: Zeroizing<Vec<u8>>,
    pub client_write_iv: [u8; 4],
    pub server_write_iv: [u8; 4],
}

impl KeyBlock {
    pub fn derive(
        suite: CipherSuite,
        master_secret: &[u8],
        client_random: &[u8],
        server_random: &[u8],
    ) -> Result<KeyBlock, Error> {
        let params = suite.params();
        let hash = suite.hash_algorithm();

        let material = key_expansion(
            master_secret,
            client_random,
            server_random,
            suite.key_block_len(),
            hash,
        )?;

        // mac_key_len is zero for GCM, the split starts at the write keys.
        let mut at = 2 * params.mac_key_len;
        let mut split = |len: usize| {
            let piece = &material[at..at + len];
            at += len;
            piece.to_vec()
        };

        let client_write_key = Zeroizing::new(split(params.enc_key_len));
        let server_write_key = Zeroizing::new(split(params.enc_key_len));
        let client_iv = split(params.fixed_iv_len);
        let server_iv = split(params.fixed_iv_len);

        Ok(KeyBlock {
            client_write_key,
            server_write_key,
            // unwrap: is ok because fixed_iv_len is 4 for every shipped suite.
            client_write_iv: client_iv.as_slice().try_into().unwrap(),
            server_write_iv: server_iv.as_slice().try_into().unwrap(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 5246 PRF test vector (SHA-256), widely reproduced.
    #[test]
    fn prf_sha256_test_vector() {
        let secret = [
            0x9b, 0xbe, 0x43, 0x6b, 0xa9, 0x40, 0xf0, 0x17, 0xb1, 0x76, 0x52, 0x84, 0x9a, 0x71,
            0xdb, 0x35,
        ];
        let seed = [
            0xa0, 0xba, 0x9f, 0x93, 0x6c, 0xda, 0x31, 0x18, 0x27, 0xa6, 0xf7, 0x96, 0xff, 0xd5,
            0x19, 0x8c,
        ];
        let expected = [
            0xe3, 0xf2, 0x29, 0xba, 0x72, 0x7b, 0xe1, 0x7b, 0x8d, 0x12, 0x26, 0x20, 0x55, 0x7c,
            0xd4, 0x53, 0xc2, 0xaa, 0xb2, 0x1d, 0x07, 0xc3, 0xd4, 0x95, 0x32, 0x9b, 0x52, 0xd4,
            0xe6, 0x1e, 0xdb, 0x5a, 0x6b, 0x30, 0x17, 0x91, 0xe9, 0x0d, 0x35, 0xc9, 0xc9, 0xa4,
            0x6b, 0x4e, 0x14, 0xba, 0xf9, 0xaf, 0x0f, 0xa0, 0x22, 0xf7, 0x07, 0x7d, 0xef, 0x17,
            0xab, 0xfd, 0x37, 0x97, 0xc0, 0x56, 0x4b, 0xab, 0x4f, 0xbc, 0x91, 0x66, 0x6e, 0x9d,
            0xef, 0x9b, 0x97, 0xfc, 0xe3, 0x4f, 0x79, 0x67, 0x89, 0xba, 0xa4, 0x80, 0x82, 0xd1,
            0x22, 0xee, 0x42, 0xc5, 0xa7, 0x2e, 0x5a, 0x51, 0x10, 0xff, 0xf7, 0x01, 0x87, 0x34,
            0x7b, 0x66,
        ];

        let out = prf(
            &secret,
            "test label",
            &seed,
            expected.len(),
            HashAlgorithm::SHA256,
        )
        .unwrap();

        assert_eq!(out.as_slice(), &expected[..]);
    }

    #[test]
    fn key_block_split() {
        let master = [0x42; 48];
        let client_random = [1; 32];
        let server_random = [2; 32];

        let block = KeyBlock::derive(
            CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384,
            &master,
            &client_random,
            &server_random,
        )
        .unwrap();

        assert_eq!(block.client_write_key.len(), 32);
        assert_eq!(block.server_write_key.len(), 32);
        assert_ne!(
            block.client_write_key.as_slice(),
            block.server_write_key.as_slice()
        );
        assert_ne!(block.client_write_iv, block.server_write_iv);
    }

    #[test]
    fn directions_use_distinct_labels() {
        let master = [0x42; 48];
        let hash = [0x13; 32];

        let client = verify_data(&master, true, &hash, HashAlgorithm::SHA256).unwrap();
        let server = verify_data(&master, false, &hash, HashAlgorithm::SHA256).unwrap();

        assert_eq!(client.len(), 12);
        assert_ne!(client.as_slice(), server.as_slice());
    }

    #[test]
    fn context_id_is_stable_per_epoch() {
        let master = [0x42; 48];
        let client_random = [1; 32];
        let server_random = [2; 32];

        let a =
            security_context_id(&master, &client_random, &server_random, 1, HashAlgorithm::SHA256)
                .unwrap();
        let b =
            security_context_id(&master, &client_random, &server_random, 1, HashAlgorithm::SHA256)
                .unwrap();
        let next_epoch =
            security_context_id(&master, &client_random, &server_random, 2, HashAlgorithm::SHA256)
                .unwrap();

        assert_eq!(a, b);
        assert_ne!(a, next_epoch);
    }
}
