//! AES-GCM record protection and the DTLS nonce/AAD layout.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, Aes256Gcm, Key, KeyInit, Tag};

use crate::buffer::Buf;
use crate::message::{ContentType, Sequence};
use crate::suite::CipherSuite;
use crate::Error;

/// Explicit nonce prefix transmitted with each record.
pub(crate) const EXPLICIT_NONCE_LEN: usize = 8;

/// GCM authentication tag appended to the ciphertext.
pub(crate) const GCM_TAG_LEN: usize = 16;

/// Per-record expansion: explicit nonce plus tag.
pub(crate) const AEAD_OVERHEAD: usize = EXPLICIT_NONCE_LEN + GCM_TAG_LEN;

/// Fixed IV portion from the key block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Iv(pub [u8; 4]);

impl Iv {
    pub(crate) fn new(iv: &[u8]) -> Self {
        // invariant: the iv is 4 bytes.
        Self(iv.try_into().unwrap())
    }
}

/// Full AEAD nonce: fixed IV followed by the explicit nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Nonce(pub [u8; 12]);

impl Nonce {
    pub(crate) fn new(iv: Iv, explicit_nonce: &[u8]) -> Self {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&iv.0);
        nonce[4..].copy_from_slice(explicit_nonce);
        Self(nonce)
    }
}

/// Additional authenticated data covering the record header fields:
/// epoch, sequence number, content type, version and plaintext length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Aad(pub [u8; 13]);

impl Aad {
    pub(crate) fn new(sequence: Sequence, content_type: ContentType, plaintext_len: u16) -> Self {
        let mut aad = [0u8; 13];

        // Full 8-byte sequence, then epoch overwrites the first 2 bytes.
        aad[..8].copy_from_slice(&sequence.sequence_number.to_be_bytes());
        aad[..2].copy_from_slice(&sequence.epoch.to_be_bytes());

        aad[8] = content_type.as_u8();
        aad[9] = 0xfe;
        aad[10] = 0xfd;
        aad[11..].copy_from_slice(&plaintext_len.to_be_bytes());

        Aad(aad)
    }
}

/// Record cipher for one direction of one epoch.
pub(crate) enum AeadCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl std::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AeadCipher::Aes128(_) => f.debug_tuple("AeadCipher::Aes128").finish(),
            AeadCipher::Aes256(_) => f.debug_tuple("AeadCipher::Aes256").finish(),
        }
    }
}

impl AeadCipher {
    pub(crate) fn new(suite: CipherSuite, key: &[u8]) -> Result<Self, Error> {
        let expected = suite.params().enc_key_len;
        if key.len() != expected {
            return Err(Error::CryptoError(format!(
                "invalid key size for {:?}: {}",
                suite,
                key.len()
            )));
        }

        match key.len() {
            16 => {
                let key = Key::<Aes128Gcm>::from_slice(key);
                Ok(AeadCipher::Aes128(Box::new(Aes128Gcm::new(key))))
            }
            32 => {
                let key = Key::<Aes256Gcm>::from_slice(key);
                Ok(AeadCipher::Aes256(Box::new(Aes256Gcm::new(key))))
            }
            n => Err(Error::CryptoError(format!("invalid AES-GCM key size: {n}"))),
        }
    }

    /// Encrypt `buf[payload_start..]` in place and append the tag.
    pub(crate) fn seal_in_place(
        &self,
        nonce: Nonce,
        aad: &Aad,
        buf: &mut Buf,
        payload_start: usize,
    ) -> Result<(), Error> {
        let gcm_nonce = aes_gcm::Nonce::from_slice(&nonce.0);

        let tag = match self {
            AeadCipher::Aes128(cipher) => {
                cipher.encrypt_in_place_detached(gcm_nonce, &aad.0, &mut buf[payload_start..])
            }
            AeadCipher::Aes256(cipher) => {
                cipher.encrypt_in_place_detached(gcm_nonce, &aad.0, &mut buf[payload_start..])
            }
        }
        .map_err(|_| Error::CryptoError("record encryption failed".into()))?;

        buf.extend_from_slice(tag.as_slice());
        Ok(())
    }

    /// Decrypt `data` (ciphertext followed by the tag) in place. On
    /// success the plaintext occupies the first returned-length bytes.
    pub(crate) fn open_in_place(
        &self,
        nonce: Nonce,
        aad: &Aad,
        data: &mut [u8],
    ) -> Result<usize, Error> {
        if data.len() < GCM_TAG_LEN {
            return Err(Error::CryptoError("record too short for tag".into()));
        }

        let gcm_nonce = aes_gcm::Nonce::from_slice(&nonce.0);
        let (ciphertext, tag) = data.split_at_mut(data.len() - GCM_TAG_LEN);
        let tag = Tag::from_slice(tag);

        match self {
            AeadCipher::Aes128(cipher) => {
                cipher.decrypt_in_place_detached(gcm_nonce, &aad.0, ciphertext, tag)
            }
            AeadCipher::Aes256(cipher) => {
                cipher.decrypt_in_place_detached(gcm_nonce, &aad.0, ciphertext, tag)
            }
        }
        .map_err(|_| Error::CryptoError("record authentication failed".into()))?;

        Ok(ciphertext.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AeadCipher {
        AeadCipher::new(CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256, &[7; 16]).unwrap()
    }

    fn sequence() -> Sequence {
        Sequence {
            epoch: 1,
            sequence_number: 42,
        }
    }

    #[test]
    fn aad_layout() {
        let aad = Aad::new(sequence(), ContentType::ApplicationData, 0x0102);

        assert_eq!(
            aad.0,
            [0, 1, 0, 0, 0, 0, 0, 42, 23, 0xfe, 0xfd, 0x01, 0x02]
        );
    }

    #[test]
    fn seal_open_roundtrip() {
        let cipher = cipher();
        let iv = Iv::new(&[1, 2, 3, 4]);
        let explicit = [9u8; 8];
        let nonce = Nonce::new(iv, &explicit);

        let plaintext = b"hello datagram";
        let aad = Aad::new(sequence(), ContentType::ApplicationData, plaintext.len() as u16);

        let mut buf = Buf::new();
        buf.extend_from_slice(plaintext);
        cipher.seal_in_place(nonce, &aad, &mut buf, 0).unwrap();

        assert_eq!(buf.len(), plaintext.len() + GCM_TAG_LEN);
        assert_ne!(&buf[..plaintext.len()], plaintext);

        let mut data = buf.to_vec();
        let len = cipher.open_in_place(nonce, &aad, &mut data).unwrap();
        assert_eq!(&data[..len], plaintext);
    }

    #[test]
    fn tampered_record_fails_open() {
        let cipher = cipher();
        let nonce = Nonce::new(Iv::new(&[0; 4]), &[0; 8]);
        let aad = Aad::new(sequence(), ContentType::ApplicationData, 4);

        let mut buf = Buf::new();
        buf.extend_from_slice(&[1, 2, 3, 4]);
        cipher.seal_in_place(nonce, &aad, &mut buf, 0).unwrap();

        let mut data = buf.to_vec();
        data[0] ^= 0x80;
        assert!(cipher.open_in_place(nonce, &aad, &mut data).is_err());

        // Mismatched AAD must fail the same way.
        let mut data = buf.to_vec();
        let wrong_aad = Aad::new(sequence(), ContentType::ApplicationData, 5);
        assert!(cipher.open_in_place(nonce, &wrong_aad, &mut data).is_err());
    }
}
