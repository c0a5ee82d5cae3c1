//! ECDSA signing and verification plus the X.509 inspection the
//! handshake needs: key algorithm, key usage and subject extraction.

use der::oid::AssociatedOid;
use der::{Decode, Encode};
use pkcs8::DecodePrivateKey;
use sha2::{Digest, Sha256, Sha384};
use signature::hazmat::{PrehashSigner, PrehashVerifier};
use spki::ObjectIdentifier;
use x509_cert::ext::pkix::{KeyUsage, KeyUsages};
use x509_cert::Certificate as X509Certificate;

use crate::message::{
    HashAlgorithm, KeyAlgorithm, SignatureAlgorithm, SignatureAndHashAlgorithm,
};
use crate::suite::NamedGroup;
use crate::Error;

const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_DSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10040.4.1");
const OID_SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// Chain validation hook. The engine proves possession of the peer's
/// key itself; whether the chain is trusted is the embedder's call.
pub trait CertVerifier: std::fmt::Debug + Send + Sync {
    /// Called once per handshake with the peer's chain, leaf first,
    /// each entry in DER. An error aborts the handshake with a
    /// bad-certificate alert.
    fn verify_chain(&self, chain: &[&[u8]]) -> Result<(), Error>;
}

/// Private key for the ECDSA certificate suites. The curve fixes the
/// hash, matching the signature algorithm pairs we advertise.
pub(crate) enum SigningKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningKey::P256(_) => f.debug_tuple("SigningKey::P256").finish(),
            SigningKey::P384(_) => f.debug_tuple("SigningKey::P384").finish(),
        }
    }
}

impl SigningKey {
    pub(crate) fn from_pkcs8_der(key_der: &[u8]) -> Result<Self, Error> {
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(key_der) {
            return Ok(SigningKey::P256(key));
        }
        if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_der(key_der) {
            return Ok(SigningKey::P384(key));
        }

        Err(Error::CertificateError(
            "private key is not a PKCS#8 P-256 or P-384 key".into(),
        ))
    }

    pub(crate) fn algorithm(&self) -> SignatureAndHashAlgorithm {
        let hash = match self {
            SigningKey::P256(_) => HashAlgorithm::SHA256,
            SigningKey::P384(_) => HashAlgorithm::SHA384,
        };
        SignatureAndHashAlgorithm::new(hash, SignatureAlgorithm::ECDSA)
    }

    /// ASN.1 DER encoded ECDSA signature over `data`.
    pub(crate) fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            SigningKey::P256(key) => {
                let digest = Sha256::digest(data);
                let signature: p256::ecdsa::Signature = key
                    .sign_prehash(&digest)
                    .map_err(|_| Error::CryptoError("signing failed".into()))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            SigningKey::P384(key) => {
                let digest = Sha384::digest(data);
                let signature: p384::ecdsa::Signature = key
                    .sign_prehash(&digest)
                    .map_err(|_| Error::CryptoError("signing failed".into()))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
        }
    }
}

/// Verify an ECDSA signature against the public key in `cert_der`.
pub(crate) fn verify_signature(
    cert_der: &[u8],
    data: &[u8],
    algorithm: SignatureAndHashAlgorithm,
    signature: &[u8],
) -> Result<(), Error> {
    if algorithm.signature != SignatureAlgorithm::ECDSA {
        return Err(Error::IllegalParameter(format!(
            "unsupported signature algorithm: {:?}",
            algorithm.signature
        )));
    }

    let cert = parse_certificate(cert_der)?;
    let spki = &cert.tbs_certificate.subject_public_key_info;

    if spki.algorithm.oid != OID_EC_PUBLIC_KEY {
        return Err(Error::CertificateError(format!(
            "expected an EC public key, got {}",
            spki.algorithm.oid
        )));
    }

    let public_key = spki
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| Error::CertificateError("invalid EC public key bitstring".into()))?;

    let curve_oid: ObjectIdentifier = spki
        .algorithm
        .parameters
        .as_ref()
        .ok_or_else(|| Error::CertificateError("missing EC curve parameter".into()))?
        .decode_as()
        .map_err(|_| Error::CertificateError("invalid EC curve parameter".into()))?;

    let group = match curve_oid {
        OID_SECP256R1 => NamedGroup::Secp256r1,
        OID_SECP384R1 => NamedGroup::Secp384r1,
        _ => {
            return Err(Error::CertificateError(format!(
                "unsupported EC curve: {}",
                curve_oid
            )))
        }
    };

    let digest: Vec<u8> = match algorithm.hash {
        HashAlgorithm::SHA256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::SHA384 => Sha384::digest(data).to_vec(),
        other => {
            return Err(Error::IllegalParameter(format!(
                "unsupported signature hash: {:?}",
                other
            )))
        }
    };

    match group {
        NamedGroup::Secp256r1 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|_| Error::CertificateError("invalid P-256 public key".into()))?;
            let signature = p256::ecdsa::Signature::from_der(signature)
                .map_err(|_| Error::VerificationFailed("malformed ECDSA signature"))?;
            key.verify_prehash(&digest, &signature)
                .map_err(|_| Error::VerificationFailed("ECDSA signature verification failed"))
        }
        NamedGroup::Secp384r1 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|_| Error::CertificateError("invalid P-384 public key".into()))?;
            let signature = p384::ecdsa::Signature::from_der(signature)
                .map_err(|_| Error::VerificationFailed("malformed ECDSA signature"))?;
            key.verify_prehash(&digest, &signature)
                .map_err(|_| Error::VerificationFailed("ECDSA signature verification failed"))
        }
        // unreachable: the OID match above only produces these two groups.
        _ => unreachable!(),
    }
}

/// Which signature family the certificate's public key belongs to.
pub(crate) fn peer_key_algorithm(cert_der: &[u8]) -> Result<KeyAlgorithm, Error> {
    let cert = parse_certificate(cert_der)?;
    let oid = cert.tbs_certificate.subject_public_key_info.algorithm.oid;

    match oid {
        OID_EC_PUBLIC_KEY => Ok(KeyAlgorithm::Ec),
        OID_RSA_ENCRYPTION => Ok(KeyAlgorithm::Rsa),
        OID_DSA => Ok(KeyAlgorithm::Dsa),
        _ => Err(Error::CertificateError(format!(
            "unsupported public key algorithm: {}",
            oid
        ))),
    }
}

/// True when the certificate permits digitalSignature, which every
/// ECDHE suite requires of the peer. An absent KeyUsage extension
/// places no restriction.
pub(crate) fn can_sign(cert_der: &[u8]) -> Result<bool, Error> {
    let cert = parse_certificate(cert_der)?;

    let Some(extensions) = &cert.tbs_certificate.extensions else {
        return Ok(true);
    };

    for extension in extensions {
        if extension.extn_id == KeyUsage::OID {
            let usage = KeyUsage::from_der(extension.extn_value.as_bytes())
                .map_err(|_| Error::CertificateError("invalid KeyUsage extension".into()))?;
            return Ok(usage.0.contains(KeyUsages::DigitalSignature));
        }
    }

    Ok(true)
}

/// DER encoded subject name, the form certificate authorities are
/// listed in inside CertificateRequest.
pub(crate) fn subject_der(cert_der: &[u8]) -> Result<Vec<u8>, Error> {
    let cert = parse_certificate(cert_der)?;
    cert.tbs_certificate
        .subject
        .to_der()
        .map_err(|_| Error::CertificateError("subject name encoding failed".into()))
}

fn parse_certificate(cert_der: &[u8]) -> Result<X509Certificate, Error> {
    X509Certificate::from_der(cert_der)
        .map_err(|e| Error::CertificateError(format!("certificate parse failed: {e}")))
}
