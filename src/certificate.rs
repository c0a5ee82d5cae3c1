//! Self-signed endpoint identities.
//!
//! Every connection role owns a leaf certificate and private key. Peers that
//! authenticate over PSK only still need one to construct, which
//! [`generate_self_signed_certificate`] produces in one call.

use std::fmt;

use rcgen::{
    Certificate as RcgenCertificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use sha2::{Digest, Sha256};

use crate::Error;

/// Long-term identity for one endpoint.
///
/// Both fields are DER: an X.509 leaf certificate and the matching PKCS#8
/// private key. The key is only parsed when a handshake actually needs a
/// signature, so a PSK-only deployment can carry a placeholder identity.
#[derive(Clone)]
pub struct EndpointCertificate {
    /// X.509 certificate in DER format.
    pub certificate: Vec<u8>,
    /// PKCS#8 private key in DER format.
    pub private_key: Vec<u8>,
}

/// Generate a fresh self-signed ECDSA P-256 identity.
pub fn generate_self_signed_certificate() -> Result<EndpointCertificate, Error> {
    let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::CertificateError(format!("key generation failed: {}", e)))?;

    let mut params = CertificateParams::new(vec!["scrim endpoint".to_string()]);

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::OrganizationName, "scrim".to_string());
    distinguished_name.push(DnType::CommonName, "scrim endpoint".to_string());
    params.distinguished_name = distinguished_name;

    params.is_ca = IsCa::NoCa;
    params.key_pair = Some(key_pair);

    let not_before = time::OffsetDateTime::now_utc();
    let not_after = not_before + time::Duration::days(365);
    params.not_before = not_before;
    params.not_after = not_after;

    let cert = RcgenCertificate::from_params(params)
        .map_err(|e| Error::CertificateError(format!("certificate build failed: {}", e)))?;

    let cert_der = cert
        .serialize_der()
        .map_err(|e| Error::CertificateError(format!("certificate encoding failed: {}", e)))?;
    let key_der = cert.serialize_private_key_der();

    Ok(EndpointCertificate {
        certificate: cert_der,
        private_key: key_der,
    })
}

/// SHA-256 over the DER encoding. This is the identity the embedder pins.
pub(crate) fn fingerprint(cert_der: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    hasher.finalize().into()
}

impl EndpointCertificate {
    pub fn new(certificate: Vec<u8>, private_key: Vec<u8>) -> Self {
        EndpointCertificate {
            certificate,
            private_key,
        }
    }

    /// SHA-256 fingerprint of the certificate.
    pub fn fingerprint(&self) -> [u8; 32] {
        fingerprint(&self.certificate)
    }

    /// Fingerprint as uppercase hex byte pairs separated by colons,
    /// for example "AF:12:F6:...".
    pub fn fingerprint_str(&self) -> String {
        self.fingerprint()
            .iter()
            .map(|byte| format!("{:02X}", byte))
            .collect::<Vec<String>>()
            .join(":")
    }
}

impl fmt::Debug for EndpointCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointCertificate")
            .field("certificate", &self.certificate.len())
            .field("private_key", &self.private_key.len())
            .finish()
    }
}
