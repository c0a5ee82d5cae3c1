use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};
use smallvec::SmallVec;

use crate::message::{
    ClientCertificateType, DistinguishedName, KeyAlgorithm, SignatureAndHashAlgorithm,
};
use crate::util::{many0, many1};

#[derive(Debug, PartialEq, Eq)]
pub struct CertificateRequest<'a> {
    pub certificate_types: SmallVec<[ClientCertificateType; 8]>,
    pub supported_signature_algorithms: SmallVec<[SignatureAndHashAlgorithm; 16]>,
    pub certificate_authorities: SmallVec<[DistinguishedName<'a>; 8]>,
}

impl<'a> CertificateRequest<'a> {
    /// Whole-message bound. The certificate_authorities vector caps at a
    /// u16 length and with it the entire request; senders check against
    /// this before adding an authority.
    pub const MAX_SERIALIZED_LEN: usize = 65535;

    pub fn new(
        certificate_types: &[ClientCertificateType],
        supported_signature_algorithms: &[SignatureAndHashAlgorithm],
    ) -> Self {
        CertificateRequest {
            certificate_types: SmallVec::from_slice(certificate_types),
            supported_signature_algorithms: SmallVec::from_slice(supported_signature_algorithms),
            certificate_authorities: SmallVec::new(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        1 + self.certificate_types.len()
            + 2
            + 2 * self.supported_signature_algorithms.len()
            + 2
            + self
                .certificate_authorities
                .iter()
                .map(|name| 2 + name.len())
                .sum::<usize>()
    }

    /// Add a certificate authority unless the message would outgrow
    /// [`Self::MAX_SERIALIZED_LEN`]. On refusal the request is unchanged.
    pub fn try_push_authority(&mut self, name: DistinguishedName<'a>) -> bool {
        if self.serialized_len() + 2 + name.len() > Self::MAX_SERIALIZED_LEN {
            return false;
        }
        self.certificate_authorities.push(name);
        true
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], CertificateRequest<'a>> {
        let (input, cert_types_len) = be_u8(input)?;
        let (input, input_types) = take(cert_types_len)(input)?;
        let (rest, certificate_types) = many1(ClientCertificateType::parse)(input_types)?;
        if !rest.is_empty() {
            return Err(Err::Failure(Error::new(rest, ErrorKind::LengthValue)));
        }

        let (input, sig_algs_len) = be_u16(input)?;
        let (input, input_sigs) = take(sig_algs_len)(input)?;
        let (rest, supported_signature_algorithms) =
            many0(SignatureAndHashAlgorithm::parse)(input_sigs)?;
        if !rest.is_empty() {
            return Err(Err::Failure(Error::new(rest, ErrorKind::LengthValue)));
        }

        let (input, cert_auths_len) = be_u16(input)?;
        let (input, input_auths) = take(cert_auths_len)(input)?;
        let (rest, certificate_authorities) = many0(parse_distinguished_name)(input_auths)?;
        if !rest.is_empty() {
            return Err(Err::Failure(Error::new(rest, ErrorKind::LengthValue)));
        }

        Ok((
            input,
            CertificateRequest {
                certificate_types,
                supported_signature_algorithms,
                certificate_authorities,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.certificate_types.len() as u8);
        for cert_type in &self.certificate_types {
            output.push(cert_type.as_u8());
        }

        let sig_algs_len = (self.supported_signature_algorithms.len() * 2) as u16;
        output.extend_from_slice(&sig_algs_len.to_be_bytes());
        for sig_alg in &self.supported_signature_algorithms {
            output.extend_from_slice(&sig_alg.as_u16().to_be_bytes());
        }

        let cert_auths_len: usize = self
            .certificate_authorities
            .iter()
            .map(|name| 2 + name.len())
            .sum();
        output.extend_from_slice(&(cert_auths_len as u16).to_be_bytes());
        for name in &self.certificate_authorities {
            output.extend_from_slice(&(name.len() as u16).to_be_bytes());
            output.extend_from_slice(name);
        }
    }
}

fn parse_distinguished_name(input: &[u8]) -> IResult<&[u8], DistinguishedName<'_>> {
    let (input, name_len) = be_u16(input)?;
    let (input, name) = take(name_len)(input)?;
    Ok((input, DistinguishedName(name)))
}

/// Pick the signature/hash pair to use: first entry in the peer's
/// preference order that we also support and that the credential's
/// key can produce. An entry both sides list still loses when its
/// signature family does not fit the key.
pub fn select_signature_algorithm(
    peer: &[SignatureAndHashAlgorithm],
    local: &[SignatureAndHashAlgorithm],
    key: KeyAlgorithm,
) -> Option<SignatureAndHashAlgorithm> {
    peer.iter()
        .find(|a| key.matches_signature(a.signature) && local.contains(a))
        .copied()
}
