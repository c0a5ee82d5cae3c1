use nom::{bytes::complete::take, number::complete::be_u24, IResult};
use smallvec::SmallVec;

use crate::message::Asn1Cert;

/// A certificate chain, leaf first. An empty list is valid: a client that
/// was asked for a certificate but has none configured answers with one.
#[derive(Debug, PartialEq, Eq)]
pub struct Certificate<'a> {
    pub certificate_list: SmallVec<[Asn1Cert<'a>; 4]>,
}

impl<'a> Certificate<'a> {
    pub fn new(certificate_list: SmallVec<[Asn1Cert<'a>; 4]>) -> Self {
        Certificate { certificate_list }
    }

    pub fn empty() -> Self {
        Certificate {
            certificate_list: SmallVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.certificate_list.is_empty()
    }

    /// The end entity certificate.
    pub fn leaf(&self) -> Option<&Asn1Cert<'a>> {
        self.certificate_list.first()
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Certificate<'a>> {
        let (input, total_len) = be_u24(input)?;
        let (input, mut list) = take(total_len as usize)(input)?;

        let mut certificate_list = SmallVec::new();
        while !list.is_empty() {
            let (rest, cert_len) = be_u24(list)?;
            let (rest, cert_data) = take(cert_len as usize)(rest)?;
            certificate_list.push(Asn1Cert(cert_data));
            list = rest;
        }

        Ok((input, Certificate { certificate_list }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        let total_len: usize = self
            .certificate_list
            .iter()
            .map(|cert| 3 + cert.len())
            .sum();
        output.extend_from_slice(&(total_len as u32).to_be_bytes()[1..]);

        for cert in &self.certificate_list {
            output.extend_from_slice(&(cert.len() as u32).to_be_bytes()[1..]);
            output.extend_from_slice(cert);
        }
    }
}
