use nom::bytes::complete::take;
use nom::number::complete::be_u16;
use nom::IResult;
use smallvec::SmallVec;

use crate::message::SignatureAndHashAlgorithm;
use crate::util::many0;

/// The signature_algorithms extension payload (RFC 5246 7.4.1.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureAlgorithmsExtension {
    pub supported_signature_algorithms: SmallVec<[SignatureAndHashAlgorithm; 16]>,
}

impl SignatureAlgorithmsExtension {
    pub fn new(algorithms: &[SignatureAndHashAlgorithm]) -> Self {
        SignatureAlgorithmsExtension {
            supported_signature_algorithms: SmallVec::from_slice(algorithms),
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], SignatureAlgorithmsExtension> {
        let (input, list_len) = be_u16(input)?;
        let (input, list) = take(list_len)(input)?;

        let (leftover, algorithms) = many0(SignatureAndHashAlgorithm::parse)(list)?;

        if !leftover.is_empty() {
            return Err(nom::Err::Failure(nom::error::Error::new(
                leftover,
                nom::error::ErrorKind::LengthValue,
            )));
        }

        Ok((
            input,
            SignatureAlgorithmsExtension {
                supported_signature_algorithms: algorithms,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(
            &((self.supported_signature_algorithms.len() * 2) as u16).to_be_bytes(),
        );

        for algorithm in &self.supported_signature_algorithms {
            output.extend_from_slice(&algorithm.as_u16().to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HashAlgorithm, SignatureAlgorithm};

    const MESSAGE: &[u8] = &[
        0x00, 0x04, // List length (4 bytes)
        0x04, 0x03, // SHA256 / ECDSA
        0x05, 0x03, // SHA384 / ECDSA
    ];

    #[test]
    fn roundtrip() {
        let extension = SignatureAlgorithmsExtension::new(&[
            SignatureAndHashAlgorithm::new(HashAlgorithm::SHA256, SignatureAlgorithm::ECDSA),
            SignatureAndHashAlgorithm::new(HashAlgorithm::SHA384, SignatureAlgorithm::ECDSA),
        ]);

        let mut serialized = Vec::new();
        extension.serialize(&mut serialized);
        assert_eq!(serialized, MESSAGE);

        let (rest, parsed) = SignatureAlgorithmsExtension::parse(&serialized).unwrap();
        assert_eq!(parsed, extension);
        assert!(rest.is_empty());
    }

    #[test]
    fn unknown_pairs_are_kept() {
        let bytes = [0x00, 0x04, 0x08, 0x07, 0x04, 0x03];
        let (_, parsed) = SignatureAlgorithmsExtension::parse(&bytes).unwrap();

        assert_eq!(parsed.supported_signature_algorithms.len(), 2);
        assert_eq!(
            parsed.supported_signature_algorithms[1],
            SignatureAndHashAlgorithm::new(HashAlgorithm::SHA256, SignatureAlgorithm::ECDSA)
        );
    }
}
