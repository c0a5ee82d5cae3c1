use nom::bytes::complete::take;
use nom::number::complete::be_u8;
use nom::IResult;
use smallvec::SmallVec;

use crate::util::many0;

/// EC point format codes (RFC 8422 5.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcPointFormat {
    Uncompressed,
    AnsiX962CompressedPrime,
    AnsiX962CompressedChar2,
    Unknown(u8),
}

impl EcPointFormat {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => EcPointFormat::Uncompressed,
            0x01 => EcPointFormat::AnsiX962CompressedPrime,
            0x02 => EcPointFormat::AnsiX962CompressedChar2,
            _ => EcPointFormat::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            EcPointFormat::Uncompressed => 0x00,
            EcPointFormat::AnsiX962CompressedPrime => 0x01,
            EcPointFormat::AnsiX962CompressedChar2 => 0x02,
            EcPointFormat::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], EcPointFormat> {
        let (input, value) = be_u8(input)?;
        Ok((input, EcPointFormat::from_u8(value)))
    }
}

/// The ec_point_formats extension payload.
///
/// Only uncompressed points are ever sent or accepted; the peer list is
/// parsed in full so the uncompressed check can run over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcPointFormatsExtension {
    pub formats: SmallVec<[EcPointFormat; 4]>,
}

impl EcPointFormatsExtension {
    /// The payload we offer: uncompressed only.
    pub fn uncompressed() -> Self {
        let mut formats = SmallVec::new();
        formats.push(EcPointFormat::Uncompressed);
        EcPointFormatsExtension { formats }
    }

    pub fn supports_uncompressed(&self) -> bool {
        self.formats.contains(&EcPointFormat::Uncompressed)
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], EcPointFormatsExtension> {
        let (input, list_len) = be_u8(input)?;
        let (input, list) = take(list_len)(input)?;

        // Each format is one byte, so the list length cannot misalign.
        let (_, formats) = many0(EcPointFormat::parse)(list)?;

        Ok((input, EcPointFormatsExtension { formats }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.formats.len() as u8);

        for format in &self.formats {
            output.push(format.as_u8());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &[u8] = &[
        0x02, // Number of formats
        0x00, // Uncompressed
        0x01, // ANSI X9.62 compressed prime
    ];

    #[test]
    fn roundtrip() {
        let mut formats = SmallVec::new();
        formats.push(EcPointFormat::Uncompressed);
        formats.push(EcPointFormat::AnsiX962CompressedPrime);
        let extension = EcPointFormatsExtension { formats };

        let mut serialized = Vec::new();
        extension.serialize(&mut serialized);
        assert_eq!(serialized, MESSAGE);

        let (rest, parsed) = EcPointFormatsExtension::parse(&serialized).unwrap();
        assert_eq!(parsed, extension);
        assert!(rest.is_empty());
        assert!(parsed.supports_uncompressed());
    }

    #[test]
    fn compressed_only_peer_detected() {
        let bytes = [0x01, 0x01];
        let (_, parsed) = EcPointFormatsExtension::parse(&bytes).unwrap();
        assert!(!parsed.supports_uncompressed());
    }
}
