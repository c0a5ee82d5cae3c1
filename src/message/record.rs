use std::fmt;
use std::ops::Range;

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use super::ProtocolVersion;
use crate::buffer::Buf;
use crate::util::be_u48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Unknown(u8),
}

impl Default for ContentType {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

impl ContentType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            _ => ContentType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ContentType> {
        let (input, value) = be_u8(input)?;
        Ok((input, ContentType::from_u8(value)))
    }
}

/// Epoch plus 48-bit record sequence number. Identifies a record for
/// replay checking and AEAD nonce construction.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Sequence {
    pub epoch: u16,
    pub sequence_number: u64,
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epoch, self.sequence_number)
    }
}

/// A parsed record header. The fragment is kept as a range into the
/// record's backing buffer so decryption can rewrite it in place.
#[derive(PartialEq, Eq, Default)]
pub struct DtlsRecord {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub sequence: Sequence,
    pub length: u16,
    pub fragment_range: Range<usize>,
}

impl DtlsRecord {
    /// content_type(1) + version(2) + epoch(2) + sequence(6) + length(2)
    pub const HEADER_LEN: usize = 13;

    /// Explicit nonce prefix carried by AES-GCM records.
    pub const EXPLICIT_NONCE_LEN: usize = 8;

    /// Where the 2-byte length field sits in the header.
    pub const LENGTH_OFFSET: Range<usize> = 11..13;

    /// Parse a record header from `input`.
    ///
    /// `skip_offset` is 0 for ciphertext and `EXPLICIT_NONCE_LEN` when
    /// re-parsing a record decrypted in place, where the plaintext starts
    /// after the nonce prefix and the length field has been patched.
    pub fn parse(input: &[u8], skip_offset: usize) -> IResult<&[u8], DtlsRecord> {
        let original_input = input;
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;

        // The record layer accepts the 1.0 version value as well, which
        // some peers put on plaintext records before version negotiation.
        if !version.is_acceptable() {
            return Err(Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }

        let (input, epoch) = be_u16(input)?;
        let (input, sequence_number) = be_u48(input)?;
        let (input, length) = be_u16(input)?;

        if input.len() < skip_offset {
            return Err(Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Eof,
            )));
        }
        let input = &input[skip_offset..];

        let (rest, fragment_slice) = take(length as usize)(input)?;

        let start = fragment_slice.as_ptr() as usize - original_input.as_ptr() as usize;
        let end = start + fragment_slice.len();

        let sequence = Sequence {
            epoch,
            sequence_number,
        };

        Ok((
            rest,
            DtlsRecord {
                content_type,
                version,
                sequence,
                length,
                fragment_range: start..end,
            },
        ))
    }

    pub fn fragment<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.fragment_range.clone()]
    }

    pub fn serialize(&self, buf: &[u8], output: &mut Buf) {
        output.push(self.content_type.as_u8());
        output.extend_from_slice(&self.version.as_u16().to_be_bytes());
        output.extend_from_slice(&self.sequence.epoch.to_be_bytes());
        output.extend_from_slice(&self.sequence.sequence_number.to_be_bytes()[2..]);
        output.extend_from_slice(&self.length.to_be_bytes());
        output.extend_from_slice(self.fragment(buf));
    }

    /// The explicit nonce prefix of an encrypted record's fragment.
    pub fn nonce<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let fragment = self.fragment(buf);
        &fragment[..Self::EXPLICIT_NONCE_LEN]
    }
}

impl fmt::Debug for DtlsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsRecord")
            .field("content_type", &self.content_type)
            .field("version", &self.version)
            .field("sequence", &self.sequence)
            .field("length", &self.length)
            .field("fragment_range", &self.fragment_range)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &[u8] = &[
        0x16, // ContentType::Handshake
        0xFE, 0xFD, // ProtocolVersion::DTLS1_2
        0x00, 0x01, // epoch
        0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // sequence_number
        0x00, 0x10, // length
        // fragment
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        0x10,
    ];

    #[test]
    fn roundtrip() {
        let (rest, parsed) = DtlsRecord::parse(RECORD, 0).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.sequence.epoch, 1);
        assert_eq!(parsed.sequence.sequence_number, 1);
        assert_eq!(parsed.fragment_range, 13..29);

        let mut serialized = Buf::new();
        parsed.serialize(RECORD, &mut serialized);
        assert_eq!(&*serialized, RECORD);
    }

    #[test]
    fn skip_offset_moves_fragment_start() {
        let mut record = RECORD.to_vec();
        // Patch length down as the in-place decrypt does.
        record[11] = 0x00;
        record[12] = 0x08;

        let (_, parsed) = DtlsRecord::parse(&record, DtlsRecord::EXPLICIT_NONCE_LEN).unwrap();
        assert_eq!(parsed.fragment_range, 21..29);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut record = RECORD.to_vec();
        record[1] = 0x03;
        record[2] = 0x03;
        assert!(DtlsRecord::parse(&record, 0).is_err());
    }

    #[test]
    fn truncated_fragment() {
        assert!(DtlsRecord::parse(&RECORD[..20], 0).is_err());
    }
}
