use nom::bytes::complete::take;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::{Err, IResult};

use crate::buffer::Buf;
use crate::message::{
    Certificate, CertificateRequest, ClientHello, ClientKeyExchange, DigitallySigned, Finished,
    HelloVerifyRequest, ServerHello, ServerKeyExchange,
};
use crate::suite::CipherSuite;
use crate::Error;

/// The 12 byte handshake header that precedes every handshake fragment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MessageType,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

impl Header {
    pub const LEN: usize = 12;

    pub fn parse(input: &[u8]) -> IResult<&[u8], Header> {
        let (input, msg_type) = MessageType::parse(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;

        Ok((
            input,
            Header {
                msg_type,
                length,
                message_seq,
                fragment_offset,
                fragment_length,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.msg_type.as_u8());
        output.extend_from_slice(&self.length.to_be_bytes()[1..]);
        output.extend_from_slice(&self.message_seq.to_be_bytes());
        output.extend_from_slice(&self.fragment_offset.to_be_bytes()[1..]);
        output.extend_from_slice(&self.fragment_length.to_be_bytes()[1..]);
    }

    /// Duplicates of these (unencrypted) handshakes mean the peer never saw
    /// our answering flight; detecting one triggers a resend of it. Only
    /// the first fragment counts, so a message the peer re-fragmented does
    /// not trigger one resend per fragment. ServerHello is in the set for
    /// the sake of abbreviated handshakes, where the client sends the final
    /// flight and a repeated server flight is the only loss signal left.
    pub fn dupe_triggers_resend(&self) -> bool {
        if self.fragment_offset != 0 {
            return false;
        }

        matches!(
            self.msg_type,
            MessageType::ClientHello
                | MessageType::HelloVerifyRequest
                | MessageType::ServerHello
                | MessageType::ServerHelloDone
                | MessageType::ClientKeyExchange
        )
    }
}

/// A parsed handshake message or fragment thereof.
#[derive(Debug, PartialEq, Eq)]
pub struct Handshake<'a> {
    pub header: Header,
    pub body: Body<'a>,
}

impl<'a> Handshake<'a> {
    /// Parse one handshake from `input`.
    ///
    /// With `as_fragment` the body is never interpreted, only framed as
    /// `Body::Fragment`. That is the mode used while scanning incoming
    /// records, where fragments of a message may still be missing and the
    /// negotiated suite (which decides the key exchange body layouts) may
    /// not be known yet.
    pub fn parse(
        input: &'a [u8],
        suite: Option<CipherSuite>,
        as_fragment: bool,
    ) -> IResult<&'a [u8], Handshake<'a>> {
        let (input, header) = Header::parse(input)?;

        let is_partial = header.fragment_offset > 0 || header.fragment_length < header.length;

        if header.fragment_offset + header.fragment_length > header.length {
            return Err(Err::Failure(NomError::new(input, ErrorKind::LengthValue)));
        }

        if !as_fragment && is_partial {
            return Err(Err::Failure(NomError::new(input, ErrorKind::LengthValue)));
        }

        let (input, body) = if as_fragment {
            let (input, fragment) = take(header.fragment_length as usize)(input)?;
            (input, Body::Fragment(fragment))
        } else {
            let (input, body_bytes) = take(header.length as usize)(input)?;
            let (leftover, body) = Body::parse(body_bytes, header.msg_type, suite)?;

            // The header length must frame the body exactly.
            if !leftover.is_empty() {
                return Err(Err::Failure(NomError::new(leftover, ErrorKind::LengthValue)));
            }

            (input, body)
        };

        Ok((input, Handshake { header, body }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        self.header.serialize(output);
        self.body.serialize(output);
    }

    /// Reassemble one handshake message from fragments.
    ///
    /// `fragments` must come ordered by fragment offset and all belong to
    /// the same message seq. Duplicated and overlapping ranges are
    /// tolerated (retransmitted flights re-fragment at whatever the sender
    /// considers the current MTU), gaps are not: missing coverage returns
    /// `ParseIncomplete` and the caller waits for more records.
    ///
    /// On success `buffer` holds the message in canonical form, header
    /// with fragment offset zero included, which is exactly the form that
    /// enters the handshake transcript. When `transcript` is given the
    /// canonical bytes are appended to it here, before the returned
    /// message borrows the buffer.
    pub fn defragment<'f>(
        fragments: impl Iterator<Item = (Header, &'f [u8])>,
        buffer: &'a mut Buf,
        suite: Option<CipherSuite>,
        transcript: Option<&mut Buf>,
    ) -> Result<Handshake<'a>, Error> {
        buffer.clear();

        let mut header: Option<Header> = None;
        let mut covered = 0usize;

        for (fragment_header, bytes) in fragments {
            let first = match header {
                Some(h) => h,
                None => {
                    let canonical = Header {
                        fragment_offset: 0,
                        fragment_length: fragment_header.length,
                        ..fragment_header
                    };
                    buffer.push(canonical.msg_type.as_u8());
                    buffer.extend_from_slice(&canonical.length.to_be_bytes()[1..]);
                    buffer.extend_from_slice(&canonical.message_seq.to_be_bytes());
                    buffer.extend_from_slice(&canonical.fragment_offset.to_be_bytes()[1..]);
                    buffer.extend_from_slice(&canonical.fragment_length.to_be_bytes()[1..]);
                    header = Some(canonical);
                    canonical
                }
            };

            let offset = fragment_header.fragment_offset as usize;
            let end = offset + bytes.len();

            if fragment_header.msg_type != first.msg_type
                || fragment_header.message_seq != first.message_seq
                || fragment_header.length != first.length
                || end > first.length as usize
            {
                return Err(Error::ParseError("inconsistent fragment".into()));
            }

            if offset > covered {
                // Gap. The caller iterates in offset order, so nothing
                // later can fill it either.
                return Err(Error::ParseIncomplete);
            }

            if end <= covered {
                continue;
            }

            buffer.extend_from_slice(&bytes[covered - offset..]);
            covered = end;
        }

        let Some(first) = header else {
            return Err(Error::ParseIncomplete);
        };

        if covered != first.length as usize {
            return Err(Error::ParseIncomplete);
        }

        if let Some(transcript) = transcript {
            transcript.extend_from_slice(&buffer[..]);
        }

        let (_, handshake) = Handshake::parse(&buffer[..], suite, false)?;

        Ok(handshake)
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    HelloRequest, // empty
    ClientHello,
    ServerHello,
    HelloVerifyRequest,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone, // empty
    CertificateVerify,
    ClientKeyExchange,
    Finished,
    Unknown(u8),
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Unknown(0)
    }
}

impl MessageType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => MessageType::HelloRequest,
            1 => MessageType::ClientHello,
            2 => MessageType::ServerHello,
            3 => MessageType::HelloVerifyRequest,
            11 => MessageType::Certificate,
            12 => MessageType::ServerKeyExchange,
            13 => MessageType::CertificateRequest,
            14 => MessageType::ServerHelloDone,
            15 => MessageType::CertificateVerify,
            16 => MessageType::ClientKeyExchange,
            20 => MessageType::Finished,
            _ => MessageType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            MessageType::HelloRequest => 0,
            MessageType::ClientHello => 1,
            MessageType::ServerHello => 2,
            MessageType::HelloVerifyRequest => 3,
            MessageType::Certificate => 11,
            MessageType::ServerKeyExchange => 12,
            MessageType::CertificateRequest => 13,
            MessageType::ServerHelloDone => 14,
            MessageType::CertificateVerify => 15,
            MessageType::ClientKeyExchange => 16,
            MessageType::Finished => 20,
            MessageType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], MessageType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }

    /// The epoch a handshake of this type is sent in. Only the Finished
    /// messages follow the cipher spec change.
    pub fn epoch(&self) -> u16 {
        if matches!(self, MessageType::Finished) {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Body<'a> {
    HelloRequest, // empty
    ClientHello(ClientHello<'a>),
    ServerHello(ServerHello<'a>),
    HelloVerifyRequest(HelloVerifyRequest),
    Certificate(Certificate<'a>),
    ServerKeyExchange(ServerKeyExchange<'a>),
    CertificateRequest(CertificateRequest<'a>),
    ServerHelloDone, // empty
    CertificateVerify(DigitallySigned<'a>),
    ClientKeyExchange(ClientKeyExchange<'a>),
    Finished(Finished<'a>),
    Unknown(u8),
    Fragment(&'a [u8]),
}

impl<'a> Body<'a> {
    pub fn parse(
        input: &'a [u8],
        msg_type: MessageType,
        suite: Option<CipherSuite>,
    ) -> IResult<&'a [u8], Body<'a>> {
        match msg_type {
            MessageType::HelloRequest => Ok((input, Body::HelloRequest)),
            MessageType::ClientHello => {
                let (input, client_hello) = ClientHello::parse(input)?;
                Ok((input, Body::ClientHello(client_hello)))
            }
            MessageType::ServerHello => {
                let (input, server_hello) = ServerHello::parse(input)?;
                Ok((input, Body::ServerHello(server_hello)))
            }
            MessageType::HelloVerifyRequest => {
                let (input, hello_verify_request) = HelloVerifyRequest::parse(input)?;
                Ok((input, Body::HelloVerifyRequest(hello_verify_request)))
            }
            MessageType::Certificate => {
                let (input, certificate) = Certificate::parse(input)?;
                Ok((input, Body::Certificate(certificate)))
            }
            MessageType::ServerKeyExchange => {
                let suite = require_suite(input, suite)?;
                let (input, server_key_exchange) =
                    ServerKeyExchange::parse(input, suite.key_exchange())?;
                Ok((input, Body::ServerKeyExchange(server_key_exchange)))
            }
            MessageType::CertificateRequest => {
                let (input, certificate_request) = CertificateRequest::parse(input)?;
                Ok((input, Body::CertificateRequest(certificate_request)))
            }
            MessageType::ServerHelloDone => Ok((input, Body::ServerHelloDone)),
            MessageType::CertificateVerify => {
                let (input, signed) = DigitallySigned::parse(input)?;
                Ok((input, Body::CertificateVerify(signed)))
            }
            MessageType::ClientKeyExchange => {
                let suite = require_suite(input, suite)?;
                let (input, client_key_exchange) =
                    ClientKeyExchange::parse(input, suite.key_exchange())?;
                Ok((input, Body::ClientKeyExchange(client_key_exchange)))
            }
            MessageType::Finished => {
                let (input, finished) = Finished::parse(input)?;
                Ok((input, Body::Finished(finished)))
            }
            MessageType::Unknown(value) => Ok((input, Body::Unknown(value))),
        }
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        match self {
            Body::HelloRequest => {}
            Body::ClientHello(client_hello) => client_hello.serialize(output),
            Body::ServerHello(server_hello) => server_hello.serialize(output),
            Body::HelloVerifyRequest(hello_verify_request) => {
                hello_verify_request.serialize(output)
            }
            Body::Certificate(certificate) => certificate.serialize(output),
            Body::ServerKeyExchange(server_key_exchange) => server_key_exchange.serialize(output),
            Body::CertificateRequest(certificate_request) => {
                certificate_request.serialize(output)
            }
            Body::ServerHelloDone => {}
            Body::CertificateVerify(signed) => signed.serialize(output),
            Body::ClientKeyExchange(client_key_exchange) => client_key_exchange.serialize(output),
            Body::Finished(finished) => finished.serialize(output),
            Body::Unknown(_) => {}
            Body::Fragment(fragment) => output.extend_from_slice(fragment),
        }
    }
}

fn require_suite(
    input: &[u8],
    suite: Option<CipherSuite>,
) -> Result<CipherSuite, Err<NomError<&[u8]>>> {
    suite.ok_or_else(|| Err::Failure(NomError::new(input, ErrorKind::Fail)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Cookie, Random, SessionId};

    const MESSAGE: &[u8] = &[
        0x01, // MessageType::ClientHello
        0x00, 0x00, 0x2E, // length
        0x00, 0x00, // message_seq
        0x00, 0x00, 0x00, // fragment_offset
        0x00, 0x00, 0x2E, // fragment_length
        // ClientHello
        0xFE, 0xFD, // ProtocolVersion::DTLS1_2
        // Random
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E,
        0x1F, 0x20, //
        0x01, // SessionId length
        0xAA, // SessionId
        0x01, // Cookie length
        0xBB, // Cookie
        0x00, 0x04, // CipherSuites length
        0xC0, 0x2B, // CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256
        0xC0, 0x2C, // CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384
        0x01, // CompressionMethods length
        0x00, // CompressionMethod::Null
    ];

    fn example_client_hello() -> ClientHello<'static> {
        let random = Random::parse(&MESSAGE[14..46]).unwrap().1;
        let session_id = SessionId::try_new(&[0xAA]).unwrap();
        let cookie = Cookie::try_new(&[0xBB]).unwrap();

        let mut client_hello = ClientHello::new(random, session_id, cookie);
        client_hello.cipher_suites.clear();
        client_hello
            .cipher_suites
            .push(CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256);
        client_hello
            .cipher_suites
            .push(CipherSuite::ECDHE_ECDSA_AES256_GCM_SHA384);
        client_hello
    }

    #[test]
    fn handshake_size() {
        let handshake = Handshake {
            header: Header {
                msg_type: MessageType::ServerHelloDone,
                length: 0,
                message_seq: 0,
                fragment_offset: 0,
                fragment_length: 0,
            },
            body: Body::ServerHelloDone,
        };

        let mut serialized = Vec::new();
        handshake.serialize(&mut serialized);

        assert_eq!(serialized.len(), Header::LEN);
    }

    #[test]
    fn roundtrip() {
        let handshake = Handshake {
            header: Header {
                msg_type: MessageType::ClientHello,
                length: 0x2E,
                message_seq: 0,
                fragment_offset: 0,
                fragment_length: 0x2E,
            },
            body: Body::ClientHello(example_client_hello()),
        };

        // Serialize and compare to MESSAGE
        let mut serialized = Vec::new();
        handshake.serialize(&mut serialized);
        assert_eq!(serialized, MESSAGE);

        // Parse and compare with original
        let serialized: &'static [u8] = serialized.leak();
        let (rest, parsed) = Handshake::parse(serialized, None, false).unwrap();
        assert_eq!(parsed, handshake);

        assert!(rest.is_empty());
    }

    #[test]
    fn partial_fragment_only_parses_as_fragment() {
        let mut partial = MESSAGE[..32].to_vec();
        // Patch fragment_length down to the 20 body bytes we kept.
        partial[11] = 20;

        assert!(Handshake::parse(&partial, None, false).is_err());

        let (rest, parsed) = Handshake::parse(&partial, None, true).unwrap();
        assert!(rest.is_empty());
        assert!(matches!(parsed.body, Body::Fragment(f) if f.len() == 20));
    }

    #[test]
    fn defragment_reassembles_with_duplicates() {
        let body = &MESSAGE[Header::LEN..];
        assert_eq!(body.len(), 0x2E);

        let header = |offset: u32, len: u32| Header {
            msg_type: MessageType::ClientHello,
            length: 0x2E,
            message_seq: 0,
            fragment_offset: offset,
            fragment_length: len,
        };

        let fragments = [
            (header(0, 20), &body[0..20]),
            (header(20, 20), &body[20..40]),
            // Exact duplicate of the previous fragment.
            (header(20, 20), &body[20..40]),
            (header(40, 6), &body[40..46]),
        ];

        let mut buffer = Buf::new();
        let mut transcript = Buf::new();
        let handshake = Handshake::defragment(
            fragments.into_iter(),
            &mut buffer,
            None,
            Some(&mut transcript),
        )
        .unwrap();

        assert_eq!(handshake.header.fragment_offset, 0);
        assert_eq!(handshake.header.fragment_length, 0x2E);
        assert!(matches!(handshake.body, Body::ClientHello(_)));

        // The transcript received the canonical unfragmented form.
        assert_eq!(&transcript[..], MESSAGE);
    }

    #[test]
    fn defragment_detects_gap() {
        let body = &MESSAGE[Header::LEN..];

        let header = |offset: u32, len: u32| Header {
            msg_type: MessageType::ClientHello,
            length: 0x2E,
            message_seq: 0,
            fragment_offset: offset,
            fragment_length: len,
        };

        let fragments = [
            (header(0, 20), &body[0..20]),
            (header(40, 6), &body[40..46]),
        ];

        let mut buffer = Buf::new();
        let result = Handshake::defragment(fragments.into_iter(), &mut buffer, None, None);

        assert_eq!(result, Err(Error::ParseIncomplete));
    }

    #[test]
    fn finished_epoch() {
        assert_eq!(MessageType::Finished.epoch(), 1);
        assert_eq!(MessageType::ClientHello.epoch(), 0);
    }
}
