use nom::IResult;
use smallvec::SmallVec;

use crate::message::client_hello::{parse_extensions, serialize_extensions};
use crate::message::{
    CompressionMethod, Extension, ExtensionType, ProtocolVersion, Random, SessionId,
};
use crate::suite::CipherSuite;

#[derive(Debug, PartialEq, Eq)]
pub struct ServerHello<'a> {
    pub server_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cipher_suite: CipherSuite,
    pub compression_method: CompressionMethod,
    pub extensions: SmallVec<[Extension<'a>; 8]>,
}

impl<'a> ServerHello<'a> {
    pub fn new(random: Random, session_id: SessionId, cipher_suite: CipherSuite) -> Self {
        ServerHello {
            server_version: ProtocolVersion::DTLS1_2,
            random,
            session_id,
            cipher_suite,
            compression_method: CompressionMethod::Null,
            extensions: SmallVec::new(),
        }
    }

    pub fn extension_data(&self, extension_type: ExtensionType) -> Option<&'a [u8]> {
        self.extensions
            .iter()
            .find(|e| e.extension_type == extension_type)
            .map(|e| e.extension_data)
    }

    pub fn has_extension(&self, extension_type: ExtensionType) -> bool {
        self.extensions
            .iter()
            .any(|e| e.extension_type == extension_type)
    }

    pub fn confirms_extended_master_secret(&self) -> bool {
        self.has_extension(ExtensionType::ExtendedMasterSecret)
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ServerHello<'a>> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cipher_suite) = CipherSuite::parse(input)?;
        let (input, compression_method) = CompressionMethod::parse(input)?;

        let (input, extensions) = parse_extensions(input)?;

        Ok((
            input,
            ServerHello {
                server_version,
                random,
                session_id,
                cipher_suite,
                compression_method,
                extensions,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.server_version.as_u16().to_be_bytes());
        self.random.serialize(output);
        output.push(self.session_id.len() as u8);
        output.extend_from_slice(&self.session_id);
        output.extend_from_slice(&self.cipher_suite.as_u16().to_be_bytes());
        output.push(self.compression_method.as_u8());

        serialize_extensions(&self.extensions, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &[u8] = &[
        0xFE, 0xFD, // ProtocolVersion::DTLS1_2
        // Random
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E,
        0x1F, 0x20, //
        0x01, // SessionId length
        0xAA, // SessionId
        0xC0, 0x2B, // CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256
        0x00, // CompressionMethod::Null
        0x00, 0x04, // Extensions length
        // Extensions
        0x00, 0x17, // ExtensionType::ExtendedMasterSecret
        0x00, 0x00, // data length
    ];

    #[test]
    fn roundtrip() {
        let random = Random::parse(&MESSAGE[2..34]).unwrap().1;
        let session_id = SessionId::try_new(&[0xAA]).unwrap();

        let mut server_hello = ServerHello::new(
            random,
            session_id,
            CipherSuite::ECDHE_ECDSA_AES128_GCM_SHA256,
        );
        server_hello
            .extensions
            .push(Extension::new(ExtensionType::ExtendedMasterSecret, &[]));

        // Serialize and compare to MESSAGE
        let mut serialized = Vec::new();
        server_hello.serialize(&mut serialized);
        assert_eq!(serialized, MESSAGE);

        // Parse and compare with original
        let serialized: &'static [u8] = serialized.leak();
        let (rest, parsed) = ServerHello::parse(serialized).unwrap();
        assert_eq!(parsed, server_hello);
        assert!(parsed.confirms_extended_master_secret());

        assert!(rest.is_empty());
    }

    #[test]
    fn no_extensions() {
        let (rest, parsed) = ServerHello::parse(&MESSAGE[..39]).unwrap();
        assert!(rest.is_empty());
        assert!(parsed.extensions.is_empty());
        assert!(!parsed.confirms_extended_master_secret());
    }

    #[test]
    fn session_id_too_long() {
        let mut message = MESSAGE.to_vec();
        message[34] = 0x21; // SessionId length (33, which is too long)

        let result = ServerHello::parse(&message);
        assert!(result.is_err());
    }
}
