use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};
use smallvec::SmallVec;

use crate::message::{
    CompressionMethod, Cookie, Extension, ExtensionType, ProtocolVersion, Random, SessionId,
};
use crate::suite::CipherSuite;
use crate::util::many1;

#[derive(Debug, PartialEq, Eq)]
pub struct ClientHello<'a> {
    pub client_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cookie: Cookie,
    pub cipher_suites: SmallVec<[CipherSuite; 16]>,
    pub compression_methods: SmallVec<[CompressionMethod; 4]>,
    pub extensions: SmallVec<[Extension<'a>; 8]>,
}

impl<'a> ClientHello<'a> {
    /// A hello offering every runnable suite and null compression. Callers
    /// prune `cipher_suites` and attach extensions afterwards.
    pub fn new(random: Random, session_id: SessionId, cookie: Cookie) -> Self {
        let mut cipher_suites = SmallVec::new();
        cipher_suites.extend(CipherSuite::all());

        let mut compression_methods = SmallVec::new();
        compression_methods.push(CompressionMethod::Null);

        ClientHello {
            client_version: ProtocolVersion::DTLS1_2,
            random,
            session_id,
            cookie,
            cipher_suites,
            compression_methods,
            extensions: SmallVec::new(),
        }
    }

    /// Raw payload of an extension, if the client sent it.
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

    pub fn offers_extended_master_secret(&self) -> bool {
        self.has_extension(ExtensionType::ExtendedMasterSecret)
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ClientHello<'a>> {
        let (input, client_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;

        let (input, cipher_suites_len) = be_u16(input)?;
        let (input, input_cipher) = take(cipher_suites_len)(input)?;
        let (rest, cipher_suites) = many1(CipherSuite::parse)(input_cipher)?;
        if !rest.is_empty() {
            return Err(Err::Failure(Error::new(rest, ErrorKind::LengthValue)));
        }

        let (input, compression_methods_len) = be_u8(input)?;
        let (input, input_compression) = take(compression_methods_len)(input)?;
        let (rest, compression_methods) = many1(CompressionMethod::parse)(input_compression)?;
        if !rest.is_empty() {
            return Err(Err::Failure(Error::new(rest, ErrorKind::LengthValue)));
        }

        let (input, extensions) = parse_extensions(input)?;

        Ok((
            input,
            ClientHello {
                client_version,
                random,
                session_id,
                cookie,
                cipher_suites,
                compression_methods,
                extensions,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.client_version.as_u16().to_be_bytes());
        self.random.serialize(output);
        output.push(self.session_id.len() as u8);
        output.extend_from_slice(&self.session_id);
        output.push(self.cookie.len() as u8);
        output.extend_from_slice(&self.cookie);

        output.extend_from_slice(&(self.cipher_suites.len() as u16 * 2).to_be_bytes());
        for suite in &self.cipher_suites {
            output.extend_from_slice(&suite.as_u16().to_be_bytes());
        }

        output.push(self.compression_methods.len() as u8);
        for method in &self.compression_methods {
            output.push(method.as_u8());
        }

        serialize_extensions(&self.extensions, output);
    }
}

/// Parse the optional extensions block. An absent block (input exhausted
/// after compression methods) is fine, a truncated one is not.
pub(crate) fn parse_extensions(
    input: &[u8],
) -> IResult<&[u8], SmallVec<[Extension<'_>; 8]>> {
    let mut extensions = SmallVec::new();

    if input.is_empty() {
        return Ok((input, extensions));
    }

    let (input, extensions_len) = be_u16(input)?;
    let (input, mut extensions_data) = take(extensions_len)(input)?;

    while !extensions_data.is_empty() {
        let (rest, extension) = Extension::parse(extensions_data)?;
        extensions.push(extension);
        extensions_data = rest;
    }

    Ok((input, extensions))
}

/// Serialize the extensions block, omitted entirely when empty.
pub(crate) fn serialize_extensions(extensions: &[Extension<'_>], output: &mut Vec<u8>) {
    if extensions.is_empty() {
        return;
    }

    let extensions_len: usize = extensions.iter().map(|e| 4 + e.extension_data.len()).sum();
    output.extend_from_slice(&(extensions_len as u16).to_be_bytes());

    for extension in extensions {
        extension.serialize(output);
    }
}
