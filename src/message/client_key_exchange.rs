use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use crate::suite::KeyExchangeKind;

#[derive(Debug, PartialEq, Eq)]
pub struct ClientKeyExchange<'a> {
    pub exchange_keys: ExchangeKeys<'a>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ExchangeKeys<'a> {
    Ecdh(ClientEcdhKeys<'a>),
    Psk { identity: &'a [u8] },
    EcdhPsk { identity: &'a [u8], public_key: &'a [u8] },
}

/// Ephemeral public key only. Curve and point format were fixed by the
/// preceding ServerKeyExchange.
#[derive(Debug, PartialEq, Eq)]
pub struct ClientEcdhKeys<'a> {
    pub public_key: &'a [u8],
}

impl<'a> ClientEcdhKeys<'a> {
    pub fn new(public_key: &'a [u8]) -> Self {
        ClientEcdhKeys { public_key }
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ClientEcdhKeys<'a>> {
        let (input, public_key_len) = be_u8(input)?;
        let (input, public_key) = take(public_key_len)(input)?;

        Ok((input, ClientEcdhKeys { public_key }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.public_key.len() as u8);
        output.extend_from_slice(self.public_key);
    }
}

impl<'a> ClientKeyExchange<'a> {
    pub fn new(exchange_keys: ExchangeKeys<'a>) -> Self {
        ClientKeyExchange { exchange_keys }
    }

    pub fn parse(
        input: &'a [u8],
        key_exchange: KeyExchangeKind,
    ) -> IResult<&'a [u8], ClientKeyExchange<'a>> {
        let (input, exchange_keys) = match key_exchange {
            KeyExchangeKind::EcdheCertificate => {
                let (input, ecdh_keys) = ClientEcdhKeys::parse(input)?;
                (input, ExchangeKeys::Ecdh(ecdh_keys))
            }
            KeyExchangeKind::Psk => {
                let (input, identity) = parse_identity(input)?;
                (input, ExchangeKeys::Psk { identity })
            }
            KeyExchangeKind::EcdhePsk => {
                let (input, identity) = parse_identity(input)?;
                let (input, ecdh_keys) = ClientEcdhKeys::parse(input)?;
                (
                    input,
                    ExchangeKeys::EcdhPsk {
                        identity,
                        public_key: ecdh_keys.public_key,
                    },
                )
            }
            KeyExchangeKind::Static => {
                return Err(Err::Failure(Error::new(input, ErrorKind::Tag)));
            }
        };

        Ok((input, ClientKeyExchange { exchange_keys }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        match &self.exchange_keys {
            ExchangeKeys::Ecdh(ecdh_keys) => ecdh_keys.serialize(output),
            ExchangeKeys::Psk { identity } => serialize_identity(identity, output),
            ExchangeKeys::EcdhPsk {
                identity,
                public_key,
            } => {
                serialize_identity(identity, output);
                ClientEcdhKeys::new(public_key).serialize(output);
            }
        }
    }

    pub fn psk_identity(&self) -> Option<&'a [u8]> {
        match &self.exchange_keys {
            ExchangeKeys::Psk { identity } => Some(identity),
            ExchangeKeys::EcdhPsk { identity, .. } => Some(identity),
            ExchangeKeys::Ecdh(_) => None,
        }
    }

    pub fn public_key(&self) -> Option<&'a [u8]> {
        match &self.exchange_keys {
            ExchangeKeys::Ecdh(ecdh_keys) => Some(ecdh_keys.public_key),
            ExchangeKeys::EcdhPsk { public_key, .. } => Some(public_key),
            ExchangeKeys::Psk { .. } => None,
        }
    }
}

fn parse_identity(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, identity_len) = be_u16(input)?;
    take(identity_len)(input)
}

fn serialize_identity(identity: &[u8], output: &mut Vec<u8>) {
    output.extend_from_slice(&(identity.len() as u16).to_be_bytes());
    output.extend_from_slice(identity);
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECDH_MESSAGE: &[u8] = &[
        0x04, // Public key length
        0x01, 0x02, 0x03, 0x04, // Public key
    ];

    const ECDH_PSK_MESSAGE: &[u8] = &[
        0x00, 0x02, // Identity length
        b'i', b'd', // Identity
        0x04, // Public key length
        0x01, 0x02, 0x03, 0x04, // Public key
    ];

    #[test]
    fn roundtrip_ecdh() {
        let client_key_exchange =
            ClientKeyExchange::new(ExchangeKeys::Ecdh(ClientEcdhKeys::new(&ECDH_MESSAGE[1..])));

        let mut serialized = Vec::new();
        client_key_exchange.serialize(&mut serialized);
        assert_eq!(serialized, ECDH_MESSAGE);

        let (rest, parsed) =
            ClientKeyExchange::parse(&serialized, KeyExchangeKind::EcdheCertificate).unwrap();
        assert_eq!(parsed, client_key_exchange);
        assert_eq!(parsed.public_key(), Some(&ECDH_MESSAGE[1..]));
        assert_eq!(parsed.psk_identity(), None);

        assert!(rest.is_empty());
    }

    #[test]
    fn roundtrip_psk() {
        let message: &[u8] = &[0x00, 0x03, b'a', b'b', b'c'];

        let client_key_exchange = ClientKeyExchange::new(ExchangeKeys::Psk { identity: b"abc" });

        let mut serialized = Vec::new();
        client_key_exchange.serialize(&mut serialized);
        assert_eq!(serialized, message);

        let (rest, parsed) = ClientKeyExchange::parse(&serialized, KeyExchangeKind::Psk).unwrap();
        assert_eq!(parsed, client_key_exchange);
        assert_eq!(parsed.psk_identity(), Some(&b"abc"[..]));
        assert_eq!(parsed.public_key(), None);

        assert!(rest.is_empty());
    }

    #[test]
    fn roundtrip_ecdhe_psk() {
        let client_key_exchange = ClientKeyExchange::new(ExchangeKeys::EcdhPsk {
            identity: b"id",
            public_key: &ECDH_PSK_MESSAGE[5..],
        });

        let mut serialized = Vec::new();
        client_key_exchange.serialize(&mut serialized);
        assert_eq!(serialized, ECDH_PSK_MESSAGE);

        let (rest, parsed) =
            ClientKeyExchange::parse(&serialized, KeyExchangeKind::EcdhePsk).unwrap();
        assert_eq!(parsed, client_key_exchange);
        assert_eq!(parsed.psk_identity(), Some(&b"id"[..]));
        assert_eq!(parsed.public_key(), Some(&ECDH_PSK_MESSAGE[5..]));

        assert!(rest.is_empty());
    }
}
