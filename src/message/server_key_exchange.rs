use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use crate::message::DigitallySigned;
use crate::suite::{KeyExchangeKind, NamedGroup};

#[derive(Debug, PartialEq, Eq)]
pub struct ServerKeyExchange<'a> {
    pub params: ServerKeyExchangeParams<'a>,
}

/// Body layout depends on the negotiated key exchange. The ECDHE
/// certificate suites sign their params, the PSK variants do not.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerKeyExchangeParams<'a> {
    Ecdh(EcdhParams<'a>, Option<DigitallySigned<'a>>),
    Psk(PskParams<'a>),
    EcdhPsk(PskParams<'a>, EcdhParams<'a>),
}

impl<'a> ServerKeyExchange<'a> {
    pub fn parse(
        input: &'a [u8],
        key_exchange: KeyExchangeKind,
    ) -> IResult<&'a [u8], ServerKeyExchange<'a>> {
        let (input, params) = match key_exchange {
            KeyExchangeKind::EcdheCertificate => {
                let (input, ecdh_params) = EcdhParams::parse(input)?;
                let (input, signature) = if ecdh_params.curve_type == CurveType::NamedCurve {
                    let (input, signed) = DigitallySigned::parse(input)?;
                    (input, Some(signed))
                } else {
                    (input, None)
                };
                (input, ServerKeyExchangeParams::Ecdh(ecdh_params, signature))
            }
            KeyExchangeKind::Psk => {
                let (input, psk_params) = PskParams::parse(input)?;
                (input, ServerKeyExchangeParams::Psk(psk_params))
            }
            KeyExchangeKind::EcdhePsk => {
                let (input, psk_params) = PskParams::parse(input)?;
                let (input, ecdh_params) = EcdhParams::parse(input)?;
                (input, ServerKeyExchangeParams::EcdhPsk(psk_params, ecdh_params))
            }
            KeyExchangeKind::Static => {
                return Err(Err::Failure(Error::new(input, ErrorKind::Tag)));
            }
        };

        Ok((input, ServerKeyExchange { params }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        match &self.params {
            ServerKeyExchangeParams::Ecdh(ecdh_params, signature) => {
                ecdh_params.serialize(output);
                if let Some(signed) = signature {
                    signed.serialize(output);
                }
            }
            ServerKeyExchangeParams::Psk(psk_params) => psk_params.serialize(output),
            ServerKeyExchangeParams::EcdhPsk(psk_params, ecdh_params) => {
                psk_params.serialize(output);
                ecdh_params.serialize(output);
            }
        }
    }

    pub fn ecdh(&self) -> Option<&EcdhParams<'a>> {
        match &self.params {
            ServerKeyExchangeParams::Ecdh(ecdh_params, _) => Some(ecdh_params),
            ServerKeyExchangeParams::EcdhPsk(_, ecdh_params) => Some(ecdh_params),
            ServerKeyExchangeParams::Psk(_) => None,
        }
    }

    pub fn identity_hint(&self) -> Option<&'a [u8]> {
        match &self.params {
            ServerKeyExchangeParams::Psk(psk_params) => Some(psk_params.identity_hint),
            ServerKeyExchangeParams::EcdhPsk(psk_params, _) => Some(psk_params.identity_hint),
            ServerKeyExchangeParams::Ecdh(..) => None,
        }
    }

    pub fn signature(&self) -> Option<&DigitallySigned<'a>> {
        match &self.params {
            ServerKeyExchangeParams::Ecdh(_, signature) => signature.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveType {
    NamedCurve,
    Unknown(u8),
}

impl CurveType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            3 => CurveType::NamedCurve,
            _ => CurveType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            CurveType::NamedCurve => 3,
            CurveType::Unknown(value) => *value,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], CurveType> {
        let (input, value) = be_u8(input)?;
        Ok((input, CurveType::from_u8(value)))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct EcdhParams<'a> {
    pub curve_type: CurveType,
    pub named_group: NamedGroup,
    pub public_key: &'a [u8],
}

impl<'a> EcdhParams<'a> {
    pub fn new(named_group: NamedGroup, public_key: &'a [u8]) -> Self {
        EcdhParams {
            curve_type: CurveType::NamedCurve,
            named_group,
            public_key,
        }
    }

    /// Only the named_curve format can be interpreted. Any other
    /// curve_type swallows the rest of the body so the caller can
    /// reject the message with an alert instead of a parse error.
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], EcdhParams<'a>> {
        let (input, curve_type) = CurveType::parse(input)?;

        if curve_type != CurveType::NamedCurve {
            let (input, _) = take(input.len())(input)?;
            return Ok((
                input,
                EcdhParams {
                    curve_type,
                    named_group: NamedGroup::Unknown(0),
                    public_key: &[],
                },
            ));
        }

        let (input, named_group) = NamedGroup::parse(input)?;
        let (input, public_key_len) = be_u8(input)?;
        let (input, public_key) = take(public_key_len)(input)?;

        Ok((
            input,
            EcdhParams {
                curve_type,
                named_group,
                public_key,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.push(self.curve_type.as_u8());
        output.extend_from_slice(&self.named_group.as_u16().to_be_bytes());
        output.push(self.public_key.len() as u8);
        output.extend_from_slice(self.public_key);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct PskParams<'a> {
    pub identity_hint: &'a [u8],
}

impl<'a> PskParams<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], PskParams<'a>> {
        let (input, hint_len) = be_u16(input)?;
        let (input, identity_hint) = take(hint_len)(input)?;
        Ok((input, PskParams { identity_hint }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&(self.identity_hint.len() as u16).to_be_bytes());
        output.extend_from_slice(self.identity_hint);
    }
}
