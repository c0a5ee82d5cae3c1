use nom::bytes::complete::take;
use nom::number::complete::be_u16;
use nom::IResult;
use smallvec::SmallVec;

use crate::suite::NamedGroup;
use crate::util::many0;

/// The supported_groups (formerly elliptic_curves) extension payload.
///
/// Unknown group codes are kept as `NamedGroup::Unknown` rather than
/// dropped. Selection later needs the peer's original preference order,
/// and an offer consisting only of unknown groups must be distinguishable
/// from an empty offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedGroupsExtension {
    pub groups: SmallVec<[NamedGroup; 8]>,
}

impl SupportedGroupsExtension {
    pub fn new(groups: &[NamedGroup]) -> Self {
        SupportedGroupsExtension {
            groups: SmallVec::from_slice(groups),
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], SupportedGroupsExtension> {
        let (input, list_len) = be_u16(input)?;
        let (input, list) = take(list_len)(input)?;

        let (leftover, groups) = many0(NamedGroup::parse)(list)?;

        if !leftover.is_empty() {
            return Err(nom::Err::Failure(nom::error::Error::new(
                leftover,
                nom::error::ErrorKind::LengthValue,
            )));
        }

        Ok((input, SupportedGroupsExtension { groups }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&((self.groups.len() * 2) as u16).to_be_bytes());

        for group in &self.groups {
            output.extend_from_slice(&group.as_u16().to_be_bytes());
        }
    }
}

/// Pick the key exchange group: first group in the peer's preference order
/// that we both support and can run.
pub fn select_named_group(peer: &[NamedGroup], local: &[NamedGroup]) -> Option<NamedGroup> {
    peer.iter()
        .find(|g| g.is_usable() && local.contains(g))
        .copied()
}
