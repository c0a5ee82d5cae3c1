use std::array::from_fn;

use nom::bytes::complete::take;
use nom::number::complete::be_u32;
use nom::IResult;

use crate::rng::SeededRng;

/// The 32-byte hello random: a 4-byte timestamp field and 28 random bytes.
///
/// The timestamp field is also drawn from the rng. Nothing in the protocol
/// requires it to be wall clock time and filling it randomly keeps the
/// engine free of clock access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Random {
    pub gmt_unix_time: u32,
    pub random_bytes: [u8; 28],
}

impl Random {
    pub fn new(rng: &mut SeededRng) -> Self {
        Self {
            gmt_unix_time: rng.random(),
            random_bytes: from_fn(|_| rng.random()),
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Random> {
        let (input, gmt_unix_time) = be_u32(input)?;
        let (input, random_slice) = take(28usize)(input)?;

        // unwrap: take() returned exactly 28 bytes.
        let random_bytes: [u8; 28] = random_slice.try_into().unwrap();

        Ok((
            input,
            Random {
                gmt_unix_time,
                random_bytes,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.gmt_unix_time.to_be_bytes());
        output.extend_from_slice(&self.random_bytes);
    }

    /// The full 32-byte wire form, used as PRF seed material.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0; 32];
        out[..4].copy_from_slice(&self.gmt_unix_time.to_be_bytes());
        out[4..].copy_from_slice(&self.random_bytes);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &[u8] = &[
        0x01, 0x02, 0x03, 0x04, // gmt_unix_time
        0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13,
        0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F, 0x20,
    ];

    #[test]
    fn roundtrip() {
        let (rest, random) = Random::parse(MESSAGE).unwrap();
        assert!(rest.is_empty());
        assert_eq!(random.gmt_unix_time, 0x01020304);

        let mut serialized = Vec::new();
        random.serialize(&mut serialized);
        assert_eq!(serialized, MESSAGE);
        assert_eq!(&random.to_bytes()[..], MESSAGE);
    }

    #[test]
    fn parse_too_short() {
        assert!(Random::parse(&MESSAGE[..31]).is_err());
    }

    #[test]
    fn distinct_per_draw() {
        let mut rng = SeededRng::new(Some(1));
        let a = Random::new(&mut rng);
        let b = Random::new(&mut rng);
        assert_ne!(a, b);
    }
}
