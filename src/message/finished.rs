use nom::bytes::complete::take;
use nom::IResult;

#[derive(Debug, PartialEq, Eq)]
pub struct Finished<'a> {
    pub verify_data: &'a [u8],
}

impl<'a> Finished<'a> {
    /// PRF output carried as verify_data.
    pub const VERIFY_DATA_LEN: usize = 12;

    pub fn new(verify_data: &'a [u8]) -> Self {
        Finished { verify_data }
    }

    /// The handshake header length bounds the body, so verify_data is
    /// whatever remains. Length is checked when the value is compared.
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Finished<'a>> {
        let (input, verify_data) = take(input.len())(input)?;
        Ok((input, Finished { verify_data }))
    }

    pub fn serialize(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(self.verify_data);
    }
}
