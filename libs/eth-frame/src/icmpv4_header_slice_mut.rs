use crate::slice_utils::write_to_offset;
use etherparse::Icmpv4Slice;
use etherparse::icmpv4::{TYPE_ECHO_REPLY, TYPE_ECHO_REQUEST};

pub struct Icmpv4HeaderSliceMut<'a> {
    slice: &'a mut [u8],
}

impl<'a> Icmpv4HeaderSliceMut<'a> {
    /// Creates a new [`Icmpv4HeaderSliceMut`].
    pub fn from_slice(slice: &'a mut [u8]) -> Result<Self, etherparse::err::LenError> {
        Icmpv4Slice::from_slice(slice)?;

        Ok(Self { slice })
    }

    pub fn set_type(&mut self, ty: u8) {
        self.slice[0] = ty;
    }

    pub fn set_code(&mut self, code: u8) {
        self.slice[1] = code;
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        write_to_offset(self.slice, 2, checksum.to_be_bytes());
    }

    pub fn set_identifier(&mut self, id: u16) {
        debug_assert!(
            self.is_echo_request_or_reply(),
            "ICMP identifier only exists for echo requests and replies"
        );

        write_to_offset(self.slice, 4, id.to_be_bytes());
    }

    fn is_echo_request_or_reply(&self) -> bool {
        let ty = self.slice[0];

        ty == TYPE_ECHO_REPLY || ty == TYPE_ECHO_REQUEST
    }
}
