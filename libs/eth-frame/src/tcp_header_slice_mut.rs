use crate::slice_utils::{read_be_u16, write_to_offset};
use etherparse::TcpHeaderSlice;

pub struct TcpHeaderSliceMut<'a> {
    slice: &'a mut [u8],
}

impl<'a> TcpHeaderSliceMut<'a> {
    /// Creates a new [`TcpHeaderSliceMut`].
    pub fn from_slice(slice: &'a mut [u8]) -> Result<Self, etherparse::err::tcp::HeaderSliceError> {
        TcpHeaderSlice::from_slice(slice)?;

        Ok(Self { slice })
    }

    pub fn get_source_port(&self) -> u16 {
        read_be_u16(self.slice, 0)
    }

    pub fn get_destination_port(&self) -> u16 {
        read_be_u16(self.slice, 2)
    }

    pub fn set_source_port(&mut self, src: u16) {
        write_to_offset(self.slice, 0, src.to_be_bytes());
    }

    pub fn set_destination_port(&mut self, dst: u16) {
        write_to_offset(self.slice, 2, dst.to_be_bytes());
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        write_to_offset(self.slice, 16, checksum.to_be_bytes());
    }
}
