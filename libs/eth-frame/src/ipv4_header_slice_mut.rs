use crate::slice_utils::write_to_offset;
use etherparse::Ipv4HeaderSlice;
use std::net::Ipv4Addr;

pub struct Ipv4HeaderSliceMut<'a> {
    slice: &'a mut [u8],
}

impl<'a> Ipv4HeaderSliceMut<'a> {
    /// Creates a new [`Ipv4HeaderSliceMut`].
    pub fn from_slice(
        slice: &'a mut [u8],
    ) -> Result<Self, etherparse::err::ipv4::HeaderSliceError> {
        Ipv4HeaderSlice::from_slice(slice)?;

        Ok(Self { slice })
    }

    pub fn get_ttl(&self) -> u8 {
        self.slice[8]
    }

    pub fn get_source(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.slice[12], self.slice[13], self.slice[14], self.slice[15])
    }

    pub fn get_destination(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.slice[16], self.slice[17], self.slice[18], self.slice[19])
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.slice[8] = ttl;
    }

    pub fn set_source(&mut self, src: Ipv4Addr) {
        write_to_offset(self.slice, 12, src.octets());
    }

    pub fn set_destination(&mut self, dst: Ipv4Addr) {
        write_to_offset(self.slice, 16, dst.octets());
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        write_to_offset(self.slice, 10, checksum.to_be_bytes());
    }
}
