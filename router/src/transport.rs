//! Frame I/O. The production transport is one `AF_PACKET` socket per
//! configured interface; everything above it only sees the [`Transport`]
//! trait, keyed by interface name.

use crate::config::Interface;
use anyhow::{Context as _, Result, bail};
use socket2::{Domain, Protocol, SockAddr, SockAddrStorage, Socket, Type};
use std::collections::HashMap;
use std::ffi::CString;
use std::io::Read as _;
use std::time::Duration;

pub trait Transport: Send + Sync {
    fn send(&self, iface: &str, frame: &[u8]) -> Result<()>;
}

pub struct PacketSockets {
    sockets: HashMap<String, Socket>,
}

impl PacketSockets {
    /// Opens a raw socket bound to each interface. Receives time out after
    /// a second so receive loops can notice shutdown.
    pub fn open(interfaces: &[Interface]) -> Result<Self> {
        let mut sockets = HashMap::with_capacity(interfaces.len());

        for iface in interfaces {
            let socket = open_packet_socket(&iface.name)
                .with_context(|| format!("Failed to open packet socket on `{}`", iface.name))?;

            sockets.insert(iface.name.clone(), socket);
        }

        Ok(Self { sockets })
    }

    pub fn recv(&self, iface: &str, buf: &mut [u8]) -> Result<usize> {
        let Some(socket) = self.sockets.get(iface) else {
            bail!("Unknown interface `{iface}`");
        };

        let mut reader = socket;

        Ok(reader.read(buf)?)
    }
}

impl Transport for PacketSockets {
    fn send(&self, iface: &str, frame: &[u8]) -> Result<()> {
        let Some(socket) = self.sockets.get(iface) else {
            bail!("Unknown interface `{iface}`");
        };

        socket
            .send(frame)
            .with_context(|| format!("Failed to send on `{iface}`"))?;

        Ok(())
    }
}

const ETH_P_ALL: u16 = libc::ETH_P_ALL as u16;

fn open_packet_socket(name: &str) -> Result<Socket> {
    let ifindex = interface_index(name)?;

    let socket = Socket::new(
        Domain::PACKET,
        Type::RAW,
        Some(Protocol::from(i32::from(ETH_P_ALL.to_be()))),
    )
    .context("socket(AF_PACKET, SOCK_RAW)")?;

    socket
        .set_read_timeout(Some(Duration::from_secs(1)))
        .context("SO_RCVTIMEO")?;

    socket
        .bind(&link_level_addr(ifindex))
        .context("bind to interface")?;

    Ok(socket)
}

fn interface_index(name: &str) -> Result<u32> {
    let cname = CString::new(name).context("Interface name contains a NUL byte")?;

    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };

    if index == 0 {
        bail!("No such interface `{name}`");
    }

    Ok(index)
}

fn link_level_addr(ifindex: u32) -> SockAddr {
    let mut storage = SockAddrStorage::zeroed();

    {
        let sll = unsafe { storage.view_as::<libc::sockaddr_ll>() };
        sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
        sll.sll_protocol = ETH_P_ALL.to_be();
        sll.sll_ifindex = ifindex as i32;
    }

    unsafe { SockAddr::new(storage, std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t) }
}
