use core::fmt;
use core::str::FromStr;

use crate::{slice_at, FrameError};

pub const ETH_HEADER_LEN: usize = 14;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERTYPE_QINQ: u16 = 0x88a8;

/// At most an outer S-tag and an inner C-tag are looked through.
const MAX_VLAN_TAGS: usize = 2;
const VLAN_TAG_LEN: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xff; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// I/G bit of the first octet. Broadcast is a multicast address too.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for octet in out.iter_mut() {
            let part = parts.next().ok_or(FrameError::Malformed("MAC has fewer than 6 octets"))?;
            if part.len() != 2 {
                return Err(FrameError::Malformed("MAC octet must be two hex digits"));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| FrameError::Malformed("MAC octet is not hex"))?;
        }
        if parts.next().is_some() {
            return Err(FrameError::Malformed("MAC has more than 6 octets"));
        }
        Ok(Self(out))
    }
}

/// Decoded Ethernet header.
///
/// `ethertype` is the type of the payload found at `payload_offset`. For 802.1Q / 802.1ad tagged
/// frames the tags are skipped, so a tagged IPv4 frame reports [`ETHERTYPE_IPV4`] and a payload
/// offset past the tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub ethertype: u16,
    pub payload_offset: usize,
}

impl EthHeader {
    pub fn is_ip(&self) -> bool {
        matches!(self.ethertype, ETHERTYPE_IPV4 | ETHERTYPE_IPV6)
    }
}

pub fn parse_ethernet(frame: &[u8]) -> Result<EthHeader, FrameError> {
    let header = slice_at(frame, 0, ETH_HEADER_LEN)?;
    let mut dst = [0u8; 6];
    dst.copy_from_slice(&header[0..6]);
    let mut src = [0u8; 6];
    src.copy_from_slice(&header[6..12]);
    let mut ethertype = u16::from_be_bytes([header[12], header[13]]);
    let mut payload_offset = ETH_HEADER_LEN;

    let mut tags = 0;
    while matches!(ethertype, ETHERTYPE_VLAN | ETHERTYPE_QINQ) {
        if tags == MAX_VLAN_TAGS {
            return Err(FrameError::Malformed("too many VLAN tags"));
        }
        let tag = slice_at(frame, payload_offset, VLAN_TAG_LEN)?;
        ethertype = u16::from_be_bytes([tag[2], tag[3]]);
        payload_offset += VLAN_TAG_LEN;
        tags += 1;
    }

    Ok(EthHeader {
        dst_mac: MacAddr(dst),
        src_mac: MacAddr(src),
        ethertype,
        payload_offset,
    })
}

pub fn is_broadcast_or_multicast(mac: &MacAddr) -> bool {
    mac.is_broadcast() || mac.is_multicast()
}
