use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::ethernet::{parse_ethernet, EthHeader, ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::{slice_at, FrameError};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

const IPV6_EXT_HOP_BY_HOP: u8 = 0;
const IPV6_EXT_ROUTING: u8 = 43;
const IPV6_EXT_FRAGMENT: u8 = 44;
const IPV6_EXT_DEST_OPTS: u8 = 60;
const IPV6_MAX_EXT_HEADERS: usize = 8;

/// Decoded IP header of an Ethernet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpHeader {
    pub version: u8,
    /// Upper-layer protocol (after any IPv6 extension headers).
    pub protocol: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Offset of the transport header from the start of the frame.
    pub l4_offset: usize,
    /// Set for non-initial fragments, which carry no transport header.
    pub later_fragment: bool,
}

fn ipv4_header(frame: &[u8], ethertype: u16, payload_offset: usize) -> Result<&[u8], FrameError> {
    if ethertype != ETHERTYPE_IPV4 {
        return Err(FrameError::UnexpectedEtherType(ethertype));
    }
    let header = slice_at(frame, payload_offset, IPV4_MIN_HEADER_LEN)?;
    if header[0] >> 4 != 4 {
        return Err(FrameError::Malformed("IPv4 version field is not 4"));
    }
    Ok(header)
}

fn ipv6_header(frame: &[u8], ethertype: u16, payload_offset: usize) -> Result<&[u8], FrameError> {
    if ethertype != ETHERTYPE_IPV6 {
        return Err(FrameError::UnexpectedEtherType(ethertype));
    }
    let header = slice_at(frame, payload_offset, IPV6_HEADER_LEN)?;
    if header[0] >> 4 != 6 {
        return Err(FrameError::Malformed("IPv6 version field is not 6"));
    }
    Ok(header)
}

fn ipv6_addr(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&bytes[..16]);
    Ipv6Addr::from(octets)
}

pub fn extract_ipv4_src(
    frame: &[u8],
    ethertype: u16,
    payload_offset: usize,
) -> Result<Ipv4Addr, FrameError> {
    let h = ipv4_header(frame, ethertype, payload_offset)?;
    Ok(Ipv4Addr::new(h[12], h[13], h[14], h[15]))
}

pub fn extract_ipv4_dst(
    frame: &[u8],
    ethertype: u16,
    payload_offset: usize,
) -> Result<Ipv4Addr, FrameError> {
    let h = ipv4_header(frame, ethertype, payload_offset)?;
    Ok(Ipv4Addr::new(h[16], h[17], h[18], h[19]))
}

pub fn extract_ipv6_src(
    frame: &[u8],
    ethertype: u16,
    payload_offset: usize,
) -> Result<Ipv6Addr, FrameError> {
    let h = ipv6_header(frame, ethertype, payload_offset)?;
    Ok(ipv6_addr(&h[8..24]))
}

pub fn extract_ipv6_dst(
    frame: &[u8],
    ethertype: u16,
    payload_offset: usize,
) -> Result<Ipv6Addr, FrameError> {
    let h = ipv6_header(frame, ethertype, payload_offset)?;
    Ok(ipv6_addr(&h[24..40]))
}

/// Source address of an IPv4 or IPv6 frame.
pub fn extract_ip_src(frame: &[u8]) -> Result<IpAddr, FrameError> {
    let eth = parse_ethernet(frame)?;
    match eth.ethertype {
        ETHERTYPE_IPV4 => extract_ipv4_src(frame, eth.ethertype, eth.payload_offset).map(IpAddr::V4),
        ETHERTYPE_IPV6 => extract_ipv6_src(frame, eth.ethertype, eth.payload_offset).map(IpAddr::V6),
        other => Err(FrameError::UnexpectedEtherType(other)),
    }
}

/// Destination address of an IPv4 or IPv6 frame.
pub fn extract_ip_dst(frame: &[u8]) -> Result<IpAddr, FrameError> {
    let eth = parse_ethernet(frame)?;
    match eth.ethertype {
        ETHERTYPE_IPV4 => extract_ipv4_dst(frame, eth.ethertype, eth.payload_offset).map(IpAddr::V4),
        ETHERTYPE_IPV6 => extract_ipv6_dst(frame, eth.ethertype, eth.payload_offset).map(IpAddr::V6),
        other => Err(FrameError::UnexpectedEtherType(other)),
    }
}

pub fn parse_ip(frame: &[u8], eth: &EthHeader) -> Result<IpHeader, FrameError> {
    match eth.ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(frame, eth.payload_offset),
        ETHERTYPE_IPV6 => parse_ipv6(frame, eth.payload_offset),
        other => Err(FrameError::UnexpectedEtherType(other)),
    }
}

fn parse_ipv4(frame: &[u8], offset: usize) -> Result<IpHeader, FrameError> {
    let h = ipv4_header(frame, ETHERTYPE_IPV4, offset)?;
    let ihl = usize::from(h[0] & 0x0f);
    if ihl < 5 {
        return Err(FrameError::Malformed("IPv4 IHL < 5"));
    }
    let header_len = ihl * 4;
    slice_at(frame, offset, header_len)?;

    let fragment_offset = u16::from_be_bytes([h[6], h[7]]) & 0x1fff;
    Ok(IpHeader {
        version: 4,
        protocol: h[9],
        src: IpAddr::V4(Ipv4Addr::new(h[12], h[13], h[14], h[15])),
        dst: IpAddr::V4(Ipv4Addr::new(h[16], h[17], h[18], h[19])),
        l4_offset: offset + header_len,
        later_fragment: fragment_offset != 0,
    })
}

fn parse_ipv6(frame: &[u8], offset: usize) -> Result<IpHeader, FrameError> {
    let h = ipv6_header(frame, ETHERTYPE_IPV6, offset)?;
    let src = IpAddr::V6(ipv6_addr(&h[8..24]));
    let dst = IpAddr::V6(ipv6_addr(&h[24..40]));

    let mut next_header = h[6];
    let mut cursor = offset + IPV6_HEADER_LEN;
    let mut later_fragment = false;

    for _ in 0..IPV6_MAX_EXT_HEADERS {
        match next_header {
            IPV6_EXT_HOP_BY_HOP | IPV6_EXT_ROUTING | IPV6_EXT_DEST_OPTS => {
                let ext = slice_at(frame, cursor, 2)?;
                let len = (usize::from(ext[1]) + 1) * 8;
                slice_at(frame, cursor, len)?;
                next_header = ext[0];
                cursor += len;
            }
            IPV6_EXT_FRAGMENT => {
                let ext = slice_at(frame, cursor, 8)?;
                let fragment_offset = u16::from_be_bytes([ext[2], ext[3]]) >> 3;
                later_fragment |= fragment_offset != 0;
                next_header = ext[0];
                cursor += 8;
            }
            protocol => {
                return Ok(IpHeader {
                    version: 6,
                    protocol,
                    src,
                    dst,
                    l4_offset: cursor,
                    later_fragment,
                });
            }
        }
    }

    Err(FrameError::Malformed("too many IPv6 extension headers"))
}

/// Destination port of a TCP or UDP frame.
///
/// Returns `Ok(None)` for other protocols and for non-initial fragments.
pub fn extract_dst_port(frame: &[u8], ip: &IpHeader) -> Result<Option<u16>, FrameError> {
    if ip.later_fragment || !matches!(ip.protocol, IPPROTO_TCP | IPPROTO_UDP) {
        return Ok(None);
    }
    let ports = slice_at(frame, ip.l4_offset, 4)?;
    Ok(Some(u16::from_be_bytes([ports[2], ports[3]])))
}
