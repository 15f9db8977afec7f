//! Header decoding for the frames relayed by the bridge.
//!
//! Everything in this crate works on borrowed byte slices and never panics on malformed input:
//! short or inconsistent headers surface as [`FrameError`]. Only the fields the forwarding and
//! firewall paths need are decoded (MAC addresses, EtherType, IP addresses, L4 protocol and
//! destination port).
#![forbid(unsafe_code)]

pub mod builder;
pub mod ethernet;
pub mod ip;

pub use ethernet::{
    is_broadcast_or_multicast, parse_ethernet, EthHeader, MacAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4,
    ETHERTYPE_IPV6, ETHERTYPE_QINQ, ETHERTYPE_VLAN, ETH_HEADER_LEN,
};
pub use ip::{
    extract_dst_port, extract_ip_dst, extract_ip_src, extract_ipv4_dst, extract_ipv4_src,
    extract_ipv6_dst, extract_ipv6_src, parse_ip, IpHeader, IPPROTO_ICMP, IPPROTO_ICMPV6,
    IPPROTO_TCP, IPPROTO_UDP,
};

/// Decode failure for a single frame.
///
/// A `FrameError` only ever affects the frame that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("truncated header: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("unexpected ethertype {0:#06x}")]
    UnexpectedEtherType(u16),
    #[error("malformed header: {0}")]
    Malformed(&'static str),
}

/// Returns `buf[offset..offset + len]`, or [`FrameError::Truncated`] if `buf` is too short.
pub(crate) fn slice_at(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], FrameError> {
    let end = offset.checked_add(len).ok_or(FrameError::Malformed("offset overflow"))?;
    buf.get(offset..end).ok_or(FrameError::Truncated {
        needed: end,
        actual: buf.len(),
    })
}
