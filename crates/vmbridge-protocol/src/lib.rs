//! Wire framing for the guest device socket.
//!
//! Each frame on the byte stream is:
//!
//! ```text
//! len (u32 BE) | frame (len bytes, raw Ethernet)
//! ```
//!
//! The codec is transport-agnostic: the bridge drives it over Unix domain stream sockets, but the
//! functions here only deal with byte slices. A length prefix above [`Limits::max_frame_len`] is
//! a protocol violation; decoders report it before any payload is buffered so a peer cannot make
//! the receiver allocate an arbitrary amount of memory.
#![forbid(unsafe_code)]

pub const FRAME_HEADER_LEN: usize = 4;

/// Default upper bound on a single frame.
///
/// Covers a 1514-byte Ethernet frame (1500 MTU) with room for VLAN tags and driver headroom.
pub const DEFAULT_MAX_FRAME_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_frame_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("length prefix {len} exceeds limit of {max}")]
    FrameTooLarge { len: u32, max: usize },
}

pub fn encode_header(frame_len: usize, limits: &Limits) -> Result<[u8; FRAME_HEADER_LEN], EncodeError> {
    let too_large = EncodeError::FrameTooLarge {
        len: frame_len,
        max: limits.max_frame_len,
    };
    if frame_len > limits.max_frame_len {
        return Err(too_large);
    }
    let len = u32::try_from(frame_len).map_err(|_| too_large)?;
    Ok(len.to_be_bytes())
}

/// Encode `frame` with its length prefix into a single buffer.
pub fn encode_frame(frame: &[u8], limits: &Limits) -> Result<Vec<u8>, EncodeError> {
    let header = encode_header(frame.len(), limits)?;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + frame.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(frame);
    Ok(out)
}

/// Decode a length prefix, returning the number of frame bytes that follow it.
pub fn decode_header(header: [u8; FRAME_HEADER_LEN], limits: &Limits) -> Result<usize, DecodeError> {
    let len = u32::from_be_bytes(header);
    match usize::try_from(len) {
        Ok(n) if n <= limits.max_frame_len => Ok(n),
        _ => Err(DecodeError::FrameTooLarge {
            len,
            max: limits.max_frame_len,
        }),
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, or `Ok(Some((frame,
/// consumed)))` where `consumed` counts the prefix and the frame bytes.
pub fn decode_frame<'a>(
    buf: &'a [u8],
    limits: &Limits,
) -> Result<Option<(&'a [u8], usize)>, DecodeError> {
    let Some(header) = buf.get(..FRAME_HEADER_LEN) else {
        return Ok(None);
    };
    let mut prefix = [0u8; FRAME_HEADER_LEN];
    prefix.copy_from_slice(header);
    let len = decode_header(prefix, limits)?;
    let end = FRAME_HEADER_LEN + len;
    Ok(buf.get(FRAME_HEADER_LEN..end).map(|frame| (frame, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian() {
        assert_eq!(encode_header(0x0102, &Limits::default()), Ok([0, 0, 1, 2]));
        assert_eq!(decode_header([0, 0, 1, 2], &Limits::default()), Ok(0x0102));
    }

    #[test]
    fn oversized_prefix_is_rejected_before_payload_arrives() {
        let limits = Limits { max_frame_len: 16 };
        let buf = [0, 0, 0, 17];
        assert_eq!(
            decode_frame(&buf, &limits),
            Err(DecodeError::FrameTooLarge { len: 17, max: 16 })
        );
        assert_eq!(
            decode_header([0xff; 4], &limits),
            Err(DecodeError::FrameTooLarge {
                len: u32::MAX,
                max: 16
            })
        );
    }

    #[test]
    fn oversized_frame_is_not_encoded() {
        let limits = Limits { max_frame_len: 4 };
        assert_eq!(
            encode_frame(&[0u8; 5], &limits),
            Err(EncodeError::FrameTooLarge { len: 5, max: 4 })
        );
        assert_eq!(encode_frame(&[7u8; 4], &limits).unwrap().len(), 8);
    }

    #[test]
    fn partial_input_yields_none() {
        let limits = Limits::default();
        assert_eq!(decode_frame(&[], &limits), Ok(None));
        assert_eq!(decode_frame(&[0, 0], &limits), Ok(None));
        assert_eq!(decode_frame(&[0, 0, 0, 3, 1, 2], &limits), Ok(None));
        assert_eq!(
            decode_frame(&[0, 0, 0, 3, 1, 2, 3, 9], &limits),
            Ok(Some((&[1u8, 2, 3][..], 7)))
        );
    }

    #[test]
    fn empty_frame_is_valid_on_the_wire() {
        let limits = Limits::default();
        let wire = encode_frame(&[], &limits).unwrap();
        assert_eq!(wire, vec![0, 0, 0, 0]);
        assert_eq!(decode_frame(&wire, &limits), Ok(Some((&[][..], 4))));
    }
}
