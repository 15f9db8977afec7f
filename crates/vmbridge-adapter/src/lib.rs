//! Host-side frame links.
//!
//! A [`FrameLink`] moves whole Ethernet frames between the bridge and something outside the
//! process: a physical interface ([`RawSocketLink`]), a kernel TAP device ([`TapLink`]) or a Unix
//! datagram socket ([`DatagramLink`]). Each `recv` yields exactly one frame and each `send`
//! transmits exactly one frame.

mod datagram;
#[cfg(target_os = "linux")]
mod raw;
#[cfg(target_os = "linux")]
mod sys;
#[cfg(target_os = "linux")]
mod tap;

use std::io;

pub use datagram::DatagramLink;
#[cfg(target_os = "linux")]
pub use raw::RawSocketLink;
#[cfg(target_os = "linux")]
pub use tap::TapLink;

/// Receive buffer size that holds any frame a link can deliver without truncation.
pub const MAX_LINK_FRAME: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("interface {0:?} does not exist")]
    InterfaceNotFound(String),
    #[error("permission denied opening {0:?} (CAP_NET_RAW/CAP_NET_ADMIN required)")]
    PermissionDenied(String),
    #[error("invalid interface name {0:?}")]
    InvalidName(String),
    #[error("{name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}: link closed")]
    Closed(String),
    #[error("{0} links are not supported on this platform")]
    Unsupported(&'static str),
}

impl AdapterError {
    pub(crate) fn io(name: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(name.to_string()),
            _ => Self::Io {
                name: name.to_string(),
                source,
            },
        }
    }

    /// Whether the link is unusable after this error.
    ///
    /// Buffer exhaustion and a carrier that is temporarily down only cost the frame in flight.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io { source, .. } => !matches!(
                source.raw_os_error(),
                Some(code) if is_transient_errno(code)
            ),
            _ => true,
        }
    }
}

#[cfg(target_os = "linux")]
fn is_transient_errno(code: i32) -> bool {
    matches!(
        code,
        libc::ENOBUFS | libc::EMSGSIZE | libc::ENETDOWN | libc::EAGAIN | libc::EINTR
    )
}

#[cfg(not(target_os = "linux"))]
fn is_transient_errno(_code: i32) -> bool {
    false
}

/// A bidirectional, frame-preserving link to the host side.
#[async_trait::async_trait]
pub trait FrameLink: Send + Sync {
    fn name(&self) -> &str;

    /// Transmit one frame.
    async fn send(&self, frame: &[u8]) -> Result<(), AdapterError>;

    /// Receive one frame into `buf`, returning its length.
    ///
    /// A frame longer than `buf` is dropped by the raw socket link and truncated to `buf.len()`
    /// by datagram and TAP links. Callers read into [`MAX_LINK_FRAME`]-sized buffers and drop
    /// anything longer than their own limit, so a partial frame is never forwarded.
    ///
    /// A zero-length frame is returned as `Ok(0)`; loss of the peer is always an error.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, AdapterError>;
}
