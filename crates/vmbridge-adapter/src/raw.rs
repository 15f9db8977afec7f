use std::os::fd::{AsRawFd, OwnedFd};

use tokio::io::unix::AsyncFd;

use crate::sys::{self, Received};
use crate::{AdapterError, FrameLink};

/// Promiscuous `AF_PACKET` link on a physical interface.
///
/// Frames the host itself transmits on the interface (including the ones this link sends) are
/// filtered out on receive, so the bridge never sees its own output again.
pub struct RawSocketLink {
    name: String,
    fd: AsyncFd<OwnedFd>,
}

impl RawSocketLink {
    /// Requires `CAP_NET_RAW`.
    pub fn open(ifname: &str) -> Result<Self, AdapterError> {
        let fd = sys::open_packet_socket(ifname)?;
        let fd = AsyncFd::new(fd).map_err(|e| AdapterError::io(ifname, e))?;
        tracing::info!(interface = ifname, "raw socket attached");
        Ok(Self {
            name: ifname.to_string(),
            fd,
        })
    }
}

#[async_trait::async_trait]
impl FrameLink for RawSocketLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, frame: &[u8]) -> Result<(), AdapterError> {
        loop {
            let mut guard = self
                .fd
                .writable()
                .await
                .map_err(|e| AdapterError::io(&self.name, e))?;
            match guard.try_io(|inner| sys::send_packet(inner.get_ref().as_raw_fd(), frame)) {
                Ok(result) => return result.map_err(|e| AdapterError::io(&self.name, e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, AdapterError> {
        loop {
            let mut guard = self
                .fd
                .readable()
                .await
                .map_err(|e| AdapterError::io(&self.name, e))?;
            let received = match guard.try_io(|inner| sys::recv_packet(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => result.map_err(|e| AdapterError::io(&self.name, e))?,
                Err(_would_block) => continue,
            };
            match received {
                Received::Frame(len) => return Ok(len),
                Received::Outgoing => continue,
                Received::Oversized(len) => {
                    tracing::debug!(interface = %self.name, len, "discarding oversized frame");
                }
            }
        }
    }
}
