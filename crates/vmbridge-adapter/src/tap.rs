use std::fs::File;
use std::io::{self, Read, Write};

use tokio::io::unix::AsyncFd;

use crate::{sys, AdapterError, FrameLink};

/// A kernel TAP device, one frame per read/write.
///
/// Bringing the interface up and attaching addresses is left to whoever provisions the host.
pub struct TapLink {
    name: String,
    file: AsyncFd<File>,
}

impl TapLink {
    /// Requires `CAP_NET_ADMIN` unless the device already exists and is owned by the caller.
    pub fn open(name: &str) -> Result<Self, AdapterError> {
        let (file, assigned) = sys::open_tap(name)?;
        let file = AsyncFd::new(file).map_err(|e| AdapterError::io(name, e))?;
        tracing::info!(interface = %assigned, "tap device attached");
        Ok(Self {
            name: assigned,
            file,
        })
    }
}

#[async_trait::async_trait]
impl FrameLink for TapLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, frame: &[u8]) -> Result<(), AdapterError> {
        loop {
            let mut guard = self
                .file
                .writable()
                .await
                .map_err(|e| AdapterError::io(&self.name, e))?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                let n = file.write(frame)?;
                if n != frame.len() {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "short tap write"));
                }
                Ok(())
            }) {
                Ok(result) => return result.map_err(|e| AdapterError::io(&self.name, e)),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, AdapterError> {
        loop {
            let mut guard = self
                .file
                .readable()
                .await
                .map_err(|e| AdapterError::io(&self.name, e))?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(Ok(0)) => return Err(AdapterError::Closed(self.name.clone())),
                Ok(Ok(len)) => return Ok(len),
                Ok(Err(e)) => return Err(AdapterError::io(&self.name, e)),
                Err(_would_block) => continue,
            }
        }
    }
}
