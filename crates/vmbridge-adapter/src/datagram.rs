use std::io;
use std::path::Path;

use tokio::net::UnixDatagram;

use crate::{AdapterError, FrameLink};

/// Frame link over a connected Unix datagram socket. One datagram carries one frame.
///
/// Needs no privileges, which makes it the link of choice for running against a userspace switch
/// and for tests.
#[derive(Debug)]
pub struct DatagramLink {
    name: String,
    socket: UnixDatagram,
}

impl DatagramLink {
    pub fn new(name: impl Into<String>, socket: UnixDatagram) -> Self {
        Self {
            name: name.into(),
            socket,
        }
    }

    /// Two links wired to each other.
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> io::Result<(Self, Self)> {
        let (left, right) = UnixDatagram::pair()?;
        Ok((Self::new(a, left), Self::new(b, right)))
    }

    /// Connect an unbound socket to a peer listening on `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let socket = UnixDatagram::unbound().map_err(|e| AdapterError::io(&name, e))?;
        socket.connect(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AdapterError::InterfaceNotFound(name.clone()),
            _ => AdapterError::io(&name, e),
        })?;
        Ok(Self { name, socket })
    }
}

#[async_trait::async_trait]
impl FrameLink for DatagramLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, frame: &[u8]) -> Result<(), AdapterError> {
        match self.socket.send(frame).await {
            Ok(_) => Ok(()),
            Err(e) if is_peer_gone(&e) => Err(AdapterError::Closed(self.name.clone())),
            Err(e) => Err(AdapterError::io(&self.name, e)),
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, AdapterError> {
        match self.socket.recv(buf).await {
            Ok(len) => Ok(len),
            Err(e) if is_peer_gone(&e) => Err(AdapterError::Closed(self.name.clone())),
            Err(e) => Err(AdapterError::io(&self.name, e)),
        }
    }
}

fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_preserves_frame_boundaries() {
        let (a, b) = DatagramLink::pair("a", "b").unwrap();
        assert_eq!(a.name(), "a");

        a.send(&[1u8; 60]).await.unwrap();
        a.send(&[2u8; 1514]).await.unwrap();

        let mut buf = [0u8; 2048];
        assert_eq!(b.recv(&mut buf).await.unwrap(), 60);
        assert!(buf[..60].iter().all(|&x| x == 1));
        assert_eq!(b.recv(&mut buf).await.unwrap(), 1514);
        assert!(buf[..1514].iter().all(|&x| x == 2));
    }

    #[tokio::test]
    async fn send_to_a_dropped_peer_reports_closed() {
        let (a, b) = DatagramLink::pair("a", "b").unwrap();
        drop(b);
        let err = a.send(&[0u8; 60]).await.unwrap_err();
        assert!(matches!(err, AdapterError::Closed(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn empty_datagram_is_an_empty_frame() {
        let (a, b) = DatagramLink::pair("a", "b").unwrap();
        a.send(&[]).await.unwrap();
        a.send(&[7u8; 60]).await.unwrap();

        let mut buf = [0u8; 2048];
        assert_eq!(b.recv(&mut buf).await.unwrap(), 0);
        assert_eq!(b.recv(&mut buf).await.unwrap(), 60);
    }

    #[tokio::test]
    async fn oversized_datagram_fills_the_buffer() {
        let (a, b) = DatagramLink::pair("a", "b").unwrap();
        a.send(&[1u8; 3014]).await.unwrap();

        let mut buf = vec![0u8; crate::MAX_LINK_FRAME];
        assert_eq!(b.recv(&mut buf).await.unwrap(), 3014);
    }

    #[tokio::test]
    async fn connect_to_missing_path_reports_not_found() {
        let dir = std::env::temp_dir().join(format!("vmbridge-adapter-{}", std::process::id()));
        let err = DatagramLink::connect(dir.join("missing.sock")).unwrap_err();
        assert!(matches!(err, AdapterError::InterfaceNotFound(_)));
    }
}
