//! Length-prefixed frame endpoints over Unix domain stream sockets.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of Ethernet frame. A
//! stream that ends anywhere (between frames or inside one) reports
//! [`TransportError::Disconnected`]; a partial frame is never returned.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use vmbridge_protocol::{decode_header, encode_frame, DecodeError, EncodeError, Limits, FRAME_HEADER_LEN};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] DecodeError),
    #[error(transparent)]
    FrameTooLarge(#[from] EncodeError),
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
}

fn classify(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => TransportError::Disconnected,
        _ => TransportError::Io(err),
    }
}

/// Receiving half of a frame endpoint.
pub struct FrameReader<R> {
    io: R,
    limits: Limits,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, limits: Limits) -> Self {
        Self { io, limits }
    }

    /// Read the next whole frame.
    ///
    /// An oversized length prefix fails before any frame buffer is allocated.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.io.read_exact(&mut header).await.map_err(classify)?;
        let len = decode_header(header, &self.limits)?;

        let mut frame = vec![0u8; len];
        self.io.read_exact(&mut frame).await.map_err(classify)?;
        Ok(frame)
    }
}

/// Sending half of a frame endpoint.
pub struct FrameWriter<W> {
    io: W,
    limits: Limits,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, limits: Limits) -> Self {
        Self { io, limits }
    }

    /// Write one frame. Prefix and payload go out as a single buffer.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let buf = encode_frame(frame, &self.limits)?;
        self.io.write_all(&buf).await.map_err(classify)?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.io.shutdown().await.map_err(classify)
    }
}

/// A connected frame endpoint.
pub struct FrameTransport {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl FrameTransport {
    pub fn new(stream: UnixStream, limits: Limits) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader::new(read, limits),
            writer: FrameWriter::new(write, limits),
        }
    }

    /// Dial a device socket.
    pub async fn connect(path: impl AsRef<Path>, limits: Limits) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::new(stream, limits))
    }

    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.writer.write_frame(frame).await
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        self.reader.read_frame().await
    }

    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        (self.reader, self.writer)
    }
}

/// Listening endpoint. The socket file is removed when the listener is dropped.
pub struct FrameListener {
    listener: UnixListener,
    path: PathBuf,
    limits: Limits,
}

impl FrameListener {
    /// Bind `path`, replacing a stale socket file left behind by a previous run.
    ///
    /// Anything at `path` that is not a socket, or a socket somebody still listens on, is left
    /// alone and the bind fails with `AddrInUse`.
    pub fn bind(path: impl Into<PathBuf>, limits: Limits) -> io::Result<Self> {
        let path = path.into();
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse && is_stale_socket(&path) => {
                tracing::debug!(path = %path.display(), "removing stale socket");
                std::fs::remove_file(&path)?;
                UnixListener::bind(&path)?
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            listener,
            path,
            limits,
        })
    }

    pub async fn accept(&self) -> io::Result<FrameTransport> {
        let (stream, _) = self.listener.accept().await?;
        Ok(FrameTransport::new(stream, self.limits))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FrameListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_stale_socket(path: &Path) -> bool {
    let is_socket = std::fs::symlink_metadata(path)
        .is_ok_and(|meta| meta.file_type().is_socket());
    is_socket
        && matches!(
            std::os::unix::net::UnixStream::connect(path),
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused
        )
}
