//! Per-port I/O tasks.
//!
//! Every port gets one reader, which turns incoming frames into [`Event`]s for the bridge task,
//! and one writer, which drains the port's outbound queue. Neither touches bridge state.

use std::sync::Arc;

use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vmbridge_adapter::{FrameLink, MAX_LINK_FRAME};

use crate::bridge::{Frame, PortId};
use crate::metrics::PortMetrics;
use crate::transport::{FrameReader, FrameWriter, TransportError};

pub(crate) enum Event {
    Frame { port: PortId, frame: Vec<u8> },
    Closed { port: PortId, reason: CloseReason },
}

#[derive(Debug)]
pub(crate) enum CloseReason {
    /// The peer went away cleanly.
    Eof,
    /// The peer broke the framing rules.
    ProtocolViolation(String),
    /// The port's socket or device failed.
    Failed(String),
}

pub(crate) struct PortTasks {
    pub(crate) reader: JoinHandle<()>,
    pub(crate) writer: JoinHandle<()>,
}

pub(crate) fn spawn_stream_port(
    port: PortId,
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    outbound: mpsc::Receiver<Frame>,
    events: mpsc::Sender<Event>,
    metrics: PortMetrics,
) -> PortTasks {
    PortTasks {
        reader: tokio::spawn(read_stream(port, reader, events.clone())),
        writer: tokio::spawn(write_stream(port, writer, outbound, events, metrics)),
    }
}

pub(crate) fn spawn_link_port(
    port: PortId,
    link: Arc<dyn FrameLink>,
    max_frame_len: usize,
    outbound: mpsc::Receiver<Frame>,
    events: mpsc::Sender<Event>,
    metrics: PortMetrics,
) -> PortTasks {
    PortTasks {
        reader: tokio::spawn(read_link(
            port,
            link.clone(),
            max_frame_len,
            events.clone(),
            metrics.clone(),
        )),
        writer: tokio::spawn(write_link(port, link, outbound, events, metrics)),
    }
}

async fn read_stream(
    port: PortId,
    mut reader: FrameReader<OwnedReadHalf>,
    events: mpsc::Sender<Event>,
) {
    let reason = loop {
        match reader.read_frame().await {
            Ok(frame) => {
                if events.send(Event::Frame { port, frame }).await.is_err() {
                    return;
                }
            }
            Err(TransportError::Disconnected) => break CloseReason::Eof,
            Err(TransportError::ProtocolViolation(err)) => {
                break CloseReason::ProtocolViolation(err.to_string())
            }
            Err(err) => break CloseReason::Failed(err.to_string()),
        }
    };
    let _ = events.send(Event::Closed { port, reason }).await;
}

async fn write_stream(
    port: PortId,
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut outbound: mpsc::Receiver<Frame>,
    events: mpsc::Sender<Event>,
    metrics: PortMetrics,
) {
    while let Some(frame) = outbound.recv().await {
        match writer.write_frame(&frame).await {
            Ok(()) => metrics.frame_tx(frame.len()),
            Err(TransportError::FrameTooLarge(err)) => {
                metrics.frame_dropped();
                tracing::trace!(%port, error = %err, "frame exceeds session limit; dropping");
            }
            Err(err) => {
                let reason = match err {
                    TransportError::Disconnected => CloseReason::Eof,
                    other => CloseReason::Failed(other.to_string()),
                };
                let _ = events.send(Event::Closed { port, reason }).await;
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_link(
    port: PortId,
    link: Arc<dyn FrameLink>,
    max_frame_len: usize,
    events: mpsc::Sender<Event>,
    metrics: PortMetrics,
) {
    // Larger than the limit, so an over-long frame shows up as such instead of truncated.
    let mut buf = vec![0u8; MAX_LINK_FRAME.max(max_frame_len + 1)];
    let reason = loop {
        match link.recv(&mut buf).await {
            Ok(len) if len > max_frame_len => {
                metrics.frame_dropped();
                tracing::trace!(%port, link = link.name(), len, max_frame_len, "dropping oversized frame");
            }
            Ok(len) => {
                let frame = buf[..len].to_vec();
                if events.send(Event::Frame { port, frame }).await.is_err() {
                    return;
                }
            }
            Err(err) if !err.is_fatal() => {
                tracing::trace!(%port, link = link.name(), error = %err, "transient receive error");
            }
            Err(err) => break CloseReason::Failed(err.to_string()),
        }
    };
    let _ = events.send(Event::Closed { port, reason }).await;
}

async fn write_link(
    port: PortId,
    link: Arc<dyn FrameLink>,
    mut outbound: mpsc::Receiver<Frame>,
    events: mpsc::Sender<Event>,
    metrics: PortMetrics,
) {
    while let Some(frame) = outbound.recv().await {
        match link.send(&frame).await {
            Ok(()) => metrics.frame_tx(frame.len()),
            Err(err) if !err.is_fatal() => {
                metrics.frame_dropped();
                tracing::trace!(%port, link = link.name(), error = %err, "transient send error");
            }
            Err(err) => {
                let reason = CloseReason::Failed(err.to_string());
                let _ = events.send(Event::Closed { port, reason }).await;
                return;
            }
        }
    }
}
