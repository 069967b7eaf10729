//! # Link
//!
//! The read and write tasks of one transport connection.
//!
//! ## Read path
//! bytes → [`Framer`] → envelope unwrap → registry decode → correlator
//!
//! Per-frame failures (bad seal, undecodable body) drop that frame only. A framing error
//! desynchronizes the stream and ends the link, as do EOF and I/O errors. A partial frame
//! that sees no new bytes for `partial_frame_timeout` is discarded.
//!
//! ## Write path
//! A bounded queue feeds a `FramedWrite`; frames leave in submission order.
//!
//! Either task reports the link's end through the lost-link channel unless the link was
//! cancelled on purpose.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use futures::SinkExt;
use tokio::io::{AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};

use crate::core::envelope;
use crate::core::framer::Framer;
use crate::core::packet::RawPacket;
use crate::error::{ErrorKind, ProtocolError, Result};
use crate::protocol::registry::ResponseKind;
use crate::service::context::EngineContext;
use crate::transport::session_store::ServerAddress;
use crate::transport::tcp::BoxedStream;

/// Why a link ended on its own
#[derive(Debug)]
pub(crate) struct LinkLost {
    pub link_id: u64,
    pub cause: LinkLossCause,
}

#[derive(Debug)]
pub(crate) enum LinkLossCause {
    Transport(String),
    Heartbeat(String),
}

/// Writes frames verbatim; they already carry their length prefix
#[derive(Debug, Default)]
pub struct RawPacketEncoder;

impl Encoder<RawPacket> for RawPacketEncoder {
    type Error = ProtocolError;

    fn encode(&mut self, item: RawPacket, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(item.len());
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

/// A live connection: its tasks, cancellation and outbound queue
pub(crate) struct Link {
    pub id: u64,
    pub server: ServerAddress,
    writer: mpsc::Sender<RawPacket>,
    cancel: CancellationToken,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Link {
    pub fn spawn(
        id: u64,
        server: ServerAddress,
        stream: BoxedStream,
        ctx: Arc<EngineContext>,
        lost: mpsc::UnboundedSender<LinkLost>,
    ) -> Self {
        let (reader, writer_half) = tokio::io::split(stream);
        let (writer, queue) = mpsc::channel(ctx.config.transport.outbound_queue_capacity);
        let cancel = CancellationToken::new();
        let span = tracing::debug_span!("link", id, server = %server);

        let read_task = tokio::spawn(
            read_loop(reader, ctx.clone(), cancel.clone(), id, lost.clone()).instrument(span.clone()),
        );
        let write_task =
            tokio::spawn(write_loop(writer_half, queue, ctx, cancel.clone(), id, lost).instrument(span));

        Self {
            id,
            server,
            writer,
            cancel,
            read_task,
            write_task,
        }
    }

    pub fn writer(&self) -> mpsc::Sender<RawPacket> {
        self.writer.clone()
    }

    /// Cancellation token shared with tasks scoped to this link
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal the tasks to stop without waiting for them
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop both tasks and wait for them to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.writer);
        let _ = self.read_task.await;
        let _ = self.write_task.await;
        debug!(link = self.id, server = %self.server, "Link closed");
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    ctx: Arc<EngineContext>,
    cancel: CancellationToken,
    link_id: u64,
    lost: mpsc::UnboundedSender<LinkLost>,
) {
    let transport = &ctx.config.transport;
    let mut framer = Framer::new(transport.max_payload_size);
    let mut buf = vec![0u8; transport.read_buffer_size];
    let mut frames = Vec::new();

    let cause = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break "connection closed by peer".to_string(),
                Ok(n) => {
                    if let Err(e) = framer.offer(&buf[..n], |frame| frames.push(frame)) {
                        break e.to_string();
                    }
                    for frame in frames.drain(..) {
                        handle_frame(&ctx, frame);
                    }
                }
                Err(e) => break e.to_string(),
            },
            _ = tokio::time::sleep(transport.partial_frame_timeout), if framer.has_partial() => {
                warn!(buffered = framer.buffered(), "Discarding stale partial frame");
                framer.reset();
            }
        }
    };

    if !cancel.is_cancelled() {
        debug!(cause = %cause, "Read loop ended");
        let _ = lost.send(LinkLost {
            link_id,
            cause: LinkLossCause::Transport(cause),
        });
    }
}

fn handle_frame(ctx: &EngineContext, frame: RawPacket) {
    ctx.metrics.frame_received(frame.len());

    let packet = match envelope::unwrap_with_limit(
        &frame,
        &ctx.keyring(),
        ctx.config.transport.max_payload_size,
    ) {
        Ok(packet) => packet,
        Err(e) => {
            if e.kind() == ErrorKind::Decryption {
                ctx.metrics.decrypt_failure();
            } else {
                ctx.metrics.decode_failure();
            }
            warn!(error = %e, len = frame.len(), "Dropping frame");
            return;
        }
    };
    trace!(command = %packet.command, sequence_id = packet.sequence_id, "Frame opened");

    let kind = ctx.registry.kind_of(&packet.command);
    if kind.is_none() {
        ctx.metrics.unknown_packet();
    }
    let incoming = ctx.registry.decode(packet);
    if incoming.result.is_err() {
        ctx.metrics.decode_failure();
    }

    if kind == Some(ResponseKind::Push) {
        ctx.correlator.publish(incoming);
    } else {
        ctx.correlator.dispatch(incoming);
    }
}

async fn write_loop(
    writer: WriteHalf<BoxedStream>,
    mut queue: mpsc::Receiver<RawPacket>,
    ctx: Arc<EngineContext>,
    cancel: CancellationToken,
    link_id: u64,
    lost: mpsc::UnboundedSender<LinkLost>,
) {
    let mut sink = FramedWrite::new(writer, RawPacketEncoder);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let len = frame.len();
        if let Err(e) = sink.send(frame).await {
            if !cancel.is_cancelled() {
                warn!(error = %e, "Write failed");
                let _ = lost.send(LinkLost {
                    link_id,
                    cause: LinkLossCause::Transport(e.to_string()),
                });
            }
            return;
        }
        ctx.metrics.frame_sent(len);
    }

    let _ = SinkExt::<RawPacket>::close(&mut sink).await;
}
