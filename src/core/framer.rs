//! # Packet Framer
//!
//! Reassembles length-prefixed frames from a byte stream that may deliver partial or
//! coalesced reads.
//!
//! Every frame starts with a 4-byte big-endian length that counts the prefix itself.
//! Emitted [`RawPacket`]s are complete frames, prefix included.

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::core::packet::RawPacket;
use crate::error::{constants, ProtocolError, Result};

const PREFIX_LEN: usize = 4;

/// Incremental frame assembler.
///
/// Single producer: chunks must be offered in arrival order from one reader.
#[derive(Debug)]
pub struct Framer {
    /// Chunks of the frame under assembly
    cached: Vec<Bytes>,
    /// Bytes still needed to complete the frame; `None` while the prefix is incomplete
    missing_length: Option<isize>,
    max_frame_size: usize,
}

impl Framer {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            cached: Vec::new(),
            missing_length: None,
            max_frame_size,
        }
    }

    /// Feed one read's worth of bytes; complete frames are passed to `emit` in order.
    ///
    /// # Errors
    /// Returns `MalformedEncoding` when a declared length is below the prefix size or above
    /// the configured maximum. The stream cannot be resynchronized after that.
    pub fn offer<F>(&mut self, chunk: &[u8], mut emit: F) -> Result<()>
    where
        F: FnMut(RawPacket),
    {
        self.offer_bytes(Bytes::copy_from_slice(chunk), &mut emit)
    }

    fn offer_bytes<F>(&mut self, mut chunk: Bytes, emit: &mut F) -> Result<()>
    where
        F: FnMut(RawPacket),
    {
        // Loop instead of recursing on the remainder of a coalesced chunk
        loop {
            if chunk.is_empty() {
                return Ok(());
            }
            let missing = match self.missing_length {
                Some(missing) => missing,
                None => {
                    // Prefix may itself be split across chunks
                    let buffered: usize = self.cached.iter().map(Bytes::len).sum();
                    if buffered + chunk.len() < PREFIX_LEN {
                        self.cached.push(chunk);
                        return Ok(());
                    }
                    let declared = self.declared_length(&chunk)?;
                    let missing = declared as isize - buffered as isize;
                    self.missing_length = Some(missing);
                    missing
                }
            };

            let after = missing - chunk.len() as isize;
            if after > 0 {
                self.cached.push(chunk);
                self.missing_length = Some(after);
                return Ok(());
            }

            // Split at the frame boundary; `after <= 0`
            let tail = chunk.split_off(missing as usize);
            self.cached.push(chunk);
            let frame = self.take_frame();
            trace!(len = frame.len(), "Frame assembled");
            emit(RawPacket::new(frame));
            chunk = tail;
        }
    }

    /// Read the length prefix from buffered bytes followed by `chunk`
    fn declared_length(&self, chunk: &Bytes) -> Result<usize> {
        let mut prefix = [0u8; PREFIX_LEN];
        let mut filled = 0;
        for part in self.cached.iter().chain(std::iter::once(chunk)) {
            let n = (PREFIX_LEN - filled).min(part.len());
            prefix[filled..filled + n].copy_from_slice(&part[..n]);
            filled += n;
            if filled == PREFIX_LEN {
                break;
            }
        }

        let declared = u32::from_be_bytes(prefix) as usize;
        if declared < PREFIX_LEN || declared > self.max_frame_size {
            trace!(declared, max = self.max_frame_size, "Rejecting frame length");
            return Err(ProtocolError::MalformedEncoding(format!(
                "{}: {declared}",
                constants::ERR_FRAME_LENGTH
            )));
        }
        Ok(declared)
    }

    fn take_frame(&mut self) -> Bytes {
        self.missing_length = None;
        if self.cached.len() == 1 {
            return self.cached.pop().unwrap_or_default();
        }
        let total = self.cached.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for part in self.cached.drain(..) {
            out.extend_from_slice(&part);
        }
        out.freeze()
    }

    /// Whether a frame is partially assembled
    pub fn has_partial(&self) -> bool {
        !self.cached.is_empty()
    }

    /// Bytes held for the frame under assembly
    pub fn buffered(&self) -> usize {
        self.cached.iter().map(|c| c.remaining()).sum()
    }

    /// Drop any partial frame, e.g. after it went stale
    pub fn reset(&mut self) {
        self.cached.clear();
        self.missing_length = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 4) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn feed(framer: &mut Framer, chunks: &[&[u8]]) -> Vec<RawPacket> {
        let mut out = Vec::new();
        for chunk in chunks {
            framer.offer(chunk, |p| out.push(p)).unwrap();
        }
        out
    }

    #[test]
    fn test_twenty_byte_frame_in_four_chunks() {
        let data = frame(&[7u8; 16]);
        assert_eq!(data.len(), 20);
        let mut framer = Framer::new(1024);
        let out = feed(
            &mut framer,
            &[&data[..3], &data[3..8], &data[8..10], &data[10..]],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 20);
        assert_eq!(out[0].declared_len(), 20);
        assert!(!framer.has_partial());
    }

    #[test]
    fn test_coalesced_frames_in_one_chunk() {
        let mut data = frame(b"first");
        data.extend(frame(b"second"));
        data.extend(frame(b""));
        let mut framer = Framer::new(1024);
        let out = feed(&mut framer, &[&data[..]]);
        let bodies: Vec<&[u8]> = out.iter().map(|p| p.body()).collect();
        assert_eq!(bodies, vec![&b"first"[..], &b"second"[..], &b""[..]]);
    }

    #[test]
    fn test_boundary_inside_next_prefix() {
        let mut data = frame(b"abc");
        data.extend(frame(b"defgh"));
        // split two bytes into the second frame's prefix
        let cut = 7 + 2;
        let mut framer = Framer::new(1024);
        let out = feed(&mut framer, &[&data[..cut], &data[cut..]]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].body(), b"defgh");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut data = frame(b"hello");
        data.extend(frame(b"world!"));
        let chunks: Vec<&[u8]> = data.chunks(1).collect();
        let mut framer = Framer::new(1024);
        let out = feed(&mut framer, &chunks);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].body(), b"hello");
        assert_eq!(out[1].body(), b"world!");
    }

    #[test]
    fn test_invalid_lengths() {
        let mut framer = Framer::new(64);
        assert!(framer.offer(&[0, 0, 0, 2], |_| {}).is_err());
        framer.reset();
        assert!(framer.offer(&[0, 0, 1, 0], |_| {}).is_err());
    }

    #[test]
    fn test_reset_discards_partial() {
        let data = frame(b"payload");
        let mut framer = Framer::new(1024);
        let out = feed(&mut framer, &[&data[..6]]);
        assert!(out.is_empty());
        assert!(framer.has_partial());
        assert_eq!(framer.buffered(), 6);
        framer.reset();
        let out = feed(&mut framer, &[&data[..]]);
        assert_eq!(out.len(), 1);
    }
}
