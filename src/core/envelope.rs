//! # Packet Envelope
//!
//! Wraps a command body into a sealed frame and opens incoming frames.
//!
//! ## Wire Format
//! ```text
//! u32   total length (includes itself)
//! [4]   MAGIC_BYTES
//! u8    version: 0x0A legacy (TEA), 0x0B current (AES-GCM)
//! u8    seal: 0 plain, 1 session key, 2 bootstrap key
//! i32   sequence id
//! u32+  account
//! [seal 2] u16 public key length, client public key
//! rest  inner frame, encrypted unless plain:
//!       u32 head length (includes itself)
//!         u32+ command
//!         u32+ session id
//!         u8   compression flag
//!       u32+ body
//! ```
//! `u32+` is a big-endian length that counts its own 4 bytes, then the data.
//!
//! The cipher follows the version byte, so a connection can carry both generations.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::config::{LEGACY_PROTOCOL_VERSION, MAGIC_BYTES, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::core::packet::{Packet, RawPacket};
use crate::error::{constants, ProtocolError, Result};
use crate::transport::session_store::SessionKeyMaterial;
use crate::utils::compression::{compress_body, decompress_body, CompressionKind};
use crate::utils::crypto::{Cipher, SymmetricKey};

const SEAL_PLAIN: u8 = 0;
const SEAL_SESSION: u8 = 1;
const SEAL_BOOTSTRAP: u8 = 2;

/// How an outgoing body is protected
#[derive(Debug, Clone, Copy)]
pub enum Seal<'a> {
    Plain,
    /// Established session key
    Session(&'a SymmetricKey),
    /// Exchange key of a key exchange in progress; the public key travels in the clear
    Bootstrap {
        public_key: &'a [u8],
        key: &'a SymmetricKey,
    },
}

impl Seal<'_> {
    fn kind(&self) -> SealKind {
        match self {
            Seal::Plain => SealKind::Plain,
            Seal::Session(_) => SealKind::Session,
            Seal::Bootstrap { .. } => SealKind::Bootstrap,
        }
    }
}

/// Seal byte of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealKind {
    Plain,
    Session,
    Bootstrap,
}

impl SealKind {
    fn to_byte(self) -> u8 {
        match self {
            SealKind::Plain => SEAL_PLAIN,
            SealKind::Session => SEAL_SESSION,
            SealKind::Bootstrap => SEAL_BOOTSTRAP,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            SEAL_PLAIN => Ok(SealKind::Plain),
            SEAL_SESSION => Ok(SealKind::Session),
            SEAL_BOOTSTRAP => Ok(SealKind::Bootstrap),
            other => Err(ProtocolError::MalformedEncoding(format!(
                "Unknown seal kind {other}"
            ))),
        }
    }
}

/// Keys available for opening incoming frames
#[derive(Clone, Default)]
pub struct KeyRing {
    pub session: Option<Arc<SessionKeyMaterial>>,
    /// Exchange key of the handshake in flight
    pub bootstrap: Option<SymmetricKey>,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("session", &self.session.is_some())
            .field("bootstrap", &self.bootstrap.is_some())
            .finish()
    }
}

/// A command body ready to be wrapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub command: String,
    pub sequence_id: i32,
    pub account: String,
    pub session_id: Bytes,
    pub body: Bytes,
}

/// Wire options applied by [`wrap`]
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeOptions {
    pub version: u8,
    pub compression: Option<CompressionKind>,
    pub compression_threshold: usize,
    pub max_payload_size: usize,
}

impl Default for EnvelopeOptions {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            compression: None,
            compression_threshold: 512,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl From<&crate::config::TransportConfig> for EnvelopeOptions {
    fn from(config: &crate::config::TransportConfig) -> Self {
        Self {
            version: config.protocol_version,
            compression: config.compression,
            compression_threshold: config.compression_threshold_bytes,
            max_payload_size: config.max_payload_size,
        }
    }
}

fn cipher_for(version: u8) -> Result<Cipher> {
    match version {
        PROTOCOL_VERSION => Ok(Cipher::Aes),
        LEGACY_PROTOCOL_VERSION => Ok(Cipher::Tea),
        other => Err(ProtocolError::UnsupportedVersion(other)),
    }
}

/// Clear-text part of a frame, readable without any key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub version: u8,
    pub seal: SealKind,
    pub sequence_id: i32,
    pub account: String,
    /// Sender's exchange public key, present on bootstrap frames
    pub public_key: Option<Bytes>,
    /// Offset of the sealed inner frame
    inner_offset: usize,
}

fn put_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32((data.len() + 4) as u32);
    buf.put_slice(data);
}

/// Wrap a body into a complete frame.
///
/// # Errors
/// - `UnsupportedVersion` for an unknown version in `options`
/// - `OversizedPacket` when the frame exceeds the payload limit
pub fn wrap(outgoing: &Outgoing, seal: &Seal<'_>, options: &EnvelopeOptions) -> Result<RawPacket> {
    let cipher = cipher_for(options.version)?;
    let (body, flag) = compress_body(
        &outgoing.body,
        options.compression,
        options.compression_threshold,
    )?;

    let head_len = 4 + (4 + outgoing.command.len()) + (4 + outgoing.session_id.len()) + 1;
    let mut inner = BytesMut::with_capacity(head_len + 4 + body.len());
    inner.put_u32(head_len as u32);
    put_prefixed(&mut inner, outgoing.command.as_bytes());
    put_prefixed(&mut inner, &outgoing.session_id);
    inner.put_u8(flag);
    put_prefixed(&mut inner, &body);

    let sealed = match seal {
        Seal::Plain => inner.to_vec(),
        Seal::Session(key) | Seal::Bootstrap { key, .. } => cipher.encrypt(key, &inner)?,
    };

    let mut frame = BytesMut::with_capacity(sealed.len() + outgoing.account.len() + 64);
    frame.put_u32(0);
    frame.put_slice(&MAGIC_BYTES);
    frame.put_u8(options.version);
    frame.put_u8(seal.kind().to_byte());
    frame.put_i32(outgoing.sequence_id);
    put_prefixed(&mut frame, outgoing.account.as_bytes());
    if let Seal::Bootstrap { public_key, .. } = seal {
        let len = u16::try_from(public_key.len())
            .map_err(|_| ProtocolError::malformed(constants::ERR_INVALID_PUBLIC_KEY))?;
        frame.put_u16(len);
        frame.put_slice(public_key);
    }
    frame.put_slice(&sealed);

    if frame.len() > options.max_payload_size {
        return Err(ProtocolError::OversizedPacket(frame.len()));
    }
    let total = frame.len() as u32;
    frame[..4].copy_from_slice(&total.to_be_bytes());
    Ok(RawPacket::new(frame.freeze()))
}

/// Read the clear-text header of a frame
pub fn peek_header(raw: &RawPacket) -> Result<EnvelopeHeader> {
    let bytes = raw.as_bytes();
    if raw.declared_len() != bytes.len() {
        return Err(ProtocolError::malformed(constants::ERR_FRAME_LENGTH));
    }
    let mut cursor = Cursor::new(bytes, 4);
    if cursor.take(4)? != MAGIC_BYTES {
        return Err(ProtocolError::InvalidHeader);
    }
    let version = cursor.u8()?;
    cipher_for(version)?;
    let seal = SealKind::from_byte(cursor.u8()?)?;
    let sequence_id = cursor.i32()?;
    let account = cursor.string()?;
    let public_key = match seal {
        SealKind::Bootstrap => {
            let len = cursor.u16()? as usize;
            let start = cursor.pos;
            cursor.take(len)?;
            Some(bytes.slice(start..cursor.pos))
        }
        _ => None,
    };
    Ok(EnvelopeHeader {
        version,
        seal,
        sequence_id,
        account,
        public_key,
        inner_offset: cursor.pos,
    })
}

/// Open a frame with whichever key its seal byte asks for.
///
/// # Errors
/// - `InvalidHeader` / `UnsupportedVersion` for foreign frames
/// - `DecryptionFailure` when the key is missing or wrong
/// - `MalformedEncoding` for truncated or inconsistent frames
pub fn unwrap(raw: &RawPacket, keys: &KeyRing) -> Result<Packet> {
    unwrap_with_limit(raw, keys, MAX_PAYLOAD_SIZE)
}

/// [`unwrap`] with an explicit bound on the decompressed body
pub fn unwrap_with_limit(raw: &RawPacket, keys: &KeyRing, max_body: usize) -> Result<Packet> {
    let header = peek_header(raw)?;
    let cipher = cipher_for(header.version)?;
    let sealed = &raw.as_bytes()[header.inner_offset..];

    let inner = match header.seal {
        SealKind::Plain => sealed.to_vec(),
        SealKind::Session => {
            let material = keys.session.as_ref().ok_or(ProtocolError::DecryptionFailure)?;
            cipher.decrypt(&material.session_key, sealed)?
        }
        SealKind::Bootstrap => {
            let key = keys.bootstrap.as_ref().ok_or(ProtocolError::DecryptionFailure)?;
            cipher.decrypt(key, sealed)?
        }
    };

    let mut cursor = Cursor::new(&inner, 0);
    let head_len = cursor.u32()? as usize;
    let command = cursor.string()?;
    let session_id = Bytes::copy_from_slice(cursor.prefixed()?);
    let flag = cursor.u8()?;
    if cursor.pos != head_len {
        return Err(ProtocolError::malformed(format!(
            "Head length {head_len} does not match its fields ({})",
            cursor.pos
        )));
    }
    let body = decompress_body(cursor.prefixed()?, flag, max_body)?;
    if !cursor.is_empty() {
        return Err(ProtocolError::malformed("Trailing bytes after body"));
    }

    Ok(Packet {
        command,
        sequence_id: header.sequence_id,
        account: header.account,
        session_id,
        body: Bytes::from(body),
        encrypted: header.seal != SealKind::Plain,
    })
}

/// Bounds-checked big-endian reader over a frame
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let buf: &'a [u8] = self.buf;
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| ProtocolError::malformed(constants::ERR_TRUNCATED))?;
        let out = &buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        self.u32().map(|v| v as i32)
    }

    fn prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        let len = len
            .checked_sub(4)
            .ok_or_else(|| ProtocolError::malformed(constants::ERR_NEGATIVE_LENGTH))?;
        self.take(len)
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.prefixed()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::malformed(constants::ERR_INVALID_UTF8))
    }
}
