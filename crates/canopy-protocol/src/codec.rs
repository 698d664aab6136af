//! Codec for encoding and decoding Canopy frames.
//!
//! A frame is a MessagePack-encoded packet followed by zero padding up to the
//! next multiple of the connection-wide chunk size:
//!
//! ```text
//! |<------------- k * chunk_size ------------->|
//! [ serialized packet ][ 0x00 0x00 ... 0x00 ]
//! ```
//!
//! Frames never end in a partial chunk, so a receiver only ever decodes
//! chunk-aligned slices of its buffer.
//!
//! Frames carry no length prefix. Before decoding, the receiver walks the
//! MessagePack headers of the buffered chunks to learn how long the frame is,
//! so a chunk whose header cannot start a packet is rejected at once instead
//! of holding up the stream.

use bytes::{Buf, Bytes, BytesMut};
use serde::Deserialize;
use thiserror::Error;

use crate::packets::Packet;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: usize = 16;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Most fields a packet map may declare.
const MAX_PACKET_FIELDS: usize = 16;

/// Longest packet field name.
const MAX_FIELD_NAME_LEN: usize = 32;

/// Deepest nesting accepted inside a packet field.
const MAX_DEPTH: usize = 8;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Chunk size out of range.
    #[error("Invalid chunk size {0}: must be between {MIN_CHUNK_SIZE} and {MAX_FRAME_SIZE}")]
    InvalidChunkSize(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The chunk cannot start a packet.
    #[error("Malformed frame: {0}")]
    Malformed(&'static str),
}

impl ProtocolError {
    /// Whether this error means the received bytes were not a valid frame.
    #[must_use]
    pub fn is_invalid_data(&self) -> bool {
        matches!(
            self,
            ProtocolError::Decode(_) | ProtocolError::FrameTooLarge(_) | ProtocolError::Malformed(_)
        )
    }
}

/// Length of a frame holding `len` packet bytes.
#[must_use]
pub fn padded_len(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size).max(1) * chunk_size
}

fn check_chunk_size(chunk_size: usize) -> Result<(), ProtocolError> {
    if (MIN_CHUNK_SIZE..=MAX_FRAME_SIZE).contains(&chunk_size) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidChunkSize(chunk_size))
    }
}

/// Encode a packet into a padded frame.
///
/// # Errors
///
/// Returns an error if the chunk size is invalid, the frame is too large, or
/// encoding fails.
pub fn encode(packet: &Packet, chunk_size: usize) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(packet, chunk_size, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a packet into an existing buffer.
///
/// # Errors
///
/// Returns an error if the chunk size is invalid, the frame is too large, or
/// encoding fails.
pub fn encode_into(
    packet: &Packet,
    chunk_size: usize,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    check_chunk_size(chunk_size)?;
    let payload = rmp_serde::to_vec_named(packet)?;

    let frame_len = padded_len(payload.len(), chunk_size);
    if frame_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(frame_len));
    }

    buf.reserve(frame_len);
    buf.extend_from_slice(&payload);
    buf.resize(buf.len() + frame_len - payload.len(), 0);

    Ok(())
}

/// Why a header scan stopped short of a full packet.
#[derive(Debug, PartialEq, Eq)]
enum Stop {
    /// The packet needs at least this many bytes.
    Needs(usize),
    /// The packet would be this long, past [`MAX_FRAME_SIZE`].
    TooLarge(usize),
    Malformed(&'static str),
}

/// Walks MessagePack headers without decoding values.
struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8], Stop> {
        let end = self.pos.saturating_add(n);
        if end > MAX_FRAME_SIZE {
            return Err(Stop::TooLarge(end));
        }
        let slice = self.data.get(self.pos..end).ok_or(Stop::Needs(end))?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, Stop> {
        Ok(self.bytes(1)?[0])
    }

    fn skip(&mut self, n: usize) -> Result<(), Stop> {
        self.bytes(n).map(drop)
    }

    /// Big-endian length of `width` bytes.
    fn len(&mut self, width: usize) -> Result<usize, Stop> {
        let raw = self.bytes(width)?;
        Ok(raw
            .iter()
            .fold(0usize, |acc, &b| acc.saturating_mul(256) | usize::from(b)))
    }

    /// Skip `count` values, each at least one byte long.
    fn values(&mut self, count: usize, depth: usize) -> Result<(), Stop> {
        let least = self.pos.saturating_add(count);
        if least > MAX_FRAME_SIZE {
            return Err(Stop::TooLarge(least));
        }
        for _ in 0..count {
            self.value(depth + 1)?;
        }
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<(), Stop> {
        if depth > MAX_DEPTH {
            return Err(Stop::Malformed("value nested too deeply"));
        }
        let marker = self.byte()?;
        match marker {
            // fixint, nil, false, true
            0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Ok(()),
            0x80..=0x8f => self.values(usize::from(marker & 0x0f) * 2, depth),
            0x90..=0x9f => self.values(usize::from(marker & 0x0f), depth),
            0xa0..=0xbf => self.skip(usize::from(marker & 0x1f)),
            0xc1 => Err(Stop::Malformed("reserved marker")),
            // bin, str
            0xc4 | 0xd9 => {
                let n = self.len(1)?;
                self.skip(n)
            }
            0xc5 | 0xda => {
                let n = self.len(2)?;
                self.skip(n)
            }
            0xc6 | 0xdb => {
                let n = self.len(4)?;
                self.skip(n)
            }
            // ext: length, type byte, data
            0xc7 => {
                let n = self.len(1)?;
                self.skip(n.saturating_add(1))
            }
            0xc8 => {
                let n = self.len(2)?;
                self.skip(n.saturating_add(1))
            }
            0xc9 => {
                let n = self.len(4)?;
                self.skip(n.saturating_add(1))
            }
            0xcc | 0xd0 => self.skip(1),
            0xcd | 0xd1 | 0xd4 => self.skip(2),
            0xd5 => self.skip(3),
            0xca | 0xce | 0xd2 => self.skip(4),
            0xd6 => self.skip(5),
            0xcb | 0xcf | 0xd3 => self.skip(8),
            0xd7 => self.skip(9),
            0xd8 => self.skip(17),
            0xdc => {
                let n = self.len(2)?;
                self.values(n, depth)
            }
            0xdd => {
                let n = self.len(4)?;
                self.values(n, depth)
            }
            0xde => {
                let n = self.len(2)?;
                self.values(n.saturating_mul(2), depth)
            }
            0xdf => {
                let n = self.len(4)?;
                self.values(n.saturating_mul(2), depth)
            }
        }
    }
}

/// Length of the packet at the start of `data`, before padding.
///
/// A packet is a map of a few short string keys, so anything else is
/// rejected from its first bytes.
fn scan_packet(data: &[u8]) -> Result<usize, Stop> {
    let mut scanner = Scanner { data, pos: 0 };
    let fields = match scanner.byte()? {
        marker @ 0x80..=0x8f => usize::from(marker & 0x0f),
        0xde => scanner.len(2)?,
        0xdf => scanner.len(4)?,
        _ => return Err(Stop::Malformed("frame does not start with a map")),
    };
    if fields > MAX_PACKET_FIELDS {
        return Err(Stop::Malformed("too many packet fields"));
    }

    for _ in 0..fields {
        let name_len = match scanner.byte()? {
            marker @ 0xa0..=0xbf => usize::from(marker & 0x1f),
            0xd9 => scanner.len(1)?,
            _ => return Err(Stop::Malformed("packet field name is not a string")),
        };
        if name_len > MAX_FIELD_NAME_LEN {
            return Err(Stop::Malformed("packet field name too long"));
        }
        scanner.skip(name_len)?;
        scanner.value(0)?;
    }
    Ok(scanner.pos)
}

fn decode_packet(data: &[u8]) -> Result<Packet, rmp_serde::decode::Error> {
    let mut deserializer = rmp_serde::Deserializer::new(data);
    Packet::deserialize(&mut deserializer)
}

/// Decode a complete frame.
///
/// # Errors
///
/// Returns an error if the data is not a valid chunk-aligned frame.
pub fn decode(data: &[u8], chunk_size: usize) -> Result<Packet, ProtocolError> {
    check_chunk_size(chunk_size)?;
    Ok(decode_packet(data)?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Only whole chunks are considered. Returns `Ok(Some(packet))` once a full
/// frame has been decoded and removed from the buffer, or `Ok(None)` if the
/// frame continues into chunks not yet received.
///
/// On a decode error exactly one chunk is discarded so the caller can report
/// it and carry on with the rest of the stream.
///
/// Callers reading a stream piecemeal should prefer [`FrameDecoder`], which
/// remembers how much of a frame is still missing between calls.
///
/// # Errors
///
/// Returns an error if the leading chunk is not a valid frame.
pub fn decode_from(buf: &mut BytesMut, chunk_size: usize) -> Result<Option<Packet>, ProtocolError> {
    check_chunk_size(chunk_size)?;
    decode_frame(buf, chunk_size, &mut 0)
}

/// `needed` is the frame length learned from an earlier call, or 0.
fn decode_frame(
    buf: &mut BytesMut,
    chunk_size: usize,
    needed: &mut usize,
) -> Result<Option<Packet>, ProtocolError> {
    if buf.len() < (*needed).max(chunk_size) {
        return Ok(None);
    }
    let available = buf.len() - buf.len() % chunk_size;

    let len = match scan_packet(&buf[..available]) {
        Ok(len) => len,
        Err(Stop::Needs(len)) => {
            *needed = padded_len(len, chunk_size);
            return Ok(None);
        }
        Err(Stop::TooLarge(len)) => {
            *needed = 0;
            buf.advance(chunk_size);
            return Err(ProtocolError::FrameTooLarge(len));
        }
        Err(Stop::Malformed(reason)) => {
            *needed = 0;
            buf.advance(chunk_size);
            return Err(ProtocolError::Malformed(reason));
        }
    };
    *needed = 0;

    match decode_packet(&buf[..len]) {
        Ok(packet) => {
            buf.advance(padded_len(len, chunk_size));
            Ok(Some(packet))
        }
        Err(e) => {
            buf.advance(chunk_size);
            Err(ProtocolError::Decode(e))
        }
    }
}

/// Streaming decoder for one connection.
///
/// Remembers the length of a partially received frame, so a large frame
/// arriving in many small reads is only scanned again once it is complete.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    codec: FrameCodec,
    needed: usize,
}

impl FrameDecoder {
    /// Create a decoder for a codec's chunk size.
    #[must_use]
    pub fn new(codec: FrameCodec) -> Self {
        Self { codec, needed: 0 }
    }

    /// Bytes the frame at the front of the buffer is known to need, or 0.
    #[must_use]
    pub fn needed(&self) -> usize {
        self.needed
    }

    /// Try to decode a frame from a buffer, advancing it if successful.
    ///
    /// # Errors
    ///
    /// Returns an error if the leading chunk is invalid; that chunk has been
    /// removed from the buffer.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        decode_frame(buf, self.codec.chunk_size(), &mut self.needed)
    }
}

/// Codec bound to one connection's chunk size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    chunk_size: usize,
}

impl FrameCodec {
    /// Create a codec for the given chunk size.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk size is out of range.
    pub fn new(chunk_size: usize) -> Result<Self, ProtocolError> {
        check_chunk_size(chunk_size)?;
        Ok(Self { chunk_size })
    }

    /// The chunk size frames are padded to.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Encode a packet to a padded frame.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, packet: &Packet) -> Result<Bytes, ProtocolError> {
        encode(packet, self.chunk_size)
    }

    /// Encode a packet into an existing buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_into(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_into(packet, self.chunk_size, buf)
    }

    /// Try to decode a frame from a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the leading chunk is invalid.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        decode_from(buf, self.chunk_size)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 64;

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet::subscribe("n1", "chat/room"),
            Packet::unsubscribe("n1", "chat/room"),
            Packet::message("n1", Some("chat"), b"hi".to_vec(), true),
            Packet::message("n1", None, vec![7u8; 1000], false),
            Packet::ack("broker", Some(42), true),
            Packet::resend("broker"),
            Packet::error("broker", false, Some("Channel not found".to_string())),
        ]
    }

    #[test]
    fn test_frames_are_chunk_aligned() {
        for packet in sample_packets() {
            let encoded = encode(&packet, CHUNK).unwrap();
            assert_eq!(encoded.len() % CHUNK, 0);
            assert!(!encoded.is_empty());
            assert_eq!(decode(&encoded, CHUNK).unwrap(), packet);
        }
    }

    #[test]
    fn test_padding_is_zeroed() {
        let packet = Packet::subscribe("n1", "a");
        let raw = rmp_serde::to_vec_named(&packet).unwrap();
        let encoded = encode(&packet, CHUNK).unwrap();

        assert_eq!(&encoded[..raw.len()], &raw[..]);
        assert!(encoded[raw.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_streaming_decode_across_chunks() {
        let small = Packet::message("n1", Some("a"), b"x".to_vec(), false);
        let large = Packet::message("n1", Some("a/b"), vec![3u8; 5 * CHUNK], false);

        let mut stream = BytesMut::new();
        encode_into(&small, CHUNK, &mut stream).unwrap();
        encode_into(&large, CHUNK, &mut stream).unwrap();
        encode_into(&small, CHUNK, &mut stream).unwrap();

        // Feed the stream in uneven slices, as a socket would.
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for piece in stream.chunks(37) {
            buf.extend_from_slice(piece);
            while let Some(packet) = decode_from(&mut buf, CHUNK).unwrap() {
                decoded.push(packet);
            }
        }

        assert_eq!(decoded, vec![small.clone(), large, small]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_chunk_waits() {
        let packet = Packet::subscribe("n1", "chat");
        let encoded = encode(&packet, CHUNK).unwrap();

        let mut buf = BytesMut::from(&encoded[..CHUNK - 1]);
        assert!(decode_from(&mut buf, CHUNK).unwrap().is_none());
        assert_eq!(buf.len(), CHUNK - 1);

        buf.extend_from_slice(&encoded[CHUNK - 1..]);
        assert_eq!(decode_from(&mut buf, CHUNK).unwrap(), Some(packet));
    }

    #[test]
    fn test_invalid_chunk_is_skipped() {
        let packet = Packet::subscribe("n1", "chat");

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8; CHUNK]);
        encode_into(&packet, CHUNK, &mut buf).unwrap();

        let err = decode_from(&mut buf, CHUNK).unwrap_err();
        assert!(err.is_invalid_data());
        assert_eq!(decode_from(&mut buf, CHUNK).unwrap(), Some(packet));
    }

    #[test]
    fn test_oversized_header_is_skipped() {
        // A str32 header claiming 2 GiB, then ordinary traffic.
        let mut garbage = [0u8; CHUNK];
        garbage[..5].copy_from_slice(&[0xdb, 0x7f, 0xff, 0xff, 0xff]);
        let packet = Packet::subscribe("n1", "chat");

        let mut buf = BytesMut::from(&garbage[..]);
        for _ in 0..50 {
            encode_into(&packet, CHUNK, &mut buf).unwrap();
        }

        let err = decode_from(&mut buf, CHUNK).unwrap_err();
        assert!(err.is_invalid_data());
        for _ in 0..50 {
            assert_eq!(decode_from(&mut buf, CHUNK).unwrap(), Some(packet.clone()));
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_field_is_too_large() {
        // {"type": bin32 of 2 GiB}
        let mut chunk = vec![0x81, 0xa4, b't', b'y', b'p', b'e', 0xc6, 0x7f, 0xff, 0xff, 0xff];
        chunk.resize(CHUNK, 0);
        let mut buf = BytesMut::from(&chunk[..]);

        assert!(matches!(
            decode_from(&mut buf, CHUNK),
            Err(ProtocolError::FrameTooLarge(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_non_packet_map_is_malformed() {
        // A map keyed by an integer.
        let mut chunk = vec![0x81, 0x01, 0x02];
        chunk.resize(CHUNK, 0);
        let mut buf = BytesMut::from(&chunk[..]);

        assert!(matches!(
            decode_from(&mut buf, CHUNK),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decoder_remembers_frame_length() {
        let packet = Packet::message("n1", Some("a"), vec![9u8; 10 * CHUNK], false);
        let frame = encode(&packet, CHUNK).unwrap();
        let mut decoder = FrameDecoder::new(FrameCodec::new(CHUNK).unwrap());

        // The first two chunks hold every header, payload length included.
        let mut buf = BytesMut::from(&frame[..2 * CHUNK]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(decoder.needed(), frame.len());

        buf.extend_from_slice(&frame[2 * CHUNK..frame.len() - 1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(decoder.needed(), frame.len());

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(packet));
        assert_eq!(decoder.needed(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_chunk_size() {
        assert!(matches!(
            FrameCodec::new(4),
            Err(ProtocolError::InvalidChunkSize(4))
        ));
        assert_eq!(FrameCodec::default().chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_frame_too_large() {
        let packet = Packet::message("n1", Some("a"), vec![0u8; MAX_FRAME_SIZE], false);
        match encode(&packet, CHUNK) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(0, CHUNK), CHUNK);
        assert_eq!(padded_len(1, CHUNK), CHUNK);
        assert_eq!(padded_len(CHUNK, CHUNK), CHUNK);
        assert_eq!(padded_len(CHUNK + 1, CHUNK), 2 * CHUNK);
    }
}
