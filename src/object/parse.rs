//! Binary frame decoding.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! header  : magic u16 (0x1205) | type u16 | body length u32
//! ping    : userid u32 | start sec u32 | start usec u32 | src [16] | dst [16]
//!           | probe_size u16 | ping_sent u16 | reply_count u16
//!           | reply_count x reply
//! reply   : probe_id u16 | flags u8 | icmp_type u8 | icmp_code u8 | reply_ttl u8
//!           | reply_size u16 | tx sec u32 | tx usec u32 | rtt usec u32 | reply_ipid u32
//! dealias : userid u32 | start sec u32 | start usec u32 | method u8 | result u8
//!           | probec u32 | addr a [16] | addr b [16]
//! ```

use std::net::Ipv6Addr;
use std::time::Duration;

use thiserror::Error;

use crate::clock::Timestamp;

use super::{
    DealiasObject, DealiasResult, Object, ObjectType, PingObject, PingReply, HEADER_SIZE, MAGIC,
};

/// Fixed part of a ping body.
pub const PING_FIXED_SIZE: usize = 50;

/// Size of one ping reply record.
pub const PING_REPLY_SIZE: usize = 24;

/// Size of a dealias body.
pub const DEALIAS_SIZE: usize = 50;

/// Largest body a frame header may announce. A ping with the maximum
/// reply count is about 1.5 MiB.
pub const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// Errors that can occur while decoding frames.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame header too short: {size} bytes")]
    Truncated { size: usize },

    #[error("bad frame magic {raw:#06x}")]
    BadMagic { raw: u16 },

    #[error("reading {object}: unexpected end of data")]
    PayloadTruncated { object: &'static str },

    #[error("reading {object}: {extra} trailing bytes")]
    TrailingBytes { object: &'static str, extra: usize },

    #[error("reading dealias: invalid result code {raw}")]
    InvalidResult { raw: u8 },

    #[error("frame body of {len} bytes exceeds {MAX_BODY_LEN}")]
    BodyTooLarge { len: usize },
}

/// Frame header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub obj_type: u16,
    pub body_len: usize,
}

/// Decode a frame header from the first [`HEADER_SIZE`] bytes of `data`.
pub fn parse_header(data: &[u8]) -> Result<FrameHeader, ParseError> {
    if data.len() < HEADER_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }
    let magic = read_u16_be(data, 0);
    if magic != MAGIC {
        return Err(ParseError::BadMagic { raw: magic });
    }
    let body_len = read_u32_be(data, 4) as usize;
    if body_len > MAX_BODY_LEN {
        return Err(ParseError::BodyTooLarge { len: body_len });
    }
    Ok(FrameHeader {
        obj_type: read_u16_be(data, 2),
        body_len,
    })
}

/// Decode a complete frame. Returns `Ok(None)` for object types this crate
/// does not consume.
pub fn parse_object(frame: &[u8]) -> Result<Option<Object>, ParseError> {
    let header = parse_header(frame)?;
    let body = frame.get(HEADER_SIZE..).unwrap_or(&[]);
    if body.len() < header.body_len {
        return Err(ParseError::PayloadTruncated { object: "frame" });
    }
    let body = body.get(..header.body_len).unwrap_or(&[]);

    match ObjectType::from_u16(header.obj_type) {
        Some(ObjectType::Ping) => parse_ping(body).map(|p| Some(Object::Ping(p))),
        Some(ObjectType::Dealias) => parse_dealias(body).map(|d| Some(Object::Dealias(d))),
        None => Ok(None),
    }
}

fn parse_ping(data: &[u8]) -> Result<PingObject, ParseError> {
    ensure_payload(data, PING_FIXED_SIZE, "ping")?;
    let reply_count = read_u16_be(data, 48) as usize;
    let need = PING_FIXED_SIZE + reply_count * PING_REPLY_SIZE;
    ensure_payload(data, need, "ping")?;
    if data.len() > need {
        return Err(ParseError::TrailingBytes {
            object: "ping",
            extra: data.len() - need,
        });
    }

    let replies = (0..reply_count)
        .map(|i| parse_ping_reply(data, PING_FIXED_SIZE + i * PING_REPLY_SIZE))
        .collect();

    Ok(PingObject {
        userid: read_u32_be(data, 0),
        start: Timestamp::from_parts(read_u32_be(data, 4), read_u32_be(data, 8)),
        src: read_addr(data, 12),
        dst: read_addr(data, 28),
        probe_size: read_u16_be(data, 44),
        ping_sent: read_u16_be(data, 46),
        replies,
    })
}

/// Callers guarantee `off + PING_REPLY_SIZE <= data.len()`.
fn parse_ping_reply(data: &[u8], off: usize) -> PingReply {
    PingReply {
        probe_id: read_u16_be(data, off),
        flags: read_u8(data, off + 2),
        icmp_type: read_u8(data, off + 3),
        icmp_code: read_u8(data, off + 4),
        reply_ttl: read_u8(data, off + 5),
        reply_size: read_u16_be(data, off + 6),
        tx: Timestamp::from_parts(read_u32_be(data, off + 8), read_u32_be(data, off + 12)),
        rtt: Duration::from_micros(u64::from(read_u32_be(data, off + 16))),
        reply_ipid: read_u32_be(data, off + 20),
    }
}

fn parse_dealias(data: &[u8]) -> Result<DealiasObject, ParseError> {
    ensure_payload(data, DEALIAS_SIZE, "dealias")?;
    let raw = read_u8(data, 13);
    let result = DealiasResult::from_u8(raw).ok_or(ParseError::InvalidResult { raw })?;
    Ok(DealiasObject {
        userid: read_u32_be(data, 0),
        start: Timestamp::from_parts(read_u32_be(data, 4), read_u32_be(data, 8)),
        method: read_u8(data, 12),
        result,
        probec: read_u32_be(data, 14),
        a: read_addr(data, 18),
        b: read_addr(data, 34),
    })
}

// ---------------------------------------------------------------------------
// Byte-reading helpers. Callers check lengths first; out-of-range reads
// yield zeroes rather than panicking.
// ---------------------------------------------------------------------------

fn ensure_payload(data: &[u8], need: usize, object: &'static str) -> Result<(), ParseError> {
    if data.len() < need {
        Err(ParseError::PayloadTruncated { object })
    } else {
        Ok(())
    }
}

fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    data.get(offset..offset + N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .unwrap_or([0u8; N])
}

fn read_u8(data: &[u8], offset: usize) -> u8 {
    data.get(offset).copied().unwrap_or(0)
}

fn read_u16_be(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(read_fixed::<2>(data, offset))
}

fn read_u32_be(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(read_fixed::<4>(data, offset))
}

fn read_addr(data: &[u8], offset: usize) -> Ipv6Addr {
    Ipv6Addr::from(read_fixed::<16>(data, offset))
}
