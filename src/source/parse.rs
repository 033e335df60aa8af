//! Frame decoding for the trigger event stream.
//!
//! A frame is a little-endian `u32` length followed by that many bytes of
//! body. The body holds a fixed header and two hit-timestamp lists:
//!
//! ```text
//! trigger | clock | ecl | wr_hi | wr_lo | n_extra | n_main | extra[..] | main[..]
//! ```

use thiserror::Error;

use super::event::{RawEvent, MAX_TIMING_ITEMS};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Fixed body header size in bytes (seven `u32` words).
pub const HEADER_SIZE: usize = 28;

/// Largest well-formed body.
pub const MAX_BODY_SIZE: usize = HEADER_SIZE + 2 * MAX_TIMING_ITEMS * 4;

/// Errors that can occur while decoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame body too short: {size} bytes")]
    Truncated { size: usize },

    #[error("frame body of {size} bytes exceeds the largest valid frame")]
    Oversized { size: usize },

    #[error("{list} list holds {count} items, limit is 1024")]
    TooManyItems { list: &'static str, count: usize },

    #[error("frame body is {actual} bytes, header announces {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Validates a length prefix before the body is read.
pub fn check_body_len(len: u32) -> Result<usize, ParseError> {
    let size = len as usize;
    if size < HEADER_SIZE {
        return Err(ParseError::Truncated { size });
    }
    if size > MAX_BODY_SIZE {
        return Err(ParseError::Oversized { size });
    }
    Ok(size)
}

/// Decodes one frame body (without its length prefix).
pub fn parse_frame(body: &[u8]) -> Result<RawEvent, ParseError> {
    if body.len() < HEADER_SIZE {
        return Err(ParseError::Truncated { size: body.len() });
    }

    let mut words = body.chunks_exact(4).map(le_word);
    let mut next = || words.next().unwrap_or(0);

    let trigger = next();
    let clock = next();
    let ecl = next();
    let wr_hi = next();
    let wr_lo = next();
    let n_extra = next() as usize;
    let n_main = next() as usize;

    if n_extra > MAX_TIMING_ITEMS {
        return Err(ParseError::TooManyItems {
            list: "extra",
            count: n_extra,
        });
    }
    if n_main > MAX_TIMING_ITEMS {
        return Err(ParseError::TooManyItems {
            list: "main",
            count: n_main,
        });
    }

    let expected = HEADER_SIZE + 4 * (n_extra + n_main);
    if body.len() != expected {
        return Err(ParseError::LengthMismatch {
            expected,
            actual: body.len(),
        });
    }

    let timing_extra: Vec<u32> = (0..n_extra).map(|_| next()).collect();
    let timing: Vec<u32> = (0..n_main).map(|_| next()).collect();

    Ok(RawEvent {
        trigger,
        clock,
        ecl,
        wr_hi,
        wr_lo,
        timing_extra,
        timing,
    })
}

/// Encodes an event as a complete frame, length prefix included.
pub fn encode_frame(event: &RawEvent) -> Vec<u8> {
    let body_len = HEADER_SIZE + 4 * event.hit_items();
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    for word in [
        event.trigger,
        event.clock,
        event.ecl,
        event.wr_hi,
        event.wr_lo,
        event.timing_extra.len() as u32,
        event.timing.len() as u32,
    ] {
        buf.extend_from_slice(&word.to_le_bytes());
    }
    for item in event.timing_extra.iter().chain(event.timing.iter()) {
        buf.extend_from_slice(&item.to_le_bytes());
    }
    buf
}

#[inline(always)]
fn le_word(chunk: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(chunk);
    u32::from_le_bytes(word)
}
