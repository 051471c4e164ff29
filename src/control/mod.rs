//! Text control channel to the probing daemon.
//!
//! The daemon speaks a newline-delimited protocol: `MORE` grants one command
//! credit, `OK`/`ERR` acknowledge the oldest outstanding command, and
//! `DATA <n>` announces `n` bytes of uuencoded result lines.

pub mod uu;

use thiserror::Error;

/// First command sent on a fresh connection.
pub const ATTACH: &[u8] = b"attach\n";

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control channel i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown response '{line}'")]
    UnknownResponse { line: String },

    #[error("could not parse data length in '{line}'")]
    BadDataLength { line: String },

    #[error("bad data line: {reason}")]
    BadData { reason: String },

    #[error("daemon closed the control channel")]
    Closed,
}

/// One parsed control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    More,
    Ok,
    Err,
    Data(usize),
}

fn starts_with_ignore_case(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Parse a line (newline excluded) received outside a data block.
pub fn parse_control_line(line: &[u8]) -> Result<ControlLine, ControlError> {
    if line.eq_ignore_ascii_case(b"MORE") {
        return Ok(ControlLine::More);
    }
    if line.len() > 5 && starts_with_ignore_case(line, b"DATA ") {
        let text = String::from_utf8_lossy(line);
        let n = text[5..]
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|&n| n >= 1)
            .ok_or_else(|| ControlError::BadDataLength {
                line: text.to_string(),
            })?;
        return Ok(ControlLine::Data(n));
    }
    if starts_with_ignore_case(line, b"OK") {
        return Ok(ControlLine::Ok);
    }
    if starts_with_ignore_case(line, b"ERR") {
        return Ok(ControlLine::Err);
    }
    Err(ControlError::UnknownResponse {
        line: String::from_utf8_lossy(line).into_owned(),
    })
}

/// What the engine needs to act on after feeding control bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// One more command may be issued.
    More,
    /// The oldest outstanding command was accepted.
    Accepted,
    /// The oldest outstanding command was rejected.
    Rejected,
    /// Raw result bytes decoded from a data block.
    Decoded(Vec<u8>),
}

/// Splits control bytes into lines and tracks data blocks.
#[derive(Debug, Default)]
pub struct ControlDecoder {
    pending: Vec<u8>,
    data_left: usize,
}

impl ControlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the current data block still expected.
    pub fn data_left(&self) -> usize {
        self.data_left
    }

    /// Feed raw bytes; returns events for every complete line.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ControlEvent>, ControlError> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        let mut consumed = 0;

        while let Some(pos) = self.pending[consumed..].iter().position(|&b| b == b'\n') {
            let line_end = consumed + pos;
            let line = &self.pending[consumed..line_end];
            consumed = line_end + 1;
            if line.is_empty() {
                continue;
            }

            if self.data_left > 0 {
                let mut out = Vec::new();
                uu::uudecode_line(line, &mut out)?;
                if !out.is_empty() {
                    events.push(ControlEvent::Decoded(out));
                }
                self.data_left = self.data_left.saturating_sub(line.len() + 1);
                continue;
            }

            match parse_control_line(line)? {
                ControlLine::More => events.push(ControlEvent::More),
                ControlLine::Ok => events.push(ControlEvent::Accepted),
                ControlLine::Err => events.push(ControlEvent::Rejected),
                ControlLine::Data(n) => self.data_left = n,
            }
        }

        self.pending.drain(..consumed);
        Ok(events)
    }
}
