use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use anyhow::{Context, Result};

use super::parse::{parse_header, parse_object, ParseError};
use super::{Frame, Object, HEADER_SIZE};

/// Reassembles frames from arbitrarily chunked input.
///
/// Bytes decoded off the control channel are pushed in as they arrive;
/// complete frames come out in order.
#[derive(Debug, Default)]
pub struct ObjectReader {
    buf: Vec<u8>,
}

impl ObjectReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ParseError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = parse_header(&self.buf)?;
        let total = HEADER_SIZE + header.body_len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let rest = self.buf.split_off(total);
        let bytes = std::mem::replace(&mut self.buf, rest);
        Ok(Some(Frame {
            obj_type: header.obj_type,
            bytes,
        }))
    }
}

/// Sequential reader over a stored results file.
pub struct FileObjects<R> {
    inner: R,
}

impl FileObjects<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> FileObjects<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next frame. Returns `Ok(None)` at a clean end of file.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut header = [0u8; HEADER_SIZE];
        match self.inner.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("reading frame header"),
        }
        let parsed = parse_header(&header)?;
        let mut bytes = Vec::with_capacity(HEADER_SIZE + parsed.body_len);
        bytes.extend_from_slice(&header);
        bytes.resize(HEADER_SIZE + parsed.body_len, 0);
        self.inner
            .read_exact(&mut bytes[HEADER_SIZE..])
            .context("reading frame body")?;
        Ok(Some(Frame {
            obj_type: parsed.obj_type,
            bytes,
        }))
    }

    /// Read the next object this crate understands, skipping the rest.
    pub fn next_object(&mut self) -> Result<Option<Object>> {
        while let Some(frame) = self.next_frame()? {
            if let Some(obj) = parse_object(&frame.bytes)? {
                return Ok(Some(obj));
            }
        }
        Ok(None)
    }
}

impl<R: Read> Iterator for FileObjects<R> {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_object().transpose()
    }
}
