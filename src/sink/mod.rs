//! Where results go: every decoded object is appended to the result file,
//! and confirmed aliases to an optional plain-text log.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::Ipv6Addr;
use std::path::Path;

use anyhow::{Context, Result};

use crate::object::Frame;

/// Persists decoded measurement objects.
pub trait ResultSink {
    /// Append one frame, header included, and flush it.
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;
}

/// Writes frames verbatim, so the output is readable by the same object
/// reader that decoded them.
pub struct ObjectWriter<W: Write> {
    out: W,
    frames: u64,
}

impl ObjectWriter<BufWriter<File>> {
    /// Create (or truncate) the result file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating result file {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> ObjectWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, frames: 0 }
    }

    /// Frames written so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ResultSink for ObjectWriter<W> {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.out
            .write_all(&frame.bytes)
            .context("writing result frame")?;
        self.out.flush().context("flushing result file")?;
        self.frames += 1;
        Ok(())
    }
}

/// Append-only log of confirmed alias pairs, one `a b` line each.
pub struct AliasLog<W: Write> {
    out: W,
}

impl AliasLog<File> {
    /// Open `path` for append and stamp it with the host and local time.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening alias log {}", path.display()))?;
        let mut log = Self { out: file };
        log.header(&hostname(), &chrono::Local::now().format("%a %b %e %T %Y").to_string())?;
        Ok(log)
    }
}

impl<W: Write> AliasLog<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn header(&mut self, host: &str, date: &str) -> Result<()> {
        writeln!(self.out, "# {host} {date}").context("writing alias log header")?;
        self.out.flush().context("flushing alias log")
    }

    pub fn record(&mut self, a: Ipv6Addr, b: Ipv6Addr) -> Result<()> {
        writeln!(self.out, "{a} {b}").context("writing alias")?;
        self.out.flush().context("flushing alias log")
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}
