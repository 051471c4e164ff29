//! Event loop driving the probing daemon over its control channel.
//!
//! The engine owns the connection and the [`Pipeline`]. Each iteration it
//! issues as many commands as the daemon has granted credit for, then waits
//! on whichever comes first: control channel input, the earliest deferred
//! probe, or cancellation. Decoded objects are persisted before the pipeline
//! sees them, so the result file always holds everything that was acted on.

use std::collections::VecDeque;
use std::fs::File;
use std::net::Ipv6Addr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{ControlDecoder, ControlError, ControlEvent, ATTACH};
use crate::export::RunMetrics;
use crate::object::parse::parse_object;
use crate::object::reader::ObjectReader;
use crate::pipeline::{Pipeline, Stage};
use crate::sink::{AliasLog, ResultSink};
use crate::wait::WaitPayload;

const READ_BUF_SIZE: usize = 16 * 1024;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Stage the pipeline was in at exit.
    pub stage: Stage,
    /// Every pair the daemon confirmed as aliases.
    pub aliases: Vec<(Ipv6Addr, Ipv6Addr)>,
    /// The run was cancelled before the pipeline finished.
    pub cancelled: bool,
}

pub struct Engine<S> {
    stream: S,
    pipeline: Pipeline,
    sink: Box<dyn ResultSink>,
    aliases: Option<AliasLog<File>>,
    aliases_logged: usize,
    metrics: Arc<RunMetrics>,
    cancel: CancellationToken,
    draining: bool,
    decoder: ControlDecoder,
    objects: ObjectReader,
    /// Commands the daemon will still accept.
    credit: usize,
    /// Commands written but not yet acknowledged or rejected, oldest first.
    issued: VecDeque<WaitPayload>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Engine<S> {
    pub fn new(
        stream: S,
        pipeline: Pipeline,
        sink: Box<dyn ResultSink>,
        metrics: Arc<RunMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            pipeline,
            sink,
            aliases: None,
            aliases_logged: 0,
            metrics,
            cancel,
            draining: false,
            decoder: ControlDecoder::new(),
            objects: ObjectReader::new(),
            credit: 0,
            issued: VecDeque::new(),
        }
    }

    pub fn with_alias_log(mut self, log: AliasLog<File>) -> Self {
        self.aliases = Some(log);
        self
    }

    /// Attach to the daemon and run the pipeline to completion.
    pub async fn run(mut self) -> Result<RunSummary> {
        self.stream
            .write_all(ATTACH)
            .await
            .context("attaching to daemon")?;
        self.stream.flush().await.context("attaching to daemon")?;
        info!(stage = %self.pipeline.stage(), "attached to daemon");

        self.pipeline.advance();
        let mut buf = vec![0u8; READ_BUF_SIZE];

        loop {
            if !self.draining && self.cancel.is_cancelled() {
                self.start_draining();
            }
            self.issue().await?;
            if self.finished() {
                break;
            }

            let deadline = if self.credit > 0 && !self.draining {
                self.pipeline.next_deadline()
            } else {
                None
            };

            tokio::select! {
                read = self.stream.read(&mut buf) => {
                    let n = read.map_err(ControlError::Io)?;
                    if n == 0 {
                        let stage = self.pipeline.stage();
                        return Err(ControlError::Closed)
                            .with_context(|| format!("during the {stage} stage"));
                    }
                    self.on_control(&buf[..n])?;
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
                _ = self.cancel.cancelled(), if !self.draining => self.start_draining(),
            }
        }

        if let Err(e) = self.stream.shutdown().await {
            debug!(error = %e, "closing control channel");
        }
        info!(
            stage = %self.pipeline.stage(),
            aliases = self.pipeline.confirmed().len(),
            cancelled = self.draining,
            "run finished"
        );

        Ok(RunSummary {
            stage: self.pipeline.stage(),
            aliases: self.pipeline.confirmed().to_vec(),
            cancelled: self.draining && !self.pipeline.is_done(),
        })
    }

    fn start_draining(&mut self) {
        info!(
            outstanding = self.issued.len(),
            "cancelled, draining outstanding commands"
        );
        self.draining = true;
    }

    fn finished(&self) -> bool {
        if self.pipeline.is_done() {
            return true;
        }
        self.draining && self.pipeline.targets().count() == 0 && self.issued.is_empty()
    }

    /// Spend credit on whatever the pipeline has ready.
    async fn issue(&mut self) -> Result<()> {
        if self.draining {
            return Ok(());
        }
        let mut wrote = false;
        while self.credit > 0 {
            let Some(cmd) = self.pipeline.next_command(Instant::now())? else {
                break;
            };
            self.stream
                .write_all(&cmd.to_wire())
                .await
                .context("writing command")?;
            self.credit -= 1;
            self.issued.push_back(cmd.payload);
            wrote = true;
        }
        if wrote {
            self.stream.flush().await.context("writing command")?;
        }
        Ok(())
    }

    fn on_control(&mut self, bytes: &[u8]) -> Result<()> {
        for event in self.decoder.feed(bytes)? {
            match event {
                ControlEvent::More => self.credit += 1,
                // the attach itself is acknowledged too
                ControlEvent::Accepted => {
                    self.issued.pop_front();
                }
                ControlEvent::Rejected => {
                    let Some(payload) = self.issued.pop_front() else {
                        bail!("daemon rejected the attach");
                    };
                    self.credit += 1;
                    warn!(?payload, stage = %self.pipeline.stage(), "command rejected");
                    self.pipeline.on_rejected(Instant::now(), payload)?;
                }
                ControlEvent::Decoded(data) => {
                    self.objects.push(&data);
                    self.drain_objects()?;
                }
            }
        }
        Ok(())
    }

    fn drain_objects(&mut self) -> Result<()> {
        while let Some(frame) = self.objects.next_frame()? {
            let Some(obj) = parse_object(&frame.bytes)? else {
                debug!(obj_type = frame.obj_type, "skipping object of unhandled type");
                continue;
            };
            self.metrics
                .objects_decoded
                .with_label_values(&[obj.object_type().as_str()])
                .inc();
            self.sink.write_frame(&frame)?;
            self.pipeline.on_object(Instant::now(), &obj)?;
            self.log_new_aliases()?;
        }
        Ok(())
    }

    fn log_new_aliases(&mut self) -> Result<()> {
        let confirmed = self.pipeline.confirmed();
        if let Some(log) = &mut self.aliases {
            for &(a, b) in confirmed.iter().skip(self.aliases_logged) {
                log.record(a, b)?;
            }
        }
        self.aliases_logged = confirmed.len();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    use super::*;
    use crate::config::Config;
    use crate::sink::ObjectWriter;

    fn addr(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n)
    }

    /// Engine in the Classify stage, with the daemon's end of the pipe.
    fn engine(addrs: &[Ipv6Addr]) -> (Engine<DuplexStream>, DuplexStream) {
        let (client, daemon) = duplex(4096);
        let metrics = Arc::new(RunMetrics::new().unwrap());
        let mut pipeline = Pipeline::new(Config::default(), Arc::clone(&metrics));
        pipeline.load(addrs.iter().copied(), false);
        pipeline.advance();
        let engine = Engine::new(
            client,
            pipeline,
            Box::new(ObjectWriter::new(Vec::new())),
            metrics,
            CancellationToken::new(),
        );
        (engine, daemon)
    }

    #[tokio::test]
    async fn test_issue_spends_only_granted_credit() {
        let (mut e, _daemon) = engine(&[addr(1), addr(2), addr(3)]);

        e.issue().await.unwrap();
        assert!(e.issued.is_empty());

        // the attach acknowledgement has nothing to pop
        e.on_control(b"OK\nMORE\nMORE\n").unwrap();
        assert_eq!(e.credit, 2);
        assert!(e.issued.is_empty());

        e.issue().await.unwrap();
        assert_eq!(e.credit, 0);
        assert_eq!(e.issued.len(), 2);
    }

    #[tokio::test]
    async fn test_ok_pops_oldest_issued() {
        let (mut e, _daemon) = engine(&[addr(1), addr(2)]);
        e.on_control(b"OK\nMORE\nMORE\n").unwrap();
        e.issue().await.unwrap();
        let second = e.issued[1];

        e.on_control(b"OK\n").unwrap();
        assert_eq!(e.issued.len(), 1);
        assert_eq!(e.issued[0], second);
        // acceptance alone grants nothing
        assert_eq!(e.credit, 0);
    }

    #[tokio::test]
    async fn test_err_restores_credit_and_reissues() {
        let (mut e, daemon) = engine(&[addr(1)]);
        let mut lines = BufReader::new(daemon).lines();
        e.on_control(b"OK\nMORE\n").unwrap();
        e.issue().await.unwrap();
        assert_eq!(e.credit, 0);

        e.on_control(b"ERR\n").unwrap();
        assert!(e.issued.is_empty());
        assert_eq!(e.credit, 1);
        assert_eq!(e.metrics.commands_rejected.get() as u64, 1);

        e.issue().await.unwrap();
        assert_eq!(e.issued.len(), 1);
        let first = lines.next_line().await.unwrap().unwrap();
        let again = lines.next_line().await.unwrap().unwrap();
        assert!(first.ends_with("2001:db8::1"), "{first}");
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_err_with_nothing_outstanding_is_fatal() {
        let (mut e, _daemon) = engine(&[addr(1)]);
        let err = e.on_control(b"ERR\n").unwrap_err();
        assert!(err.to_string().contains("rejected the attach"), "{err}");
    }
}
