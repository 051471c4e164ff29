use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::skip::SkipPairs;
use crate::config::Config;
use crate::engine::{Engine, RunSummary};
use crate::export::RunMetrics;
use crate::input;
use crate::pipeline::{Pipeline, Stage};
use crate::sink::{AliasLog, ObjectWriter};

/// Where the probing daemon listens for control connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP port on the loopback interface.
    Port(u16),
    /// Unix domain socket.
    Unix(PathBuf),
}

/// Per-run inputs taken from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub addresses: PathBuf,
    pub output: PathBuf,
    pub endpoint: Endpoint,
    /// Treat every input address as already known to increment.
    pub assume_incrementing: bool,
    pub alias_log: Option<PathBuf>,
    /// Stop once this stage completes.
    pub stop: Option<Stage>,
    pub skip_pairs: Option<PathBuf>,
}

/// Agent wires configuration, inputs, the daemon connection and the result
/// sinks for one live run.
pub struct Agent {
    cfg: Config,
    opts: RunOptions,
    metrics: Arc<RunMetrics>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(cfg: Config, opts: RunOptions) -> Result<Self> {
        cfg.validate().context("validating config")?;
        let metrics = Arc::new(RunMetrics::new().context("creating run metrics")?);

        Ok(Self {
            cfg,
            opts,
            metrics,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the run gracefully once cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load inputs, connect to the daemon and run the pipeline to completion.
    pub async fn run(self) -> Result<RunSummary> {
        // 1. Inputs.
        let mut addrs = input::load_addresses(&self.opts.addresses)?;
        if self.cfg.shuffle {
            input::shuffle(&mut addrs);
        }
        let skip = match &self.opts.skip_pairs {
            Some(path) => input::load_skip_pairs(path)?,
            None => SkipPairs::new(),
        };

        let mut pipeline = Pipeline::new(self.cfg.clone(), Arc::clone(&self.metrics))
            .with_stop(self.opts.stop)
            .with_skip_pairs(skip);
        pipeline.load(addrs, self.opts.assume_incrementing);

        // 2. Outputs, opened before connecting so a bad path fails fast.
        let sink = ObjectWriter::create(&self.opts.output)?;
        let alias_log = self
            .opts
            .alias_log
            .as_deref()
            .map(AliasLog::open)
            .transpose()?;

        // 3. Connect and drive.
        let summary = match &self.opts.endpoint {
            Endpoint::Port(port) => {
                let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, *port))
                    .await
                    .with_context(|| format!("connecting to daemon on port {port}"))?;
                info!(port, "connected to daemon");
                self.drive(stream, pipeline, sink, alias_log).await?
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("connecting to daemon at {}", path.display()))?;
                info!(path = %path.display(), "connected to daemon");
                self.drive(stream, pipeline, sink, alias_log).await?
            }
        };

        // 4. Report.
        self.metrics.log_summary();
        if let Some(path) = &self.cfg.metrics_file {
            self.metrics.write_to(path)?;
            info!(path = %path.display(), "wrote run metrics");
        }

        Ok(summary)
    }

    async fn drive<S>(
        &self,
        stream: S,
        pipeline: Pipeline,
        sink: ObjectWriter<std::io::BufWriter<std::fs::File>>,
        alias_log: Option<AliasLog<std::fs::File>>,
    ) -> Result<RunSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut engine = Engine::new(
            stream,
            pipeline,
            Box::new(sink),
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        );
        if let Some(log) = alias_log {
            engine = engine.with_alias_log(log);
        }
        engine.run().await
    }
}
