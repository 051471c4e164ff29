use std::path::Path;

use anyhow::{Context, Result};
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};

use crate::pipeline::Stage;

/// Prometheus metrics for one run.
///
/// All metrics use the "speedtrap" namespace and live in a private registry.
/// Nothing is served; the registry is dumped in text format at exit.
pub struct RunMetrics {
    registry: Registry,

    /// Commands written to the daemon, by stage.
    pub commands_issued: CounterVec,
    /// Objects decoded off the control channel, by object type.
    pub objects_decoded: CounterVec,
    /// Classify verdicts, by outcome.
    pub classify_outcomes: CounterVec,
    /// Commands the daemon rejected.
    pub commands_rejected: Counter,
    /// Probes rescheduled after an empty reply or a rejection, by stage.
    pub retries: CounterVec,
    /// Pairs accepted by the pairwise sequence test.
    pub likely_aliases: Counter,
    /// Ally verdicts, by result.
    pub ally_results: CounterVec,
    /// Pairs the daemon confirmed as aliases.
    pub aliases_confirmed: Counter,
    /// Index of the current stage.
    pub stage: Gauge,
}

impl RunMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let commands_issued = CounterVec::new(
            Opts::new(
                "commands_issued_total",
                "Total commands written to the probing daemon by stage.",
            )
            .namespace("speedtrap"),
            &["stage"],
        )?;
        let objects_decoded = CounterVec::new(
            Opts::new(
                "objects_decoded_total",
                "Total measurement objects decoded by type.",
            )
            .namespace("speedtrap"),
            &["type"],
        )?;
        let classify_outcomes = CounterVec::new(
            Opts::new(
                "classify_outcomes_total",
                "Total classify verdicts by outcome.",
            )
            .namespace("speedtrap"),
            &["outcome"],
        )?;
        let commands_rejected = Counter::with_opts(
            Opts::new(
                "commands_rejected_total",
                "Total commands rejected by the probing daemon.",
            )
            .namespace("speedtrap"),
        )?;
        let retries = CounterVec::new(
            Opts::new("retries_total", "Total probes rescheduled by stage.")
                .namespace("speedtrap"),
            &["stage"],
        )?;
        let likely_aliases = Counter::with_opts(
            Opts::new(
                "likely_aliases_total",
                "Total pairs accepted by the pairwise sequence test.",
            )
            .namespace("speedtrap"),
        )?;
        let ally_results = CounterVec::new(
            Opts::new("ally_results_total", "Total ally verdicts by result.")
                .namespace("speedtrap"),
            &["result"],
        )?;
        let aliases_confirmed = Counter::with_opts(
            Opts::new(
                "aliases_confirmed_total",
                "Total address pairs confirmed as aliases.",
            )
            .namespace("speedtrap"),
        )?;
        let stage = Gauge::with_opts(
            Opts::new("stage", "Index of the current pipeline stage.").namespace("speedtrap"),
        )?;

        registry.register(Box::new(commands_issued.clone()))?;
        registry.register(Box::new(objects_decoded.clone()))?;
        registry.register(Box::new(classify_outcomes.clone()))?;
        registry.register(Box::new(commands_rejected.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(likely_aliases.clone()))?;
        registry.register(Box::new(ally_results.clone()))?;
        registry.register(Box::new(aliases_confirmed.clone()))?;
        registry.register(Box::new(stage.clone()))?;

        Ok(Self {
            registry,
            commands_issued,
            objects_decoded,
            classify_outcomes,
            commands_rejected,
            retries,
            likely_aliases,
            ally_results,
            aliases_confirmed,
            stage,
        })
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn command_issued(&self, stage: Stage) {
        self.commands_issued
            .with_label_values(&[stage.as_str()])
            .inc();
    }

    pub fn retry(&self, stage: Stage) {
        self.retries.with_label_values(&[stage.as_str()]).inc();
    }

    pub fn set_stage(&self, stage: Stage) {
        self.stage.set(f64::from(stage.index()));
    }

    /// Commands issued across all stages.
    pub fn total_commands(&self) -> u64 {
        Stage::ALL
            .iter()
            .map(|s| {
                self.commands_issued
                    .with_label_values(&[s.as_str()])
                    .get() as u64
            })
            .sum()
    }

    /// Encode every registered metric in prometheus text format.
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Write the text exposition to `path`, replacing any previous content.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let text = self.encode_text()?;
        std::fs::write(path, text)
            .with_context(|| format!("writing metrics to {}", path.display()))
    }

    /// Log a one-line summary of the run.
    pub fn log_summary(&self) {
        let per_stage: Vec<String> = Stage::ALL
            .iter()
            .map(|s| {
                format!(
                    "{}={}",
                    s.as_str(),
                    self.commands_issued.with_label_values(&[s.as_str()]).get() as u64
                )
            })
            .collect();
        tracing::info!(
            commands = self.total_commands(),
            per_stage = %per_stage.join(" "),
            rejected = self.commands_rejected.get() as u64,
            likely_aliases = self.likely_aliases.get() as u64,
            aliases = self.aliases_confirmed.get() as u64,
            "run summary"
        );
    }
}
