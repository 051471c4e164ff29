use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for a speedtrap run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Largest gap tolerated between consecutive counter values. 0 selects
    /// the exact ordering check. Default: 65535.
    #[serde(default = "default_fudge")]
    pub fudge: u32,

    /// Retry cap for empty replies and inconclusive ally verdicts. Default: 2.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Delay before a retry and between probes of one set. Default: 1s.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Candidate clusters larger than this get a second exhaustive pairwise
    /// pass before Ally. Default: 3.
    #[serde(default = "default_candidate_split_threshold")]
    pub candidate_split_threshold: usize,

    /// Randomize the initial probe order. Default: true.
    #[serde(default = "default_true")]
    pub shuffle: bool,

    /// Probe shaping.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Write run metrics in prometheus text format here at exit.
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
}

/// Parameters of the commands sent to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProbeConfig {
    /// Echo request size in bytes. Must exceed `mtu`. Default: 1300.
    #[serde(default = "default_packet_size")]
    pub packet_size: u16,

    /// Path MTU the daemon reports to elicit fragmentation. Default: 1280.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Probes per Classify ping. Default: 6.
    #[serde(default = "default_classify_count")]
    pub classify_count: u16,

    /// Probes per ping in the later stages. Default: 2.
    #[serde(default = "default_descend_count")]
    pub descend_count: u16,

    /// Inter-probe wait of the ally method. Default: 1s.
    #[serde(default = "default_ally_wait", with = "humantime_serde")]
    pub ally_wait: Duration,
}

fn default_fudge() -> u32 {
    65535
}

fn default_max_attempts() -> u8 {
    2
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_candidate_split_threshold() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_packet_size() -> u16 {
    1300
}

fn default_mtu() -> u16 {
    1280
}

fn default_classify_count() -> u16 {
    6
}

fn default_descend_count() -> u16 {
    2
}

fn default_ally_wait() -> Duration {
    Duration::from_secs(1)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            fudge: default_fudge(),
            max_attempts: default_max_attempts(),
            retry_delay: default_retry_delay(),
            candidate_split_threshold: default_candidate_split_threshold(),
            shuffle: true,
            probe: ProbeConfig::default(),
            metrics_file: None,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            packet_size: default_packet_size(),
            mtu: default_mtu(),
            classify_count: default_classify_count(),
            descend_count: default_descend_count(),
            ally_wait: default_ally_wait(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.probe.packet_size <= self.probe.mtu {
            bail!(
                "probe.packet_size ({}) must exceed probe.mtu ({}) to elicit fragmentation",
                self.probe.packet_size,
                self.probe.mtu
            );
        }

        if self.probe.classify_count < 3 {
            bail!("probe.classify_count must be at least 3");
        }

        if self.probe.descend_count == 0 {
            bail!("probe.descend_count must be positive");
        }

        if self.max_attempts == 0 {
            bail!("max_attempts must be positive");
        }

        if self.candidate_split_threshold < 2 {
            bail!("candidate_split_threshold must be at least 2");
        }

        if self.retry_delay.is_zero() {
            bail!("retry_delay must be positive");
        }

        Ok(())
    }
}
