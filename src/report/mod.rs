//! Offline reports over stored result files.
//!
//! Each report consumes objects from one or more files in order and writes
//! plain text (or JSON lines) to the given writer.

use std::io::{Read, Write};
use std::net::Ipv6Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::ValueEnum;

use crate::clock::{hms, Timestamp};
use crate::cluster::ClusterManager;
use crate::object::reader::FileObjects;
use crate::object::{DealiasResult, Object, PingObject};
use crate::pipeline::classify::{classify, Verdict};
use crate::pipeline::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Report {
    /// Transitive closure of confirmed aliases over incrementing addresses.
    Closure,
    /// Per-address counter classification from the Classify stage.
    Classify,
    /// Probe counts and durations per stage.
    Summary,
    /// Every object as one JSON document per line.
    Json,
}

/// Whether to keep reading the current file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    NextFile,
}

trait Dump {
    fn object(&mut self, obj: &Object, out: &mut dyn Write) -> Result<Flow>;

    fn finish(&mut self, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }
}

/// Run `report` over `files` in order.
pub fn run(report: Report, files: &[PathBuf], fudge: u32, out: &mut dyn Write) -> Result<()> {
    let mut readers = Vec::with_capacity(files.len());
    for path in files {
        readers.push(FileObjects::open(path)?);
    }
    run_readers(report, readers, fudge, out)
}

fn run_readers<R: Read>(
    report: Report,
    readers: Vec<FileObjects<R>>,
    fudge: u32,
    out: &mut dyn Write,
) -> Result<()> {
    let mut dump: Box<dyn Dump> = match report {
        Report::Closure => Box::new(Closure::new(fudge)),
        Report::Classify => Box::new(ClassifyDump { fudge }),
        Report::Summary => Box::new(Summary::default()),
        Report::Json => Box::new(JsonDump),
    };
    for reader in readers {
        for obj in reader {
            if dump.object(&obj?, out)? == Flow::NextFile {
                break;
            }
        }
    }
    dump.finish(out)?;
    out.flush().context("flushing report")
}

struct Closure {
    fudge: u32,
    clusters: ClusterManager<Ipv6Addr>,
}

impl Closure {
    fn new(fudge: u32) -> Self {
        Self {
            fudge,
            clusters: ClusterManager::new(),
        }
    }
}

impl Dump for Closure {
    fn object(&mut self, obj: &Object, _out: &mut dyn Write) -> Result<Flow> {
        match obj {
            Object::Ping(ping) if ping.userid == Stage::Classify.index() => {
                if classify(&ping.read_counters(), self.fudge) == Verdict::Incrementing {
                    self.clusters.insert_singleton(ping.dst);
                }
            }
            Object::Dealias(d) if d.result == DealiasResult::Aliases => {
                self.clusters.merge(d.a, d.b);
            }
            _ => {}
        }
        Ok(Flow::Continue)
    }

    fn finish(&mut self, out: &mut dyn Write) -> Result<()> {
        let mut sets = std::mem::take(&mut self.clusters).into_clusters();
        for set in &mut sets {
            set.sort();
        }
        sets.sort_by(|a, b| b.len().cmp(&a.len()));
        for set in sets {
            let line: Vec<String> = set.iter().map(Ipv6Addr::to_string).collect();
            writeln!(out, "{}", line.join(" "))?;
        }
        Ok(())
    }
}

struct ClassifyDump {
    fudge: u32,
}

impl Dump for ClassifyDump {
    fn object(&mut self, obj: &Object, out: &mut dyn Write) -> Result<Flow> {
        let Object::Ping(ping) = obj else {
            return Ok(Flow::Continue);
        };
        // Classify objects come first in a run's output
        if ping.userid != Stage::Classify.index() {
            return Ok(Flow::NextFile);
        }
        let verdict = classify(&ping.read_counters(), self.fudge);
        writeln!(out, "{} {}", ping.dst, verdict.as_str())?;
        Ok(Flow::Continue)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct StageSpan {
    probes: u64,
    first: Option<Timestamp>,
    last: Option<Timestamp>,
}

impl StageSpan {
    fn add(&mut self, probes: u64, start: Timestamp) {
        self.probes += probes;
        self.first = Some(self.first.map_or(start, |f| f.min(start)));
        self.last = Some(self.last.map_or(start, |l| l.max(start)));
    }

    fn secs(&self) -> u64 {
        match (self.first, self.last) {
            (Some(first), Some(last)) => last.saturating_since(first).as_secs(),
            _ => 0,
        }
    }
}

#[derive(Debug, Default)]
struct Summary {
    stages: [StageSpan; 6],
}

impl Summary {
    fn ping(&mut self, ping: &PingObject) {
        if let Some(span) = self.stages.get_mut(ping.userid as usize) {
            span.add(u64::from(ping.ping_sent), ping.start);
        }
    }
}

impl Dump for Summary {
    fn object(&mut self, obj: &Object, _out: &mut dyn Write) -> Result<Flow> {
        match obj {
            Object::Ping(ping) => self.ping(ping),
            Object::Dealias(d) => {
                let ally = Stage::Ally.index() as usize;
                if let Some(span) = self.stages.get_mut(ally) {
                    span.add(u64::from(d.probec), d.start);
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn finish(&mut self, out: &mut dyn Write) -> Result<()> {
        let mut total_secs = 0;
        let mut total_probes = 0;
        for (i, span) in self.stages.iter().enumerate() {
            let (h, m, s) = hms(span.secs());
            writeln!(out, "{i}: {} {h}:{m:02}:{s:02}", span.probes)?;
            total_secs += span.secs();
            total_probes += span.probes;
        }
        let (h, m, s) = hms(total_secs);
        writeln!(out, "total: {total_probes} {h}:{m:02}:{s:02}")?;
        Ok(())
    }
}

struct JsonDump;

impl Dump for JsonDump {
    fn object(&mut self, obj: &Object, out: &mut dyn Write) -> Result<Flow> {
        serde_json::to_writer(&mut *out, obj).context("encoding object as JSON")?;
        writeln!(out)?;
        Ok(Flow::Continue)
    }
}
