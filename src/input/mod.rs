//! Address-list and skip-pair file loading.
//!
//! Bad lines never abort a run: they are logged and skipped.

use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::net::Ipv6Addr;
use std::path::Path;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::cluster::skip::SkipPairs;

/// True for global unicast space, 2000::/3.
pub fn is_global_unicast(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xe000 == 0x2000
}

/// Strip a trailing `#` comment and surrounding whitespace.
fn content(line: &str) -> &str {
    line.split('#').next().unwrap_or("").trim()
}

/// Parse an address list: one address per line. Addresses outside
/// 2000::/3, duplicates and unparseable lines are dropped. Order is kept.
pub fn read_addresses<R: BufRead>(reader: R) -> Result<Vec<Ipv6Addr>> {
    let mut seen = HashSet::new();
    let mut addrs = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line.context("reading address list")?;
        let text = content(&line);
        if text.is_empty() {
            continue;
        }
        let addr: Ipv6Addr = match text.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(line = n + 1, text, error = %e, "skipping unparseable address");
                continue;
            }
        };
        if !is_global_unicast(&addr) {
            debug!(%addr, "skipping address outside 2000::/3");
            continue;
        }
        if !seen.insert(addr) {
            warn!(%addr, "skipping duplicate address");
            continue;
        }
        addrs.push(addr);
    }
    Ok(addrs)
}

pub fn load_addresses(path: &Path) -> Result<Vec<Ipv6Addr>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening address list {}", path.display()))?;
    let addrs = read_addresses(BufReader::new(file))
        .with_context(|| format!("loading {}", path.display()))?;
    info!(path = %path.display(), count = addrs.len(), "loaded addresses");
    Ok(addrs)
}

/// Parse a skip file: two whitespace-separated addresses per line.
pub fn read_skip_pairs<R: BufRead>(reader: R) -> Result<SkipPairs> {
    let mut skip = SkipPairs::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line.context("reading skip file")?;
        let text = content(&line);
        if text.is_empty() {
            continue;
        }
        let mut fields = text.split_whitespace();
        let pair = match (fields.next(), fields.next(), fields.next()) {
            (Some(a), Some(b), None) => a.parse::<Ipv6Addr>().ok().zip(b.parse().ok()),
            _ => None,
        };
        match pair {
            Some((a, b)) => {
                skip.insert(a, b);
            }
            None => warn!(line = n + 1, text, "skipping malformed skip pair"),
        }
    }
    Ok(skip)
}

pub fn load_skip_pairs(path: &Path) -> Result<SkipPairs> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening skip file {}", path.display()))?;
    let skip = read_skip_pairs(BufReader::new(file))
        .with_context(|| format!("loading {}", path.display()))?;
    info!(path = %path.display(), pairs = skip.len(), "loaded skip pairs");
    Ok(skip)
}

/// Randomize probe order so consecutive probes rarely hit the same host.
pub fn shuffle(addrs: &mut [Ipv6Addr]) {
    addrs.shuffle(&mut rand::thread_rng());
}
