//! Candidate targets, their counter samples, and the registry of targets
//! with a probe outstanding.
//!
//! Every [`Target`] lives in a single arena owned by [`TargetRegistry`] and
//! is addressed by a [`TargetId`]. Other structures (target sets, clusters,
//! the wait queue) hold ids, never references, so removing a target from
//! any of them is an index invalidation rather than pointer surgery.

pub mod set;

use std::collections::BTreeMap;
use std::net::Ipv6Addr;

use thiserror::Error;

use crate::clock::Timestamp;
use crate::wait::{WaitKey, WaitQueue};

use self::set::SetId;

/// Index of a target in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(pub(crate) usize);

/// One counter observation: the probe's transmit time, the time the reply
/// arrived, and the fragment identifier it carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub target: TargetId,
    pub tx: Timestamp,
    pub rx: Timestamp,
    pub ipid: u32,
}

/// Stage-owned attachment of a target.
///
/// Which variant is live depends on the stage: Overlap attaches targets to
/// the time window they are probed in, Candidates and Ally attach them to
/// the alias-candidate cluster whose cursors reference them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StageRef {
    #[default]
    Unattached,
    Window(SetId),
    Cluster(SetId),
}

/// A candidate address and everything learnt about it.
#[derive(Debug)]
pub struct Target {
    addr: Ipv6Addr,
    samples: Vec<Sample>,
    /// Retries used within the current stage.
    pub attempt: u8,
    /// A probe drew replies, but none of them were fragmented.
    pub ptb: bool,
    pub stage_ref: StageRef,
    pub(crate) wait: Option<WaitKey>,
}

impl Target {
    fn new(addr: Ipv6Addr) -> Self {
        Self {
            addr,
            samples: Vec::new(),
            attempt: 0,
            ptb: false,
            stage_ref: StageRef::Unattached,
            wait: None,
        }
    }

    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }

    /// Samples in arrival order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    /// Counter value of the most recent sample, if any.
    pub fn last_ipid(&self) -> Option<u32> {
        self.samples.last().map(|s| s.ipid)
    }

    /// Reset per-stage state ahead of a new stage or a new set traversal.
    pub fn reset(&mut self, stage_ref: StageRef) {
        self.ptb = false;
        self.attempt = 0;
        self.stage_ref = stage_ref;
    }
}

/// Errors raised by registry bookkeeping. All of them mean the engine and
/// the daemon disagree about what is in flight.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("target {0} already has a probe outstanding")]
    Duplicate(Ipv6Addr),

    #[error("target id {0:?} does not exist")]
    Missing(TargetId),
}

/// Owns every target and indexes the ones awaiting a response by address.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    arena: Vec<Option<Target>>,
    active: BTreeMap<Ipv6Addr, TargetId>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a target for `addr`. The target is dormant until registered.
    pub fn insert(&mut self, addr: Ipv6Addr) -> TargetId {
        let id = TargetId(self.arena.len());
        self.arena.push(Some(Target::new(addr)));
        id
    }

    pub fn get(&self, id: TargetId) -> Option<&Target> {
        self.arena.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: TargetId) -> Option<&mut Target> {
        self.arena.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn addr(&self, id: TargetId) -> Option<Ipv6Addr> {
        self.get(id).map(Target::addr)
    }

    /// Mark `id` as awaiting a response.
    pub fn register(&mut self, id: TargetId) -> Result<(), RegistryError> {
        let addr = self.get(id).ok_or(RegistryError::Missing(id))?.addr;
        if self.active.contains_key(&addr) {
            return Err(RegistryError::Duplicate(addr));
        }
        self.active.insert(addr, id);
        Ok(())
    }

    /// Look up the target awaiting a response from `addr`.
    pub fn find(&self, addr: &Ipv6Addr) -> Option<TargetId> {
        self.active.get(addr).copied()
    }

    pub fn is_registered(&self, id: TargetId) -> bool {
        self.get(id)
            .map(|t| self.active.get(&t.addr) == Some(&id))
            .unwrap_or(false)
    }

    /// Remove `id` from the outstanding index, keeping its samples.
    pub fn release(&mut self, id: TargetId) {
        if let Some(addr) = self.addr(id) {
            if self.active.get(&addr) == Some(&id) {
                self.active.remove(&addr);
            }
        }
    }

    /// Drop a target entirely, detaching it from the outstanding index and
    /// the wait queue.
    pub fn destroy(&mut self, id: TargetId, waiting: &mut WaitQueue) {
        self.release(id);
        if let Some(slot) = self.arena.get_mut(id.0) {
            if let Some(target) = slot.take() {
                if let Some(key) = target.wait {
                    waiting.cancel(key);
                }
            }
        }
    }

    /// Append a sample to the target's history.
    pub fn push_sample(
        &mut self,
        id: TargetId,
        tx: Timestamp,
        rx: Timestamp,
        ipid: u32,
    ) -> Result<Sample, RegistryError> {
        let target = self.get_mut(id).ok_or(RegistryError::Missing(id))?;
        let sample = Sample {
            target: id,
            tx,
            rx,
            ipid,
        };
        target.samples.push(sample);
        Ok(sample)
    }

    /// Number of targets with a probe outstanding.
    pub fn count(&self) -> usize {
        self.active.len()
    }

    /// Number of live (not destroyed) targets.
    pub fn live(&self) -> usize {
        self.arena.iter().filter(|t| t.is_some()).count()
    }
}
