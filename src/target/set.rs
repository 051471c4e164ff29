use crate::clock::Timestamp;
use crate::wait::WaitKey;

use super::TargetId;

/// Index of a target set in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetId(pub(crate) usize);

/// A group of targets handled together: either a window of time-overlapping
/// samples (Overlap) or a cluster of alias candidates (Candidates, Ally).
#[derive(Debug, Default)]
pub struct TargetSet {
    pub targets: Vec<TargetId>,
    /// Overlap: index of the next member to probe.
    pub next: usize,
    /// Overlap: bounds of the Descend window the set was built from. They
    /// stay fixed while the window's members are re-probed, so collisions
    /// are judged on the samples that put the members together.
    pub min: Timestamp,
    pub max: Timestamp,
    /// Overlap: sets that collided with this one while it was active.
    pub blocked: Vec<SetId>,
    pub attempt: u8,
    /// Pair cursors: `s1` fixes the reference member, `s2` walks the rest.
    pub s1: Option<usize>,
    pub s2: Option<usize>,
    pub(crate) wait: Option<WaitKey>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets(targets: Vec<TargetId>) -> Self {
        Self {
            targets,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Member under the reference cursor.
    pub fn first(&self) -> Option<TargetId> {
        self.s1.and_then(|i| self.targets.get(i).copied())
    }

    /// Member under the inner cursor.
    pub fn second(&self) -> Option<TargetId> {
        self.s2.and_then(|i| self.targets.get(i).copied())
    }

    /// True if this window starts before `other` ends.
    pub fn collides_with(&self, other: &TargetSet) -> bool {
        self.min < other.max
    }
}

/// Arena of target sets. Ids are never reused.
#[derive(Debug, Default)]
pub struct SetArena {
    sets: Vec<Option<TargetSet>>,
}

impl SetArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, set: TargetSet) -> SetId {
        let id = SetId(self.sets.len());
        self.sets.push(Some(set));
        id
    }

    pub fn get(&self, id: SetId) -> Option<&TargetSet> {
        self.sets.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: SetId) -> Option<&mut TargetSet> {
        self.sets.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: SetId) -> Option<TargetSet> {
        self.sets.get_mut(id.0).and_then(Option::take)
    }

    /// Number of live sets.
    pub fn live(&self) -> usize {
        self.sets.iter().filter(|s| s.is_some()).count()
    }
}
