use tokio::time::Instant;
use tracing::{debug, info};

use crate::cluster::ClusterManager;
use crate::object::CounterReadout;
use crate::sequence::pairwise;
use crate::target::set::TargetSet;
use crate::target::{StageRef, TargetId};

use super::{Pipeline, PipelineError, Stage};

impl Pipeline {
    /// Pairwise-test every pair of `ids` and group them into clusters of
    /// likely aliases. Targets without samples, and targets that match no
    /// other, are left out.
    pub(super) fn pairwise_all(&self, ids: &[TargetId]) -> Vec<Vec<TargetId>> {
        let sampled: Vec<TargetId> = ids
            .iter()
            .copied()
            .filter(|&id| self.targets.get(id).is_some_and(|t| t.last().is_some()))
            .collect();

        let mut clusters = ClusterManager::new();
        for (i, &a) in sampled.iter().enumerate() {
            for &b in &sampled[i + 1..] {
                if !self.pairwise_ids(a, b) {
                    continue;
                }
                if let (Some(ta), Some(tb)) = (self.targets.addr(a), self.targets.addr(b)) {
                    debug!(a = %ta, b = %tb, "likely aliases");
                }
                self.metrics.likely_aliases.inc();
                clusters.merge(a, b);
            }
        }
        clusters.into_clusters()
    }

    /// Run the pairwise sequence test over two targets' full histories.
    pub(super) fn pairwise_ids(&self, a: TargetId, b: TargetId) -> bool {
        match (self.targets.get(a), self.targets.get(b)) {
            (Some(ta), Some(tb)) => pairwise(ta.samples(), tb.samples(), self.cfg.fudge),
            _ => false,
        }
    }

    /// Largest sets first. Ties keep their order.
    pub(super) fn sort_sets_by_size(&mut self) {
        let sets = &self.sets;
        self.pending_sets
            .make_contiguous()
            .sort_by_key(|&s| std::cmp::Reverse(sets.get(s).map_or(0, TargetSet::len)));
    }

    /// Start walking the next large cluster, from its lowest counter.
    pub(super) fn select_candidates(&mut self) -> Option<TargetId> {
        while let Some(set_id) = self.pending_sets.pop_front() {
            let mut members = match self.sets.get_mut(set_id) {
                Some(ts) if ts.len() >= 2 => std::mem::take(&mut ts.targets),
                _ => {
                    self.free_set(set_id);
                    continue;
                }
            };
            Self::sort_by_counter(&self.targets, &mut members);
            let first = members[0];
            if let Some(ts) = self.sets.get_mut(set_id) {
                ts.targets = members;
                ts.s1 = Some(0);
                ts.s2 = None;
            }
            if let Some(t) = self.targets.get_mut(first) {
                t.reset(StageRef::Cluster(set_id));
            }
            return Some(first);
        }
        None
    }

    /// Candidates: walk a large cluster pair by pair, collecting fresh
    /// samples that let the pairwise test split apart non-aliases.
    ///
    /// `s1` fixes a reference member and `s2` searches the members after it
    /// for one that still matches. A matching member is probed, then the
    /// reference is probed again while the pair holds. When the search runs
    /// out the reference moves on; when it reaches the second-last member
    /// the walk is over.
    pub(super) fn reply_candidates(
        &mut self,
        now: Instant,
        id: TargetId,
        readout: &CounterReadout,
    ) -> Result<(), PipelineError> {
        if readout.samples.is_empty() && self.retry_empty(now, id, readout) {
            return Ok(());
        }
        let sampled = self.push_first_sample(id, readout)?.is_some();

        let target = self.target(id)?;
        let StageRef::Cluster(set_id) = target.stage_ref else {
            return Err(PipelineError::Unowned(target.addr()));
        };

        let ts = self.set(set_id)?;
        let (Some(s1), Some(t1)) = (ts.s1, ts.first()) else {
            return Err(PipelineError::Unowned(target.addr()));
        };
        let t2 = ts.second();

        let mut next = None;
        if t2 == Some(id) && sampled && self.pairwise_ids(t1, id) {
            next = Some(t1);
        } else {
            let from = ts.s2.map_or(s1 + 1, |s2| s2 + 1);
            let found = (from..ts.len())
                .find(|&j| ts.targets.get(j).is_some_and(|&t| self.pairwise_ids(t1, t)));
            let len = ts.len();
            let ts = self.set_mut(set_id)?;
            match found {
                Some(j) => {
                    ts.s2 = Some(j);
                    next = ts.targets.get(j).copied();
                }
                None => {
                    ts.s2 = None;
                    let n1 = s1 + 1;
                    if n1 + 1 >= len {
                        ts.s1 = None;
                    } else {
                        ts.s1 = Some(n1);
                        next = ts.targets.get(n1).copied();
                    }
                }
            }
        }

        match next {
            Some(next) => {
                if let Some(t) = self.targets.get_mut(next) {
                    t.reset(StageRef::Cluster(set_id));
                }
                self.schedule_target(next, now + self.cfg.retry_delay);
            }
            None => self.candidates.push(set_id),
        }
        Ok(())
    }

    /// Re-split the walked clusters with their fresh samples and queue the
    /// result for Ally, largest first.
    pub(super) fn finish_candidates(&mut self) {
        self.set_stage(Stage::Ally);

        let threshold = self.cfg.candidate_split_threshold;
        for set_id in std::mem::take(&mut self.candidates) {
            let Some(ts) = self.sets.get_mut(set_id) else {
                continue;
            };
            if ts.len() <= threshold {
                ts.s1 = None;
                ts.s2 = None;
                ts.attempt = 0;
                self.pending_sets.push_back(set_id);
                continue;
            }
            let members = std::mem::take(&mut ts.targets);
            self.free_set(set_id);
            for split in self.pairwise_all(&members) {
                let split_id = self.sets.insert(TargetSet::with_targets(split));
                self.pending_sets.push_back(split_id);
            }
        }
        self.sort_sets_by_size();

        for (n, &set_id) in self.pending_sets.iter().enumerate() {
            let Some(ts) = self.sets.get(set_id) else {
                continue;
            };
            let members: Vec<String> = ts
                .targets
                .iter()
                .filter_map(|&t| self.targets.addr(t))
                .map(|a| a.to_string())
                .collect();
            info!(set = n, size = ts.len(), members = %members.join(" "), "alias candidates");
        }
    }
}
