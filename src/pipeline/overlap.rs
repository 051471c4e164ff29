use tokio::time::Instant;
use tracing::debug;

use crate::object::CounterReadout;
use crate::target::{StageRef, TargetId};

use super::{Pipeline, PipelineError, Stage};

impl Pipeline {
    /// Start the next overlap window that does not collide with an active
    /// one. Colliding windows are parked on the window they collide with
    /// and come back when it completes.
    pub(super) fn select_overlap(&mut self) -> Option<TargetId> {
        while let Some(set_id) = self.pending_sets.pop_front() {
            let Some(ts) = self.sets.get(set_id) else {
                continue;
            };
            let blocker = self
                .overlap_active
                .iter()
                .copied()
                .find(|&active| self.sets.get(active).is_some_and(|tt| ts.collides_with(tt)));
            if let Some(active) = blocker {
                debug!(window = ?set_id, blocked_by = ?active, "overlap window blocked");
                if let Some(tt) = self.sets.get_mut(active) {
                    tt.blocked.push(set_id);
                }
                continue;
            }

            let mut members = match self.sets.get_mut(set_id) {
                Some(ts) => std::mem::take(&mut ts.targets),
                None => continue,
            };
            if members.is_empty() {
                self.free_set(set_id);
                continue;
            }
            Self::sort_by_counter(&self.targets, &mut members);
            let first = members[0];
            if let Some(ts) = self.sets.get_mut(set_id) {
                ts.targets = members;
                ts.next = 1;
            }
            self.overlap_active.push(set_id);
            if let Some(t) = self.targets.get_mut(first) {
                t.reset(StageRef::Window(set_id));
            }
            return Some(first);
        }
        None
    }

    /// Overlap: probe window members one after another, spaced by the
    /// retry delay, so their samples no longer share a time window.
    pub(super) fn reply_overlap(
        &mut self,
        now: Instant,
        id: TargetId,
        readout: &CounterReadout,
    ) -> Result<(), PipelineError> {
        if readout.samples.is_empty() && self.retry_empty(now, id, readout) {
            return Ok(());
        }
        self.push_first_sample(id, readout)?;

        let target = self.target(id)?;
        let StageRef::Window(set_id) = target.stage_ref else {
            return Err(PipelineError::Unowned(target.addr()));
        };

        let ts = self.set_mut(set_id)?;
        if let Some(&next) = ts.targets.get(ts.next) {
            ts.next += 1;
            if let Some(t) = self.targets.get_mut(next) {
                t.reset(StageRef::Window(set_id));
            }
            self.schedule_target(next, now + self.cfg.retry_delay);
            return Ok(());
        }

        let blocked = std::mem::take(&mut ts.blocked);
        self.overlap_active.retain(|&s| s != set_id);
        self.free_set(set_id);
        if !blocked.is_empty() {
            self.pending_sets.extend(blocked);
            let sets = &self.sets;
            self.pending_sets
                .make_contiguous()
                .sort_by_key(|&s| sets.get(s).map(|ts| ts.min));
        }
        Ok(())
    }

    pub(super) fn finish_overlap(&mut self) {
        self.set_stage(Stage::Descend2);
        let sampled: Vec<TargetId> = self
            .incr
            .iter()
            .copied()
            .filter(|&id| self.targets.get(id).is_some_and(|t| t.last().is_some()))
            .collect();
        for &id in &self.incr {
            if let Some(t) = self.targets.get_mut(id) {
                t.reset(StageRef::Unattached);
            }
        }
        self.requeue_targets(sampled);
    }
}
