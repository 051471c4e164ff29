use tokio::time::Instant;
use tracing::debug;

use crate::clock::Timestamp;
use crate::object::CounterReadout;
use crate::target::set::{SetId, TargetSet};
use crate::target::TargetId;

use super::{Pipeline, PipelineError, Stage};

impl Pipeline {
    /// Descend: one fresh, precisely timed sample per incrementing target.
    pub(super) fn reply_descend(
        &mut self,
        now: Instant,
        id: TargetId,
        readout: &CounterReadout,
    ) -> Result<(), PipelineError> {
        if readout.samples.is_empty() {
            self.retry_empty(now, id, readout);
            return Ok(());
        }
        if let Some(sample) = self.push_first_sample(id, readout)? {
            self.descend.push(sample);
        }
        Ok(())
    }

    /// Group the Descend samples into windows of overlapping probe time.
    ///
    /// Samples are taken in transmit order. A sample joins the current
    /// window if it was sent before the reply that opened the window came
    /// back; otherwise it opens a new one.
    pub(super) fn finish_descend(&mut self) {
        self.set_stage(Stage::Overlap);

        let mut samples = std::mem::take(&mut self.descend);
        samples.sort_by_key(|s| s.tx);

        let mut current: Option<(SetId, Timestamp)> = None;
        for sample in samples {
            match current {
                Some((set_id, opened_rx)) if sample.tx < opened_rx => {
                    if let Some(ts) = self.sets.get_mut(set_id) {
                        ts.max = ts.max.max(sample.rx);
                        ts.targets.push(sample.target);
                    }
                }
                _ => {
                    let ts = TargetSet {
                        min: sample.tx,
                        max: sample.rx,
                        ..TargetSet::with_targets(vec![sample.target])
                    };
                    let set_id = self.sets.insert(ts);
                    self.pending_sets.push_back(set_id);
                    current = Some((set_id, sample.rx));
                }
            }
        }

        for &set_id in &self.pending_sets {
            if let Some(ts) = self.sets.get(set_id) {
                let members: Vec<String> = ts
                    .targets
                    .iter()
                    .filter_map(|&t| self.targets.get(t))
                    .map(|t| format!("{}:{:08x}", t.addr(), t.last_ipid().unwrap_or(0)))
                    .collect();
                debug!(
                    min = %ts.min,
                    max = %ts.max,
                    members = %members.join(" "),
                    "overlap window"
                );
            }
        }
    }

    /// Descend2: refresh timing of every target that produced a Descend
    /// sample before pairwise testing.
    pub(super) fn reply_descend2(
        &mut self,
        now: Instant,
        id: TargetId,
        readout: &CounterReadout,
    ) -> Result<(), PipelineError> {
        if readout.samples.is_empty() && self.retry_empty(now, id, readout) {
            return Ok(());
        }
        self.push_first_sample(id, readout)?;
        Ok(())
    }

    /// Cluster the survivors by pairwise testing. Small clusters go straight
    /// to Ally; larger ones are walked pair by pair in Candidates first.
    pub(super) fn finish_descend2(&mut self) {
        self.set_stage(Stage::Candidates);

        let incr = self.incr.clone();
        let threshold = self.cfg.candidate_split_threshold;
        for members in self.pairwise_all(&incr) {
            let large = members.len() > threshold;
            let set_id = self.sets.insert(TargetSet::with_targets(members));
            if large {
                self.pending_sets.push_back(set_id);
            } else {
                self.candidates.push(set_id);
            }
        }

        if self.pending_sets.is_empty() {
            if self.stage_allowed(Stage::Ally) {
                self.set_stage(Stage::Ally);
                self.pending_sets.extend(self.candidates.drain(..));
            }
        } else {
            self.sort_sets_by_size();
        }
    }
}
