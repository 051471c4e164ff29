use std::net::Ipv6Addr;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::object::DealiasResult;
use crate::target::set::SetId;
use crate::target::{StageRef, TargetId};
use crate::wait::WaitPayload;

use super::{Pipeline, PipelineError, ProbeCommand};

impl Pipeline {
    /// Ally issues one dealias command per set at a time, for the pair under
    /// the set's cursors.
    pub(super) fn next_ally(&mut self, now: Instant) -> Result<Option<ProbeCommand>, PipelineError> {
        loop {
            let set_id = match self.waiting.pop_ready(now) {
                Some(WaitPayload::Set(set_id)) => {
                    if let Some(ts) = self.sets.get_mut(set_id) {
                        ts.wait = None;
                    }
                    set_id
                }
                Some(payload @ WaitPayload::Target(_)) => {
                    return Err(PipelineError::StrayWait {
                        payload,
                        stage: self.stage,
                    })
                }
                None => match self.select_ally() {
                    Some(set_id) => set_id,
                    None => return Ok(None),
                },
            };

            let ts = self.set(set_id)?;
            let (Some(t1), Some(t2)) = (ts.first(), ts.second()) else {
                self.free_set(set_id);
                continue;
            };
            let (a, b) = self.set_pair(set_id)?;

            self.targets.register(t1)?;
            if let Some(t) = self.targets.get_mut(t1) {
                t.reset(StageRef::Cluster(set_id));
            }
            debug!(set = ?set_id, t2 = ?t2, "ally pair");
            return Ok(Some(ProbeCommand::ally(
                WaitPayload::Set(set_id),
                a,
                b,
                &self.cfg.probe,
            )));
        }
    }

    /// Next queued set with at least one pair left to test.
    fn select_ally(&mut self) -> Option<SetId> {
        while let Some(set_id) = self.pending_sets.pop_front() {
            if self.next_pair(set_id) {
                return Some(set_id);
            }
            self.free_set(set_id);
        }
        None
    }

    /// Move a set's cursors to its next pair that is not in the skip list
    /// and still passes the pairwise test. Returns false once the set has no
    /// pairs left.
    fn next_pair(&mut self, set_id: SetId) -> bool {
        let Some(ts) = self.sets.get(set_id) else {
            return false;
        };
        let n = ts.len();
        let mut cursor = match (ts.s1, ts.s2) {
            (Some(i), Some(j)) => next_pair_index(i, j, n),
            _ if n >= 2 => Some((0, 1)),
            _ => None,
        };

        while let Some((i, j)) = cursor {
            if let (Some(&a), Some(&b)) = (ts.targets.get(i), ts.targets.get(j)) {
                if self.pair_wanted(a, b) {
                    break;
                }
            }
            cursor = next_pair_index(i, j, n);
        }

        let Some(ts) = self.sets.get_mut(set_id) else {
            return false;
        };
        ts.s1 = cursor.map(|(i, _)| i);
        ts.s2 = cursor.map(|(_, j)| j);
        ts.attempt = 0;
        cursor.is_some()
    }

    fn pair_wanted(&self, a: TargetId, b: TargetId) -> bool {
        let (Some(aa), Some(ba)) = (self.targets.addr(a), self.targets.addr(b)) else {
            return false;
        };
        if self.skip.contains(aa, ba) {
            debug!(a = %aa, b = %ba, "skipping known pair");
            return false;
        }
        self.pairwise_ids(a, b)
    }

    /// Ally: record the daemon's verdict on the pair `a`, `b` and move the
    /// set on. An inconclusive verdict retries the same pair until the
    /// attempt cap.
    pub(super) fn reply_ally(
        &mut self,
        now: Instant,
        id: TargetId,
        a: Ipv6Addr,
        b: Ipv6Addr,
        result: DealiasResult,
    ) -> Result<(), PipelineError> {
        let StageRef::Cluster(set_id) = self.target(id)?.stage_ref else {
            return Err(PipelineError::Unowned(a));
        };

        let more = match result {
            DealiasResult::None => {
                let max = self.cfg.max_attempts;
                let ts = self.set_mut(set_id)?;
                if ts.attempt >= max {
                    self.next_pair(set_id)
                } else {
                    ts.attempt += 1;
                    self.metrics.retry(self.stage);
                    true
                }
            }
            DealiasResult::Aliases => {
                info!(%a, %b, "aliases");
                self.metrics.aliases_confirmed.inc();
                self.confirmed.push((a, b));
                self.next_pair(set_id)
            }
            _ => self.next_pair(set_id),
        };

        if more {
            self.schedule_set(set_id, now + self.cfg.retry_delay);
        } else {
            self.free_set(set_id);
        }
        Ok(())
    }
}

/// Cursor of a set's pair walk. `s1` and `s2` index the set's members;
/// pairs are visited in (0, 1), (0, 2), .., (1, 2), .. order.
fn next_pair_index(i: usize, j: usize, n: usize) -> Option<(usize, usize)> {
    if j + 1 < n {
        Some((i, j + 1))
    } else if i + 2 < n {
        Some((i + 1, i + 2))
    } else {
        None
    }
}
