//! The six-stage alias resolution pipeline.
//!
//! [`Pipeline`] owns every piece of run state: the target registry, target
//! sets, the wait queue, per-stage work lists and the skip pairs. The engine
//! asks it for the next command when the daemon grants credit, and feeds it
//! every decoded object. Stage handlers live in the submodules, one per
//! stage family.

mod ally;
mod candidates;
pub mod classify;
pub mod command;
mod descend;
mod overlap;

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cluster::skip::SkipPairs;
use crate::config::Config;
use crate::export::RunMetrics;
use crate::object::{CounterReadout, DealiasResult, Object};
use crate::target::set::{SetArena, SetId, TargetSet};
use crate::target::{RegistryError, Sample, StageRef, Target, TargetId, TargetRegistry};
use crate::wait::{WaitPayload, WaitQueue};

pub use self::command::ProbeCommand;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Classify,
    Descend,
    Overlap,
    Descend2,
    Candidates,
    Ally,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Classify,
        Stage::Descend,
        Stage::Overlap,
        Stage::Descend2,
        Stage::Candidates,
        Stage::Ally,
    ];

    /// Stage index, also carried as the userid of every command.
    pub const fn index(self) -> u32 {
        match self {
            Self::Classify => 0,
            Self::Descend => 1,
            Self::Overlap => 2,
            Self::Descend2 => 3,
            Self::Candidates => 4,
            Self::Ally => 5,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Descend => "descend",
            Self::Overlap => "overlap",
            Self::Descend2 => "descend2",
            Self::Candidates => "candidates",
            Self::Ally => "ally",
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown stage '{0}'")]
pub struct UnknownStage(String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

/// Errors that mean the engine and the daemon no longer agree on what is in
/// flight. All of them are fatal to the run.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("reply for {0} which has no probe outstanding")]
    UnknownReply(Ipv6Addr),

    #[error("reply for {0} which belongs to no target set")]
    Unowned(Ipv6Addr),

    #[error("target set {0:?} does not exist")]
    MissingSet(SetId),

    #[error("wait entry {payload:?} does not belong to the {stage} stage")]
    StrayWait { payload: WaitPayload, stage: Stage },

    #[error("{kind} result received during {stage} stage")]
    UnexpectedObject { kind: &'static str, stage: Stage },
}

/// Run state of the pipeline.
pub struct Pipeline {
    cfg: Config,
    stop: Option<Stage>,
    stage: Stage,
    targets: TargetRegistry,
    sets: SetArena,
    waiting: WaitQueue,
    /// Classify, Descend, Descend2: targets not yet probed.
    pending_targets: VecDeque<TargetId>,
    /// Overlap, Candidates, Ally: sets not yet started.
    pending_sets: VecDeque<SetId>,
    /// Targets whose counter increments.
    incr: Vec<TargetId>,
    /// Fresh Descend samples awaiting grouping into windows.
    descend: Vec<Sample>,
    /// Overlap windows being probed.
    overlap_active: Vec<SetId>,
    /// Candidates: clusters whose traversal finished.
    candidates: Vec<SetId>,
    skip: SkipPairs,
    confirmed: Vec<(Ipv6Addr, Ipv6Addr)>,
    metrics: Arc<RunMetrics>,
}

impl Pipeline {
    pub fn new(cfg: Config, metrics: Arc<RunMetrics>) -> Self {
        metrics.set_stage(Stage::Classify);
        Self {
            cfg,
            stop: None,
            stage: Stage::Classify,
            targets: TargetRegistry::new(),
            sets: SetArena::new(),
            waiting: WaitQueue::new(),
            pending_targets: VecDeque::new(),
            pending_sets: VecDeque::new(),
            incr: Vec::new(),
            descend: Vec::new(),
            overlap_active: Vec::new(),
            candidates: Vec::new(),
            skip: SkipPairs::new(),
            confirmed: Vec::new(),
            metrics,
        }
    }

    /// Halt after `stage` completes: later stages are never entered.
    pub fn with_stop(mut self, stop: Option<Stage>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_skip_pairs(mut self, skip: SkipPairs) -> Self {
        self.skip = skip;
        self
    }

    /// Queue `addrs` for probing in the given order. When
    /// `assume_incrementing` is set, Classify is skipped and every address
    /// starts at Descend.
    pub fn load(&mut self, addrs: impl IntoIterator<Item = Ipv6Addr>, assume_incrementing: bool) {
        for addr in addrs {
            let id = self.targets.insert(addr);
            self.pending_targets.push_back(id);
            if assume_incrementing {
                self.incr.push(id);
            }
        }
        if assume_incrementing {
            self.set_stage(Stage::Descend);
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    /// Targets whose counter was classified as incrementing.
    pub fn incrementing(&self) -> &[TargetId] {
        &self.incr
    }

    /// Pairs confirmed as aliases so far.
    pub fn confirmed(&self) -> &[(Ipv6Addr, Ipv6Addr)] {
        &self.confirmed
    }

    /// Earliest deferred probe.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.waiting.next_deadline()
    }

    /// Nothing outstanding, pending or deferred in the current stage.
    pub fn is_idle(&self) -> bool {
        self.targets.count() == 0
            && self.pending_targets.is_empty()
            && self.pending_sets.is_empty()
            && self.waiting.is_empty()
    }

    /// The run is over: the current stage is idle and no later stage may run.
    pub fn is_done(&self) -> bool {
        self.is_idle() && self.stage.next().map_or(true, |s| !self.stage_allowed(s))
    }

    fn stage_allowed(&self, stage: Stage) -> bool {
        self.stop.map_or(true, |stop| stage <= stop)
    }

    fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.metrics.set_stage(stage);
    }

    /// Pick the next command to issue, if the current stage has one ready.
    /// Deferred probes whose deadline passed go first.
    pub fn next_command(&mut self, now: Instant) -> Result<Option<ProbeCommand>, PipelineError> {
        let cmd = if self.stage == Stage::Ally {
            self.next_ally(now)?
        } else {
            self.next_ping(now)?
        };
        if let Some(cmd) = &cmd {
            self.metrics.command_issued(cmd.stage);
            debug!(
                stage = %cmd.stage,
                outstanding = self.targets.count(),
                waiting = self.waiting.len(),
                pending = self.pending_targets.len() + self.pending_sets.len(),
                command = %cmd,
                "issuing command"
            );
        }
        Ok(cmd)
    }

    fn next_ping(&mut self, now: Instant) -> Result<Option<ProbeCommand>, PipelineError> {
        let id = match self.waiting.pop_ready(now) {
            Some(WaitPayload::Target(id)) => {
                if let Some(t) = self.targets.get_mut(id) {
                    t.wait = None;
                }
                id
            }
            Some(payload @ WaitPayload::Set(_)) => {
                return Err(PipelineError::StrayWait {
                    payload,
                    stage: self.stage,
                })
            }
            None => {
                let selected = match self.stage {
                    Stage::Classify | Stage::Descend | Stage::Descend2 => {
                        self.pending_targets.pop_front()
                    }
                    Stage::Overlap => self.select_overlap(),
                    Stage::Candidates => self.select_candidates(),
                    Stage::Ally => None,
                };
                match selected {
                    Some(id) => id,
                    None => return Ok(None),
                }
            }
        };

        self.targets.register(id)?;
        let target = self.target(id)?;
        Ok(Some(ProbeCommand::ping(
            self.stage,
            WaitPayload::Target(id),
            target.addr(),
            target.attempt == 0,
            &self.cfg.probe,
        )))
    }

    /// Feed a decoded object to the current stage.
    pub fn on_object(&mut self, now: Instant, obj: &Object) -> Result<(), PipelineError> {
        match obj {
            Object::Ping(ping) => {
                if self.stage == Stage::Ally {
                    return Err(PipelineError::UnexpectedObject {
                        kind: "ping",
                        stage: self.stage,
                    });
                }
                let id = self
                    .targets
                    .find(&ping.dst)
                    .ok_or(PipelineError::UnknownReply(ping.dst))?;
                self.targets.release(id);
                self.on_ping_reply(now, id, ping.read_counters())?;
            }
            Object::Dealias(dealias) => {
                if self.stage != Stage::Ally {
                    return Err(PipelineError::UnexpectedObject {
                        kind: "dealias",
                        stage: self.stage,
                    });
                }
                let id = self
                    .targets
                    .find(&dealias.a)
                    .ok_or(PipelineError::UnknownReply(dealias.a))?;
                self.targets.release(id);
                self.metrics
                    .ally_results
                    .with_label_values(&[dealias.result.as_str()])
                    .inc();
                info!(a = %dealias.a, b = %dealias.b, result = dealias.result.as_str(), "ally verdict");
                self.reply_ally(now, id, dealias.a, dealias.b, dealias.result)?;
            }
        }
        self.advance();
        Ok(())
    }

    /// The daemon refused the command issued for `payload`. The payload is
    /// released and retried immediately while it has attempts left; after
    /// that it is treated as an empty result.
    pub fn on_rejected(&mut self, now: Instant, payload: WaitPayload) -> Result<(), PipelineError> {
        self.metrics.commands_rejected.inc();
        match payload {
            WaitPayload::Target(id) => {
                self.targets.release(id);
                let max = self.cfg.max_attempts;
                let target = self.target_mut(id)?;
                if target.attempt < max {
                    target.attempt += 1;
                    self.metrics.retry(self.stage);
                    self.schedule_target(id, now);
                } else {
                    self.on_ping_reply(now, id, CounterReadout::default())?;
                }
            }
            WaitPayload::Set(set) => {
                let (a, b) = self.set_pair(set)?;
                let first = self.set(set)?.first();
                if let Some(id) = first {
                    self.targets.release(id);
                }
                let max = self.cfg.max_attempts;
                let ts = self.set_mut(set)?;
                if ts.attempt < max {
                    ts.attempt += 1;
                    self.metrics.retry(self.stage);
                    self.schedule_set(set, now);
                } else if let Some(id) = first {
                    self.reply_ally(now, id, a, b, DealiasResult::None)?;
                }
            }
        }
        self.advance();
        Ok(())
    }

    fn on_ping_reply(
        &mut self,
        now: Instant,
        id: TargetId,
        readout: CounterReadout,
    ) -> Result<(), PipelineError> {
        match self.stage {
            Stage::Classify => self.reply_classify(id, &readout),
            Stage::Descend => self.reply_descend(now, id, &readout),
            Stage::Overlap => self.reply_overlap(now, id, &readout),
            Stage::Descend2 => self.reply_descend2(now, id, &readout),
            Stage::Candidates => self.reply_candidates(now, id, &readout),
            Stage::Ally => Err(PipelineError::UnexpectedObject {
                kind: "ping",
                stage: self.stage,
            }),
        }
    }

    /// Move through stage boundaries for as long as the current stage is
    /// idle and the next one is allowed.
    pub fn advance(&mut self) {
        while self.is_idle() {
            let Some(next) = self.stage.next() else {
                break;
            };
            if !self.stage_allowed(next) {
                break;
            }
            let from = self.stage;
            match from {
                Stage::Classify => self.finish_classify(),
                Stage::Descend => self.finish_descend(),
                Stage::Overlap => self.finish_overlap(),
                Stage::Descend2 => self.finish_descend2(),
                Stage::Candidates => self.finish_candidates(),
                Stage::Ally => break,
            }
            info!(
                from = %from,
                to = %self.stage,
                targets = self.incr.len(),
                pending = self.pending_targets.len() + self.pending_sets.len(),
                "stage complete"
            );
        }
    }

    // --- Shared helpers ---

    fn target(&self, id: TargetId) -> Result<&Target, PipelineError> {
        self.targets
            .get(id)
            .ok_or(PipelineError::Registry(RegistryError::Missing(id)))
    }

    fn target_mut(&mut self, id: TargetId) -> Result<&mut Target, PipelineError> {
        self.targets
            .get_mut(id)
            .ok_or(PipelineError::Registry(RegistryError::Missing(id)))
    }

    fn set(&self, id: SetId) -> Result<&TargetSet, PipelineError> {
        self.sets.get(id).ok_or(PipelineError::MissingSet(id))
    }

    fn set_mut(&mut self, id: SetId) -> Result<&mut TargetSet, PipelineError> {
        self.sets.get_mut(id).ok_or(PipelineError::MissingSet(id))
    }

    /// Addresses under a set's two cursors.
    fn set_pair(&self, id: SetId) -> Result<(Ipv6Addr, Ipv6Addr), PipelineError> {
        let ts = self.set(id)?;
        let addr = |t: Option<TargetId>| {
            t.and_then(|t| self.targets.addr(t))
                .unwrap_or(Ipv6Addr::UNSPECIFIED)
        };
        Ok((addr(ts.first()), addr(ts.second())))
    }

    fn schedule_target(&mut self, id: TargetId, deadline: Instant) {
        let key = self.waiting.schedule(deadline, WaitPayload::Target(id));
        if let Some(t) = self.targets.get_mut(id) {
            t.wait = Some(key);
        }
    }

    fn schedule_set(&mut self, id: SetId, deadline: Instant) {
        let key = self.waiting.schedule(deadline, WaitPayload::Set(id));
        if let Some(ts) = self.sets.get_mut(id) {
            ts.wait = Some(key);
        }
    }

    fn free_set(&mut self, id: SetId) {
        if let Some(ts) = self.sets.remove(id) {
            if let Some(key) = ts.wait {
                self.waiting.cancel(key);
            }
        }
    }

    /// Handle an empty reply in the stages that retry: reschedule after the
    /// retry delay while attempts remain. Returns true if rescheduled.
    fn retry_empty(&mut self, now: Instant, id: TargetId, readout: &CounterReadout) -> bool {
        let max = self.cfg.max_attempts;
        let Some(target) = self.targets.get_mut(id) else {
            return false;
        };
        if target.attempt >= max {
            debug!(addr = %target.addr(), stage = %self.stage, "giving up on target");
            return false;
        }
        if readout.responses > 0 {
            target.ptb = true;
        }
        target.attempt += 1;
        self.metrics.retry(self.stage);
        self.schedule_target(id, now + self.cfg.retry_delay);
        true
    }

    /// Record the first counter sample of a readout.
    fn push_first_sample(
        &mut self,
        id: TargetId,
        readout: &CounterReadout,
    ) -> Result<Option<Sample>, PipelineError> {
        match readout.samples.first() {
            Some(s) => Ok(Some(self.targets.push_sample(id, s.tx, s.rx, s.ipid)?)),
            None => Ok(None),
        }
    }

    /// Order targets by their most recent counter value, lowest first.
    fn sort_by_counter(targets: &TargetRegistry, ids: &mut [TargetId]) {
        ids.sort_by_key(|id| targets.get(*id).and_then(Target::last_ipid).unwrap_or(0));
    }

    /// Reset `ids` for a new stage and queue them, lowest counter first.
    fn requeue_targets(&mut self, ids: Vec<TargetId>) {
        for &id in &ids {
            if let Some(t) = self.targets.get_mut(id) {
                t.reset(StageRef::Unattached);
            }
        }
        self.pending_targets.extend(ids);
        Self::sort_by_counter(&self.targets, self.pending_targets.make_contiguous());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
pub(crate) mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::Timestamp;
    use crate::object::{
        DealiasObject, PingObject, PingReply, ICMP6_ECHO_REPLY, REPLY_FLAG_IPID,
    };

    pub(crate) fn addr(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n)
    }

    pub(crate) fn test_config() -> Config {
        Config {
            shuffle: false,
            ..Config::default()
        }
    }

    pub(crate) fn pipeline(addrs: &[Ipv6Addr]) -> Pipeline {
        let mut p = Pipeline::new(test_config(), Arc::new(RunMetrics::new().unwrap()));
        p.load(addrs.iter().copied(), false);
        p
    }

    /// Ping to `dst` whose replies carry `(tx µs, ipid)`, all echo replies
    /// with a fragment identifier. Each reply takes 100µs.
    pub(crate) fn ping(dst: Ipv6Addr, stage: Stage, replies: &[(u64, u32)]) -> Object {
        Object::Ping(PingObject {
            userid: stage.index(),
            start: Timestamp::from_micros(replies.first().map_or(0, |r| r.0)),
            src: addr(0xffff),
            dst,
            probe_size: 1300,
            ping_sent: replies.len() as u16,
            replies: replies
                .iter()
                .enumerate()
                .map(|(i, &(tx, ipid))| PingReply {
                    probe_id: i as u16,
                    flags: REPLY_FLAG_IPID,
                    icmp_type: ICMP6_ECHO_REPLY,
                    icmp_code: 0,
                    reply_ttl: 60,
                    reply_size: 1280,
                    tx: Timestamp::from_micros(tx),
                    rtt: Duration::from_micros(100),
                    reply_ipid: ipid,
                })
                .collect(),
        })
    }

    /// Ping to `dst` with `sent` probes and no replies.
    pub(crate) fn silent_ping(dst: Ipv6Addr, stage: Stage, sent: u16) -> Object {
        Object::Ping(PingObject {
            userid: stage.index(),
            start: Timestamp::ZERO,
            src: addr(0xffff),
            dst,
            probe_size: 1300,
            ping_sent: sent,
            replies: Vec::new(),
        })
    }

    pub(crate) fn dealias(a: Ipv6Addr, b: Ipv6Addr, result: DealiasResult) -> Object {
        Object::Dealias(DealiasObject {
            userid: Stage::Ally.index(),
            start: Timestamp::ZERO,
            method: crate::object::DEALIAS_METHOD_ALLY,
            result,
            probec: 6,
            a,
            b,
        })
    }

    pub(crate) fn cmd_addr(cmd: &ProbeCommand) -> Ipv6Addr {
        cmd.line().rsplit(' ').next().unwrap().parse().unwrap()
    }

    #[test]
    fn test_stage_names_and_order() {
        assert_eq!("Overlap".parse::<Stage>().unwrap(), Stage::Overlap);
        assert_eq!("DESCEND2".parse::<Stage>().unwrap(), Stage::Descend2);
        assert!("bogus".parse::<Stage>().is_err());
        assert!(Stage::Classify < Stage::Ally);
        assert_eq!(Stage::Candidates.next(), Some(Stage::Ally));
        assert_eq!(Stage::Ally.next(), None);
        assert_eq!(Stage::from_index(3), Some(Stage::Descend2));
        assert_eq!(Stage::Ally.to_string(), "ally");
    }

    #[test]
    fn test_reply_for_unknown_target_is_fatal() {
        let mut p = pipeline(&[addr(1)]);
        let now = Instant::now();
        let err = p
            .on_object(now, &ping(addr(2), Stage::Classify, &[(0, 1)]))
            .unwrap_err();
        assert_eq!(err, PipelineError::UnknownReply(addr(2)));
    }

    #[test]
    fn test_dealias_outside_ally_is_fatal() {
        let mut p = pipeline(&[addr(1)]);
        let now = Instant::now();
        p.next_command(now).unwrap().unwrap();
        let err = p
            .on_object(now, &dealias(addr(1), addr(2), DealiasResult::Aliases))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnexpectedObject { .. }));
    }

    #[test]
    fn test_rejection_requeues_immediately() {
        let mut p = pipeline(&[addr(1)]);
        let now = Instant::now();
        let cmd = p.next_command(now).unwrap().unwrap();
        assert_eq!(p.targets().count(), 1);

        p.on_rejected(now, cmd.payload).unwrap();
        assert_eq!(p.targets().count(), 0);
        assert!(!p.is_idle());

        let again = p.next_command(now).unwrap().unwrap();
        assert_eq!(cmd_addr(&again), addr(1));
    }

    #[test]
    fn test_rejection_past_attempt_cap_is_empty_result() {
        let mut p = pipeline(&[addr(1)]);
        let now = Instant::now();
        for _ in 0..2 {
            let cmd = p.next_command(now).unwrap().unwrap();
            p.on_rejected(now, cmd.payload).unwrap();
        }
        let cmd = p.next_command(now).unwrap().unwrap();
        p.on_rejected(now, cmd.payload).unwrap();

        // classify treats the empty result as unresponsive
        assert_eq!(p.targets().live(), 0);
        assert!(p.is_done());
    }

    #[test]
    fn test_empty_input_finishes_immediately() {
        let p = pipeline(&[]);
        assert!(p.is_idle());
        assert!(!p.is_done());
        let mut p = p;
        p.advance();
        assert!(p.is_done());
        assert_eq!(p.stage(), Stage::Ally);
    }

    #[test]
    fn test_stop_stage_halts_progression() {
        let mut p = pipeline(&[]).with_stop(Some(Stage::Descend));
        p.advance();
        assert_eq!(p.stage(), Stage::Descend);
        assert!(p.is_done());
    }

    #[test]
    fn test_assume_incrementing_starts_at_descend() {
        let mut p = Pipeline::new(test_config(), Arc::new(RunMetrics::new().unwrap()));
        p.load([addr(1), addr(2)], true);
        assert_eq!(p.stage(), Stage::Descend);
        assert_eq!(p.incrementing().len(), 2);

        let cmd = p.next_command(Instant::now()).unwrap().unwrap();
        assert!(cmd.line().starts_with("ping -O dl -U 1 -c 2"));
    }
}
