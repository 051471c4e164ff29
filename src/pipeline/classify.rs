use tracing::info;

use crate::object::CounterReadout;
use crate::sequence::monotonic;
use crate::target::TargetId;

use super::{Pipeline, PipelineError, Stage};

/// What a Classify ping says about a target's counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// No echo replies at all.
    Unresponsive,
    /// A single echo reply, not fragmented.
    GoneSilent,
    /// Several echo replies, none fragmented.
    NoFrags,
    /// Fewer than three counter values.
    InsufficientIpids,
    /// Counter values do not increase.
    Random,
    Incrementing,
}

impl Verdict {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unresponsive => "unresponsive",
            Self::GoneSilent => "gone-silent",
            Self::NoFrags => "no-frags",
            Self::InsufficientIpids => "insuff-ipids",
            Self::Random => "random",
            Self::Incrementing => "incr",
        }
    }
}

pub fn classify(readout: &CounterReadout, fudge: u32) -> Verdict {
    match readout.samples.len() {
        0 => match readout.responses {
            0 => Verdict::Unresponsive,
            1 => Verdict::GoneSilent,
            _ => Verdict::NoFrags,
        },
        1 | 2 => Verdict::InsufficientIpids,
        _ if !monotonic(&readout.ipids(), fudge) => Verdict::Random,
        _ => Verdict::Incrementing,
    }
}

impl Pipeline {
    pub(super) fn reply_classify(
        &mut self,
        id: TargetId,
        readout: &CounterReadout,
    ) -> Result<(), PipelineError> {
        let addr = self.target(id)?.addr();
        let verdict = classify(readout, self.cfg.fudge);
        self.metrics
            .classify_outcomes
            .with_label_values(&[verdict.as_str()])
            .inc();
        info!(%addr, verdict = verdict.as_str(), samples = readout.samples.len(), "classified");

        match (verdict, readout.samples.last()) {
            (Verdict::Incrementing, Some(last)) => {
                self.targets.push_sample(id, last.tx, last.rx, last.ipid)?;
                self.incr.push(id);
            }
            _ => self.targets.destroy(id, &mut self.waiting),
        }
        Ok(())
    }

    pub(super) fn finish_classify(&mut self) {
        self.set_stage(Stage::Descend);
        self.requeue_targets(self.incr.clone());
    }
}
