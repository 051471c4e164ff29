use std::fmt;
use std::net::Ipv6Addr;

use crate::config::ProbeConfig;
use crate::wait::WaitPayload;

use super::Stage;

/// A command line ready to send to the daemon, plus what it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCommand {
    pub stage: Stage,
    /// Target (ping stages) or set (Ally) to hand back on rejection.
    pub payload: WaitPayload,
    line: String,
}

impl ProbeCommand {
    /// Counter probe of one address.
    pub fn ping(
        stage: Stage,
        payload: WaitPayload,
        addr: Ipv6Addr,
        first_attempt: bool,
        probe: &ProbeConfig,
    ) -> Self {
        let count = if stage == Stage::Classify {
            probe.classify_count
        } else {
            probe.descend_count
        };
        let mut line = format!(
            "ping -O dl -U {} -c {} -s {} -M {}",
            stage.index(),
            count,
            probe.packet_size,
            probe.mtu
        );
        // stop after the first reply, unless retrying
        if stage != Stage::Classify && first_attempt {
            line.push_str(" -o 1");
        }
        line.push(' ');
        line.push_str(&addr.to_string());
        Self {
            stage,
            payload,
            line,
        }
    }

    /// Direct alias confirmation of a pair.
    pub fn ally(payload: WaitPayload, a: Ipv6Addr, b: Ipv6Addr, probe: &ProbeConfig) -> Self {
        let line = format!(
            "dealias -U {} -m ally -W {} -p '-P icmp-echo -s {} -M {}' {} {}",
            Stage::Ally.index(),
            probe.ally_wait.as_millis(),
            probe.packet_size,
            probe.mtu,
            a,
            b
        );
        Self {
            stage: Stage::Ally,
            payload,
            line,
        }
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// The command as written to the control channel.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.line.len() + 1);
        out.extend_from_slice(self.line.as_bytes());
        out.push(b'\n');
        out
    }
}

impl fmt::Display for ProbeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}
