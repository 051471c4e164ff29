//! Measurement objects returned by the probing daemon.
//!
//! Objects arrive as length-prefixed binary frames (see [`parse`]). Only two
//! kinds matter here: counter probes ([`PingObject`]) and direct alias
//! confirmations ([`DealiasObject`]).

pub mod parse;
pub mod reader;

use std::net::Ipv6Addr;
use std::time::Duration;

use serde::Serialize;

use crate::clock::Timestamp;

/// Frame header magic.
pub const MAGIC: u16 = 0x1205;

/// Frame header size in bytes: magic, type, body length.
pub const HEADER_SIZE: usize = 8;

/// ICMPv6 echo reply.
pub const ICMP6_ECHO_REPLY: u8 = 129;

/// Reply flag: the reply carried a fragment identifier.
pub const REPLY_FLAG_IPID: u8 = 0x01;

/// Object type tag carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u16)]
pub enum ObjectType {
    Dealias = 6,
    Ping = 7,
}

impl ObjectType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dealias => "dealias",
            Self::Ping => "ping",
        }
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            6 => Some(Self::Dealias),
            7 => Some(Self::Ping),
            _ => None,
        }
    }
}

/// One reply to one probe of a ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingReply {
    pub probe_id: u16,
    pub flags: u8,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub reply_ttl: u8,
    pub reply_size: u16,
    pub tx: Timestamp,
    pub rtt: Duration,
    pub reply_ipid: u32,
}

impl PingReply {
    pub fn is_echo_reply(&self) -> bool {
        self.icmp_type == ICMP6_ECHO_REPLY
    }

    pub fn has_ipid(&self) -> bool {
        self.flags & REPLY_FLAG_IPID != 0
    }

    /// Time the reply was received.
    pub fn rx(&self) -> Timestamp {
        self.tx + self.rtt
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingObject {
    /// Stage index the probe was issued for.
    pub userid: u32,
    pub start: Timestamp,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub probe_size: u16,
    pub ping_sent: u16,
    pub replies: Vec<PingReply>,
}

/// Counter values and reply count pulled out of a ping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterReadout {
    /// Probes answered with an echo reply.
    pub responses: u16,
    /// Fragmented echo replies, in probe order.
    pub samples: Vec<CounterSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSample {
    pub tx: Timestamp,
    pub rx: Timestamp,
    pub ipid: u32,
}

impl CounterReadout {
    pub fn ipids(&self) -> Vec<u32> {
        self.samples.iter().map(|s| s.ipid).collect()
    }
}

impl PingObject {
    /// First reply to probe `probe_id`, if any.
    pub fn reply_to(&self, probe_id: u16) -> Option<&PingReply> {
        self.replies.iter().find(|r| r.probe_id == probe_id)
    }

    /// Walk the probes in order, counting echo replies and collecting the
    /// counter value of every fragmented one.
    pub fn read_counters(&self) -> CounterReadout {
        let mut out = CounterReadout::default();
        for probe_id in 0..self.ping_sent {
            let Some(reply) = self.reply_to(probe_id) else {
                continue;
            };
            if !reply.is_echo_reply() {
                continue;
            }
            out.responses += 1;
            if reply.has_ipid() {
                out.samples.push(CounterSample {
                    tx: reply.tx,
                    rx: reply.rx(),
                    ipid: reply.reply_ipid,
                });
            }
        }
        out
    }
}

/// Verdict of a direct alias confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DealiasResult {
    None = 0,
    Aliases = 1,
    NotAliases = 2,
    Halted = 3,
    IpidEcho = 4,
}

impl DealiasResult {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Aliases => "aliases",
            Self::NotAliases => "not-aliases",
            Self::Halted => "halted",
            Self::IpidEcho => "ipid-echo",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Aliases),
            2 => Some(Self::NotAliases),
            3 => Some(Self::Halted),
            4 => Some(Self::IpidEcho),
            _ => None,
        }
    }
}

/// Dealias method code for the ally technique.
pub const DEALIAS_METHOD_ALLY: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DealiasObject {
    pub userid: u32,
    pub start: Timestamp,
    pub method: u8,
    pub result: DealiasResult,
    /// Probes sent while measuring.
    pub probec: u32,
    pub a: Ipv6Addr,
    pub b: Ipv6Addr,
}

/// A decoded measurement object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Object {
    Ping(PingObject),
    Dealias(DealiasObject),
}

impl Object {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::Ping(_) => ObjectType::Ping,
            Self::Dealias(_) => ObjectType::Dealias,
        }
    }

    pub fn userid(&self) -> u32 {
        match self {
            Self::Ping(p) => p.userid,
            Self::Dealias(d) => d.userid,
        }
    }
}

/// A complete frame exactly as received, header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub obj_type: u16,
    pub bytes: Vec<u8>,
}

impl Frame {
    pub fn body(&self) -> &[u8] {
        self.bytes.get(HEADER_SIZE..).unwrap_or(&[])
    }
}
