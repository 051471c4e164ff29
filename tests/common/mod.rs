//! In-process stand-in for the probing daemon.
//!
//! Each simulated router owns one fragment-ID counter shared by all of its
//! addresses; every fragmented echo reply it sends takes the next value.
//! Probes are spaced one second apart on a virtual clock, so no two samples
//! ever share a time window.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use std::collections::{HashMap, HashSet};
use std::net::Ipv6Addr;

use speedtrap::control::uu::uuencode;
use speedtrap::object::{DEALIAS_METHOD_ALLY, ICMP6_ECHO_REPLY, MAGIC, REPLY_FLAG_IPID};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Virtual time of the first probe, in microseconds.
const EPOCH_US: u64 = 1_700_000_000_000_000;
const PROBE_SPACING_US: u64 = 1_000_000;
const RTT_US: u32 = 100;
const VANTAGE: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0xffff, 0, 0, 0, 0, 1);

pub fn addr(n: u16) -> Ipv6Addr {
    Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n)
}

pub struct FakeDaemon {
    routers: HashMap<Ipv6Addr, usize>,
    counters: Vec<u32>,
    clock_us: u64,
    credit: usize,
    reject: HashSet<usize>,
    hang_up: bool,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl Default for FakeDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self {
            routers: HashMap::new(),
            counters: Vec::new(),
            clock_us: EPOCH_US,
            credit: 1,
            reject: HashSet::new(),
            hang_up: false,
            cancel_after: None,
        }
    }

    /// A router answering on `addrs` whose counter starts at `base`.
    pub fn router(mut self, base: u32, addrs: &[Ipv6Addr]) -> Self {
        let id = self.counters.len();
        self.counters.push(base);
        for &a in addrs {
            self.routers.insert(a, id);
        }
        self
    }

    /// Commands the engine may have in flight at once. A command sent
    /// beyond the granted credit panics the daemon task.
    pub fn credit(mut self, n: usize) -> Self {
        self.credit = n;
        self
    }

    /// Answer the `nth` command received (0-based) with ERR.
    pub fn reject(mut self, nth: usize) -> Self {
        self.reject.insert(nth);
        self
    }

    /// Acknowledge the attach without granting credit, then close.
    pub fn hang_up(mut self) -> Self {
        self.hang_up = true;
        self
    }

    /// Cancel `token` as soon as `n` commands have arrived, before
    /// answering the last of them.
    pub fn cancel_after(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((n, token));
        self
    }

    /// Serve one end of an in-memory pipe; the other end is returned. The
    /// task resolves to every command line received.
    pub fn spawn(self) -> (DuplexStream, JoinHandle<Vec<String>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (client, tokio::spawn(self.serve(server)))
    }

    pub async fn serve<S: AsyncRead + AsyncWrite + Unpin>(mut self, stream: S) -> Vec<String> {
        let (rd, mut wr) = tokio::io::split(stream);
        let mut lines = BufReader::new(rd).lines();
        let mut commands = Vec::new();

        match lines.next_line().await {
            Ok(Some(line)) if line == "attach" => {}
            other => panic!("expected attach, got {other:?}"),
        }
        let mut greeting = b"OK\n".to_vec();
        if self.hang_up {
            let _ = wr.write_all(&greeting).await;
            return commands;
        }
        for _ in 0..self.credit {
            greeting.extend_from_slice(b"MORE\n");
        }
        if wr.write_all(&greeting).await.is_err() {
            return commands;
        }

        // credit granted and not yet spent, as the daemon sees it
        let mut available = self.credit;
        while let Ok(Some(line)) = lines.next_line().await {
            if available == 0 {
                panic!("command arrived with no credit left: {line}");
            }
            available -= 1;
            let n = commands.len();
            commands.push(line.clone());
            if let Some((after, token)) = &self.cancel_after {
                if commands.len() == *after {
                    token.cancel();
                }
            }

            // OK is followed by MORE; ERR returns the credit implicitly
            available += 1;
            let reply = if self.reject.contains(&n) {
                b"ERR\n".to_vec()
            } else {
                let frame = self.execute(&line);
                let data = uuencode(&frame);
                let mut reply = format!("OK\nDATA {}\n", data.len()).into_bytes();
                reply.extend_from_slice(&data);
                reply.extend_from_slice(b"MORE\n");
                reply
            };
            if wr.write_all(&reply).await.is_err() {
                break;
            }
        }
        commands
    }

    fn execute(&mut self, line: &str) -> Vec<u8> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let userid: u32 = option(&tokens, "-U").unwrap();
        match tokens.first() {
            Some(&"ping") => {
                let dst: Ipv6Addr = tokens.last().unwrap().parse().unwrap();
                let count: u16 = option(&tokens, "-c").unwrap();
                let stop_after: Option<u16> = option(&tokens, "-o");
                self.ping(userid, dst, count, stop_after)
            }
            Some(&"dealias") => {
                let a: Ipv6Addr = tokens[tokens.len() - 2].parse().unwrap();
                let b: Ipv6Addr = tokens[tokens.len() - 1].parse().unwrap();
                self.dealias(userid, a, b)
            }
            _ => panic!("unexpected command {line}"),
        }
    }

    fn ping(&mut self, userid: u32, dst: Ipv6Addr, count: u16, stop_after: Option<u16>) -> Vec<u8> {
        let router = self.routers.get(&dst).copied();
        let sent = match (router, stop_after) {
            (Some(_), Some(n)) => n.min(count),
            _ => count,
        };
        let start = self.clock_us;

        let mut replies = Vec::new();
        for probe_id in 0..sent {
            let tx = self.clock_us;
            self.clock_us += PROBE_SPACING_US;
            let Some(router) = router else {
                continue;
            };
            let ipid = self.counters[router];
            self.counters[router] = ipid.wrapping_add(1);
            replies.push(reply(probe_id, tx, ipid));
        }

        let mut body = Vec::new();
        body.extend_from_slice(&userid.to_be_bytes());
        push_time(&mut body, start);
        body.extend_from_slice(&VANTAGE.octets());
        body.extend_from_slice(&dst.octets());
        body.extend_from_slice(&1300u16.to_be_bytes());
        body.extend_from_slice(&sent.to_be_bytes());
        body.extend_from_slice(&(replies.len() as u16).to_be_bytes());
        for r in &replies {
            body.extend_from_slice(r);
        }
        frame(7, &body)
    }

    fn dealias(&mut self, userid: u32, a: Ipv6Addr, b: Ipv6Addr) -> Vec<u8> {
        let start = self.clock_us;
        self.clock_us += 5 * PROBE_SPACING_US;
        let result: u8 = match (self.routers.get(&a), self.routers.get(&b)) {
            (Some(ra), Some(rb)) if ra == rb => 1,
            _ => 2,
        };

        let mut body = Vec::new();
        body.extend_from_slice(&userid.to_be_bytes());
        push_time(&mut body, start);
        body.push(DEALIAS_METHOD_ALLY);
        body.push(result);
        body.extend_from_slice(&5u32.to_be_bytes());
        body.extend_from_slice(&a.octets());
        body.extend_from_slice(&b.octets());
        frame(6, &body)
    }
}

fn option<T: std::str::FromStr>(tokens: &[&str], flag: &str) -> Option<T> {
    let at = tokens.iter().position(|t| *t == flag)?;
    tokens.get(at + 1)?.parse().ok()
}

fn push_time(buf: &mut Vec<u8>, us: u64) {
    buf.extend_from_slice(&((us / 1_000_000) as u32).to_be_bytes());
    buf.extend_from_slice(&((us % 1_000_000) as u32).to_be_bytes());
}

fn reply(probe_id: u16, tx_us: u64, ipid: u32) -> Vec<u8> {
    let mut r = Vec::with_capacity(24);
    r.extend_from_slice(&probe_id.to_be_bytes());
    r.push(REPLY_FLAG_IPID);
    r.push(ICMP6_ECHO_REPLY);
    r.push(0);
    r.push(64);
    r.extend_from_slice(&1280u16.to_be_bytes());
    push_time(&mut r, tx_us);
    r.extend_from_slice(&RTT_US.to_be_bytes());
    r.extend_from_slice(&ipid.to_be_bytes());
    r
}

pub fn frame(obj_type: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&obj_type.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}
