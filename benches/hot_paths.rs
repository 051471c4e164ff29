use std::net::Ipv6Addr;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use speedtrap::clock::Timestamp;
use speedtrap::control::uu::uuencode;
use speedtrap::control::ControlDecoder;
use speedtrap::object::parse::parse_object;
use speedtrap::object::{ICMP6_ECHO_REPLY, MAGIC, REPLY_FLAG_IPID};
use speedtrap::sequence::pairwise;
use speedtrap::target::{Sample, TargetRegistry};

fn addr(n: u16) -> Ipv6Addr {
    Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, n)
}

/// Ping frame with `replies` fragmented echo replies.
fn ping_frame(replies: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&addr(0xffff).octets());
    body.extend_from_slice(&addr(1).octets());
    body.extend_from_slice(&1300u16.to_be_bytes());
    body.extend_from_slice(&replies.to_be_bytes());
    body.extend_from_slice(&replies.to_be_bytes());
    for i in 0..replies {
        body.extend_from_slice(&i.to_be_bytes());
        body.push(REPLY_FLAG_IPID);
        body.push(ICMP6_ECHO_REPLY);
        body.push(0);
        body.push(64);
        body.extend_from_slice(&1280u16.to_be_bytes());
        body.extend_from_slice(&(1_700_000_000 + u32::from(i)).to_be_bytes());
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&120u32.to_be_bytes());
        body.extend_from_slice(&(9_000 + u32::from(i)).to_be_bytes());
    }

    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&MAGIC.to_be_bytes());
    frame.extend_from_slice(&7u16.to_be_bytes());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Two targets sampled alternately off one counter, `n` samples each.
fn interleaved_histories(n: u64) -> (Vec<Sample>, Vec<Sample>) {
    let mut reg = TargetRegistry::new();
    let a = reg.insert(addr(1));
    let b = reg.insert(addr(2));
    for i in 0..n * 2 {
        let id = if i % 2 == 0 { a } else { b };
        let tx = Timestamp::from_micros(i * 1_000_000);
        let rx = Timestamp::from_micros(i * 1_000_000 + 150);
        reg.push_sample(id, tx, rx, 40_000 + i as u32 * 3)
            .expect("push sample");
    }
    let history = |id| reg.get(id).map(|t| t.samples().to_vec()).unwrap_or_default();
    (history(a), history(b))
}

fn bench_pairwise(c: &mut Criterion) {
    let (sa, sb) = interleaved_histories(4);

    c.bench_function("pairwise/interleaved_4x4", |bench| {
        bench.iter(|| pairwise(black_box(&sa), black_box(&sb), 65535))
    });
}

fn bench_parse_object(c: &mut Criterion) {
    let frame = ping_frame(6);

    c.bench_function("parse_object/ping_6_replies", |b| {
        b.iter(|| parse_object(black_box(&frame)).expect("parse ping"))
    });
}

fn bench_control_decode(c: &mut Criterion) {
    let data = uuencode(&ping_frame(6));
    let mut stream = format!("DATA {}\n", data.len()).into_bytes();
    stream.extend_from_slice(&data);
    stream.extend_from_slice(b"MORE\n");

    c.bench_function("control/decode_data_block", |b| {
        b.iter(|| {
            let mut decoder = ControlDecoder::new();
            let events = decoder.feed(black_box(&stream)).expect("decode");
            black_box(events.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_pairwise(c);
    bench_parse_object(c);
    bench_control_decode(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
