//! Counter sequence tests.
//!
//! A host that draws fragment identifiers from one global counter produces
//! values that rise steadily no matter which of its addresses is probed.
//! These functions decide whether one address's samples look like such a
//! counter, and whether two addresses' samples interleave as if they were
//! read off the same counter.

use crate::target::Sample;

const WRAP: u64 = 1 << 32;

/// True if `a`, `b`, `c` are strictly increasing, allowing for the 32-bit
/// counter to wrap once across the triple.
///
/// With a non-zero `fudge` each step (`a` to `b`, `b` to `c`) must also be
/// no larger than `fudge`.
pub fn in_sequence3(a: u32, b: u32, c: u32, fudge: u32) -> bool {
    if a == b || b == c || a == c {
        return false;
    }

    let a = u64::from(a);
    let mut b = u64::from(b);
    let mut c = u64::from(c);
    if a > b {
        b += WRAP;
    }
    if a > c {
        c += WRAP;
    }

    if c < b {
        return false;
    }

    if fudge != 0 {
        let fudge = u64::from(fudge);
        b - a <= fudge && c - b <= fudge
    } else {
        true
    }
}

/// True if every consecutive triple of `ipids` is in sequence. Fewer than
/// three values cannot be classified and are rejected.
pub fn monotonic(ipids: &[u32], fudge: u32) -> bool {
    if ipids.len() < 3 {
        return false;
    }
    ipids
        .windows(3)
        .all(|w| in_sequence3(w[0], w[1], w[2], fudge))
}

/// True unless one sample's reply arrived before the other was sent.
pub fn windows_overlap(a: &Sample, b: &Sample) -> bool {
    if a.tx < b.tx {
        a.rx > b.tx
    } else if a.tx > b.tx {
        b.rx > a.tx
    } else {
        true
    }
}

/// Test whether two targets' sample histories are consistent with both
/// drawing from a single counter.
///
/// The histories are merged by transmit time. Any repeated counter value
/// makes the pair ambiguous. Each sample is then checked against the latest
/// sample of the other target and the previous sample of its own: samples
/// whose windows do not overlap must form an increasing triple. The pair is
/// accepted when at least one such triple validates and none fail.
pub fn pairwise(a: &[Sample], b: &[Sample], fudge: u32) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }

    let mut merged: Vec<(usize, &Sample)> = a
        .iter()
        .map(|s| (0, s))
        .chain(b.iter().map(|s| (1, s)))
        .collect();
    merged.sort_by(|(_, x), (_, y)| {
        x.tx.cmp(&y.tx)
            .then(x.rx.cmp(&y.rx))
            .then(x.ipid.cmp(&y.ipid))
    });

    let mut seen: Vec<u32> = merged.iter().map(|(_, s)| s.ipid).collect();
    seen.sort_unstable();
    if seen.windows(2).any(|w| w[0] == w[1]) {
        return false;
    }

    interleaved(&merged, fudge)
}

/// Core of [`pairwise`]: walk the merged samples keeping the two most
/// recent samples per side.
fn interleaved(merged: &[(usize, &Sample)], fudge: u32) -> bool {
    let Some(&(first_side, _)) = merged.first() else {
        return false;
    };

    // st[side] = [previous, latest]
    let mut st: [[Option<&Sample>; 2]; 2] = [[None; 2]; 2];
    let mut accepted = false;

    for &(side, ti) in merged {
        let (si, sj) = if side == first_side { (0, 1) } else { (1, 0) };

        if let (Some(own), Some(other)) = (st[si][1], st[sj][1]) {
            if own.tx > other.tx {
                if !in_sequence3(other.ipid, own.ipid, ti.ipid, fudge)
                    && !windows_overlap(other, own)
                    && !windows_overlap(own, ti)
                {
                    return false;
                }
            } else if windows_overlap(own, other) || windows_overlap(other, ti) {
                if windows_overlap(other, ti) {
                    if let Some(other_prev) = st[sj][0] {
                        if own.tx < other_prev.tx
                            && !windows_overlap(own, other_prev)
                            && !in_sequence3(own.ipid, other_prev.ipid, ti.ipid, fudge)
                        {
                            return false;
                        }
                    }
                }
            } else if in_sequence3(own.ipid, other.ipid, ti.ipid, fudge) {
                accepted = true;
            } else {
                return false;
            }
        }

        st[si][0] = st[si][1];
        st[si][1] = Some(ti);
    }

    accepted
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::target::TargetId;

    const FUDGE: u32 = 65535;

    /// Sample sent at `t` ms with a 5 ms round trip.
    fn sample(target: usize, t_ms: u64, ipid: u32) -> Sample {
        let tx = Timestamp::from_micros(1_000_000_000 + t_ms * 1000);
        Sample {
            target: TargetId(target),
            tx,
            rx: Timestamp::from_micros(tx.as_micros() + 5_000),
            ipid,
        }
    }

    // -- in_sequence3 --

    #[test]
    fn test_in_sequence3_basic() {
        assert!(in_sequence3(1, 2, 3, FUDGE));
        assert!(!in_sequence3(3, 2, 1, FUDGE));
        assert!(!in_sequence3(1, 3, 2, FUDGE));
        assert!(!in_sequence3(1, 1, 2, FUDGE));
        assert!(!in_sequence3(1, 2, 1, FUDGE));
    }

    #[test]
    fn test_in_sequence3_wraparound() {
        assert!(in_sequence3(0xffff_fffe, 0xffff_ffff, 0, FUDGE));
        assert!(in_sequence3(0xffff_ffff, 0, 1, FUDGE));
        assert!(in_sequence3(0xffff_fff0, 5, 10, FUDGE));
        // c wrapped but b did not, in the wrong place.
        assert!(!in_sequence3(0xffff_fff0, 5, 0xffff_fff8, FUDGE));
    }

    #[test]
    fn test_in_sequence3_wrap_verdict_changes_only_for_actual_wrap() {
        // Shifting every value across the wrap point keeps the verdict.
        let base = [100u32, 200, 300];
        let shift = u32::MAX - 150;
        let wrapped: Vec<u32> = base.iter().map(|v| v.wrapping_add(shift)).collect();
        assert!(in_sequence3(base[0], base[1], base[2], FUDGE));
        assert!(in_sequence3(wrapped[0], wrapped[1], wrapped[2], FUDGE));

        let bad = [100u32, 300, 200];
        let bad_wrapped: Vec<u32> = bad.iter().map(|v| v.wrapping_add(shift)).collect();
        assert!(!in_sequence3(bad[0], bad[1], bad[2], FUDGE));
        assert!(!in_sequence3(bad_wrapped[0], bad_wrapped[1], bad_wrapped[2], FUDGE));
    }

    #[test]
    fn test_in_sequence3_fudge_bounds_gaps() {
        assert!(in_sequence3(0, 10, 20, 10));
        assert!(!in_sequence3(0, 11, 20, 10));
        assert!(!in_sequence3(0, 10, 21, 10));
        // Exact mode has no gap limit.
        assert!(in_sequence3(0, 1_000_000, 2_000_000, 0));
        assert!(!in_sequence3(0, 2_000_000, 1_000_000, 0));
    }

    // -- monotonic --

    #[test]
    fn test_monotonic_too_few_samples() {
        assert!(!monotonic(&[], 0));
        assert!(!monotonic(&[1], 0));
        assert!(!monotonic(&[1, 2], 0));
    }

    #[test]
    fn test_monotonic_arithmetic_sequence() {
        assert!(monotonic(&[100, 101, 102, 103], 0));
        assert!(monotonic(&[100, 101, 102, 103], FUDGE));
    }

    #[test]
    fn test_monotonic_out_of_order() {
        assert!(!monotonic(&[100, 101, 99, 103], 0));
        assert!(!monotonic(&[100, 101, 99, 103], FUDGE));
    }

    #[test]
    fn test_monotonic_random_values() {
        assert!(!monotonic(&[0x1234, 0xbeef_0000, 0x0042_1111, 0x7777_0000], FUDGE));
    }

    // -- windows_overlap --

    #[test]
    fn test_windows_overlap() {
        let a = sample(0, 0, 1);
        let b = sample(1, 3, 2);
        let c = sample(1, 10, 3);
        assert!(windows_overlap(&a, &b));
        assert!(windows_overlap(&b, &a));
        assert!(!windows_overlap(&a, &c));
        assert!(!windows_overlap(&c, &a));
        assert!(windows_overlap(&a, &a));
    }

    #[test]
    fn test_windows_touching_do_not_overlap() {
        let a = sample(0, 0, 1);
        // b is sent exactly when a's reply arrives.
        let b = sample(1, 5, 2);
        assert!(!windows_overlap(&a, &b));
    }

    // -- pairwise --

    #[test]
    fn test_pairwise_shared_counter() {
        let a = vec![sample(0, 0, 100), sample(0, 200, 102), sample(0, 400, 104)];
        let b = vec![sample(1, 100, 101), sample(1, 300, 103)];
        assert!(pairwise(&a, &b, FUDGE));
        assert!(pairwise(&b, &a, FUDGE));
    }

    #[test]
    fn test_pairwise_independent_counters() {
        // a:100, b:150, a:101, b:151, a:102
        let a = vec![sample(0, 0, 100), sample(0, 200, 101), sample(0, 400, 102)];
        let b = vec![sample(1, 100, 150), sample(1, 300, 151)];
        assert!(!in_sequence3(100, 150, 101, FUDGE));
        assert!(!pairwise(&a, &b, FUDGE));
        assert!(!pairwise(&b, &a, FUDGE));
        assert!(!pairwise(&a, &b, 0));
    }

    #[test]
    fn test_pairwise_far_apart_counters() {
        let a = vec![sample(0, 0, 100), sample(0, 200, 101), sample(0, 400, 102)];
        let b = vec![sample(1, 100, 900_000), sample(1, 300, 900_001)];
        assert!(!pairwise(&a, &b, FUDGE));
    }

    #[test]
    fn test_pairwise_repeated_value_is_ambiguous() {
        let a = vec![sample(0, 0, 100), sample(0, 200, 102)];
        let b = vec![sample(1, 100, 101), sample(1, 300, 102)];
        assert!(!pairwise(&a, &b, FUDGE));
    }

    #[test]
    fn test_pairwise_needs_one_straddling_triple() {
        // All of a before all of b: no triple straddles both targets.
        let a = vec![sample(0, 0, 100)];
        let b = vec![sample(1, 100, 101)];
        assert!(!pairwise(&a, &b, FUDGE));
        assert!(!pairwise(&a, &[], FUDGE));
    }

    #[test]
    fn test_pairwise_overlapping_windows_are_not_evidence() {
        // b is sent while a's probe is in flight, so ordering is unknown.
        let a = vec![sample(0, 0, 100), sample(0, 2, 103)];
        let b = vec![sample(1, 1, 101)];
        assert!(!pairwise(&a, &b, FUDGE));
    }

    #[test]
    fn test_pairwise_wraparound() {
        let a = vec![sample(0, 0, u32::MAX - 1), sample(0, 200, 0)];
        let b = vec![sample(1, 100, u32::MAX), sample(1, 300, 1)];
        assert!(pairwise(&a, &b, FUDGE));
        assert!(pairwise(&b, &a, FUDGE));
    }

    #[test]
    fn test_pairwise_symmetric() {
        let histories: Vec<(Vec<Sample>, Vec<Sample>)> = vec![
            (
                vec![sample(0, 0, 10), sample(0, 50, 30)],
                vec![sample(1, 20, 20), sample(1, 80, 40)],
            ),
            (
                vec![sample(0, 0, 10), sample(0, 50, 5)],
                vec![sample(1, 20, 20), sample(1, 80, 40)],
            ),
            (
                vec![sample(0, 0, 10), sample(0, 1, 12)],
                vec![sample(1, 0, 11), sample(1, 2, 13)],
            ),
            (
                vec![sample(0, 0, 10), sample(0, 100, 12), sample(0, 102, 14)],
                vec![sample(1, 50, 11), sample(1, 101, 13)],
            ),
        ];
        for (a, b) in &histories {
            assert_eq!(pairwise(a, b, FUDGE), pairwise(b, a, FUDGE));
            assert_eq!(pairwise(a, b, 0), pairwise(b, a, 0));
        }
    }
}
