//! Line-oriented uuencoding as used on the daemon's control channel.
//!
//! Each line starts with a length character (`' ' + n`, or a backtick for
//! zero) followed by groups of four characters that each carry six bits.

use super::ControlError;

/// Bytes carried by one full encoded line.
pub const LINE_BYTES: usize = 45;

fn sixbits(c: u8) -> u8 {
    c.wrapping_sub(b' ') & 0x3f
}

fn enc(v: u8) -> u8 {
    if v == 0 {
        b'`'
    } else {
        v + b' '
    }
}

/// Decode one uuencoded line (newline excluded), appending to `out`.
pub fn uudecode_line(line: &[u8], out: &mut Vec<u8>) -> Result<(), ControlError> {
    let Some((&first, rest)) = line.split_first() else {
        return Ok(());
    };
    let len = sixbits(first) as usize;
    if len == 0 {
        return Ok(());
    }
    let groups = len.div_ceil(3);
    if rest.len() < groups * 4 {
        return Err(ControlError::BadData {
            reason: format!("uuencoded line carries {} of {} chars", rest.len(), groups * 4),
        });
    }

    let mut decoded = Vec::with_capacity(groups * 3);
    for chunk in rest.chunks_exact(4).take(groups) {
        let [a, b, c, d] = [
            sixbits(chunk[0]),
            sixbits(chunk[1]),
            sixbits(chunk[2]),
            sixbits(chunk[3]),
        ];
        decoded.push((a << 2) | (b >> 4));
        decoded.push((b << 4) | (c >> 2));
        decoded.push((c << 6) | d);
    }
    decoded.truncate(len);
    out.extend_from_slice(&decoded);
    Ok(())
}

/// Encode `data` as uuencoded lines, each terminated by a newline, followed by
/// the zero-length terminator line.
pub fn uuencode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 4 / 3 + data.len() / LINE_BYTES * 2 + 4);
    for line in data.chunks(LINE_BYTES) {
        out.push(enc(line.len() as u8));
        for group in line.chunks(3) {
            let b0 = group.first().copied().unwrap_or(0);
            let b1 = group.get(1).copied().unwrap_or(0);
            let b2 = group.get(2).copied().unwrap_or(0);
            out.push(enc(b0 >> 2));
            out.push(enc(((b0 << 4) | (b1 >> 4)) & 0x3f));
            out.push(enc(((b1 << 2) | (b2 >> 6)) & 0x3f));
            out.push(enc(b2 & 0x3f));
        }
        out.push(b'\n');
    }
    out.extend_from_slice(b"`\n");
    out
}
