//! Concealment of protected entries in directory enumeration streams.
//!
//! getdents64 fills a buffer with variable length records laid out as
//! `u64 d_ino, i64 d_off, u16 d_reclen, u8 d_type` followed by the NUL
//! terminated name. The stream is rewritten in place after the original
//! call; surviving records keep their order.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::convert::TryInto;

/// Byte offset of the record length inside a record.
const RECLEN: usize = 16;

/// Byte offset of the name inside a record.
const NAME: usize = 19;

/// Minimum bytes needed to read a record header.
const HEADER: usize = NAME;

/// How records of unreadable files are concealed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Concealment {
    /// Zero the identity and name in place, keeping the record length, so
    /// the stream stays well-formed. An enumeration still reveals that some
    /// entry exists.
    Zero,

    /// Remove the record entirely and close the gap, shortening the stream.
    Compact,
}

impl Default for Concealment {
    fn default() -> Self {
        Concealment::Zero
    }
}

/// Walk the record stream in `buf[..len]` and conceal every record whose
/// identity `hidden` claims. Returns the resulting stream length, which only
/// [`Concealment::Compact`] can shorten. A malformed record terminates the
/// walk, leaving the remainder untouched.
pub fn conceal<F>(buf: &mut [u8], len: usize, mode: Concealment, hidden: F) -> usize
where
    F: FnMut(u64) -> bool,
{
    match mode {
        Concealment::Zero => conceal_zero(buf, len, hidden),
        Concealment::Compact => conceal_compact(buf, len, hidden),
    }
}

fn record_header(buf: &[u8], bpos: usize, len: usize) -> Option<(u64, usize)> {
    if bpos + HEADER > len {
        return None;
    }
    let ino = u64::from_ne_bytes(buf[bpos..bpos + 8].try_into().expect("eight ino bytes"));
    let reclen = u16::from_ne_bytes(
        buf[bpos + RECLEN..bpos + RECLEN + 2]
            .try_into()
            .expect("two reclen bytes"),
    ) as usize;
    if reclen < HEADER || bpos + reclen > len {
        return None;
    }
    Some((ino, reclen))
}

fn conceal_zero<F>(buf: &mut [u8], len: usize, mut hidden: F) -> usize
where
    F: FnMut(u64) -> bool,
{
    let mut bpos = 0;
    while let Some((ino, reclen)) = record_header(buf, bpos, len) {
        if hidden(ino) {
            for b in &mut buf[bpos..bpos + 8] {
                *b = 0;
            }
            for b in &mut buf[bpos + NAME..bpos + reclen] {
                *b = 0;
            }
        }
        bpos += reclen;
    }
    len
}

fn conceal_compact<F>(buf: &mut [u8], len: usize, mut hidden: F) -> usize
where
    F: FnMut(u64) -> bool,
{
    let mut bpos = 0;
    let mut end = len;
    while let Some((ino, reclen)) = record_header(buf, bpos, end) {
        if hidden(ino) {
            buf.copy_within(bpos + reclen..end, bpos);
            end -= reclen;
        } else {
            bpos += reclen;
        }
    }
    end
}


#[cfg(test)]
mod tests {
    use super::testutil::{names, stream};
    use super::*;

    #[test]
    fn zero_mode_blanks_identity_and_name() {
        let mut buf = stream(&[(100, "visible"), (200, "secret"), (300, "other")]);
        let len = buf.len();

        let out = conceal(&mut buf, len, Concealment::Zero, |ino| ino == 200);

        assert_eq!(out, len);
        assert_eq!(
            names(&buf, out),
            vec![
                (100, "visible".to_string()),
                (0, "".to_string()),
                (300, "other".to_string()),
            ]
        );
    }

    #[test]
    fn compact_mode_removes_records() {
        let mut buf = stream(&[(100, "first"), (200, "secret"), (300, "third")]);
        let len = buf.len();

        let out = conceal(&mut buf, len, Concealment::Compact, |ino| ino == 200);

        assert!(out < len);
        assert_eq!(
            names(&buf, out),
            vec![(100, "first".to_string()), (300, "third".to_string())]
        );
    }

    #[test]
    fn compact_mode_removes_adjacent_records() {
        let mut buf = stream(&[(200, "a"), (201, "b"), (100, "keep"), (202, "c")]);
        let len = buf.len();

        let out = conceal(&mut buf, len, Concealment::Compact, |ino| ino >= 200);

        assert_eq!(names(&buf, out), vec![(100, "keep".to_string())]);
    }

    #[test]
    fn survivors_keep_their_order() {
        let entries: Vec<(u64, String)> = (0..20)
            .map(|i| (100 + i as u64, format!("entry{}", i)))
            .collect();
        let borrowed: Vec<(u64, &str)> =
            entries.iter().map(|(i, n)| (*i, n.as_str())).collect();
        let mut buf = stream(&borrowed);
        let len = buf.len();

        let out = conceal(&mut buf, len, Concealment::Compact, |ino| ino % 2 == 0);

        let survivors: Vec<u64> = names(&buf, out).iter().map(|(i, _)| *i).collect();
        let expected: Vec<u64> = (0..20)
            .map(|i| 100 + i as u64)
            .filter(|i| i % 2 != 0)
            .collect();
        assert_eq!(survivors, expected);
    }

    #[test]
    fn malformed_stream_stops_the_walk() {
        let mut buf = stream(&[(100, "fine")]);
        let len = buf.len();
        // Truncated trailing garbage must not be walked into.
        buf.extend(&[0xffu8; 5]);
        let total = buf.len();

        let out = conceal(&mut buf, total, Concealment::Zero, |_| true);
        assert_eq!(out, total);
        assert_eq!(names(&buf, len), vec![(0, "".to_string())]);
    }

    #[test]
    fn empty_stream() {
        let mut buf = Vec::new();
        assert_eq!(conceal(&mut buf, 0, Concealment::Zero, |_| true), 0);
        assert_eq!(conceal(&mut buf, 0, Concealment::Compact, |_| true), 0);
    }
}
