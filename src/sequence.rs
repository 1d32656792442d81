//! Mutable byte buffer carrying a byte-stuffed/unstuffed flag, and the
//! stuffing and CRC rules that operate over it.

use crate::consts::{EXP, EXP_EXP, SYN, SYN_EXP};
use crate::crc::crc8;

/// An ordered mutable buffer of bytes, tagged with whether its current
/// contents are in stuffed (wire) or unstuffed (logical) form.
///
/// Invariant: while `stuffed` is `true`, the buffer contains no interior
/// [`SYN`] and every [`EXP`] is immediately followed by [`EXP_EXP`] or
/// [`SYN_EXP`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequence {
    buf: Vec<u8>,
    stuffed: bool,
}

impl Sequence {
    /// Creates an empty, unstuffed sequence.
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            stuffed: false,
        }
    }

    /// Builds a sequence from an already-unstuffed byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec(),
            stuffed: false,
        }
    }

    /// Builds a sequence from raw wire bytes, marking it stuffed.
    pub fn from_stuffed(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec(),
            stuffed: true,
        }
    }

    /// Parses a hex string (e.g. `"aa52b5"`) into an unstuffed sequence.
    /// Returns `None` if `hex` isn't a valid, even-length hex digit string,
    /// mirroring the original's validate-then-parse `isHex` guard ahead of
    /// its string-based `createMaster`/`createSlave` entry points.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if !crate::util::is_hex(hex, 2) {
            return None;
        }
        let bytes = crate::util::hex_to_bytes(hex);
        Some(Self::from_bytes(&bytes))
    }

    /// Appends one byte. `already_stuffed` sets the sequence's `stuffed`
    /// flag to match the byte just pushed — mixing stuffed and unstuffed
    /// pushes is the caller's responsibility to avoid.
    pub fn push(&mut self, byte: u8, already_stuffed: bool) {
        self.buf.push(byte);
        self.stuffed = already_stuffed;
    }

    /// Number of bytes currently in the buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Clears the buffer and resets the stuffed flag.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.stuffed = false;
    }

    /// Whether the buffer is currently in stuffed (wire) form.
    pub fn is_stuffed(&self) -> bool {
        self.stuffed
    }

    /// Raw access to the underlying bytes, in whatever form they're in.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Indexed access; panics like `Vec::index` on out-of-range `i`.
    pub fn at(&self, i: usize) -> u8 {
        self.buf[i]
    }

    /// A shallow copy of `len` bytes starting at `index` (fewer if the
    /// buffer is shorter). Inherits the `stuffed` flag.
    pub fn range(&self, index: usize, len: usize) -> Sequence {
        let end = (index + len).min(self.buf.len());
        let slice = if index < self.buf.len() {
            &self.buf[index..end]
        } else {
            &[]
        };
        Sequence {
            buf: slice.to_vec(),
            stuffed: self.stuffed,
        }
    }

    /// Transforms the buffer into stuffed (wire) form. Idempotent.
    pub fn stuff(&mut self) {
        if self.stuffed {
            return;
        }
        let mut out = Vec::with_capacity(self.buf.len());
        for &b in &self.buf {
            match b {
                SYN => {
                    out.push(EXP);
                    out.push(SYN_EXP);
                }
                EXP => {
                    out.push(EXP);
                    out.push(EXP_EXP);
                }
                other => out.push(other),
            }
        }
        self.buf = out;
        self.stuffed = true;
    }

    /// Transforms the buffer into unstuffed (logical) form. Idempotent.
    ///
    /// A trailing lone [`EXP`] (no following byte yet) is absorbed silently
    /// rather than treated as an error: it represents a receive still in
    /// progress, not a malformed sequence.
    pub fn unstuff(&mut self) {
        if !self.stuffed {
            return;
        }
        let mut out = Vec::with_capacity(self.buf.len());
        let mut pending_escape = false;
        for &b in &self.buf {
            if pending_escape {
                out.push(if b == SYN_EXP { SYN } else { EXP });
                pending_escape = false;
            } else if b == EXP {
                pending_escape = true;
            } else {
                out.push(b);
            }
        }
        self.buf = out;
        self.stuffed = false;
    }

    /// `true` if the buffer, in its current stuffed form, ends on a lone
    /// unresolved [`EXP`] escape byte — i.e. more data is needed before the
    /// last logical byte can be determined.
    pub fn has_pending_escape(&self) -> bool {
        self.stuffed && self.buf.last() == Some(&EXP)
    }

    /// CRC-8 over the buffer forced into stuffed form; the buffer is
    /// restored to its original form afterwards.
    pub fn crc(&mut self) -> u8 {
        let was_unstuffed = !self.stuffed;
        if was_unstuffed {
            self.stuff();
        }
        let crc = crc8(&self.buf);
        if was_unstuffed {
            self.unstuff();
        }
        crc
    }

    /// Index of the first occurrence of `needle` at or after `from`, or
    /// `None` if not found.
    pub fn find(&self, needle: &Sequence, from: usize) -> Option<usize> {
        if needle.buf.is_empty() || needle.buf.len() > self.buf.len() {
            return None;
        }
        (from..=self.buf.len() - needle.buf.len()).find(|&i| self.buf[i..i + needle.buf.len()] == needle.buf[..])
    }

    /// Ordering compatible with the source's three-way `compare`: shorter
    /// sorts first, then lexical on equal length.
    pub fn compare(&self, other: &Sequence) -> core::cmp::Ordering {
        self.buf.len().cmp(&other.buf.len()).then_with(|| self.buf.cmp(&other.buf))
    }

    /// Whether this sequence contains `hex` (parsed as an unstuffed byte
    /// string) as a contiguous sub-sequence. `false` if `hex` isn't valid.
    pub fn contains(&self, hex: &str) -> bool {
        match Sequence::from_hex(hex) {
            Some(needle) => self.find(&needle, 0).is_some(),
            None => false,
        }
    }

    /// Hex-encodes the buffer's current contents.
    pub fn to_hex(&self) -> String {
        crate::util::bytes_to_hex(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuff_round_trip() {
        let cases: &[&[u8]] = &[&[], &[0x01], &[0xAA, 0xA9, 0x10], &[0xAA, 0xAA, 0xA9]];
        for &v in cases {
            let mut s = Sequence::from_bytes(v);
            s.stuff();
            s.unstuff();
            assert_eq!(s.as_slice(), v);
        }
    }

    #[test]
    fn stuff_syn_and_exp() {
        let mut s = Sequence::from_bytes(&[0xAA]);
        s.stuff();
        assert_eq!(s.as_slice(), &[0xA9, 0x01]);

        let mut s = Sequence::from_bytes(&[0xA9]);
        s.stuff();
        assert_eq!(s.as_slice(), &[0xA9, 0x00]);
    }

    #[test]
    fn unstuff_leaves_trailing_lone_escape_pending() {
        let mut s = Sequence::from_stuffed(&[0x10, 0xA9]);
        s.unstuff();
        assert_eq!(s.as_slice(), &[0x10]);
        assert!(!s.is_stuffed());
    }

    #[test]
    fn pending_escape_detection_before_unstuffing() {
        let s = Sequence::from_stuffed(&[0x10, 0xA9]);
        assert!(s.has_pending_escape());
        let s = Sequence::from_stuffed(&[0x10, 0xA9, 0x01]);
        assert!(!s.has_pending_escape());
    }

    #[test]
    fn crc_determinism() {
        let mut a = Sequence::from_bytes(&[0x10, 0x52, 0xb5]);
        let mut b = Sequence::from_bytes(&[0x10, 0x52, 0xb5]);
        assert_eq!(a.crc(), b.crc());
    }

    #[test]
    fn crc_restores_original_form() {
        let mut s = Sequence::from_bytes(&[0xAA, 0x10]);
        let _ = s.crc();
        assert!(!s.is_stuffed());
        assert_eq!(s.as_slice(), &[0xAA, 0x10]);
    }

    #[test]
    fn range_inherits_stuffed_flag_and_clamps() {
        let s = Sequence::from_stuffed(&[1, 2, 3, 4]);
        let r = s.range(2, 10);
        assert_eq!(r.as_slice(), &[3, 4]);
        assert!(r.is_stuffed());
    }

    #[test]
    fn find_and_contains() {
        let s = Sequence::from_bytes(&[0x10, 0x52, 0xb5, 0x09]);
        let needle = Sequence::from_bytes(&[0x52, 0xb5]);
        assert_eq!(s.find(&needle, 0), Some(1));
        assert!(s.contains("52b5"));
        assert!(!s.contains("ffff"));
    }

    #[test]
    fn from_hex_rejects_malformed_input() {
        assert!(Sequence::from_hex("52b5").is_some());
        assert!(Sequence::from_hex("52b").is_none());
        assert!(Sequence::from_hex("zz").is_none());
    }

    #[test]
    fn contains_is_false_for_malformed_hex() {
        let s = Sequence::from_bytes(&[0x10, 0x52, 0xb5]);
        assert!(!s.contains("zz"));
    }
}
