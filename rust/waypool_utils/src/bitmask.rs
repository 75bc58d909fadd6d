// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Bitmask
//!
//! A logically-sized bit vector with set algebra and contiguous-run queries,
//! used for both CPU sets and cache-way masks.
//!
//! A Bitmask is a BitVec of u32 words, least-significant word first, with a
//! fixed logical length. Bits beyond the logical length are always zero.
//! Every algebraic operation returns a new Bitmask; operations over two
//! masks of different lengths widen to the larger one.
//!
//! Masks are parsed from the two textual forms the resource-control
//! filesystem speaks: human range lists and big-endian hex words.
//!
//!```
//!     use waypool_utils::Bitmask;
//!     let ways = Bitmask::from_spec(Some(11), "1-8,^3-4,^7,9").unwrap();
//!     assert_eq!(ways.to_human_string(), "1-2,5-6,8-9");
//!
//!     let cbm = Bitmask::from_hex(Some(11), "7f0").unwrap();
//!     assert_eq!(cbm.weight(), 7);
//!     assert_eq!(cbm.to_hex_string(), "7f0");
//!```
//!
//! The placement primitive is `connective_bits`, which carves a run of a
//! requested size out of the free bits, steered toward one end of the mask:
//!
//!```
//!     use waypool_utils::Bitmask;
//!     let free = Bitmask::from_spec(Some(12), "0-3,6-10").unwrap();
//!     let high = free.connective_bits(3, 0, false);
//!     assert_eq!(high.to_human_string(), "8-10");
//!     let low = free.connective_bits(3, 0, true);
//!     assert_eq!(low.to_human_string(), "0-2");
//!```

use std::fmt;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;

#[derive(Debug, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Bitmask {
    bits: BitVec<u32, Lsb0>,
}

impl Bitmask {
    /// Build an empty Bitmask of the given logical length.
    pub fn new(len: usize) -> Bitmask {
        Bitmask {
            bits: bitvec![u32, Lsb0; 0; len],
        }
    }

    /// Build a Bitmask of the given length with every bit set.
    pub fn full(len: usize) -> Bitmask {
        Bitmask {
            bits: bitvec![u32, Lsb0; 1; len],
        }
    }

    // Contiguous run constructor for callers that have already bounds-checked.
    fn run_mask(len: usize, low: usize, count: usize) -> Bitmask {
        let mut bits = bitvec![u32, Lsb0; 0; len];
        for pos in low..low + count {
            bits.set(pos, true);
        }
        Bitmask { bits }
    }

    /// Build a Bitmask with a single contiguous run of `count` set bits
    /// starting at bit `low`.
    pub fn with_run(len: usize, low: usize, count: usize) -> Result<Bitmask> {
        if low + count > len {
            bail!(
                "run {}..{} does not fit in a {}-bit mask",
                low,
                low + count,
                len
            );
        }
        Ok(Self::run_mask(len, low, count))
    }

    /// Parse a textual bit spec. Strings containing hex letters or an `0x`
    /// prefix (and no range punctuation) are treated as the hex form;
    /// everything else as the human range form. Schemata masks of all-decimal
    /// digits must go through [`Bitmask::from_hex`] directly, which is what
    /// the schemata parser does.
    pub fn from_spec(len: Option<usize>, spec: &str) -> Result<Bitmask> {
        let s = spec.trim();
        let hexish = s.starts_with("0x")
            || s.chars()
                .any(|c| c.is_ascii_hexdigit() && !c.is_ascii_digit());
        if hexish && !s.contains(['-', '^']) {
            return Self::from_hex(len, s);
        }
        Self::from_ranges(len, s)
    }

    /// Parse the human range form: comma-joined `n` or `n-m` spans, each
    /// optionally prefixed with `^` to clear the span instead of setting it.
    /// Spans apply in order. A `^` span before any positive span is an
    /// error; clearing an already-clear bit is not. When `len` is `None` the
    /// length is inferred as one past the highest positive index.
    pub fn from_ranges(len: Option<usize>, spec: &str) -> Result<Bitmask> {
        let mut spans: Vec<(bool, usize, usize)> = Vec::new();
        let mut seen_positive = false;
        for raw in spec.split(',') {
            let token = raw.trim();
            if token.is_empty() {
                bail!("empty token in bit spec {:?}", spec);
            }
            let (clear, body) = match token.strip_prefix('^') {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            if clear && !seen_positive {
                bail!("negated span {:?} precedes any positive span in {:?}", token, spec);
            }
            let (low, high) = match sscanf!(body, "{usize}-{usize}") {
                Ok((a, b)) => (a, b),
                Err(_) => match sscanf!(body, "{usize}") {
                    Ok(v) => (v, v),
                    Err(_) => bail!("malformed token {:?} in bit spec {:?}", token, spec),
                },
            };
            if low > high {
                bail!("descending span {:?} in bit spec {:?}", token, spec);
            }
            if !clear {
                seen_positive = true;
            }
            spans.push((clear, low, high));
        }

        let nbits = match len {
            Some(l) => l,
            None => spans
                .iter()
                .filter(|(clear, _, _)| !clear)
                .map(|&(_, _, high)| high + 1)
                .max()
                .unwrap_or(0),
        };

        let mut bits = bitvec![u32, Lsb0; 0; nbits];
        for (clear, low, high) in spans {
            if high >= nbits {
                bail!(
                    "bit {} in spec {:?} is out of range for a {}-bit mask",
                    high,
                    spec,
                    nbits
                );
            }
            for pos in low..=high {
                bits.set(pos, !clear);
            }
        }
        Ok(Bitmask { bits })
    }

    /// Parse a big-endian hex string, optionally `0x`-prefixed. Commas are
    /// cosmetic word separators: the string is the concatenation of its
    /// chunks, most-significant first, which accepts both the kernel's
    /// comma-joined 32-bit word format and plain schemata masks. When `len`
    /// is `None` the length is inferred from the digit count.
    pub fn from_hex(len: Option<usize>, spec: &str) -> Result<Bitmask> {
        let joined = spec
            .trim()
            .strip_prefix("0x")
            .unwrap_or(spec.trim())
            .replace(',', "");
        if joined.is_empty() {
            bail!("empty hex mask {:?}", spec);
        }
        let nbits = match len {
            Some(l) => l,
            None => joined.len() * 4,
        };
        let hex_str = if joined.len() % 2 != 0 {
            format!("0{joined}")
        } else {
            joined
        };
        let bytes =
            hex::decode(&hex_str).with_context(|| format!("failed to parse hex mask {spec:?}"))?;

        let mut bits = bitvec![u32, Lsb0; 0; nbits];
        for (index, &val) in bytes.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let pos = index * 8 + lsb;
                if pos >= nbits {
                    bail!(
                        "bit {} in hex mask {:?} is out of range for a {}-bit mask",
                        pos,
                        spec,
                        nbits
                    );
                }
                bits.set(pos, true);
            }
        }
        Ok(Bitmask { bits })
    }

    /// The logical length of the mask in bits.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Count the set bits.
    pub fn weight(&self) -> usize {
        self.bits.count_ones()
    }

    /// True when no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits.count_ones() == 0
    }

    /// The position of the highest set bit, or `None` for an empty mask.
    pub fn max_set_bit(&self) -> Option<usize> {
        self.bits.last_one()
    }

    /// Test a bit. Positions beyond the logical length read as clear.
    pub fn test_bit(&self, pos: usize) -> bool {
        match self.bits.get(pos) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Set a bit in place. Fails if `pos` exceeds the logical length.
    pub fn set_bit(&mut self, pos: usize) -> Result<()> {
        self.check_bit(pos)?;
        self.bits.set(pos, true);
        Ok(())
    }

    /// Clear a bit in place. Fails if `pos` exceeds the logical length.
    pub fn clear_bit(&mut self, pos: usize) -> Result<()> {
        self.check_bit(pos)?;
        self.bits.set(pos, false);
        Ok(())
    }

    fn check_bit(&self, pos: usize) -> Result<()> {
        if pos >= self.bits.len() {
            bail!("bit {} out of range for a {}-bit mask", pos, self.bits.len());
        }
        Ok(())
    }

    fn widened(&self, other: &Bitmask) -> (BitVec<u32, Lsb0>, BitVec<u32, Lsb0>) {
        let len = self.bits.len().max(other.bits.len());
        let mut a = self.bits.clone();
        let mut b = other.bits.clone();
        a.resize(len, false);
        b.resize(len, false);
        (a, b)
    }

    /// Set union, widened to the larger operand length.
    pub fn or(&self, other: &Bitmask) -> Bitmask {
        let (mut a, b) = self.widened(other);
        a |= b;
        Bitmask { bits: a }
    }

    /// Set intersection, widened to the larger operand length.
    pub fn and(&self, other: &Bitmask) -> Bitmask {
        let (mut a, b) = self.widened(other);
        a &= b;
        Bitmask { bits: a }
    }

    /// Symmetric difference, widened to the larger operand length.
    pub fn xor(&self, other: &Bitmask) -> Bitmask {
        let (mut a, b) = self.widened(other);
        a ^= b;
        Bitmask { bits: a }
    }

    /// Asymmetric difference: the bits this mask holds that `other` does
    /// not, i.e. what would need reclaiming from `self` to satisfy `other`'s
    /// absence. Computed as xor-then-and.
    pub fn axor(&self, other: &Bitmask) -> Bitmask {
        self.xor(other).and(self)
    }

    /// Bitwise complement over the logical length.
    pub fn not(&self) -> Bitmask {
        Bitmask {
            bits: !self.bits.clone(),
        }
    }

    /// True when every set bit of `self` is also set in `other`. Lengths do
    /// not have to match.
    pub fn is_subset_of(&self, other: &Bitmask) -> bool {
        self.and(other).weight() == self.weight()
    }

    /// Iterate maximal runs of identical bit value, most-significant run
    /// first.
    pub fn binary_runs(&self) -> BinaryRuns<'_> {
        BinaryRuns {
            mask: self,
            next: self.bits.len().checked_sub(1),
        }
    }

    /// A new Bitmask holding only the single longest run of consecutive set
    /// bits. Ties go to the first run found scanning from the
    /// most-significant end. An empty mask yields an empty mask.
    pub fn max_connective_bits(&self) -> Bitmask {
        let mut best: Option<BitRun> = None;
        for run in self.binary_runs() {
            if !run.value {
                continue;
            }
            match &best {
                Some(b) if b.len() >= run.len() => {}
                _ => best = Some(run),
            }
        }
        match best {
            Some(run) => Self::run_mask(self.len(), run.low, run.len()),
            None => Self::new(self.len()),
        }
    }

    /// Find the first run of at least `count` consecutive set bits, starting
    /// `offset` bits in from the chosen end (`from_low` selects the end), and
    /// return a Bitmask holding exactly the `count`-bit sub-run nearest the
    /// scanned-from end. Returns an empty mask when no such run exists, when
    /// `count` is zero, or when `offset + count` exceeds the length.
    pub fn connective_bits(&self, count: usize, offset: usize, from_low: bool) -> Bitmask {
        let len = self.len();
        if count == 0 || offset + count > len {
            return Self::new(len);
        }
        let mut streak = 0usize;
        if from_low {
            for pos in offset..len {
                streak = if self.test_bit(pos) { streak + 1 } else { 0 };
                if streak == count {
                    return Self::run_mask(len, pos + 1 - count, count);
                }
            }
        } else {
            for pos in (0..len - offset).rev() {
                streak = if self.test_bit(pos) { streak + 1 } else { 0 };
                if streak == count {
                    return Self::run_mask(len, pos, count);
                }
            }
        }
        Self::new(len)
    }

    /// Format as comma-joined 32-bit hex words, most-significant word first.
    /// The top word is printed with minimal width, lower words zero-padded
    /// to eight digits; a zero-length or all-clear mask prints as `0`.
    pub fn to_hex_string(&self) -> String {
        let mut words: Vec<u32> = self.bits.as_raw_slice().to_vec();
        words.truncate(self.len().div_ceil(32));
        if words.is_empty() {
            return "0".to_string();
        }
        // The backing store may carry junk beyond the logical length.
        let rem = self.len() % 32;
        if rem != 0 {
            let last = words.len() - 1;
            words[last] &= (1u32 << rem) - 1;
        }
        let mut out = String::new();
        for (i, word) in words.iter().rev().enumerate() {
            if i == 0 {
                out.push_str(&format!("{word:x}"));
            } else {
                out.push_str(&format!(",{word:08x}"));
            }
        }
        out
    }

    /// Format as an ascending comma-joined range list (`2-3,16,28-31`).
    /// An empty mask formats as the empty string.
    pub fn to_human_string(&self) -> String {
        let mut runs: Vec<BitRun> = self.binary_runs().filter(|r| r.value).collect();
        runs.reverse();
        let mut parts = Vec::new();
        for run in runs {
            if run.low == run.high {
                parts.push(format!("{}", run.low));
            } else {
                parts.push(format!("{}-{}", run.low, run.high));
            }
        }
        parts.join(",")
    }
}

/// One maximal run of identical bit value. `low` and `high` are inclusive
/// bit positions.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BitRun {
    pub value: bool,
    pub low: usize,
    pub high: usize,
}

impl BitRun {
    pub fn len(&self) -> usize {
        self.high - self.low + 1
    }
}

pub struct BinaryRuns<'a> {
    mask: &'a Bitmask,
    next: Option<usize>,
}

impl Iterator for BinaryRuns<'_> {
    type Item = BitRun;

    fn next(&mut self) -> Option<Self::Item> {
        let high = self.next?;
        let value = self.mask.test_bit(high);
        let mut low = high;
        while low > 0 && self.mask.test_bit(low - 1) == value {
            low -= 1;
        }
        self.next = low.checked_sub(1);
        Some(BitRun { value, low, high })
    }
}

impl Default for Bitmask {
    /// A zero-length mask. Widening algebra grows it on first use.
    fn default() -> Bitmask {
        Bitmask::new(0)
    }
}

impl fmt::Display for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_string())
    }
}

impl fmt::LowerHex for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_string())
    }
}
