//! Affinity mask and cpulist codecs
//!
//! The kernel prints affinity masks (`Cpus_allowed` in `/proc/<pid>/status`)
//! as hex in comma-separated 32-bit groups, most significant group first:
//! `ff` on an 8-CPU host, `ffffffff,ffffffff` on a 64-CPU host and so on.
//! Masks are treated as bit strings of arbitrary length, never as a fixed
//! width integer, so hosts with more than 64 logical cores decode correctly.
//!
//! Topology files and `taskset -c` use the cpulist format instead: `0,2-5,7`.

use crate::error::{Result, TidyError};
use crate::models::CoreSet;
use std::fmt;
use std::str::FromStr;

/// Hex digits per comma-separated group
const GROUP_DIGITS: usize = 8;

/// Arbitrary-width CPU affinity mask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuMask {
    /// Bit words, least significant first
    words: Vec<u64>,
    /// Number of hex digits in the textual form
    digits: usize,
}

impl CpuMask {
    /// Parse a kernel hex mask such as `00000000,000000ff`
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(TidyError::parse("affinity mask", "empty mask"));
        }

        let mut nibbles = Vec::with_capacity(trimmed.len());
        for group in trimmed.split(',') {
            if group.is_empty() {
                return Err(TidyError::parse(
                    "affinity mask",
                    format!("empty group in {:?}", trimmed),
                ));
            }
            for ch in group.chars() {
                let value = ch.to_digit(16).ok_or_else(|| {
                    TidyError::parse("affinity mask", format!("invalid hex digit {:?}", ch))
                })?;
                nibbles.push(value as u64);
            }
        }

        let digits = nibbles.len();
        let mut words = vec![0u64; digits.div_ceil(16)];
        for (position, nibble) in nibbles.iter().rev().enumerate() {
            let bit = position * 4;
            words[bit / 64] |= nibble << (bit % 64);
        }

        Ok(Self { words, digits })
    }

    /// Smallest mask holding every core in `cores`
    pub fn from_cores(cores: &CoreSet) -> Self {
        Self::with_width(cores, 0)
    }

    /// Mask printed with at least `digits` hex digits
    pub fn with_width(cores: &CoreSet, digits: usize) -> Self {
        let needed = cores
            .iter()
            .next_back()
            .map(|max| (*max as usize) / 4 + 1)
            .unwrap_or(1);
        let digits = digits.max(needed);

        let mut words = vec![0u64; digits.div_ceil(16)];
        for core in cores {
            let bit = *core as usize;
            words[bit / 64] |= 1u64 << (bit % 64);
        }

        Self { words, digits }
    }

    /// Decoded core ids, ascending
    pub fn cores(&self) -> CoreSet {
        let mut cores = CoreSet::new();
        for (index, word) in self.words.iter().enumerate() {
            let mut remaining = *word;
            while remaining != 0 {
                let bit = remaining.trailing_zeros();
                cores.insert(index as u32 * 64 + bit);
                remaining &= remaining - 1;
            }
        }
        cores
    }

    pub fn contains(&self, core: u32) -> bool {
        let bit = core as usize;
        self.words
            .get(bit / 64)
            .map(|word| word & (1u64 << (bit % 64)) != 0)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Width of the mask in bits
    pub fn width_bits(&self) -> usize {
        self.digits * 4
    }

    pub fn digits(&self) -> usize {
        self.digits
    }

    fn nibble(&self, position: usize) -> u64 {
        let bit = position * 4;
        self.words
            .get(bit / 64)
            .map(|word| (word >> (bit % 64)) & 0xf)
            .unwrap_or(0)
    }
}

impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::with_capacity(self.digits + self.digits / GROUP_DIGITS);
        for position in (0..self.digits).rev() {
            let value = self.nibble(position) as u32;
            out.push(char::from_digit(value, 16).unwrap_or('0'));
            if position != 0 && position % GROUP_DIGITS == 0 {
                out.push(',');
            }
        }
        f.write_str(&out)
    }
}

impl FromStr for CpuMask {
    type Err = TidyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parse kernel cpulist format: `3`, `0,6`, `0-2,6-8`
pub fn parse_cpu_list(input: &str) -> Result<CoreSet> {
    let mut cores = CoreSet::new();

    for part in input.trim().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start
                .trim()
                .parse()
                .map_err(|_| TidyError::parse("cpu list", format!("bad range {:?}", part)))?;
            let end: u32 = end
                .trim()
                .parse()
                .map_err(|_| TidyError::parse("cpu list", format!("bad range {:?}", part)))?;
            if end < start {
                return Err(TidyError::parse(
                    "cpu list",
                    format!("descending range {:?}", part),
                ));
            }
            cores.extend(start..=end);
        } else {
            let core: u32 = part
                .parse()
                .map_err(|_| TidyError::parse("cpu list", format!("bad entry {:?}", part)))?;
            cores.insert(core);
        }
    }

    Ok(cores)
}

/// Format a core set as a cpulist, collapsing runs: `[0, 2, 3, 4]` -> `0,2-4`
pub fn format_cpu_list(cores: &CoreSet) -> String {
    let mut parts = Vec::new();
    let mut iter = cores.iter().copied();

    let Some(first) = iter.next() else {
        return String::new();
    };

    let (mut start, mut end) = (first, first);
    for core in iter {
        if end.checked_add(1) == Some(core) {
            end = core;
            continue;
        }
        parts.push(range_text(start, end));
        start = core;
        end = core;
    }
    parts.push(range_text(start, end));

    parts.join(",")
}

fn range_text(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}
