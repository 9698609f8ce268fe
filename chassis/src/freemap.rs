// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

/// This is a simple structure for tracking and allocating integers from a
/// pre-defined range.  It is used to hand out hardware trunk numbers on each
/// unit.
use std::cmp::Ord;
use std::cmp::Ordering;

use crate::types::ChassisError;
use crate::types::ChassisResult;

use slog::debug;

/// A Span represents a contiguous range of integers, where the range is closed
/// on the bottom and open on the top.  In other words, a Span{1,4} will include
/// 1, 2, and 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    low: u32,
    high: u32,
}

impl Span {
    /// Create a new Span with the given bounds
    fn new(low: u32, high: u32) -> Self {
        Span { low, high }
    }

    fn contains(&self, idx: u32) -> bool {
        self.low <= idx && idx < self.high
    }

    fn is_empty(&self) -> bool {
        self.low >= self.high
    }
}

impl PartialOrd for Span {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// In the general case Ord is not well-defined for Spans, as they can be
// overlapping in several different ways.  This implementation produces correct
// results for our specific use case, as we know that spans will be
// non-overlapping.
impl Ord for Span {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.high <= other.low {
            Ordering::Less
        } else if self.low >= other.high {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// A FreeMap represents a managed range of integers `[low, high)`.
/// Allocation always returns the lowest free value, so numbering is dense and
/// reproducible.
pub struct FreeMap {
    // Where debug messages are logged
    log: slog::Logger,
    name: String,
    // All of the free ranges, ordered by their offset and never adjacent.
    freelist: Vec<Span>,
}

impl FreeMap {
    pub fn new(
        log: &slog::Logger,
        name: impl ToString,
        low: u32,
        high: u32,
    ) -> Self {
        let name = name.to_string();
        let log = log.new(slog::o!("unit" => format!("freemap_{name}")));
        debug!(log, "created new freemap";
            "low" => low,
            "high" => high);
        let span = Span::new(low, high);
        FreeMap {
            log,
            name,
            freelist: if span.is_empty() { Vec::new() } else { vec![span] },
        }
    }

    /// Allocate the lowest available value.
    pub fn alloc(&mut self) -> ChassisResult<u32> {
        let Some(span) = self.freelist.first_mut() else {
            return Err(ChassisError::Invalid(format!(
                "no free entries left in {}",
                self.name
            )));
        };
        let idx = span.low;
        span.low += 1;
        if span.is_empty() {
            self.freelist.remove(0);
        }
        slog::trace!(self.log, "allocated {idx}");
        Ok(idx)
    }

    /// Claim a specific value, typically one allocated before this map was
    /// built.  Fails if the value is out of range or already taken.
    pub fn reserve(&mut self, idx: u32) -> ChassisResult<()> {
        let target = Span::new(idx, idx.saturating_add(1));
        let Ok(pos) = self.freelist.binary_search(&target) else {
            return Err(ChassisError::Invalid(format!(
                "{idx} is not available in {}",
                self.name
            )));
        };

        let span = self.freelist[pos];
        debug_assert!(span.contains(idx));
        let below = Span::new(span.low, idx);
        let above = Span::new(idx + 1, span.high);
        self.freelist.remove(pos);
        if !above.is_empty() {
            self.freelist.insert(pos, above);
        }
        if !below.is_empty() {
            self.freelist.insert(pos, below);
        }
        Ok(())
    }

    #[cfg(test)]
    fn first(&self) -> Option<Span> {
        self.freelist.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Drain;

    fn new_freemap(low: u32, high: u32) -> FreeMap {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let log = slog::Logger::root(drain, slog::o!());
        FreeMap::new(&log, "test", low, high)
    }

    // sanity check the Ord implementation for span
    #[test]
    fn test_ordering() {
        let a = Span::new(0, 5);
        let b = Span::new(5, 10);
        let c = Span::new(10, 15);

        assert!(a < b);
        assert!(a < c);
        assert!(b < c);
        assert!(c > a);
        assert_eq!(a.cmp(&Span::new(3, 4)), Ordering::Equal);
    }

    #[test]
    fn test_basic() -> anyhow::Result<()> {
        let mut map = new_freemap(1, 128);

        assert_eq!(map.alloc()?, 1);
        assert_eq!(map.first().unwrap(), Span::new(2, 128));
        assert_eq!(map.alloc()?, 2);
        assert_eq!(map.first().unwrap(), Span::new(3, 128));
        Ok(())
    }

    #[test]
    fn test_reserve() -> anyhow::Result<()> {
        let mut map = new_freemap(1, 10);

        map.reserve(1)?;
        map.reserve(3)?;
        assert!(map.reserve(3).is_err());
        assert!(map.reserve(10).is_err());
        assert_eq!(map.alloc()?, 2);
        assert_eq!(map.alloc()?, 4);
        Ok(())
    }

    #[test]
    fn test_exhaustion() -> anyhow::Result<()> {
        let mut map = new_freemap(0, 8);

        for _ in 0..8 {
            map.alloc().expect("exhausted pool prematurely");
        }
        map.alloc().unwrap_err();
        map.reserve(5).unwrap_err();
        Ok(())
    }
}
