// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{collections::HashMap, time::Duration};

use crate::ranges::SourceRange;

/// Reference counted set of source ranges belonging to sounding events.
///
/// Overlapping events covering the same range keep it active until the last
/// one ends. Releases carry the generation they were acquired in so that
/// timers outliving a [`ActiveRanges::clear`] are ignored.
#[derive(Debug, Default)]
pub(crate) struct ActiveRanges {
    counts: HashMap<String, (SourceRange, usize)>,
    generation: u64,
}

impl ActiveRanges {
    /// Adds one reference to each range. Returns the current generation.
    pub fn acquire(&mut self, ranges: &[SourceRange]) -> u64 {
        for range in ranges {
            self.counts
                .entry(range.key())
                .or_insert((*range, 0))
                .1 += 1;
        }
        self.generation
    }

    /// Drops one reference to each range. Returns false if the ranges were
    /// acquired before the last clear.
    pub fn release(&mut self, ranges: &[SourceRange], generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        for range in ranges {
            let key = range.key();
            if let Some((_, count)) = self.counts.get_mut(&key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.counts.remove(&key);
                }
            }
        }
        true
    }

    /// Forgets every range.
    pub fn clear(&mut self) {
        self.counts.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// The active ranges in source order.
    pub fn active(&self) -> Vec<SourceRange> {
        let mut active: Vec<SourceRange> = self.counts.values().map(|(range, _)| *range).collect();
        active.sort();
        active
    }

    #[cfg(test)]
    pub fn count(&self, range: &SourceRange) -> usize {
        self.counts
            .get(&range.key())
            .map(|(_, count)| *count)
            .unwrap_or_default()
    }
}

/// How long an event's ranges stay active: its duration plus a small padding.
/// Negative, non-finite or absurd durations are treated as zero or saturate.
pub(crate) fn hold_time(duration_secs: f64, padding: Duration) -> Duration {
    let secs = if duration_secs.is_finite() {
        duration_secs.max(0.0)
    } else {
        0.0
    };
    Duration::try_from_secs_f64(secs)
        .unwrap_or(Duration::MAX)
        .saturating_add(padding)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_overlapping_references() {
        let mut ranges = ActiveRanges::default();
        let shared = SourceRange::new(4, 6);
        let other = SourceRange::new(8, 10);

        let generation = ranges.acquire(&[shared]);
        ranges.acquire(&[shared, other]);
        assert_eq!(2, ranges.count(&shared));
        assert_eq!(vec![shared, other], ranges.active());

        assert!(ranges.release(&[shared], generation));
        assert_eq!(vec![shared, other], ranges.active());

        assert!(ranges.release(&[shared, other], generation));
        assert!(ranges.active().is_empty());

        // Releasing something that isn't held is harmless.
        assert!(ranges.release(&[shared], generation));
        assert_eq!(0, ranges.count(&shared));
    }

    #[test]
    fn test_clear_invalidates_pending_releases() {
        let mut ranges = ActiveRanges::default();
        let range = SourceRange::new(0, 2);
        let stale = ranges.acquire(&[range]);
        ranges.clear();
        assert!(ranges.active().is_empty());

        let fresh = ranges.acquire(&[range]);
        assert!(!ranges.release(&[range], stale));
        assert_eq!(vec![range], ranges.active());
        assert!(ranges.release(&[range], fresh));
        assert!(ranges.active().is_empty());
    }

    #[test]
    fn test_hold_time() {
        let padding = Duration::from_millis(10);
        assert_eq!(Duration::from_millis(510), hold_time(0.5, padding));
        assert_eq!(padding, hold_time(-1.0, padding));
        assert_eq!(padding, hold_time(f64::NAN, padding));
        assert_eq!(Duration::MAX, hold_time(1e300, padding));
    }
}
