//! Interval list: the tape as a sequence of silence, leader and data runs.
//!
//! Built once by the initial scan of a loaded tape, and grown tick by tick
//! while recording. The seek bar stripes are painted from it.

use crate::error::{Recoverable, Result, TapeError};
use crate::tone::Tone;

/// Consecutive `'1'` ticks before a run is classed as leader.
pub const LEADER_DETECT_THRESHOLD: u32 = 256;

/// Intervals are allocated in blocks of this many.
const GROW_BY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalKind {
    Silence,
    Leader,
    Data,
}

impl IntervalKind {
    #[must_use]
    pub fn from_tone(tone: Tone) -> Self {
        match tone {
            Tone::Silence => Self::Silence,
            Tone::Leader => Self::Leader,
            Tone::Zero | Tone::One => Self::Data,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Silence => "SILENT",
            Self::Leader => "leader",
            Self::Data => "  data",
        }
    }
}

/// A run of same-class ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub kind: IntervalKind,
    pub start: i32,
    pub len: i32,
}

impl Interval {
    #[must_use]
    pub fn end(&self) -> i32 {
        self.start + self.len
    }
}

#[derive(Debug, Clone, Default)]
struct Decoder {
    leader_detect: u32,
    previous_tone: Option<Tone>,
    wip_kind: Option<IntervalKind>,
    wip_len: i32,
}

/// Append-only interval log plus the incremental decoder that feeds it.
#[derive(Debug, Clone, Default)]
pub struct IntervalList {
    list: Vec<Interval>,
    decoder: Decoder,
}

impl IntervalList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interval. With `deduce_start` the start is taken from the end
    /// of the previous interval (0 for the first).
    pub fn append(&mut self, mut interval: Interval, deduce_start: bool) -> Result<()> {
        if self.list.len() == self.list.capacity() {
            self.list.try_reserve(GROW_BY).map_err(|_| {
                log::warn!("tape: appending to interval list: out of memory");
                TapeError::from(Recoverable::OutOfMemory)
            })?;
        }
        if deduce_start {
            interval.start = self.list.last().map_or(0, Interval::end);
        }
        self.list.push(interval);
        Ok(())
    }

    /// Feed one tick. A change of class commits the interval in progress;
    /// the last one stays pending until [`Self::commit_wip`].
    pub fn send_tone(&mut self, tone: Tone, free_on_error: bool) -> Result<()> {
        let mut tone = tone;
        if tone == Tone::One {
            if self.decoder.leader_detect >= LEADER_DETECT_THRESHOLD {
                tone = Tone::Leader;
            } else {
                self.decoder.leader_detect += 1;
            }
        } else {
            self.decoder.leader_detect = 0;
        }

        let kind = IntervalKind::from_tone(tone);
        if self.decoder.wip_kind.is_none() {
            self.decoder.wip_kind = Some(kind);
        }

        let class_changed = self
            .decoder
            .previous_tone
            .is_some_and(|prev| IntervalKind::from_tone(prev) != kind);
        if class_changed {
            if let Err(e) = self.commit_wip() {
                if free_on_error {
                    self.clear();
                }
                return Err(e);
            }
            self.decoder.wip_kind = Some(kind);
        }

        self.decoder.wip_len += 1;
        self.decoder.previous_tone = Some(tone);
        Ok(())
    }

    /// Flush the interval in progress onto the list.
    pub fn commit_wip(&mut self) -> Result<()> {
        if let Some(kind) = self.decoder.wip_kind.take() {
            let len = std::mem::take(&mut self.decoder.wip_len);
            if len > 0 {
                self.append(
                    Interval {
                        kind,
                        start: 0,
                        len,
                    },
                    true,
                )?;
            }
        }
        self.decoder.wip_len = 0;
        Ok(())
    }

    /// Check that every interval starts where the previous one ended.
    pub fn integrity_check(&self) -> Result<()> {
        let first_start = self.list.first().map_or(0, |iv| iv.start);
        if first_start != 0 {
            return Err(TapeError::bug(format!(
                "interval list starts at {first_start}, not 0"
            )));
        }
        for (i, pair) in self.list.windows(2).enumerate() {
            if pair[0].end() != pair[1].start {
                return Err(TapeError::bug(format!(
                    "interval list integrity failure: list[{i}]=({} + {}), but [{}]'s start is {}",
                    pair[0].start,
                    pair[0].len,
                    i + 1,
                    pair[1].start
                )));
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.list.clear();
        self.decoder = Decoder::default();
    }

    #[must_use]
    pub fn intervals(&self) -> &[Interval] {
        &self.list
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// End of the last committed interval.
    #[must_use]
    pub fn end(&self) -> i32 {
        self.list.last().map_or(0, Interval::end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(list: &mut IntervalList, tone: Tone, n: usize) {
        for _ in 0..n {
            list.send_tone(tone, false).unwrap();
        }
    }

    #[test]
    fn class_changes_commit_contiguous_intervals() {
        let mut list = IntervalList::new();
        feed(&mut list, Tone::Silence, 10);
        feed(&mut list, Tone::Zero, 5);
        feed(&mut list, Tone::Silence, 3);
        list.commit_wip().unwrap();

        let iv = list.intervals();
        assert_eq!(iv.len(), 3);
        assert_eq!(iv[0].start, 0);
        assert_eq!(iv[0].kind, IntervalKind::Silence);
        assert_eq!(iv[1].start, 10);
        assert_eq!(iv[1].len, 5);
        assert_eq!(iv[2].end(), 18);
        list.integrity_check().unwrap();
    }

    #[test]
    fn long_runs_of_ones_become_leader() {
        let mut list = IntervalList::new();
        feed(&mut list, Tone::One, 400);
        feed(&mut list, Tone::Zero, 1);
        list.commit_wip().unwrap();

        let iv = list.intervals();
        assert_eq!(iv[0].kind, IntervalKind::Data);
        assert_eq!(iv[0].len, LEADER_DETECT_THRESHOLD as i32);
        assert_eq!(iv[1].kind, IntervalKind::Leader);
        assert_eq!(iv[1].len, 400 - LEADER_DETECT_THRESHOLD as i32);
        assert_eq!(iv[2].kind, IntervalKind::Data);
        assert_eq!(list.end(), 401);
    }

    #[test]
    fn wip_is_not_visible_until_committed() {
        let mut list = IntervalList::new();
        feed(&mut list, Tone::Zero, 7);
        assert!(list.is_empty());
        list.commit_wip().unwrap();
        assert_eq!(list.len(), 1);
        list.commit_wip().unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn integrity_check_catches_gaps() {
        let mut list = IntervalList::new();
        let iv = Interval {
            kind: IntervalKind::Data,
            start: 0,
            len: 5,
        };
        list.append(iv, false).unwrap();
        list.append(Interval { start: 7, ..iv }, false).unwrap();
        assert!(list.integrity_check().is_err());
    }
}
