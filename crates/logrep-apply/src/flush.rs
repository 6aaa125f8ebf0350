//! Flush-position tracking and feedback to the publisher.
//!
//! Every applied commit appends `(remote end LSN, local commit LSN)` to a
//! FIFO ring. Once local WAL is flushed past an entry's local LSN, the
//! remote LSN can be confirmed to the publisher as flushed and the entry is
//! dropped.

use crate::lsn::Lsn;
use crate::proto::StandbyStatusUpdate;
use crate::types::TimestampTz;
use std::collections::VecDeque;
use std::time::Duration;

/// One applied commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPosition {
    /// End LSN of the remote commit.
    pub remote_end: Lsn,
    /// Local commit LSN.
    pub local_end: Lsn,
}

/// FIFO of applied commits not yet known flushed.
#[derive(Debug, Default)]
pub struct FlushRing {
    entries: VecDeque<FlushPosition>,
}

/// Result of draining the ring against the local flush LSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushProgress {
    /// Largest remote LSN whose local commit is flushed.
    pub flushed: Option<Lsn>,
    /// Remote end of the newest entry still waiting for a local flush.
    pub pending: Option<Lsn>,
}

impl FlushRing {
    /// Empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an applied commit.
    pub fn push(&mut self, remote_end: Lsn, local_end: Lsn) {
        self.entries.push_back(FlushPosition {
            remote_end,
            local_end,
        });
    }

    /// Pops every entry flushed locally.
    pub fn drain_flushed(&mut self, local_flush: Lsn) -> FlushProgress {
        let mut progress = FlushProgress::default();
        while let Some(front) = self.entries.front() {
            if front.local_end > local_flush {
                break;
            }
            progress.flushed = Some(front.remote_end);
            self.entries.pop_front();
        }
        progress.pending = self.entries.back().map(|p| p.remote_end);
        progress
    }

    /// Entries still waiting.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &FlushPosition> {
        self.entries.iter()
    }
}

/// What was last reported, so replies never move backwards.
#[derive(Debug, Default)]
pub struct FeedbackState {
    ring: FlushRing,
    last_recv: Lsn,
    last_write: Lsn,
    last_flush: Lsn,
    last_send: Option<TimestampTz>,
}

impl FeedbackState {
    /// Fresh state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an applied commit.
    pub fn store_flush_position(&mut self, remote_end: Lsn, local_end: Lsn) {
        self.ring.push(remote_end, local_end);
    }

    /// Notes the end of the latest received chunk.
    pub fn received(&mut self, lsn: Lsn) {
        if lsn > self.last_recv {
            self.last_recv = lsn;
        }
    }

    /// Last received LSN.
    pub fn last_received(&self) -> Lsn {
        self.last_recv
    }

    /// Last flush LSN reported.
    pub fn last_flush(&self) -> Lsn {
        self.last_flush
    }

    /// The ring, for inspection.
    pub fn ring(&self) -> &FlushRing {
        &self.ring
    }

    /// Builds the next status reply, or `None` when nothing moved and the
    /// status interval has not elapsed. With nothing waiting in the ring
    /// everything received counts as flushed.
    pub fn build_reply(
        &mut self,
        local_flush: Lsn,
        now: TimestampTz,
        status_interval: Duration,
        force: bool,
        reply_requested: bool,
    ) -> Option<StandbyStatusUpdate> {
        let progress = self.ring.drain_flushed(local_flush);
        let (mut write, mut flush) = match progress.pending {
            None => (self.last_recv, self.last_recv),
            Some(pending) => (pending, progress.flushed.unwrap_or(self.last_flush)),
        };
        write = write.max(self.last_write);
        flush = flush.max(self.last_flush);

        let interval_us = i64::try_from(status_interval.as_micros()).unwrap_or(i64::MAX);
        let due = self
            .last_send
            .map_or(true, |sent| now.saturating_sub(sent) >= interval_us);
        if !force && write == self.last_write && flush == self.last_flush && !due {
            return None;
        }
        self.last_write = write;
        self.last_flush = flush;
        self.last_send = Some(now);
        Some(StandbyStatusUpdate {
            write_lsn: self.last_recv,
            flush_lsn: flush,
            apply_lsn: flush,
            send_time: now,
            reply_requested,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SEC: Duration = Duration::from_secs(10);

    #[test]
    fn test_only_flushed_entries_are_reported() {
        let mut fb = FeedbackState::new();
        fb.received(Lsn(0x300));
        fb.store_flush_position(Lsn(0x108), Lsn(0x1000));
        fb.store_flush_position(Lsn(0x208), Lsn(0x2000));

        let r = fb.build_reply(Lsn(0x1500), 1, SEC, true, false).unwrap();
        assert_eq!(r.write_lsn, Lsn(0x300));
        assert_eq!(r.flush_lsn, Lsn(0x108));
        assert_eq!(fb.ring().len(), 1);

        let r = fb.build_reply(Lsn(0x2000), 2, SEC, true, false).unwrap();
        assert_eq!(r.flush_lsn, Lsn(0x300));
        assert!(fb.ring().is_empty());
    }

    #[test]
    fn test_unchanged_reply_suppressed_until_interval() {
        let mut fb = FeedbackState::new();
        fb.received(Lsn(0x10));
        assert!(fb.build_reply(Lsn(0), 0, SEC, false, false).is_some());
        assert!(fb.build_reply(Lsn(0), 1_000, SEC, false, false).is_none());
        assert!(fb.build_reply(Lsn(0), 10_000_000, SEC, false, false).is_some());
        assert!(fb.build_reply(Lsn(0), 10_000_001, SEC, true, true).unwrap().reply_requested);
    }

    proptest! {
        #[test]
        fn prop_ring_sorted_and_flush_monotone(
            steps in proptest::collection::vec((1u64..100, 1u64..100, 0u64..300), 1..40)
        ) {
            let mut fb = FeedbackState::new();
            let (mut remote, mut local) = (0u64, 0u64);
            let mut last_flush = Lsn::INVALID;
            for (i, (dr, dl, flush_back)) in steps.into_iter().enumerate() {
                remote += dr;
                local += dl;
                fb.received(Lsn(remote));
                fb.store_flush_position(Lsn(remote), Lsn(local));
                let ring: Vec<_> = fb.ring().iter().copied().collect();
                for pair in ring.windows(2) {
                    prop_assert!(pair[0].remote_end <= pair[1].remote_end);
                    prop_assert!(pair[0].local_end <= pair[1].local_end);
                }
                let local_flush = Lsn(local.saturating_sub(flush_back));
                if let Some(reply) = fb.build_reply(local_flush, i as i64, SEC, true, false) {
                    prop_assert!(reply.flush_lsn >= last_flush);
                    prop_assert!(reply.flush_lsn <= reply.write_lsn);
                    last_flush = reply.flush_lsn;
                }
            }
        }
    }
}
