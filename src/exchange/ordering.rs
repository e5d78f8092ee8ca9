//! Per-sender sequence tracking: gap stashing, duplicate dropping and
//! in-order release. The transport may retry, reorder or duplicate
//! messages; everything downstream of this module sees each sequence
//! number exactly once, in ascending order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use log::debug;

use super::{GrainId, PayloadMessage};

#[derive(Default)]
pub struct OrderingEnforcer {
    /// Next sequence number expected from each sender.
    expected: HashMap<GrainId, u64>,
    /// Messages that arrived ahead of their turn, keyed by sequence number.
    stashed: HashMap<GrainId, BTreeMap<u64, PayloadMessage>>,
}

impl OrderingEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits one message. Returns it if its sequence number is the next
    /// expected one for its sender (advancing the counter); stashes it and
    /// returns `None` if it is ahead; drops it and returns `None` if it is
    /// behind (an already-processed duplicate from a retry).
    pub fn pre_process(&mut self, msg: PayloadMessage) -> Option<PayloadMessage> {
        let expected = self.expected.entry(msg.sender).or_insert(0);
        match msg.seq.cmp(expected) {
            Ordering::Equal => {
                *expected += 1;
                Some(msg)
            }
            Ordering::Greater => {
                let stash = self.stashed.entry(msg.sender).or_default();
                if stash.insert(msg.seq, msg).is_some() {
                    debug!("dropped duplicate of a stashed message");
                }
                None
            }
            Ordering::Less => {
                debug!(
                    "dropped stale message from {}: seq {} already processed (expecting {})",
                    msg.sender, msg.seq, expected
                );
                None
            }
        }
    }

    /// Releases the next contiguously-stashed message, if any sender's gap
    /// has been filled. Call repeatedly after each `pre_process` until it
    /// returns `None`.
    pub fn post_process(&mut self) -> Option<PayloadMessage> {
        for (sender, stash) in &mut self.stashed {
            let expected = self.expected.entry(*sender).or_insert(0);
            if let Some(first) = stash.keys().next().copied() {
                if first == *expected {
                    *expected += 1;
                    return stash.remove(&first);
                }
            }
        }
        None
    }

    /// Number of messages currently held back waiting for a gap to fill.
    pub fn stashed_count(&self) -> usize {
        self.stashed.values().map(|s| s.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    const SENDER: GrainId = GrainId::new(1, 0, 0);

    fn msg(seq: u64) -> PayloadMessage {
        PayloadMessage::data(SENDER, seq, vec![])
    }

    fn feed(enforcer: &mut OrderingEnforcer, seqs: &[u64]) -> Vec<u64> {
        let mut released = vec![];
        for &seq in seqs {
            if let Some(m) = enforcer.pre_process(msg(seq)) {
                released.push(m.seq);
                while let Some(next) = enforcer.post_process() {
                    released.push(next.seq);
                }
            }
        }
        released
    }

    #[test_case(&[0, 1, 2, 3] ; "already in order")]
    #[test_case(&[3, 2, 1, 0] ; "fully reversed")]
    #[test_case(&[1, 0, 3, 2] ; "pairwise swapped")]
    #[test_case(&[2, 3, 0, 1] ; "rotated")]
    #[test_case(&[0, 0, 1, 1, 2, 2, 3, 3] ; "every message duplicated")]
    #[test_case(&[3, 3, 0, 2, 1, 0] ; "reordered with duplicates")]
    fn releases_ascending_exactly_once(seqs: &[u64]) {
        let mut enforcer = OrderingEnforcer::new();
        assert_eq!(feed(&mut enforcer, seqs), vec![0, 1, 2, 3]);
        assert_eq!(enforcer.stashed_count(), 0);
    }

    #[test]
    fn duplicate_after_gap_fill_is_dropped() {
        let mut enforcer = OrderingEnforcer::new();
        assert_eq!(feed(&mut enforcer, &[0, 2, 1, 0]), vec![0, 1, 2]);
    }

    #[test]
    fn senders_are_tracked_independently() {
        let other = GrainId::new(2, 0, 0);
        let mut enforcer = OrderingEnforcer::new();
        assert!(enforcer.pre_process(msg(1)).is_none());
        let released = enforcer
            .pre_process(PayloadMessage::data(other, 0, vec![]))
            .unwrap();
        assert_eq!(released.sender, other);
        assert_eq!(enforcer.stashed_count(), 1);
        assert!(enforcer.pre_process(msg(0)).is_some());
        assert_eq!(enforcer.post_process().unwrap().seq, 1);
    }

    #[test]
    fn stash_holds_only_the_gap() {
        let mut enforcer = OrderingEnforcer::new();
        for seq in [5, 3, 1] {
            assert!(enforcer.pre_process(msg(seq)).is_none());
        }
        assert_eq!(enforcer.stashed_count(), 3);
        assert!(enforcer.pre_process(msg(0)).is_some());
        assert_eq!(enforcer.post_process().unwrap().seq, 1);
        assert!(enforcer.post_process().is_none());
        assert_eq!(enforcer.stashed_count(), 2);
    }
}
