//! Outgoing side of a worker: partitions produced tuples into
//! per-destination queues and flushes them as sequence-numbered payloads.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use log::debug;

use super::flow::LinkHandle;
use super::{GrainId, LinkError, PayloadMessage};
use crate::tuple::{TableId, Tuple};

/// How a shuffle extracts the partition key from a tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShuffleKey {
    /// Hash one field, the same for every tuple.
    Field(usize),
    /// Hash a different field depending on the tuple's originating table,
    /// so both join sides of one key land on the same partition.
    ByTable {
        build: TableId,
        build_field: usize,
        probe_field: usize,
    },
}

impl ShuffleKey {
    pub fn partition(&self, tuple: &Tuple, destinations: usize) -> usize {
        let index = match self {
            ShuffleKey::Field(i) => *i,
            ShuffleKey::ByTable {
                build,
                build_field,
                probe_field,
            } => {
                if tuple.table() == *build {
                    *build_field
                } else {
                    *probe_field
                }
            }
        };
        let Some(value) = tuple.field(index) else {
            debug!("tuple of arity {} has no shuffle field {index}", tuple.arity());
            return 0;
        };
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        (hasher.finish() % destinations as u64) as usize
    }
}

struct Destination {
    link: LinkHandle,
    queue: Vec<Tuple>,
    next_seq: u64,
}

impl Destination {
    fn new(link: LinkHandle) -> Self {
        Destination {
            link,
            queue: Vec::new(),
            next_seq: 0,
        }
    }

    fn flush(&mut self, sender: GrainId, upto: usize) -> Result<(), LinkError> {
        let tuples: Vec<Tuple> = self.queue.drain(..upto).collect();
        let msg = PayloadMessage::data(sender, self.next_seq, tuples);
        self.next_seq += 1;
        self.link.send(msg)
    }
}

enum Router {
    RoundRobin { cursor: usize },
    Shuffle(ShuffleKey),
    Stream,
}

/// One outgoing edge of a worker: a routing policy over a set of
/// flow-controlled destinations plus the per-destination batch queues.
pub struct SendingStrategy {
    router: Router,
    destinations: Vec<Destination>,
    batch_size: usize,
}

impl SendingStrategy {
    pub fn round_robin(links: Vec<LinkHandle>, batch_size: usize) -> Self {
        Self::build(Router::RoundRobin { cursor: 0 }, links, batch_size)
    }

    pub fn shuffle(key: ShuffleKey, links: Vec<LinkHandle>, batch_size: usize) -> Self {
        Self::build(Router::Shuffle(key), links, batch_size)
    }

    /// Emits everything to one logical output stream (terminal operators).
    pub fn stream(link: LinkHandle, batch_size: usize) -> Self {
        Self::build(Router::Stream, vec![link], batch_size)
    }

    fn build(router: Router, links: Vec<LinkHandle>, batch_size: usize) -> Self {
        SendingStrategy {
            router,
            destinations: links.into_iter().map(Destination::new).collect(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn enqueue(&mut self, tuple: Tuple) {
        let n = self.destinations.len();
        let index = match &mut self.router {
            Router::RoundRobin { cursor } => {
                let index = *cursor % n;
                *cursor += 1;
                index
            }
            Router::Shuffle(key) => key.partition(&tuple, n),
            Router::Stream => 0,
        };
        self.destinations[index].queue.push(tuple);
    }

    /// Flushes every queue that has reached the batch size, repeatedly,
    /// until no full batch remains.
    pub fn send_batched(&mut self, sender: GrainId) -> Result<(), LinkError> {
        for dest in &mut self.destinations {
            while dest.queue.len() >= self.batch_size {
                dest.flush(sender, self.batch_size)?;
            }
        }
        Ok(())
    }

    /// Flushes every remaining partial queue, then sends exactly one
    /// end-of-stream sentinel to every destination, including those that
    /// never received data.
    pub fn send_end(&mut self, sender: GrainId) -> Result<(), LinkError> {
        for dest in &mut self.destinations {
            if !dest.queue.is_empty() {
                let upto = dest.queue.len();
                dest.flush(sender, upto)?;
            }
            let end = PayloadMessage::end(sender, dest.next_seq);
            dest.next_seq += 1;
            dest.link.send(end)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::tuple::FieldValue;

    const SENDER: GrainId = GrainId::new(1, 0, 0);

    fn row(key: i64) -> Tuple {
        Tuple::new(TableId(1), [FieldValue::Int(key)])
    }

    fn fake_links(n: usize) -> (Vec<LinkHandle>, Vec<mpsc::UnboundedReceiver<PayloadMessage>>) {
        (0..n)
            .map(|i| {
                let (tx, rx) = mpsc::unbounded_channel();
                (LinkHandle::direct(GrainId::new(9, 0, i as u16), tx), rx)
            })
            .unzip()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PayloadMessage>) -> Vec<PayloadMessage> {
        let mut out = vec![];
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn round_robin_rotates_and_batches() {
        let (links, mut rxs) = fake_links(2);
        let mut strategy = SendingStrategy::round_robin(links, 2);
        for key in 0..5 {
            strategy.enqueue(row(key));
        }
        strategy.send_batched(SENDER).unwrap();
        strategy.send_end(SENDER).unwrap();

        // tuples 0,2,4 rotate onto the first destination, 1,3 onto the second
        let first = drain(&mut rxs[0]);
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].tuples, vec![row(0), row(2)]);
        assert_eq!(first[1].tuples, vec![row(4)]);
        assert!(first[2].is_end);
        assert_eq!(
            first.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let second = drain(&mut rxs[1]);
        assert_eq!(second[0].tuples, vec![row(1), row(3)]);
        assert!(second[1].is_end);
    }

    #[test]
    fn send_batched_drains_multiple_full_batches() {
        let (links, mut rxs) = fake_links(1);
        let mut strategy = SendingStrategy::stream(links.into_iter().next().unwrap(), 2);
        for key in 0..6 {
            strategy.enqueue(row(key));
        }
        strategy.send_batched(SENDER).unwrap();
        let msgs = drain(&mut rxs[0]);
        assert_eq!(msgs.len(), 3);
        assert!(msgs.iter().all(|m| m.tuples.len() == 2 && !m.is_end));
    }

    #[test]
    fn shuffle_sends_equal_keys_to_one_destination() {
        let (links, mut rxs) = fake_links(4);
        let key = ShuffleKey::Field(0);
        let mut strategy = SendingStrategy::shuffle(key.clone(), links, 1);
        for _ in 0..3 {
            strategy.enqueue(row(42));
        }
        strategy.send_batched(SENDER).unwrap();

        let chosen = key.partition(&row(42), 4);
        assert_eq!(drain(&mut rxs[chosen]).len(), 3);
        for (i, rx) in rxs.iter_mut().enumerate() {
            if i != chosen {
                assert!(drain(rx).is_empty());
            }
        }
    }

    #[test]
    fn by_table_key_co_partitions_both_sides() {
        let build = TableId(1);
        let key = ShuffleKey::ByTable {
            build,
            build_field: 0,
            probe_field: 1,
        };
        let build_row = Tuple::new(build, [FieldValue::Int(7)]);
        let probe_row = Tuple::new(
            TableId(2),
            [FieldValue::String("x".into()), FieldValue::Int(7)],
        );
        assert_eq!(key.partition(&build_row, 5), key.partition(&probe_row, 5));
    }

    #[test]
    fn every_destination_gets_exactly_one_end() {
        let (links, mut rxs) = fake_links(3);
        let mut strategy = SendingStrategy::shuffle(ShuffleKey::Field(0), links, 8);
        strategy.enqueue(row(1));
        strategy.send_end(SENDER).unwrap();

        for rx in &mut rxs {
            let msgs = drain(rx);
            assert_eq!(msgs.iter().filter(|m| m.is_end).count(), 1);
            assert!(msgs.last().unwrap().is_end);
            // sequence numbers stay contiguous from zero on every link
            for (i, m) in msgs.iter().enumerate() {
                assert_eq!(m.seq, i as u64);
            }
        }
    }
}
