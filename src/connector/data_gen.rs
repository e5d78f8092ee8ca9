use std::time::Duration;

use futures::StreamExt;

use super::{BoxTupleStream, TupleSource};
use crate::tuple::{TableId, Tuple};

/// Deterministic generated rows `(id, cat<id mod 10>, (id * 37) mod 100)`,
/// striped across scan partitions. An optional pause every few rows keeps
/// the stream slow enough to exercise pause and breakpoint handling from a
/// shell.
pub struct DataGenSource {
    table: TableId,
    count: usize,
    partition: usize,
    partitions: usize,
    pace: Option<Duration>,
}

impl DataGenSource {
    pub fn new(
        table: TableId,
        count: usize,
        partition: usize,
        partitions: usize,
        pace: Option<Duration>,
    ) -> Self {
        DataGenSource {
            table,
            count,
            partition,
            partitions: partitions.max(1),
            pace,
        }
    }

    fn row(table: TableId, id: usize) -> Tuple {
        Tuple::from_strings(
            table,
            [
                id.to_string(),
                format!("cat{}", id % 10),
                ((id * 37) % 100).to_string(),
            ],
        )
    }
}

impl TupleSource for DataGenSource {
    fn read(self: Box<Self>) -> BoxTupleStream {
        async_stream::stream! {
            let mut id = self.partition;
            let mut emitted = 0usize;
            while id < self.count {
                if let Some(pace) = self.pace {
                    if emitted % 8 == 0 {
                        tokio::time::sleep(pace).await;
                    }
                }
                yield Ok(Self::row(self.table, id));
                emitted += 1;
                id += self.partitions;
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn partitions_stripe_the_id_space() {
        let mut ids = vec![];
        for partition in 0..3 {
            let source = Box::new(DataGenSource::new(TableId(1), 10, partition, 3, None));
            let mut stream = source.read();
            while let Some(t) = stream.next().await {
                let t = t.unwrap();
                ids.push(t.to_line().split('|').next().unwrap().to_string());
            }
        }
        let mut numbers: Vec<usize> = ids.iter().map(|s| s.parse().unwrap()).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn rows_are_deterministic() {
        let source = Box::new(DataGenSource::new(TableId(1), 3, 0, 1, None));
        let rows: Vec<String> = source
            .read()
            .map(|t| t.unwrap().to_line())
            .collect()
            .await;
        assert_eq!(rows, vec!["0|cat0|0", "1|cat1|37", "2|cat2|74"]);
    }
}
