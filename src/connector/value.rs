use futures::stream::{self, StreamExt};

use super::{BoxTupleStream, TupleSource};
use crate::tuple::{TableId, Tuple};

/// Inline rows handed over at plan time. Each parallel scan partition takes
/// every n-th row so the full set is read exactly once.
pub struct ValueSource {
    table: TableId,
    rows: Vec<Vec<String>>,
    partition: usize,
    partitions: usize,
}

impl ValueSource {
    pub fn new(table: TableId, rows: Vec<Vec<String>>, partition: usize, partitions: usize) -> Self {
        ValueSource {
            table,
            rows,
            partition,
            partitions: partitions.max(1),
        }
    }
}

impl TupleSource for ValueSource {
    fn read(self: Box<Self>) -> BoxTupleStream {
        let table = self.table;
        let (partition, partitions) = (self.partition, self.partitions);
        stream::iter(
            self.rows
                .into_iter()
                .enumerate()
                .filter(move |(i, _)| i % partitions == partition)
                .map(move |(_, row)| Ok(Tuple::from_strings(table, row))),
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn rows() -> Vec<Vec<String>> {
        (0..5)
            .map(|i| vec![i.to_string(), format!("row{i}")])
            .collect()
    }

    #[tokio::test]
    async fn partitions_cover_all_rows_once() {
        let mut seen = vec![];
        for partition in 0..2 {
            let source = Box::new(ValueSource::new(TableId(1), rows(), partition, 2));
            let mut stream = source.read();
            while let Some(t) = stream.next().await {
                seen.push(t.unwrap().to_line());
            }
        }
        seen.sort();
        assert_eq!(
            seen,
            vec!["0|row0", "1|row1", "2|row2", "3|row3", "4|row4"]
        );
    }
}
