use std::path::PathBuf;

use futures::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{BoxTupleStream, TupleSource};
use crate::tuple::{TableId, Tuple};

/// Line-delimited local file, `|`-separated fields (the same layout the
/// materializer spills). Every partition reads the file and keeps its
/// stripe of line numbers; blank lines are skipped before striping.
pub struct FileSource {
    path: PathBuf,
    table: TableId,
    partition: usize,
    partitions: usize,
}

impl FileSource {
    pub fn new(path: PathBuf, table: TableId, partition: usize, partitions: usize) -> Self {
        FileSource {
            path,
            table,
            partition,
            partitions: partitions.max(1),
        }
    }
}

impl TupleSource for FileSource {
    fn read(self: Box<Self>) -> BoxTupleStream {
        async_stream::try_stream! {
            let file = File::open(&self.path).await?;
            let mut lines = BufReader::new(file).lines();
            let mut index = 0usize;
            while let Some(line) = lines.next_line().await? {
                if line.is_empty() {
                    continue;
                }
                if index % self.partitions == self.partition {
                    yield Tuple::from_strings(self.table, line.split('|'));
                }
                index += 1;
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use futures::StreamExt;

    use super::*;

    fn fixture(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[tokio::test]
    async fn reads_delimited_lines() {
        let file = fixture(&["1|ada", "", "2|grace"]);
        let source = Box::new(FileSource::new(file.path().into(), TableId(4), 0, 1));
        let rows: Vec<String> = source
            .read()
            .map(|t| t.unwrap().to_line())
            .collect()
            .await;
        assert_eq!(rows, vec!["1|ada", "2|grace"]);
    }

    #[tokio::test]
    async fn partitions_split_lines_without_overlap() {
        let file = fixture(&["a", "b", "c", "d", "e"]);
        let mut seen = vec![];
        for partition in 0..2 {
            let source = Box::new(FileSource::new(file.path().into(), TableId(4), partition, 2));
            let mut stream = source.read();
            while let Some(t) = stream.next().await {
                seen.push(t.unwrap().to_line());
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn missing_file_surfaces_an_error() {
        let source = Box::new(FileSource::new(
            PathBuf::from("/nonexistent/grainflow.tbl"),
            TableId(4),
            0,
            1,
        ));
        let mut stream = source.read();
        assert!(stream.next().await.unwrap().is_err());
    }
}
