use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use super::{ProcessorError, TupleProcessor};
use crate::exchange::sending::ShuffleKey;
use crate::tuple::Tuple;

/// Pass-through transform that spills every tuple it sees to disk, one
/// `|`-joined line per tuple, one file per output partition. A staging
/// artifact for re-computation, not a log: files are truncated per run.
pub struct Materializer {
    dir: PathBuf,
    file_stem: String,
    partitions: usize,
    key: Option<usize>,
    writers: Vec<Option<BufWriter<File>>>,
    out: VecDeque<Tuple>,
}

impl Materializer {
    pub fn new(dir: PathBuf, file_stem: String, partitions: usize, key: Option<usize>) -> Self {
        let partitions = partitions.max(1);
        Materializer {
            dir,
            file_stem,
            partitions,
            key,
            writers: (0..partitions).map(|_| None).collect(),
            out: VecDeque::new(),
        }
    }

    fn partition_of(&self, tuple: &Tuple) -> usize {
        match self.key {
            Some(index) => ShuffleKey::Field(index).partition(tuple, self.partitions),
            None => 0,
        }
    }

    fn writer(&mut self, partition: usize) -> Result<&mut BufWriter<File>, ProcessorError> {
        let slot = &mut self.writers[partition];
        match slot {
            Some(writer) => Ok(writer),
            None => {
                let path = self
                    .dir
                    .join(format!("{}_p{partition}.tbl", self.file_stem));
                Ok(slot.insert(BufWriter::new(File::create(path)?)))
            }
        }
    }
}

impl TupleProcessor for Materializer {
    fn initialize(&mut self) -> Result<(), ProcessorError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn accept(&mut self, tuple: Tuple) -> Result<(), ProcessorError> {
        let partition = self.partition_of(&tuple);
        let line = tuple.to_line();
        writeln!(self.writer(partition)?, "{line}")?;
        self.out.push_back(tuple);
        Ok(())
    }

    fn has_next(&self) -> bool {
        !self.out.is_empty()
    }

    fn next(&mut self) -> Option<Tuple> {
        self.out.pop_front()
    }

    fn no_more(&mut self) -> Result<(), ProcessorError> {
        for writer in self.writers.iter_mut().flatten() {
            writer.flush()?;
        }
        Ok(())
    }

    fn dispose(&mut self) {
        for writer in self.writers.iter_mut().flatten() {
            let _ = writer.flush();
        }
    }
}
