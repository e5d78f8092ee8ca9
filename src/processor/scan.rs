use std::collections::VecDeque;

use log::warn;

use super::{ProcessorError, TupleProcessor};
use crate::tuple::{FieldType, FieldValue, TableId, Tuple};

/// Entry transform of a scan worker: raw tuples arrive with every field as
/// a string and leave typed according to the declared schema. A tuple that
/// fails to parse is dropped, not fatal.
pub struct ScanCast {
    table: TableId,
    types: Vec<FieldType>,
    out: VecDeque<Tuple>,
    skipped: u64,
}

impl ScanCast {
    pub fn new(table: TableId, types: Vec<FieldType>) -> Self {
        ScanCast {
            table,
            types,
            out: VecDeque::new(),
            skipped: 0,
        }
    }

    fn cast(&self, tuple: &Tuple) -> Result<Tuple, ProcessorError> {
        if tuple.arity() != self.types.len() {
            return Err(ProcessorError::MissingField {
                index: self.types.len(),
                arity: tuple.arity(),
            });
        }
        let mut fields = Vec::with_capacity(self.types.len());
        for (value, ty) in tuple.fields().iter().zip(&self.types) {
            let raw = match value {
                FieldValue::String(s) => ty.parse_value(s)?,
                other => other.clone(),
            };
            fields.push(raw);
        }
        Ok(Tuple::new(self.table, fields))
    }
}

impl TupleProcessor for ScanCast {
    fn accept(&mut self, tuple: Tuple) -> Result<(), ProcessorError> {
        match self.cast(&tuple) {
            Ok(typed) => {
                self.out.push_back(typed);
                Ok(())
            }
            Err(e) => {
                self.skipped += 1;
                Err(e)
            }
        }
    }

    fn has_next(&self) -> bool {
        !self.out.is_empty()
    }

    fn next(&mut self) -> Option<Tuple> {
        self.out.pop_front()
    }

    fn dispose(&mut self) {
        if self.skipped > 0 {
            warn!(
                "scan of {} dropped {} malformed tuples",
                self.table, self.skipped
            );
        }
    }
}
