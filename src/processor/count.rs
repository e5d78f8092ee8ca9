use std::collections::VecDeque;

use super::{field, ProcessorError, TupleProcessor};
use crate::tuple::{FieldValue, TableId, Tuple};

/// First count layer: every partition counts the tuples it sees and emits
/// one partial total once its inputs end.
pub struct CountPartial {
    out_table: TableId,
    seen: i64,
    out: VecDeque<Tuple>,
}

impl CountPartial {
    pub fn new(out_table: TableId) -> Self {
        CountPartial {
            out_table,
            seen: 0,
            out: VecDeque::new(),
        }
    }
}

impl TupleProcessor for CountPartial {
    fn accept(&mut self, _tuple: Tuple) -> Result<(), ProcessorError> {
        self.seen += 1;
        Ok(())
    }

    fn has_next(&self) -> bool {
        !self.out.is_empty()
    }

    fn next(&mut self) -> Option<Tuple> {
        self.out.pop_front()
    }

    fn no_more(&mut self) -> Result<(), ProcessorError> {
        self.out
            .push_back(Tuple::new(self.out_table, [FieldValue::Int(self.seen)]));
        Ok(())
    }
}

/// Second count layer: a single partition adding up the partial totals.
pub struct CountFinal {
    out_table: TableId,
    total: FieldValue,
    out: VecDeque<Tuple>,
}

impl CountFinal {
    pub fn new(out_table: TableId) -> Self {
        CountFinal {
            out_table,
            total: FieldValue::Null,
            out: VecDeque::new(),
        }
    }
}

impl TupleProcessor for CountFinal {
    fn accept(&mut self, tuple: Tuple) -> Result<(), ProcessorError> {
        let partial = field(&tuple, 0)?;
        self.total = self.total.add(partial)?;
        Ok(())
    }

    fn has_next(&self) -> bool {
        !self.out.is_empty()
    }

    fn next(&mut self) -> Option<Tuple> {
        self.out.pop_front()
    }

    fn no_more(&mut self) -> Result<(), ProcessorError> {
        let total = match &self.total {
            FieldValue::Null => FieldValue::Int(0),
            other => other.clone(),
        };
        self.out.push_back(Tuple::new(self.out_table, [total]));
        Ok(())
    }
}
