use std::collections::{HashMap, VecDeque};

use smallvec::SmallVec;

use super::{field, ProcessorError, TupleProcessor};
use crate::tuple::{ConvertError, FieldValue, TableId, Tuple};

pub type GroupKey = SmallVec<[FieldValue; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum { field: usize },
    Min { field: usize },
    Max { field: usize },
}

/// Hash aggregation on one or more key fields. Emits one tuple per group
/// (key fields followed by the aggregate value) once every input ended.
pub struct GroupBy {
    keys: Vec<usize>,
    agg: Aggregate,
    out_table: TableId,
    groups: HashMap<GroupKey, FieldValue>,
    out: VecDeque<Tuple>,
}

impl GroupBy {
    pub fn new(keys: Vec<usize>, agg: Aggregate, out_table: TableId) -> Self {
        GroupBy {
            keys,
            agg,
            out_table,
            groups: HashMap::new(),
            out: VecDeque::new(),
        }
    }

    fn fold(agg: Aggregate, state: &mut FieldValue, tuple: &Tuple) -> Result<(), ProcessorError> {
        match agg {
            Aggregate::Count => {
                *state = state.add(&FieldValue::Int(1))?;
            }
            Aggregate::Sum { field: index } => {
                *state = state.add(field(tuple, index)?)?;
            }
            Aggregate::Min { field: index } | Aggregate::Max { field: index } => {
                let value = field(tuple, index)?;
                if value.is_null() {
                    return Ok(());
                }
                if state.is_null() {
                    *state = value.clone();
                    return Ok(());
                }
                let ordering = state
                    .try_cmp(value)
                    .ok_or_else(|| ConvertError::Incompatible(state.clone(), value.clone()))?;
                let replace = match agg {
                    Aggregate::Min { .. } => ordering == std::cmp::Ordering::Greater,
                    _ => ordering == std::cmp::Ordering::Less,
                };
                if replace {
                    *state = value.clone();
                }
            }
        }
        Ok(())
    }
}

impl TupleProcessor for GroupBy {
    fn accept(&mut self, tuple: Tuple) -> Result<(), ProcessorError> {
        let mut key = GroupKey::new();
        for &index in &self.keys {
            key.push(field(&tuple, index)?.clone());
        }
        let state = self.groups.entry(key).or_insert(FieldValue::Null);
        Self::fold(self.agg, state, &tuple)
    }

    fn has_next(&self) -> bool {
        !self.out.is_empty()
    }

    fn next(&mut self) -> Option<Tuple> {
        self.out.pop_front()
    }

    fn no_more(&mut self) -> Result<(), ProcessorError> {
        for (key, value) in self.groups.drain() {
            let fields = key.into_iter().chain([value]);
            self.out.push_back(Tuple::new(self.out_table, fields));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUT: TableId = TableId(9);

    fn row(category: &str, amount: i64) -> Tuple {
        Tuple::new(
            TableId(1),
            [FieldValue::String(category.into()), FieldValue::Int(amount)],
        )
    }

    fn finish(mut group_by: GroupBy) -> Vec<String> {
        group_by.no_more().unwrap();
        let mut lines = vec![];
        while let Some(t) = group_by.next() {
            lines.push(t.to_line());
        }
        lines.sort();
        lines
    }

    #[test]
    fn counts_per_group() {
        let mut group_by = GroupBy::new(vec![0], Aggregate::Count, OUT);
        for (cat, amount) in [("a", 1), ("b", 2), ("a", 3), ("a", 4)] {
            group_by.accept(row(cat, amount)).unwrap();
        }
        assert_eq!(finish(group_by), vec!["a|3", "b|1"]);
    }

    #[test]
    fn sums_ignore_nulls() {
        let mut group_by = GroupBy::new(vec![0], Aggregate::Sum { field: 1 }, OUT);
        group_by.accept(row("a", 10)).unwrap();
        group_by
            .accept(Tuple::new(
                TableId(1),
                [FieldValue::String("a".into()), FieldValue::Null],
            ))
            .unwrap();
        group_by.accept(row("a", 5)).unwrap();
        assert_eq!(finish(group_by), vec!["a|15"]);
    }

    #[test]
    fn min_and_max_track_extremes() {
        let mut min = GroupBy::new(vec![0], Aggregate::Min { field: 1 }, OUT);
        let mut max = GroupBy::new(vec![0], Aggregate::Max { field: 1 }, OUT);
        for (cat, amount) in [("a", 4), ("a", 2), ("a", 9)] {
            min.accept(row(cat, amount)).unwrap();
            max.accept(row(cat, amount)).unwrap();
        }
        assert_eq!(finish(min), vec!["a|2"]);
        assert_eq!(finish(max), vec!["a|9"]);
    }

    #[test]
    fn incompatible_sum_reports_the_tuple() {
        let mut group_by = GroupBy::new(vec![0], Aggregate::Sum { field: 0 }, OUT);
        group_by.accept(row("a", 1)).unwrap();
        assert!(group_by.accept(row("a", 1)).is_err());
    }
}
