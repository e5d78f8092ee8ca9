use std::collections::{HashMap, VecDeque};

use super::{field, ProcessorError, TupleProcessor};
use crate::tuple::{FieldValue, Fields, TableId, Tuple};

/// Equi-join keyed by each tuple's originating table: tuples from the build
/// table go into the hash table, everything else is probe input. Probes are
/// buffered until all inputs end, so arrival interleaving never matters.
/// Output tuples are probe fields followed by build fields.
pub struct HashJoin {
    build_table: TableId,
    build_field: usize,
    probe_field: usize,
    out_table: TableId,
    built: HashMap<FieldValue, Vec<Fields>>,
    probes: Vec<Tuple>,
    out: VecDeque<Tuple>,
}

impl HashJoin {
    pub fn new(
        build_table: TableId,
        build_field: usize,
        probe_field: usize,
        out_table: TableId,
    ) -> Self {
        HashJoin {
            build_table,
            build_field,
            probe_field,
            out_table,
            built: HashMap::new(),
            probes: Vec::new(),
            out: VecDeque::new(),
        }
    }
}

impl TupleProcessor for HashJoin {
    fn accept(&mut self, tuple: Tuple) -> Result<(), ProcessorError> {
        if tuple.table() == self.build_table {
            let key = field(&tuple, self.build_field)?.clone();
            if !key.is_null() {
                self.built.entry(key).or_default().push(tuple.into_fields());
            }
        } else {
            field(&tuple, self.probe_field)?;
            self.probes.push(tuple);
        }
        Ok(())
    }

    fn has_next(&self) -> bool {
        !self.out.is_empty()
    }

    fn next(&mut self) -> Option<Tuple> {
        self.out.pop_front()
    }

    fn no_more(&mut self) -> Result<(), ProcessorError> {
        for probe in self.probes.drain(..) {
            let key = match probe.field(self.probe_field) {
                Some(k) if !k.is_null() => k,
                _ => continue,
            };
            let Some(matches) = self.built.get(key) else {
                continue;
            };
            for build_fields in matches {
                let fields = probe
                    .fields()
                    .iter()
                    .cloned()
                    .chain(build_fields.iter().cloned());
                self.out.push_back(Tuple::new(self.out_table, fields));
            }
        }
        self.built.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS: TableId = TableId(1);
    const ORDERS: TableId = TableId(2);
    const OUT: TableId = TableId(10);

    fn user(id: i64, name: &str) -> Tuple {
        Tuple::new(USERS, [FieldValue::Int(id), FieldValue::String(name.into())])
    }

    fn order(user_id: i64, item: &str) -> Tuple {
        Tuple::new(
            ORDERS,
            [FieldValue::Int(user_id), FieldValue::String(item.into())],
        )
    }

    fn run(join: &mut HashJoin, input: Vec<Tuple>) -> Vec<String> {
        for t in input {
            join.accept(t).unwrap();
        }
        join.no_more().unwrap();
        let mut lines = vec![];
        while let Some(t) = join.next() {
            lines.push(t.to_line());
        }
        lines.sort();
        lines
    }

    #[test]
    fn joins_matching_keys_regardless_of_arrival_order() {
        let mut join = HashJoin::new(USERS, 0, 0, OUT);
        let lines = run(
            &mut join,
            vec![
                order(2, "bolt"),
                user(1, "ada"),
                order(1, "gear"),
                user(2, "grace"),
                order(3, "nut"),
            ],
        );
        assert_eq!(lines, vec!["1|gear|1|ada", "2|bolt|2|grace"]);
    }

    #[test]
    fn one_build_row_matches_many_probes() {
        let mut join = HashJoin::new(USERS, 0, 0, OUT);
        let lines = run(
            &mut join,
            vec![user(1, "ada"), order(1, "gear"), order(1, "bolt")],
        );
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn null_keys_never_join() {
        let mut join = HashJoin::new(USERS, 0, 0, OUT);
        let lines = run(
            &mut join,
            vec![
                Tuple::new(USERS, [FieldValue::Null, FieldValue::String("x".into())]),
                Tuple::new(ORDERS, [FieldValue::Null, FieldValue::String("y".into())]),
            ],
        );
        assert!(lines.is_empty());
    }
}
