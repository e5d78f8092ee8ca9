use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;

use super::{field, ProcessorError, TupleProcessor};
use crate::tuple::{FieldValue, Tuple};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CmpOp {
    fn matches(&self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Ge => ordering != Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
        };
        write!(f, "{s}")
    }
}

/// Passes tuples whose field compares against a constant. Null fields and
/// type mismatches never match.
pub struct Filter {
    index: usize,
    op: CmpOp,
    rhs: FieldValue,
    out: VecDeque<Tuple>,
}

impl Filter {
    pub fn new(index: usize, op: CmpOp, rhs: FieldValue) -> Self {
        Filter {
            index,
            op,
            rhs,
            out: VecDeque::new(),
        }
    }
}

impl TupleProcessor for Filter {
    fn accept(&mut self, tuple: Tuple) -> Result<(), ProcessorError> {
        let lhs = field(&tuple, self.index)?;
        if let Some(ordering) = lhs.try_cmp(&self.rhs) {
            if self.op.matches(ordering) {
                self.out.push_back(tuple);
            }
        }
        Ok(())
    }

    fn has_next(&self) -> bool {
        !self.out.is_empty()
    }

    fn next(&mut self) -> Option<Tuple> {
        self.out.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::tuple::TableId;

    fn row(v: i64) -> Tuple {
        Tuple::new(TableId(1), [FieldValue::Int(v)])
    }

    #[test_case(CmpOp::Eq, 5, true ; "equal matches")]
    #[test_case(CmpOp::Eq, 6, false ; "equal rejects")]
    #[test_case(CmpOp::Ne, 6, true ; "not equal matches")]
    #[test_case(CmpOp::Gt, 4, true ; "greater matches")]
    #[test_case(CmpOp::Gt, 5, false ; "greater rejects equal")]
    #[test_case(CmpOp::Ge, 5, true ; "greater or equal matches equal")]
    #[test_case(CmpOp::Lt, 6, true ; "less matches")]
    #[test_case(CmpOp::Le, 4, false ; "less or equal rejects")]
    fn comparisons(op: CmpOp, rhs: i64, expect: bool) {
        let mut filter = Filter::new(0, op, FieldValue::Int(rhs));
        filter.accept(row(5)).unwrap();
        assert_eq!(filter.has_next(), expect);
    }

    #[test]
    fn null_and_mismatched_types_never_pass() {
        let mut filter = Filter::new(0, CmpOp::Ne, FieldValue::Int(1));
        filter
            .accept(Tuple::new(TableId(1), [FieldValue::Null]))
            .unwrap();
        filter
            .accept(Tuple::new(TableId(1), [FieldValue::String("1".into())]))
            .unwrap();
        assert!(!filter.has_next());
    }

    #[test]
    fn missing_field_is_reported() {
        let mut filter = Filter::new(2, CmpOp::Eq, FieldValue::Int(1));
        assert!(filter.accept(row(1)).is_err());
    }
}
