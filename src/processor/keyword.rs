use std::collections::VecDeque;

use super::{field, ProcessorError, TupleProcessor};
use crate::tuple::{FieldValue, Tuple};

/// Passes tuples whose string field contains the keyword.
pub struct KeywordSearch {
    index: usize,
    keyword: String,
    out: VecDeque<Tuple>,
}

impl KeywordSearch {
    pub fn new(index: usize, keyword: impl Into<String>) -> Self {
        KeywordSearch {
            index,
            keyword: keyword.into(),
            out: VecDeque::new(),
        }
    }
}

impl TupleProcessor for KeywordSearch {
    fn accept(&mut self, tuple: Tuple) -> Result<(), ProcessorError> {
        if let FieldValue::String(text) = field(&tuple, self.index)? {
            if text.contains(&self.keyword) {
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
    use super::*;
    use crate::tuple::TableId;

    fn row(text: &str) -> Tuple {
        Tuple::new(TableId(1), [FieldValue::String(text.into())])
    }

    #[test]
    fn keeps_only_containing_tuples() {
        let mut search = KeywordSearch::new(0, "widget");
        search.accept(row("blue widget deluxe")).unwrap();
        search.accept(row("plain gadget")).unwrap();
        search.accept(row("widget")).unwrap();
        let mut kept = vec![];
        while let Some(t) = search.next() {
            kept.push(t.to_line());
        }
        assert_eq!(kept, vec!["blue widget deluxe", "widget"]);
    }

    #[test]
    fn non_string_fields_never_match() {
        let mut search = KeywordSearch::new(0, "1");
        search
            .accept(Tuple::new(TableId(1), [FieldValue::Int(1)]))
            .unwrap();
        assert!(!search.has_next());
    }
}
