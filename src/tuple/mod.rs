use std::fmt;
use std::fmt::Formatter;
use std::str::FromStr;

use parse_display::Display;
use smallvec::SmallVec;

/// Identifier of the table a tuple originates from. Assigned by scan
/// operators and carried unchanged through every transform, so that
/// multi-input operators (hash join) can tell their sides apart.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("t{0}")]
pub struct TableId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int,
    String,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "BOOLEAN"),
            Self::Int => write!(f, "BIGINT"),
            Self::String => write!(f, "STRING"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("failed to convert string {0:?} to int: {1}")]
    ParseInt(String, #[source] std::num::ParseIntError),
    #[error("failed to convert string {0:?} to bool: {1}")]
    ParseBool(String, #[source] std::str::ParseBoolError),
    #[error("incompatible operands: {0} and {1}")]
    Incompatible(FieldValue, FieldValue),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "NULL"),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "{}", v),
        }
    }
}

impl FieldValue {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Null-coalescing addition (used by the sum aggregates). Adding
    /// incompatible operands is reported, not panicked on, so a bad tuple
    /// can be skipped.
    pub fn add(&self, other: &FieldValue) -> Result<FieldValue, ConvertError> {
        use FieldValue::*;
        match (self, other) {
            (Null, v) | (v, Null) => Ok(v.clone()),
            (Int(x), Int(y)) => Ok(Int(x.wrapping_add(*y))),
            (a, b) => Err(ConvertError::Incompatible(a.clone(), b.clone())),
        }
    }

    /// Ordering between two values of the same type. `None` when either
    /// side is null or the types differ.
    pub fn try_cmp(&self, other: &FieldValue) -> Option<std::cmp::Ordering> {
        use FieldValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (String(a), String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(_) => Some(FieldType::Bool),
            FieldValue::Int(_) => Some(FieldType::Int),
            FieldValue::String(_) => Some(FieldType::String),
        }
    }
}

impl FieldType {
    /// Parses one raw string field into a typed value. Empty strings and the
    /// literal `NULL` (any case) become `Null` for every type.
    pub fn parse_value(&self, raw: &str) -> Result<FieldValue, ConvertError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
            return Ok(FieldValue::Null);
        }
        match self {
            FieldType::Bool => trimmed
                .parse()
                .map(FieldValue::Bool)
                .map_err(|e| ConvertError::ParseBool(trimmed.into(), e)),
            FieldType::Int => trimmed
                .parse()
                .map(FieldValue::Int)
                .map_err(|e| ConvertError::ParseInt(trimmed.into(), e)),
            FieldType::String => Ok(FieldValue::String(trimmed.into())),
        }
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BOOLEAN" | "BOOL" => Ok(Self::Bool),
            "BIGINT" | "INT" => Ok(Self::Int),
            "STRING" | "VARCHAR" | "TEXT" => Ok(Self::String),
            other => Err(format!("unknown field type: {other}")),
        }
    }
}

pub type Fields = SmallVec<[FieldValue; 4]>;

/// One immutable record. Built once by a source or a transform, then handed
/// off by value; nothing mutates a tuple in place after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    table: TableId,
    fields: Fields,
}

impl Tuple {
    pub fn new(table: TableId, fields: impl IntoIterator<Item = FieldValue>) -> Self {
        Tuple {
            table,
            fields: fields.into_iter().collect(),
        }
    }

    /// Convenience for inline test/demo rows: every field arrives as text.
    pub fn from_strings<S: AsRef<str>>(table: TableId, raw: impl IntoIterator<Item = S>) -> Self {
        Tuple {
            table,
            fields: raw
                .into_iter()
                .map(|s| FieldValue::String(s.as_ref().to_string()))
                .collect(),
        }
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn field(&self, index: usize) -> Option<&FieldValue> {
        self.fields.get(index)
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    /// Renders the tuple as one `|`-joined line, the spill-file format.
    pub fn to_line(&self) -> String {
        itertools::Itertools::join(&mut self.fields.iter(), "|")
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_typed_fields() {
        assert_eq!(
            FieldType::Int.parse_value("42"),
            Ok(FieldValue::Int(42))
        );
        assert_eq!(
            FieldType::Bool.parse_value("true"),
            Ok(FieldValue::Bool(true))
        );
        assert_eq!(FieldType::Int.parse_value(""), Ok(FieldValue::Null));
        assert_eq!(FieldType::String.parse_value("NULL"), Ok(FieldValue::Null));
        assert!(FieldType::Int.parse_value("abc").is_err());
    }

    #[test]
    fn add_coalesces_null() {
        let a = FieldValue::Int(3);
        assert_eq!(a.add(&FieldValue::Null).unwrap(), FieldValue::Int(3));
        assert_eq!(
            FieldValue::Null.add(&FieldValue::Int(5)).unwrap(),
            FieldValue::Int(5)
        );
        assert_eq!(a.add(&FieldValue::Int(4)).unwrap(), FieldValue::Int(7));
        assert!(a.add(&FieldValue::String("x".into())).is_err());
    }

    #[test]
    fn line_rendering() {
        let t = Tuple::new(
            TableId(1),
            [
                FieldValue::Int(7),
                FieldValue::Null,
                FieldValue::String("widget".into()),
            ],
        );
        assert_eq!(t.to_line(), "7|NULL|widget");
        assert_eq!(t.table().to_string(), "t1");
    }
}
