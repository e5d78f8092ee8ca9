//! Pluggable per-worker tuple transforms.
//!
//! A worker feeds every in-order tuple through one [`TupleProcessor`] and
//! drains whatever the processor emits into its sending strategies. The
//! engine never looks inside a transform; a processor error only costs the
//! single tuple that caused it.

use crate::tuple::{ConvertError, FieldValue, Tuple};

pub mod count;
pub mod filter;
pub mod group_by;
pub mod hash_join;
pub mod keyword;
pub mod materialize;
pub mod scan;

#[derive(thiserror::Error, Debug)]
pub enum ProcessorError {
    #[error("field {index} out of range for tuple of arity {arity}")]
    MissingField { index: usize, arity: usize },
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("spill failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One operator partition's transform. `accept` may buffer; emitted tuples
/// are pulled out through `has_next`/`next`. `no_more` runs once after every
/// input ended, which is where blocking transforms (aggregates, joins)
/// flush.
pub trait TupleProcessor: Send {
    fn initialize(&mut self) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn accept(&mut self, tuple: Tuple) -> Result<(), ProcessorError>;

    fn has_next(&self) -> bool;

    fn next(&mut self) -> Option<Tuple>;

    fn no_more(&mut self) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn dispose(&mut self) {}
}

pub type BoxedProcessor = Box<dyn TupleProcessor>;

pub(crate) fn field(tuple: &Tuple, index: usize) -> Result<&FieldValue, ProcessorError> {
    tuple.field(index).ok_or(ProcessorError::MissingField {
        index,
        arity: tuple.arity(),
    })
}
