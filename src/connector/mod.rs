//! Raw tuple sources for scan workers. A source yields untyped tuples
//! (every field a string); the scan worker's cast transform applies the
//! declared schema.

pub mod data_gen;
pub mod file;
pub mod value;

pub use data_gen::DataGenSource;
pub use file::FileSource;
pub use value::ValueSource;

use futures::stream::BoxStream;

use crate::tuple::Tuple;

#[derive(thiserror::Error, Debug)]
pub enum ConnectorError {
    #[error("source io: {0}")]
    Io(#[from] std::io::Error),
}

pub type BoxTupleStream = BoxStream<'static, Result<Tuple, ConnectorError>>;

pub trait TupleSource: Send {
    fn read(self: Box<Self>) -> BoxTupleStream;
}
