pub mod config;
pub mod connector;
pub mod engine;
pub mod exchange;
pub mod plan;
pub mod processor;
pub mod runtime;
pub mod tuple;

pub use self::config::EngineConfig;
pub use self::engine::{Engine, EngineError};
pub use self::plan::{OperatorId, OperatorKind, SourceSpec, Workflow, WorkflowError};
pub use self::processor::filter::CmpOp;
pub use self::processor::group_by::Aggregate;
pub use self::runtime::{BreakpointId, BreakpointSpec, JobError, JobEvent, JobId, JobPhase};
pub use self::tuple::{FieldType, FieldValue, TableId, Tuple};
