//! The actor runtime. Every worker, principal, and controller is a tokio
//! task with a private mailbox; control flows down the tree as messages,
//! state events flow back up, and the only timeout anywhere lives in the
//! delivery links of the exchange layer.

pub mod breakpoint;
pub mod controller;
pub mod job;
pub mod principal;
pub mod worker;

pub use breakpoint::{BreakpointId, BreakpointSpec};
pub use job::{launch, JobError, JobEvent, JobHandle, JobId, JobPhase};
