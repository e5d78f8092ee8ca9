//! The handle a caller holds on one launched job.

use std::fmt;

use parse_display::Display;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::exchange::GrainId;
use crate::plan::{OperatorId, Workflow};
use crate::runtime::breakpoint::{BreakpointId, BreakpointSpec};
use crate::runtime::controller::{spawn_controller, JobControl};
use crate::tuple::Tuple;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[display(style = "lowercase")]
pub enum JobPhase {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Deactivated,
}

impl JobPhase {
    /// A terminal job never changes phase again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Completed | JobPhase::Failed | JobPhase::Deactivated
        )
    }
}

#[derive(Debug)]
pub enum JobEvent {
    Paused,
    Resumed,
    Completed,
    Failed {
        operator: OperatorId,
        worker: GrainId,
        reason: String,
    },
    Breakpoint {
        operator: OperatorId,
        id: BreakpointId,
        report: String,
    },
    Deactivated,
}

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("job is no longer running")]
    Terminated,
    #[error("unknown operator {0}")]
    UnknownOperator(OperatorId),
}

/// Spawns the controller for a validated workflow and hands back its
/// control surface. Dropping the handle tears the job down.
pub fn launch(workflow: Workflow, config: EngineConfig, id: JobId) -> JobHandle {
    let job_dir = config.spill_dir.join(id.to_string());
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (result_tx, result_rx) = mpsc::unbounded_channel();
    let (phase_tx, phase_rx) = watch::channel(JobPhase::Created);
    spawn_controller(
        workflow, config, job_dir, control_rx, event_tx, result_tx, phase_tx,
    );
    JobHandle {
        id,
        control: control_tx,
        phase: phase_rx,
        events: Some(event_rx),
        results: Some(result_rx),
    }
}

pub struct JobHandle {
    pub id: JobId,
    control: mpsc::UnboundedSender<JobControl>,
    phase: watch::Receiver<JobPhase>,
    events: Option<mpsc::UnboundedReceiver<JobEvent>>,
    results: Option<mpsc::UnboundedReceiver<Tuple>>,
}

impl JobHandle {
    pub fn phase(&self) -> JobPhase {
        *self.phase.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<JobPhase> {
        self.phase.clone()
    }

    /// The event stream can be taken once; later calls get None.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<JobEvent>> {
        self.events.take()
    }

    /// The terminal tuple stream can be taken once; later calls get None.
    pub fn take_results(&mut self) -> Option<mpsc::UnboundedReceiver<Tuple>> {
        self.results.take()
    }

    pub async fn start(&self) -> Result<(), JobError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(JobControl::Start { ack: tx })
            .map_err(|_| JobError::Terminated)?;
        rx.await.map_err(|_| JobError::Terminated)
    }

    pub fn pause(&self) -> Result<(), JobError> {
        self.control
            .send(JobControl::Pause)
            .map_err(|_| JobError::Terminated)
    }

    pub fn resume(&self) -> Result<(), JobError> {
        self.control
            .send(JobControl::Resume)
            .map_err(|_| JobError::Terminated)
    }

    /// Cooperative teardown. A job that already reached a terminal phase
    /// has torn itself down, which counts as success.
    pub async fn deactivate(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .control
            .send(JobControl::Deactivate { ack: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn add_breakpoint(
        &self,
        operator: OperatorId,
        spec: BreakpointSpec,
    ) -> Result<BreakpointId, JobError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(JobControl::AddBreakpoint {
                operator,
                spec,
                ack: tx,
            })
            .map_err(|_| JobError::Terminated)?;
        rx.await.map_err(|_| JobError::Terminated)?
    }
}
