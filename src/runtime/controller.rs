//! Job-level orchestration. The controller owns every principal of one
//! job: it spawns them in topological order, wires operator outputs to the
//! successors' inputs with the strategy each consumer demands, attaches
//! terminal operators to the result collector, and folds per-operator
//! events into the job-level ones a caller sees.

use std::collections::HashSet;
use std::path::PathBuf;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::EngineConfig;
use crate::exchange::ordering::OrderingEnforcer;
use crate::exchange::{GrainId, PayloadAck, PayloadDelivery, PayloadMessage, PayloadReceiver};
use crate::plan::{input_strategy, LinkStrategyKind, OperatorId, Workflow};
use crate::runtime::breakpoint::{BreakpointId, BreakpointSpec};
use crate::runtime::job::{JobError, JobEvent, JobPhase};
use crate::runtime::principal::{
    spawn_principal, PrincipalControl, PrincipalEvent, PrincipalHandle,
};
use crate::tuple::Tuple;

pub enum JobControl {
    Start {
        ack: oneshot::Sender<()>,
    },
    Pause,
    Resume,
    Deactivate {
        ack: oneshot::Sender<()>,
    },
    AddBreakpoint {
        operator: OperatorId,
        spec: BreakpointSpec,
        ack: oneshot::Sender<Result<BreakpointId, JobError>>,
    },
}

/// Pseudo-grain address the result collector acks from.
const COLLECTOR: GrainId = GrainId::new(u32::MAX, 0, 0);

pub(crate) fn spawn_controller(
    workflow: Workflow,
    config: EngineConfig,
    job_dir: PathBuf,
    control: mpsc::UnboundedReceiver<JobControl>,
    events: mpsc::UnboundedSender<JobEvent>,
    results: mpsc::UnboundedSender<Tuple>,
    phase: watch::Sender<JobPhase>,
) {
    tokio::spawn(async move {
        let Ok(order) = workflow.topo_order() else {
            warn!("refusing to run an unvalidated workflow");
            return;
        };
        let (principal_tx, principal_rx) = mpsc::unbounded_channel();
        let mut principals = Vec::with_capacity(order.len());
        for id in order {
            let Some(spec) = workflow.operator(id) else {
                continue;
            };
            principals.push(spawn_principal(spec, &config, &job_dir, principal_tx.clone()).await);
        }

        for (from, to) in &workflow.edges {
            let Some(consumer) = workflow.operator(*to) else {
                continue;
            };
            let kind = input_strategy(&consumer.kind);
            let Some(upstream) = principals.iter().find(|p| p.operator == *from) else {
                continue;
            };
            let Some(downstream) = principals.iter().find(|p| p.operator == *to) else {
                continue;
            };
            let destinations = downstream.inputs.clone();
            let senders = upstream.output_ids.clone();
            let (tx, rx) = oneshot::channel();
            if upstream
                .control
                .send(PrincipalControl::ConnectDownstream {
                    kind,
                    destinations,
                    ack: tx,
                })
                .is_ok()
            {
                let _ = rx.await;
            }
            let (tx, rx) = oneshot::channel();
            if downstream
                .control
                .send(PrincipalControl::ExpectInputs { senders, ack: tx })
                .is_ok()
            {
                let _ = rx.await;
            }
        }

        // terminal operators stream into the job's result collector
        let (collector_tx, collector_rx) = mpsc::unbounded_channel();
        let mut terminal_senders = 0;
        for principal in &principals {
            if !workflow.successors(principal.operator).is_empty() {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            if principal
                .control
                .send(PrincipalControl::ConnectDownstream {
                    kind: LinkStrategyKind::Stream,
                    destinations: vec![(COLLECTOR, collector_tx.clone())],
                    ack: tx,
                })
                .is_ok()
            {
                let _ = rx.await;
            }
            terminal_senders += principal.output_ids.len();
        }
        drop(collector_tx);
        tokio::spawn(run_collector(
            collector_rx,
            terminal_senders,
            results,
            config.flow_window,
        ));

        let controller = Controller {
            principals,
            pending_pause: HashSet::new(),
            pending_resume: HashSet::new(),
            completed: HashSet::new(),
            failed: false,
            next_breakpoint: 0,
            events,
            phase,
        };
        controller.run(control, principal_rx).await;
    });
}

struct Controller {
    principals: Vec<PrincipalHandle>,
    /// Operators whose paused/resumed confirmation the caller still awaits.
    pending_pause: HashSet<OperatorId>,
    pending_resume: HashSet<OperatorId>,
    completed: HashSet<OperatorId>,
    failed: bool,
    next_breakpoint: u32,
    events: mpsc::UnboundedSender<JobEvent>,
    phase: watch::Sender<JobPhase>,
}

impl Controller {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<JobControl>,
        mut principals: mpsc::UnboundedReceiver<(OperatorId, PrincipalEvent)>,
    ) {
        loop {
            tokio::select! {
                biased;
                msg = control.recv() => match msg {
                    Some(msg) => {
                        if self.handle_control(msg).await {
                            break;
                        }
                    }
                    None => {
                        // the job handle is gone; tear the topology down
                        self.deactivate_all().await;
                        break;
                    }
                },
                Some((op, event)) = principals.recv() => {
                    if self.handle_principal_event(op, event).await {
                        break;
                    }
                }
            }
        }
    }

    fn current(&self) -> JobPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: JobPhase) {
        let _ = self.phase.send(phase);
    }

    /// True ends the job.
    async fn handle_control(&mut self, msg: JobControl) -> bool {
        match msg {
            JobControl::Start { ack } => {
                if self.current() == JobPhase::Created {
                    for principal in &self.principals {
                        let (tx, rx) = oneshot::channel();
                        if principal
                            .control
                            .send(PrincipalControl::Start { ack: tx })
                            .is_ok()
                        {
                            let _ = rx.await;
                        }
                    }
                    self.set_phase(JobPhase::Running);
                } else {
                    warn!("start ignored, job is {}", self.current());
                }
                let _ = ack.send(());
            }
            JobControl::Pause => {
                if self.current() != JobPhase::Running
                    || !self.pending_pause.is_empty()
                    || !self.pending_resume.is_empty()
                {
                    warn!("pause ignored, job is {}", self.current());
                    return false;
                }
                for principal in &self.principals {
                    if !self.completed.contains(&principal.operator) {
                        self.pending_pause.insert(principal.operator);
                        let _ = principal.control.send(PrincipalControl::Pause);
                    }
                }
            }
            JobControl::Resume => {
                if self.current() != JobPhase::Paused
                    || !self.pending_pause.is_empty()
                    || !self.pending_resume.is_empty()
                {
                    warn!("resume ignored, job is {}", self.current());
                    return false;
                }
                for principal in &self.principals {
                    if !self.completed.contains(&principal.operator) {
                        self.pending_resume.insert(principal.operator);
                        let _ = principal.control.send(PrincipalControl::Resume);
                    }
                }
            }
            JobControl::Deactivate { ack } => {
                self.deactivate_all().await;
                self.set_phase(JobPhase::Deactivated);
                let _ = self.events.send(JobEvent::Deactivated);
                let _ = ack.send(());
                return true;
            }
            JobControl::AddBreakpoint {
                operator,
                spec,
                ack,
            } => {
                let Some(principal) = self.principals.iter().find(|p| p.operator == operator)
                else {
                    let _ = ack.send(Err(JobError::UnknownOperator(operator)));
                    return false;
                };
                self.next_breakpoint += 1;
                let id = BreakpointId(self.next_breakpoint);
                let (tx, rx) = oneshot::channel();
                if principal
                    .control
                    .send(PrincipalControl::AddBreakpoint { id, spec, ack: tx })
                    .is_ok()
                {
                    let _ = rx.await;
                    let _ = ack.send(Ok(id));
                } else {
                    let _ = ack.send(Err(JobError::Terminated));
                }
            }
        }
        false
    }

    /// True ends the job.
    async fn handle_principal_event(&mut self, op: OperatorId, event: PrincipalEvent) -> bool {
        match event {
            PrincipalEvent::Paused => {
                if self.pending_pause.remove(&op) {
                    if self.pending_pause.is_empty() {
                        self.set_phase(JobPhase::Paused);
                        let _ = self.events.send(JobEvent::Paused);
                    }
                } else {
                    debug!("{op} paused on its own, not surfacing");
                }
            }
            PrincipalEvent::Resumed => {
                if self.pending_resume.remove(&op) {
                    if self.pending_resume.is_empty() {
                        self.set_phase(JobPhase::Running);
                        let _ = self.events.send(JobEvent::Resumed);
                    }
                } else {
                    debug!("{op} resumed on its own, not surfacing");
                }
            }
            PrincipalEvent::Completed => {
                info!("{op} completed");
                self.completed.insert(op);
                if self.pending_pause.remove(&op) && self.pending_pause.is_empty() {
                    self.set_phase(JobPhase::Paused);
                    let _ = self.events.send(JobEvent::Paused);
                }
                if self.pending_resume.remove(&op) && self.pending_resume.is_empty() {
                    self.set_phase(JobPhase::Running);
                    let _ = self.events.send(JobEvent::Resumed);
                }
                if self.completed.len() == self.principals.len() && !self.failed {
                    self.set_phase(JobPhase::Completed);
                    let _ = self.events.send(JobEvent::Completed);
                    self.deactivate_all().await;
                    return true;
                }
            }
            PrincipalEvent::Failed { worker, reason } => {
                warn!("{op} failed at {worker}: {reason}");
                if !self.failed {
                    self.failed = true;
                    self.set_phase(JobPhase::Failed);
                    let _ = self.events.send(JobEvent::Failed {
                        operator: op,
                        worker,
                        reason,
                    });
                    self.deactivate_all().await;
                    return true;
                }
            }
            PrincipalEvent::Breakpoint { id, report } => {
                info!("{op} {id}: {report}");
                let _ = self.events.send(JobEvent::Breakpoint {
                    operator: op,
                    id,
                    report,
                });
            }
        }
        false
    }

    async fn deactivate_all(&self) {
        for principal in &self.principals {
            let (tx, rx) = oneshot::channel();
            if principal
                .control
                .send(PrincipalControl::Deactivate { ack: tx })
                .is_ok()
            {
                let _ = rx.await;
            }
        }
    }
}

/// Drains terminal payloads into the job's result channel, deduplicating
/// and reordering like any other receiver, and closes the channel once
/// every terminal sender has ended.
async fn run_collector(
    mut inbox: PayloadReceiver,
    mut remaining: usize,
    results: mpsc::UnboundedSender<Tuple>,
    window: usize,
) {
    let mut enforcer = OrderingEnforcer::new();
    while remaining > 0 {
        let Some(PayloadDelivery { payload, ack }) = inbox.recv().await else {
            debug!("collector inbox closed with {remaining} senders still open");
            return;
        };
        let _ = ack.send(PayloadAck {
            seq: payload.seq,
            window,
        });
        if let Some(msg) = enforcer.pre_process(payload) {
            remaining = forward(msg, remaining, &results);
        }
        while let Some(msg) = enforcer.post_process() {
            remaining = forward(msg, remaining, &results);
        }
    }
}

fn forward(msg: PayloadMessage, remaining: usize, results: &mpsc::UnboundedSender<Tuple>) -> usize {
    if msg.is_end {
        return remaining.saturating_sub(1);
    }
    for tuple in msg.tuples {
        let _ = results.send(tuple);
    }
    remaining
}
