//! The data-plane actor. One worker owns one partition of one operator
//! layer: payloads come in through its mailbox, pass the ordering enforcer,
//! run through the tuple processor, and leave through per-edge sending
//! strategies. Control messages share the loop and always win the race, so
//! a pause lands between batches, never inside one.

use std::collections::{HashMap, VecDeque};

use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::connector::{BoxTupleStream, ConnectorError, TupleSource};
use crate::exchange::flow::{open_link, FaultSender, LinkConfig, LinkFault, LinkHandle};
use crate::exchange::ordering::OrderingEnforcer;
use crate::exchange::sending::SendingStrategy;
use crate::exchange::{
    GrainId, PayloadAck, PayloadDelivery, PayloadMessage, PayloadReceiver, PayloadSender,
};
use crate::plan::LinkStrategyKind;
use crate::processor::BoxedProcessor;
use crate::runtime::breakpoint::{BreakpointId, LocalBreakpoint, LocalReport};
use crate::tuple::Tuple;

/// One outgoing edge: the routing policy plus every destination mailbox.
/// The worker opens its own flow-controlled links from this.
#[derive(Debug)]
pub struct OutputSpec {
    pub kind: LinkStrategyKind,
    pub destinations: Vec<(GrainId, PayloadSender)>,
}

pub enum WorkerControl {
    Start {
        ack: oneshot::Sender<()>,
    },
    Pause,
    Resume {
        ack: oneshot::Sender<()>,
    },
    Deactivate {
        ack: oneshot::Sender<()>,
    },
    ConnectOutputs {
        outputs: OutputSpec,
        ack: oneshot::Sender<()>,
    },
    /// Accumulative: every call adds senders whose end-of-stream the worker
    /// must see before it can finish.
    RegisterInputs {
        senders: Vec<GrainId>,
        ack: oneshot::Sender<()>,
    },
    AssignBreakpoint(LocalBreakpoint),
    ClearBreakpoint(BreakpointId),
    CollectBreakpoint {
        id: BreakpointId,
        reply: oneshot::Sender<Option<LocalReport>>,
    },
}

#[derive(Debug)]
pub enum WorkerEvent {
    Paused(GrainId),
    Finished(GrainId),
    BreakpointTriggered {
        worker: GrainId,
        ids: Vec<BreakpointId>,
    },
    Failed {
        worker: GrainId,
        reason: String,
    },
}

#[derive(Clone)]
pub struct WorkerHandle {
    pub id: GrainId,
    pub control: mpsc::UnboundedSender<WorkerControl>,
    pub payloads: PayloadSender,
}

pub fn spawn_worker(
    id: GrainId,
    processor: BoxedProcessor,
    source: Option<Box<dyn TupleSource>>,
    link: LinkConfig,
    batch_size: usize,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerHandle {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (payload_tx, payload_rx) = mpsc::unbounded_channel();
    let (fault_tx, fault_rx) = mpsc::unbounded_channel();
    let had_source = source.is_some();
    let worker = Worker {
        id,
        mode: Mode::Created,
        processor,
        outputs: Vec::new(),
        enforcer: OrderingEnforcer::new(),
        pending_ends: HashMap::new(),
        registered: 0,
        had_source,
        source_done: !had_source,
        stash: VecDeque::new(),
        breakpoints: Vec::new(),
        tripped: Vec::new(),
        flow_window: link.initial_window,
        link,
        batch_size,
        faults: fault_tx,
        events,
    };
    tokio::spawn(worker.run(control_rx, payload_rx, fault_rx, source.map(|s| s.read())));
    WorkerHandle {
        id,
        control: control_tx,
        payloads: payload_tx,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Created,
    Running,
    Paused,
    Completed,
}

struct Worker {
    id: GrainId,
    mode: Mode,
    processor: BoxedProcessor,
    outputs: Vec<SendingStrategy>,
    enforcer: OrderingEnforcer,
    /// Remaining end-of-stream signals expected per upstream sender.
    pending_ends: HashMap<GrainId, u32>,
    registered: usize,
    had_source: bool,
    source_done: bool,
    /// Payloads that arrived while created or paused, in receipt order.
    stash: VecDeque<PayloadMessage>,
    breakpoints: Vec<LocalBreakpoint>,
    tripped: Vec<BreakpointId>,
    flow_window: usize,
    link: LinkConfig,
    batch_size: usize,
    faults: FaultSender,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Polls the scan source if there is one; parks the branch otherwise.
async fn next_item(source: &mut Option<BoxTupleStream>) -> Option<Result<Tuple, ConnectorError>> {
    match source {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<WorkerControl>,
        mut payloads: PayloadReceiver,
        mut faults: mpsc::UnboundedReceiver<LinkFault>,
        mut source: Option<BoxTupleStream>,
    ) {
        debug!("{} is live", self.id);
        loop {
            let pump = self.mode == Mode::Running && source.is_some();
            tokio::select! {
                biased;
                msg = control.recv() => match msg {
                    Some(msg) => {
                        if self.handle_control(msg) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(fault) = faults.recv() => self.handle_fault(fault),
                Some(delivery) = payloads.recv() => self.handle_payload(delivery),
                item = next_item(&mut source), if pump => self.handle_source_item(item, &mut source),
            }
        }
        debug!("{} deactivated", self.id);
    }

    /// True ends the actor.
    fn handle_control(&mut self, msg: WorkerControl) -> bool {
        match msg {
            WorkerControl::Start { ack } => {
                if self.mode == Mode::Created {
                    match self.processor.initialize() {
                        Ok(()) => {
                            self.mode = Mode::Running;
                            self.replay_stash();
                        }
                        Err(e) => {
                            warn!("{}: processor failed to initialize: {e}", self.id);
                            let _ = self.events.send(WorkerEvent::Failed {
                                worker: self.id,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                let _ = ack.send(());
            }
            WorkerControl::Pause => match self.mode {
                Mode::Created | Mode::Running | Mode::Paused => {
                    self.mode = Mode::Paused;
                    let _ = self.events.send(WorkerEvent::Paused(self.id));
                }
                Mode::Completed => {
                    warn!("{}: pause ignored, worker already completed", self.id)
                }
            },
            WorkerControl::Resume { ack } => {
                match self.mode {
                    Mode::Paused => {
                        self.mode = Mode::Running;
                        self.replay_stash();
                    }
                    Mode::Completed => {
                        warn!("{}: resume ignored, worker already completed", self.id)
                    }
                    Mode::Created | Mode::Running => {}
                }
                let _ = ack.send(());
            }
            WorkerControl::Deactivate { ack } => {
                self.processor.dispose();
                let _ = ack.send(());
                return true;
            }
            WorkerControl::ConnectOutputs { outputs, ack } => {
                self.connect_outputs(outputs);
                let _ = ack.send(());
            }
            WorkerControl::RegisterInputs { senders, ack } => {
                for sender in senders {
                    *self.pending_ends.entry(sender).or_insert(0) += 1;
                    self.registered += 1;
                }
                let _ = ack.send(());
            }
            WorkerControl::AssignBreakpoint(slice) => {
                self.breakpoints.retain(|bp| bp.id != slice.id);
                self.breakpoints.push(slice);
            }
            WorkerControl::ClearBreakpoint(id) => {
                self.breakpoints.retain(|bp| bp.id != id);
            }
            WorkerControl::CollectBreakpoint { id, reply } => {
                let slice = self
                    .breakpoints
                    .iter()
                    .position(|bp| bp.id == id)
                    .map(|i| self.breakpoints.remove(i).report(self.id));
                let _ = reply.send(slice);
            }
        }
        false
    }

    fn connect_outputs(&mut self, spec: OutputSpec) {
        let links: Vec<LinkHandle> = spec
            .destinations
            .into_iter()
            .map(|(dest, inbox)| {
                open_link(self.id, dest, inbox, self.link.clone(), self.faults.clone())
            })
            .collect();
        let strategy = match spec.kind {
            LinkStrategyKind::RoundRobin => SendingStrategy::round_robin(links, self.batch_size),
            LinkStrategyKind::Shuffle(key) => {
                SendingStrategy::shuffle(key, links, self.batch_size)
            }
            LinkStrategyKind::Stream => {
                let Some(link) = links.into_iter().next() else {
                    warn!("{}: stream output with no destination", self.id);
                    return;
                };
                SendingStrategy::stream(link, self.batch_size)
            }
        };
        self.outputs.push(strategy);
    }

    fn handle_fault(&mut self, fault: LinkFault) {
        warn!("{}: giving up on {}: {}", self.id, fault.dest, fault.error);
        let _ = self.events.send(WorkerEvent::Failed {
            worker: self.id,
            reason: fault.error.to_string(),
        });
    }

    /// Every payload is acked, whatever the mode; ownership moves here with
    /// the message. The advertised window shrinks as the stash grows so a
    /// paused worker throttles its upstreams instead of hoarding.
    fn handle_payload(&mut self, delivery: PayloadDelivery) {
        let PayloadDelivery { payload, ack } = delivery;
        let seq = payload.seq;
        match self.mode {
            Mode::Created | Mode::Paused => self.stash.push_back(payload),
            Mode::Running => self.ingest(payload),
            Mode::Completed => {
                if self.enforcer.pre_process(payload).is_some() {
                    warn!("{}: dropped a payload that arrived after completion", self.id);
                }
            }
        }
        let _ = ack.send(PayloadAck {
            seq,
            window: self.advertised_window(),
        });
    }

    fn advertised_window(&self) -> usize {
        self.flow_window
            .saturating_sub(self.stash.len() + self.enforcer.stashed_count())
            .max(1)
    }

    fn ingest(&mut self, payload: PayloadMessage) {
        if let Some(msg) = self.enforcer.pre_process(payload) {
            self.consume(msg);
            while let Some(next) = self.enforcer.post_process() {
                self.consume(next);
            }
        }
        self.flush_batches();
        self.report_tripped();
        self.check_finished();
    }

    fn consume(&mut self, msg: PayloadMessage) {
        if msg.is_end {
            match self.pending_ends.get_mut(&msg.sender) {
                Some(n) if *n > 0 => *n -= 1,
                _ => warn!("{}: unexpected end-of-stream from {}", self.id, msg.sender),
            }
            return;
        }
        for tuple in msg.tuples {
            self.process_tuple(tuple);
        }
    }

    fn process_tuple(&mut self, tuple: Tuple) {
        for bp in &mut self.breakpoints {
            if bp.observe(&tuple) {
                self.tripped.push(bp.id);
            }
        }
        if let Err(e) = self.processor.accept(tuple) {
            warn!("{}: tuple skipped: {e}", self.id);
        }
        self.drain_processor();
    }

    fn drain_processor(&mut self) {
        while self.processor.has_next() {
            match self.processor.next() {
                Some(tuple) => self.emit(tuple),
                None => break,
            }
        }
    }

    fn emit(&mut self, tuple: Tuple) {
        let Some(last) = self.outputs.len().checked_sub(1) else {
            debug!("{}: no outputs connected, dropping a tuple", self.id);
            return;
        };
        for output in &mut self.outputs[..last] {
            output.enqueue(tuple.clone());
        }
        self.outputs[last].enqueue(tuple);
    }

    fn flush_batches(&mut self) {
        for output in &mut self.outputs {
            if let Err(e) = output.send_batched(self.id) {
                warn!("{}: batch flush failed: {e}", self.id);
            }
        }
    }

    fn report_tripped(&mut self) {
        if self.tripped.is_empty() {
            return;
        }
        let ids = std::mem::take(&mut self.tripped);
        let _ = self.events.send(WorkerEvent::BreakpointTriggered {
            worker: self.id,
            ids,
        });
    }

    fn replay_stash(&mut self) {
        let backlog: Vec<PayloadMessage> = self.stash.drain(..).collect();
        for payload in backlog {
            if self.mode == Mode::Running {
                self.ingest(payload);
            } else if self.enforcer.pre_process(payload).is_some() {
                warn!("{}: dropped a payload that arrived after completion", self.id);
            }
        }
    }

    fn handle_source_item(
        &mut self,
        item: Option<Result<Tuple, ConnectorError>>,
        source: &mut Option<BoxTupleStream>,
    ) {
        match item {
            Some(Ok(tuple)) => {
                self.process_tuple(tuple);
                self.flush_batches();
                self.report_tripped();
            }
            Some(Err(e)) => warn!("{}: source error: {e}", self.id),
            None => {
                *source = None;
                self.source_done = true;
                self.check_finished();
            }
        }
    }

    fn inputs_exhausted(&self) -> bool {
        if !self.source_done {
            return false;
        }
        if !self.had_source && self.registered == 0 {
            return false;
        }
        self.pending_ends.values().all(|&n| n == 0)
    }

    fn check_finished(&mut self) {
        if self.mode != Mode::Running || !self.inputs_exhausted() {
            return;
        }
        if let Err(e) = self.processor.no_more() {
            warn!("{}: final flush failed: {e}", self.id);
        }
        self.drain_processor();
        for output in &mut self.outputs {
            if let Err(e) = output.send_end(self.id) {
                warn!("{}: end-of-stream send failed: {e}", self.id);
            }
        }
        self.mode = Mode::Completed;
        let _ = self.events.send(WorkerEvent::Finished(self.id));
    }
}
