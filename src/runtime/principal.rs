//! The per-operator coordinator. A principal builds its operator's worker
//! layers, wires the links between them, and serializes every pause/resume
//! transition through its own single-threaded turn loop: requests that
//! arrive while a transition is settling queue up and replay strictly in
//! arrival order. Worker states live in a map only this task touches.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;

use futures::future::join_all;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::exchange::{GrainId, PayloadSender};
use crate::plan::{build_processor, build_source, generate_topology, LinkStrategyKind, OperatorId, OperatorSpec};
use crate::runtime::breakpoint::{Breakpoint, BreakpointId, BreakpointSpec, BreakpointVerdict};
use crate::runtime::worker::{spawn_worker, OutputSpec, WorkerControl, WorkerEvent, WorkerHandle};

pub enum PrincipalControl {
    Start {
        ack: oneshot::Sender<()>,
    },
    Pause,
    Resume,
    Deactivate {
        ack: oneshot::Sender<()>,
    },
    /// Wire this operator's last layer to the given destination mailboxes.
    ConnectDownstream {
        kind: LinkStrategyKind,
        destinations: Vec<(GrainId, PayloadSender)>,
        ack: oneshot::Sender<()>,
    },
    /// Tell this operator's first layer which upstream senders must end
    /// before its workers may finish.
    ExpectInputs {
        senders: Vec<GrainId>,
        ack: oneshot::Sender<()>,
    },
    AddBreakpoint {
        id: BreakpointId,
        spec: BreakpointSpec,
        ack: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
pub enum PrincipalEvent {
    Paused,
    Resumed,
    Completed,
    Failed { worker: GrainId, reason: String },
    Breakpoint { id: BreakpointId, report: String },
}

pub struct PrincipalHandle {
    pub operator: OperatorId,
    pub control: mpsc::UnboundedSender<PrincipalControl>,
    /// First-layer inboxes, for upstream operators to link against.
    pub inputs: Vec<(GrainId, PayloadSender)>,
    /// Last-layer grain ids, for downstream operators to expect ends from.
    pub output_ids: Vec<GrainId>,
}

/// Builds the operator's topology, wires its internal layers, and spawns
/// the coordinating task.
pub async fn spawn_principal(
    spec: &OperatorSpec,
    config: &EngineConfig,
    job_dir: &Path,
    events: mpsc::UnboundedSender<(OperatorId, PrincipalEvent)>,
) -> PrincipalHandle {
    let topology = generate_topology(spec, config.default_parallelism);
    let (worker_tx, worker_rx) = mpsc::unbounded_channel();
    let mut layers: Vec<Vec<WorkerHandle>> = Vec::with_capacity(topology.layers.len());
    let mut states = HashMap::new();
    for (l, &count) in topology.layers.iter().enumerate() {
        let mut layer = Vec::with_capacity(count);
        for i in 0..count {
            let grain = GrainId::new(spec.id.0, l as u16, i as u16);
            let processor = build_processor(spec, grain, l, job_dir);
            let source = if l == 0 { build_source(spec, i, count) } else { None };
            layer.push(spawn_worker(
                grain,
                processor,
                source,
                config.link(),
                config.batch_size,
                worker_tx.clone(),
            ));
            states.insert(grain, WorkerView::Uninitialized);
        }
        layers.push(layer);
    }
    for (l, kind) in topology.interlink.iter().enumerate() {
        let destinations: Vec<(GrainId, PayloadSender)> = layers[l + 1]
            .iter()
            .map(|w| (w.id, w.payloads.clone()))
            .collect();
        let senders: Vec<GrainId> = layers[l].iter().map(|w| w.id).collect();
        connect_layer(&layers[l], kind, &destinations).await;
        register_layer(&layers[l + 1], &senders).await;
    }

    let inputs = layers[0].iter().map(|w| (w.id, w.payloads.clone())).collect();
    let output_ids = layers[layers.len() - 1].iter().map(|w| w.id).collect();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let principal = Principal {
        operator: spec.id,
        layers,
        states,
        transitioning: false,
        queued: VecDeque::new(),
        auto_resume: false,
        reported_paused: false,
        failed: false,
        completed_reported: false,
        breakpoints: HashMap::new(),
        triggered: BTreeSet::new(),
        events,
    };
    tokio::spawn(principal.run(control_rx, worker_rx));
    PrincipalHandle {
        operator: spec.id,
        control: control_tx,
        inputs,
        output_ids,
    }
}

async fn connect_layer(
    senders: &[WorkerHandle],
    kind: &LinkStrategyKind,
    destinations: &[(GrainId, PayloadSender)],
) {
    for worker in senders {
        let (tx, rx) = oneshot::channel();
        let outputs = OutputSpec {
            kind: kind.clone(),
            destinations: destinations.to_vec(),
        };
        if worker
            .control
            .send(WorkerControl::ConnectOutputs { outputs, ack: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

async fn register_layer(receivers: &[WorkerHandle], senders: &[GrainId]) {
    for worker in receivers {
        let (tx, rx) = oneshot::channel();
        if worker
            .control
            .send(WorkerControl::RegisterInputs {
                senders: senders.to_vec(),
                ack: tx,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerView {
    Uninitialized,
    Running,
    Pausing,
    Paused,
    Completed,
}

enum Request {
    Pause,
    Resume,
}

struct Principal {
    operator: OperatorId,
    layers: Vec<Vec<WorkerHandle>>,
    states: HashMap<GrainId, WorkerView>,
    /// Coarse mutex over pause settling; while true, new pause/resume
    /// requests queue instead of interleaving.
    transitioning: bool,
    queued: VecDeque<Request>,
    /// The in-flight pause was breakpoint-driven; resume once settled.
    auto_resume: bool,
    reported_paused: bool,
    failed: bool,
    completed_reported: bool,
    breakpoints: HashMap<BreakpointId, Breakpoint>,
    triggered: BTreeSet<BreakpointId>,
    events: mpsc::UnboundedSender<(OperatorId, PrincipalEvent)>,
}

impl Principal {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<PrincipalControl>,
        mut workers: mpsc::UnboundedReceiver<WorkerEvent>,
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
                    None => break,
                },
                Some(event) = workers.recv() => self.handle_worker_event(event).await,
            }
        }
        debug!("{} principal stopped", self.operator);
    }

    /// True ends the actor.
    async fn handle_control(&mut self, msg: PrincipalControl) -> bool {
        match msg {
            PrincipalControl::Start { ack } => {
                for l in 0..self.layers.len() {
                    let mut acks = Vec::new();
                    for worker in &self.layers[l] {
                        let (tx, rx) = oneshot::channel();
                        if worker
                            .control
                            .send(WorkerControl::Start { ack: tx })
                            .is_ok()
                        {
                            acks.push(rx);
                        }
                    }
                    join_all(acks).await;
                    for worker in &self.layers[l] {
                        if let Some(view) = self.states.get_mut(&worker.id) {
                            if *view == WorkerView::Uninitialized {
                                *view = WorkerView::Running;
                            }
                        }
                    }
                }
                let _ = ack.send(());
            }
            PrincipalControl::Pause => self.request(Request::Pause).await,
            PrincipalControl::Resume => self.request(Request::Resume).await,
            PrincipalControl::Deactivate { ack } => {
                for l in 0..self.layers.len() {
                    let mut acks = Vec::new();
                    for worker in &self.layers[l] {
                        let (tx, rx) = oneshot::channel();
                        if worker
                            .control
                            .send(WorkerControl::Deactivate { ack: tx })
                            .is_ok()
                        {
                            acks.push(rx);
                        }
                    }
                    join_all(acks).await;
                }
                let _ = ack.send(());
                return true;
            }
            PrincipalControl::ConnectDownstream {
                kind,
                destinations,
                ack,
            } => {
                if let Some(last) = self.layers.last() {
                    connect_layer(last, &kind, &destinations).await;
                }
                let _ = ack.send(());
            }
            PrincipalControl::ExpectInputs { senders, ack } => {
                if let Some(first) = self.layers.first() {
                    register_layer(first, &senders).await;
                }
                let _ = ack.send(());
            }
            PrincipalControl::AddBreakpoint { id, spec, ack } => {
                let bp = Breakpoint::new(id, spec);
                let live = self.live_ids();
                if live.is_empty() {
                    warn!("{}: no live workers left to watch {id}", self.operator);
                } else {
                    self.assign_slices(&bp, &live);
                    self.breakpoints.insert(id, bp);
                }
                let _ = ack.send(());
            }
        }
        false
    }

    async fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Paused(id) => {
                if let Some(view) = self.states.get_mut(&id) {
                    if *view != WorkerView::Completed {
                        *view = WorkerView::Paused;
                    }
                }
                self.try_settle().await;
            }
            WorkerEvent::Finished(id) => {
                if let Some(view) = self.states.get_mut(&id) {
                    *view = WorkerView::Completed;
                }
                self.check_completed();
                // a worker that finished before our pause reached it will
                // never report paused; recheck so the transition settles
                self.try_settle().await;
            }
            WorkerEvent::Failed { worker, reason } => {
                warn!("{}: worker {worker} failed: {reason}", self.operator);
                self.failed = true;
                if let Some(view) = self.states.get_mut(&worker) {
                    *view = WorkerView::Completed;
                }
                let _ = self
                    .events
                    .send((self.operator, PrincipalEvent::Failed { worker, reason }));
                self.try_settle().await;
            }
            WorkerEvent::BreakpointTriggered { worker, ids } => {
                debug!("{}: {worker} tripped {ids:?}", self.operator);
                self.triggered.extend(ids);
                if !self.transitioning {
                    self.auto_resume = true;
                    self.pause_workers();
                }
            }
        }
    }

    async fn request(&mut self, req: Request) {
        if self.transitioning {
            self.queued.push_back(req);
            return;
        }
        self.execute(req).await;
    }

    async fn execute(&mut self, req: Request) {
        match req {
            Request::Pause => self.pause_workers(),
            Request::Resume => self.resume_workers().await,
        }
    }

    fn pause_workers(&mut self) {
        let mut any = false;
        for layer in &self.layers {
            for worker in layer {
                let Some(view) = self.states.get_mut(&worker.id) else {
                    continue;
                };
                match view {
                    WorkerView::Completed | WorkerView::Paused => {}
                    _ => {
                        *view = WorkerView::Pausing;
                        let _ = worker.control.send(WorkerControl::Pause);
                        any = true;
                    }
                }
            }
        }
        if any {
            self.transitioning = true;
        } else {
            // nothing left to pause: all workers completed or already paused
            self.auto_resume = false;
            self.report_paused();
        }
    }

    async fn resume_workers(&mut self) {
        for l in 0..self.layers.len() {
            let mut acks = Vec::new();
            for worker in &self.layers[l] {
                if self.states.get(&worker.id) == Some(&WorkerView::Completed) {
                    continue;
                }
                let (tx, rx) = oneshot::channel();
                if worker
                    .control
                    .send(WorkerControl::Resume { ack: tx })
                    .is_ok()
                {
                    acks.push(rx);
                }
            }
            join_all(acks).await;
            for worker in &self.layers[l] {
                if let Some(view) = self.states.get_mut(&worker.id) {
                    if *view != WorkerView::Completed {
                        *view = WorkerView::Running;
                    }
                }
            }
        }
        self.reported_paused = false;
        let _ = self.events.send((self.operator, PrincipalEvent::Resumed));
    }

    /// Settles an in-flight pause once no worker is still mid-transition:
    /// report, collect breakpoints while quiescent, auto-resume if the
    /// pause was internal, then replay queued requests in arrival order.
    async fn try_settle(&mut self) {
        if !self.transitioning {
            return;
        }
        if self.states.values().any(|v| *v == WorkerView::Pausing) {
            return;
        }
        self.transitioning = false;
        self.report_paused();
        self.evaluate_breakpoints().await;
        if self.auto_resume {
            self.auto_resume = false;
            self.resume_workers().await;
        }
        self.drain_queue().await;
    }

    async fn drain_queue(&mut self) {
        while !self.transitioning {
            let Some(req) = self.queued.pop_front() else {
                break;
            };
            self.execute(req).await;
        }
    }

    fn report_paused(&mut self) {
        if self.reported_paused {
            return;
        }
        self.reported_paused = true;
        let _ = self.events.send((self.operator, PrincipalEvent::Paused));
    }

    fn check_completed(&mut self) {
        if self.completed_reported || self.failed {
            return;
        }
        if self.states.values().all(|v| *v == WorkerView::Completed) {
            self.completed_reported = true;
            let _ = self.events.send((self.operator, PrincipalEvent::Completed));
        }
    }

    async fn evaluate_breakpoints(&mut self) {
        if self.triggered.is_empty() {
            return;
        }
        let ids: Vec<BreakpointId> = std::mem::take(&mut self.triggered).into_iter().collect();
        for id in ids {
            let Some(mut bp) = self.breakpoints.remove(&id) else {
                continue;
            };
            let mut reports = Vec::new();
            for l in 0..self.layers.len() {
                for w in 0..self.layers[l].len() {
                    let worker = &self.layers[l][w];
                    if self.states.get(&worker.id) == Some(&WorkerView::Completed) {
                        continue;
                    }
                    let (tx, rx) = oneshot::channel();
                    if worker
                        .control
                        .send(WorkerControl::CollectBreakpoint { id, reply: tx })
                        .is_err()
                    {
                        continue;
                    }
                    if let Ok(Some(report)) = rx.await {
                        reports.push(report);
                    }
                }
            }
            match bp.absorb(&reports) {
                BreakpointVerdict::Satisfied(report) => {
                    let _ = self
                        .events
                        .send((self.operator, PrincipalEvent::Breakpoint { id, report }));
                }
                BreakpointVerdict::Rearm => {
                    let live = self.live_ids();
                    if live.is_empty() {
                        debug!("{}: dropping {id}, no live workers remain", self.operator);
                        continue;
                    }
                    self.assign_slices(&bp, &live);
                    self.breakpoints.insert(id, bp);
                }
            }
        }
    }

    fn live_ids(&self) -> Vec<GrainId> {
        self.layers
            .iter()
            .flatten()
            .filter(|w| self.states.get(&w.id) != Some(&WorkerView::Completed))
            .map(|w| w.id)
            .collect()
    }

    fn assign_slices(&self, bp: &Breakpoint, live: &[GrainId]) {
        for (grain, slice) in bp.partition(live) {
            if let Some(worker) = self.layers.iter().flatten().find(|w| w.id == grain) {
                let _ = worker.control.send(WorkerControl::AssignBreakpoint(slice));
            }
        }
    }
}
