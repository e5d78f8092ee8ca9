//! Sliding-window flow control for one (sender, destination) link.
//!
//! [`FlowWindow`] is the pure bookkeeping: it decides whether a message may
//! go on the wire now or must wait in a FIFO buffer, and it coalesces acks
//! that arrive out of order. [`open_link`] spawns the delivery task that
//! drives a window against a real destination mailbox, retrying unacked
//! messages on timeout and reporting the link as dead once retries are
//! exhausted.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot};

use super::{GrainId, LinkError, PayloadAck, PayloadDelivery, PayloadMessage, PayloadSender};

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub initial_window: usize,
    pub ack_timeout: Duration,
    pub retry_limit: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            initial_window: 20,
            ack_timeout: Duration::from_millis(500),
            retry_limit: 5,
        }
    }
}

/// Window bookkeeping for one destination. Messages are offered in sequence
/// order; at most `window` sequence numbers may be outstanding (sent but not
/// yet contiguously acknowledged) at any time.
pub struct FlowWindow {
    window: usize,
    /// Next sequence number that may be handed to the wire.
    next_seq: u64,
    /// Every sequence number below this has been acknowledged.
    acked_below: u64,
    /// Acks that arrived ahead of a still-missing one.
    acked_ahead: BTreeSet<u64>,
    /// Overflow, in original enqueue order.
    buffered: VecDeque<PayloadMessage>,
}

impl FlowWindow {
    pub fn new(window: usize) -> Self {
        FlowWindow {
            window: window.max(1),
            next_seq: 0,
            acked_below: 0,
            acked_ahead: BTreeSet::new(),
            buffered: VecDeque::new(),
        }
    }

    /// Sequence distance between the newest sent message and the oldest
    /// unacknowledged one.
    pub fn outstanding(&self) -> u64 {
        self.next_seq - self.acked_below
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffered.is_empty()
    }

    /// Returns the message if it may be sent immediately, buffers it
    /// otherwise. Earlier buffered messages always leave first.
    pub fn offer(&mut self, msg: PayloadMessage) -> Option<PayloadMessage> {
        if self.has_buffered() || self.outstanding() >= self.window as u64 {
            self.buffered.push_back(msg);
            return None;
        }
        self.next_seq = msg.seq + 1;
        Some(msg)
    }

    /// Records one ack, adopting the receiver's advertised window, and
    /// returns any buffered messages that now fit.
    pub fn on_ack(&mut self, ack: PayloadAck) -> Vec<PayloadMessage> {
        self.window = ack.window.max(1);
        if ack.seq >= self.acked_below {
            self.acked_ahead.insert(ack.seq);
            while self.acked_ahead.remove(&self.acked_below) {
                self.acked_below += 1;
            }
        } else {
            debug!("ignoring stale ack for seq {}", ack.seq);
        }
        let mut released = Vec::new();
        while self.has_buffered() && self.outstanding() < self.window as u64 {
            if let Some(msg) = self.buffered.pop_front() {
                self.next_seq = msg.seq + 1;
                released.push(msg);
            }
        }
        released
    }
}

/// Producer-side handle of a flow-controlled link. Dropping it lets the
/// delivery task finish its backlog and exit.
pub struct LinkHandle {
    pub dest: GrainId,
    queue: mpsc::UnboundedSender<PayloadMessage>,
}

impl LinkHandle {
    pub fn send(&self, msg: PayloadMessage) -> Result<(), LinkError> {
        self.queue.send(msg).map_err(|_| LinkError::Closed)
    }

    /// Link fed straight into a channel, bypassing the delivery task.
    #[cfg(test)]
    pub(crate) fn direct(dest: GrainId, queue: mpsc::UnboundedSender<PayloadMessage>) -> Self {
        LinkHandle { dest, queue }
    }
}

/// Raised by a delivery task whose destination is gone for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFault {
    pub dest: GrainId,
    pub error: LinkError,
}

pub type FaultSender = mpsc::UnboundedSender<LinkFault>;

/// Spawns the delivery task for one link and returns its producer handle.
pub fn open_link(
    owner: GrainId,
    dest: GrainId,
    inbox: PayloadSender,
    config: LinkConfig,
    faults: FaultSender,
) -> LinkHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_link(owner, dest, rx, inbox, config, faults));
    LinkHandle { dest, queue: tx }
}

type AckWait = BoxFuture<
    'static,
    (
        u64,
        Result<Result<PayloadAck, oneshot::error::RecvError>, tokio::time::error::Elapsed>,
    ),
>;

fn put_on_wire(
    msg: PayloadMessage,
    inbox: &PayloadSender,
    in_flight: &mut HashMap<u64, PayloadMessage>,
    acks: &mut FuturesUnordered<AckWait>,
    ack_timeout: Duration,
) -> Result<(), LinkError> {
    let seq = msg.seq;
    let (tx, rx) = oneshot::channel();
    in_flight.insert(seq, msg.clone());
    inbox
        .send(PayloadDelivery {
            payload: msg,
            ack: tx,
        })
        .map_err(|_| LinkError::Closed)?;
    acks.push(Box::pin(async move {
        (seq, tokio::time::timeout(ack_timeout, rx).await)
    }));
    Ok(())
}

async fn run_link(
    owner: GrainId,
    dest: GrainId,
    mut queue: mpsc::UnboundedReceiver<PayloadMessage>,
    inbox: PayloadSender,
    config: LinkConfig,
    faults: FaultSender,
) {
    let mut window = FlowWindow::new(config.initial_window);
    let mut in_flight: HashMap<u64, PayloadMessage> = HashMap::new();
    let mut attempts: HashMap<u64, u32> = HashMap::new();
    let mut acks: FuturesUnordered<AckWait> = FuturesUnordered::new();
    let mut queue_open = true;

    let fail = |error: LinkError, faults: &FaultSender| {
        error!("link {owner} -> {dest} is dead: {error}");
        let _ = faults.send(LinkFault { dest, error });
    };

    loop {
        tokio::select! {
            Some((seq, outcome)) = acks.next(), if !acks.is_empty() => match outcome {
                Ok(Ok(ack)) => {
                    attempts.remove(&seq);
                    in_flight.remove(&seq);
                    for msg in window.on_ack(ack) {
                        if let Err(e) = put_on_wire(msg, &inbox, &mut in_flight, &mut acks, config.ack_timeout) {
                            fail(e, &faults);
                            return;
                        }
                    }
                }
                // a dropped ack slot is retried exactly like a timeout
                Ok(Err(_)) | Err(_) => {
                    let tries = attempts.entry(seq).or_insert(0);
                    *tries += 1;
                    if *tries > config.retry_limit {
                        fail(LinkError::AckTimeout { attempts: *tries }, &faults);
                        return;
                    }
                    let Some(copy) = in_flight.get(&seq).cloned() else {
                        continue;
                    };
                    warn!(
                        "no ack from {dest} for seq {seq} (attempt {tries} of {}), resending",
                        config.retry_limit
                    );
                    if let Err(e) = put_on_wire(copy, &inbox, &mut in_flight, &mut acks, config.ack_timeout) {
                        fail(e, &faults);
                        return;
                    }
                }
            },
            maybe = queue.recv(), if queue_open => match maybe {
                Some(msg) => {
                    if let Some(clear) = window.offer(msg) {
                        if let Err(e) = put_on_wire(clear, &inbox, &mut in_flight, &mut acks, config.ack_timeout) {
                            fail(e, &faults);
                            return;
                        }
                    }
                }
                None => queue_open = false,
            },
            else => break,
        }
        if !queue_open && in_flight.is_empty() && !window.has_buffered() {
            break;
        }
    }
    debug!("link {owner} -> {dest} drained and closed");
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;

    const OWNER: GrainId = GrainId::new(1, 0, 0);
    const DEST: GrainId = GrainId::new(2, 0, 0);

    fn msg(seq: u64) -> PayloadMessage {
        PayloadMessage::data(OWNER, seq, vec![])
    }

    fn quick_config() -> LinkConfig {
        LinkConfig {
            initial_window: 20,
            ack_timeout: Duration::from_millis(20),
            retry_limit: 2,
        }
    }

    #[test]
    fn window_buffers_past_capacity() {
        let mut w = FlowWindow::new(2);
        assert!(w.offer(msg(0)).is_some());
        assert!(w.offer(msg(1)).is_some());
        assert!(w.offer(msg(2)).is_none());
        assert_eq!(w.outstanding(), 2);

        let released = w.on_ack(PayloadAck { seq: 0, window: 2 });
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].seq, 2);
        assert!(w.outstanding() <= 2);
    }

    #[test]
    fn window_coalesces_out_of_order_acks() {
        let mut w = FlowWindow::new(3);
        for seq in 0..3 {
            assert!(w.offer(msg(seq)).is_some());
        }
        for seq in 3..6 {
            assert!(w.offer(msg(seq)).is_none());
        }
        // acks for 1 and 2 are stuck behind the missing ack for 0
        assert!(w.on_ack(PayloadAck { seq: 2, window: 3 }).is_empty());
        assert!(w.on_ack(PayloadAck { seq: 1, window: 3 }).is_empty());
        let released = w.on_ack(PayloadAck { seq: 0, window: 3 });
        assert_eq!(
            released.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert_eq!(w.outstanding(), 3);
    }

    #[test]
    fn window_honors_receiver_resize() {
        let mut w = FlowWindow::new(4);
        for seq in 0..4 {
            assert!(w.offer(msg(seq)).is_some());
        }
        assert!(w.offer(msg(4)).is_none());
        // receiver shrinks the window to 1: the ack frees slot 0 but the
        // new bound keeps everything else buffered
        assert!(w.on_ack(PayloadAck { seq: 0, window: 1 }).is_empty());
        assert!(w.has_buffered());
    }

    #[test]
    fn buffered_messages_keep_enqueue_order() {
        let mut w = FlowWindow::new(1);
        assert!(w.offer(msg(0)).is_some());
        for seq in 1..4 {
            assert!(w.offer(msg(seq)).is_none());
        }
        let mut seen = Vec::new();
        for seq in 0..3 {
            for m in w.on_ack(PayloadAck { seq, window: 1 }) {
                seen.push(m.seq);
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn delivers_backlog_within_window() {
        let (inbox, mut deliveries) = mpsc::unbounded_channel();
        let (fault_tx, mut faults) = mpsc::unbounded_channel();
        let link = open_link(
            OWNER,
            DEST,
            inbox,
            LinkConfig {
                initial_window: 2,
                ..quick_config()
            },
            fault_tx,
        );

        for seq in 0..5 {
            link.send(msg(seq)).unwrap();
        }
        drop(link);

        let mut pending: VecDeque<PayloadDelivery> = VecDeque::new();
        let mut seen = Vec::new();
        while seen.len() < 5 {
            let d = deliveries.recv().await.unwrap();
            seen.push(d.payload.seq);
            pending.push_back(d);
            assert!(pending.len() <= 2, "window of 2 exceeded");
            if pending.len() == 2 || seen.len() == 5 {
                while let Some(d) = pending.pop_front() {
                    let seq = d.payload.seq;
                    let _ = d.ack.send(PayloadAck { seq, window: 2 });
                }
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(deliveries.recv().await.is_none());
        assert_eq!(faults.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }

    #[tokio::test]
    async fn lost_ack_triggers_resend() {
        let (inbox, mut deliveries) = mpsc::unbounded_channel();
        let (fault_tx, mut faults) = mpsc::unbounded_channel();
        let link = open_link(OWNER, DEST, inbox, quick_config(), fault_tx);

        link.send(msg(0)).unwrap();
        link.send(msg(1)).unwrap();
        drop(link);

        let mut seen = Vec::new();
        let mut dropped_once = false;
        while let Some(d) = deliveries.recv().await {
            seen.push(d.payload.seq);
            if d.payload.seq == 0 && !dropped_once {
                dropped_once = true;
                continue; // ack slot dropped, forcing a timeout
            }
            let seq = d.payload.seq;
            let _ = d.ack.send(PayloadAck { seq, window: 20 });
        }
        assert_eq!(seen.iter().filter(|&&s| s == 0).count(), 2);
        assert!(faults.recv().await.is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_report_a_fault() {
        let (inbox, mut deliveries) = mpsc::unbounded_channel();
        let (fault_tx, mut faults) = mpsc::unbounded_channel();
        let link = open_link(OWNER, DEST, inbox, quick_config(), fault_tx);
        link.send(msg(0)).unwrap();

        // swallow every delivery without acking
        tokio::spawn(async move { while deliveries.recv().await.is_some() {} });

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.dest, DEST);
        assert_eq!(fault.error, LinkError::AckTimeout { attempts: 3 });
        drop(link);
    }
}
