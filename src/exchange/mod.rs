//! Data-plane message passing between grains.
//!
//! A payload travels as a [`PayloadMessage`] stamped with the sending grain
//! and a per-(sender, receiver) sequence number. Delivery is at-least-once
//! and unordered; [`ordering::OrderingEnforcer`] restores per-sender FIFO
//! exactly-once semantics on the receiving side, and [`flow`] keeps a
//! sliding window of unacknowledged messages per link.

use parse_display::Display;
use tokio::sync::{mpsc, oneshot};

use crate::tuple::Tuple;

pub mod flow;
pub mod ordering;
pub mod sending;

/// Address of one worker grain: operator, layer within the operator,
/// partition index within the layer.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("w{operator}.{layer}.{index}")]
pub struct GrainId {
    pub operator: u32,
    pub layer: u16,
    pub index: u16,
}

impl GrainId {
    pub const fn new(operator: u32, layer: u16, index: u16) -> Self {
        GrainId {
            operator,
            layer,
            index,
        }
    }
}

/// The unit of transfer between grains. Sequence numbers are per
/// (sender, receiver) and start at 0; `is_end` marks the final message of
/// that link (its payload is empty). Once built a message is never mutated,
/// so a retry resends exactly the same bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadMessage {
    pub sender: GrainId,
    pub seq: u64,
    pub tuples: Vec<Tuple>,
    pub is_end: bool,
}

impl PayloadMessage {
    pub fn data(sender: GrainId, seq: u64, tuples: Vec<Tuple>) -> Self {
        PayloadMessage {
            sender,
            seq,
            tuples,
            is_end: false,
        }
    }

    pub fn end(sender: GrainId, seq: u64) -> Self {
        PayloadMessage {
            sender,
            seq,
            tuples: Vec::new(),
            is_end: true,
        }
    }
}

/// Receiver response to one payload. `window` is the receiver-advertised
/// number of messages it is willing to keep in flight on this link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadAck {
    pub seq: u64,
    pub window: usize,
}

/// One payload in transit together with its ack slot. The receiver owns the
/// message once it pulls the delivery out of its mailbox.
#[derive(Debug)]
pub struct PayloadDelivery {
    pub payload: PayloadMessage,
    pub ack: oneshot::Sender<PayloadAck>,
}

pub type PayloadSender = mpsc::UnboundedSender<PayloadDelivery>;
pub type PayloadReceiver = mpsc::UnboundedReceiver<PayloadDelivery>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("destination mailbox closed")]
    Closed,
    #[error("no acknowledgement after {attempts} attempts")]
    AckTimeout { attempts: u32 },
}
