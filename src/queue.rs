#![forbid(unsafe_code)]

// Bounded hand-off between the generator thread and sender workers

use crate::message::OutboundUnit;

/// Item carried by the unit queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Unit(OutboundUnit),
    /// Tells one worker to stop consuming.
    Stop,
}

pub type UnitSender = flume::Sender<Envelope>;
pub type UnitReceiver = flume::Receiver<Envelope>;

/// Fixed-capacity multi-consumer FIFO.
///
/// The generator thread blocks in `send` while the queue is full; workers await
/// `recv_async` while it is empty.
pub fn bounded(capacity: usize) -> (UnitSender, UnitReceiver) {
    flume::bounded(capacity)
}
