//! Per-channel buffering of sends issued before the channel is bound

use crate::message::{Args, ChannelKind, PeerId};
use crate::transport::Channel;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Ordered buffer that is drained exactly once
#[derive(Debug)]
pub struct PendingQueue<T> {
    state: QueueState<T>,
}

#[derive(Debug)]
enum QueueState<T> {
    Buffering(VecDeque<T>),
    Drained,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self {
            state: QueueState::Buffering(VecDeque::new()),
        }
    }

    /// Append an item; hands it back once the queue has been drained
    pub fn push(&mut self, item: T) -> std::result::Result<(), T> {
        match &mut self.state {
            QueueState::Buffering(items) => {
                items.push_back(item);
                Ok(())
            }
            QueueState::Drained => Err(item),
        }
    }

    /// Take every buffered item in insertion order and retire the queue
    pub fn drain(&mut self) -> VecDeque<T> {
        match std::mem::replace(&mut self.state, QueueState::Drained) {
            QueueState::Buffering(items) => items,
            QueueState::Drained => VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.state {
            QueueState::Buffering(items) => items.len(),
            QueueState::Drained => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_drained(&self) -> bool {
        matches!(self.state, QueueState::Drained)
    }
}

/// A send with its addressing, as issued by the endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ToPeer(Args),
    ToTarget(PeerId, Args),
    ToAll(Args),
}

impl Outbound {
    pub fn deliver(self, channel: &dyn Channel) -> Result<()> {
        match self {
            Outbound::ToPeer(args) => channel.send_to_peer(args),
            Outbound::ToTarget(target, args) => channel.send_to_target(&target, args),
            Outbound::ToAll(args) => channel.send_to_all(args),
        }
    }
}

struct SlotState {
    channel: Option<Arc<dyn Channel>>,
    pending: PendingQueue<Outbound>,
}

/// One of an endpoint's two channels, bound at most once
pub(crate) struct ChannelSlot {
    kind: ChannelKind,
    state: Mutex<SlotState>,
}

impl ChannelSlot {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            state: Mutex::new(SlotState {
                channel: None,
                pending: PendingQueue::new(),
            }),
        }
    }

    /// Send now if bound, otherwise buffer
    ///
    /// Delivery happens under the slot lock so concurrent senders cannot
    /// overtake a replay in progress.
    pub fn send(&self, outbound: Outbound) -> Result<()> {
        let mut state = self.state.lock();
        match state.channel.clone() {
            Some(channel) => outbound.deliver(channel.as_ref()),
            None => {
                if let Err(outbound) = state.pending.push(outbound) {
                    return Err(Error::runtime_msg(format!(
                        "{:?} queue drained without a channel: {outbound:?}",
                        self.kind
                    )));
                }
                tracing::trace!(
                    "Buffered {:?} send, {} pending",
                    self.kind,
                    state.pending.len()
                );
                Ok(())
            }
        }
    }

    /// Bind `channel`: run `install`, replay the queue in order, then retire it
    ///
    /// Returns the number of replayed sends.
    pub fn bind<F>(&self, channel: Arc<dyn Channel>, install: F) -> Result<usize>
    where
        F: FnOnce(&Arc<dyn Channel>) -> Result<()>,
    {
        let mut state = self.state.lock();
        if state.channel.is_some() {
            return Err(Error::configuration(
                format!("{:?} channel is already bound", self.kind),
                Some(format!("{:?}", self.kind).to_lowercase()),
            ));
        }

        install(&channel)?;

        let replay = state.pending.drain();
        let replayed = replay.len();
        for outbound in replay {
            if let Err(e) = outbound.deliver(channel.as_ref()) {
                tracing::warn!("Dropped buffered {:?} send during replay: {}", self.kind, e);
            }
        }
        state.channel = Some(channel);

        tracing::info!("Bound {:?} channel, replayed {} sends", self.kind, replayed);
        Ok(replayed)
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.state.lock().channel.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().channel.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}
