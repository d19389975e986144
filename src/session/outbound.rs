//! Bounded outbound packet queue.
//!
//! Many producers (handlers, fan-out, the dispatcher) and one consumer (the
//! session writer). What happens when the queue is full is decided by the
//! node's [`OverflowPolicy`].

use crate::config::OverflowPolicy;
use crate::core::packet::Packet;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Result of [`OutboundQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest packet.
    DroppedOldest,
    /// The new packet was discarded.
    DroppedNewest,
    /// Queue full under `CloseSession`; nothing was queued.
    Overflow,
    /// The queue no longer accepts packets.
    Closed,
}

#[derive(Debug, Default)]
struct State {
    packets: VecDeque<Packet>,
    closed: bool,
}

#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<State>,
    capacity: usize,
    policy: OverflowPolicy,
    readable: Notify,
    writable: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(State {
                packets: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `packet`. Only suspends under [`OverflowPolicy::Block`].
    pub async fn push(&self, packet: Packet) -> PushOutcome {
        let mut packet = Some(packet);
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return PushOutcome::Closed;
                }
                if state.packets.len() < self.capacity {
                    if let Some(packet) = packet.take() {
                        state.packets.push_back(packet);
                    }
                    drop(state);
                    self.readable.notify_one();
                    return PushOutcome::Queued;
                }
                match self.policy {
                    OverflowPolicy::Block => {}
                    OverflowPolicy::DropOldest => {
                        state.packets.pop_front();
                        if let Some(packet) = packet.take() {
                            state.packets.push_back(packet);
                        }
                        drop(state);
                        self.readable.notify_one();
                        return PushOutcome::DroppedOldest;
                    }
                    OverflowPolicy::DropNewest => return PushOutcome::DroppedNewest,
                    OverflowPolicy::CloseSession => return PushOutcome::Overflow,
                }
            }

            notified.await;
        }
    }

    /// Next packet to write. Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<Packet> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(packet) = state.packets.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(packet);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting packets. `last` is appended regardless of capacity, so
    /// a Kick always goes out after everything already queued.
    pub fn close_with(&self, last: Option<Packet>) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            if let Some(packet) = last {
                state.packets.push_back(packet);
            }
            state.closed = true;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn close(&self) {
        self.close_with(None);
    }

    /// Discard everything still queued.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.packets.len();
        state.packets.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().packets.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}
