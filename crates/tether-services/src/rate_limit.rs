//! Control-message rate limiter: one message per type and sender per window.
//!
//! Only control messages addressed to this node are limited. Application
//! traffic and relayed traffic pass untouched.
//!
//! Runs below disarming, so only the type visible in the clear counts:
//! unarmed content, or armed content that is authenticated but not
//! encrypted.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tether_core::{MessageType, PublicKey};

use crate::clock::SharedClock;
use crate::error::PipelineError;
use crate::pipeline::{Action, Address, Message, NodeEvent, Stage};

pub struct RateLimiter {
    me: PublicKey,
    window_ms: u64,
    clock: SharedClock,
    last_accepted: DashMap<(MessageType, PublicKey), u64>,
}

impl RateLimiter {
    pub fn new(me: PublicKey, window_ms: u64, clock: SharedClock) -> Self {
        Self {
            me,
            window_ms,
            clock,
            last_accepted: DashMap::new(),
        }
    }

    /// Record an attempt at `now`. Rejected attempts do not move the window.
    pub fn try_acquire(&self, message_type: MessageType, sender: PublicKey) -> bool {
        let now = self.clock.now_ms();
        match self.last_accepted.entry((message_type, sender)) {
            Entry::Occupied(mut last) => {
                if now.saturating_sub(*last.get()) < self.window_ms {
                    return false;
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        true
    }

    /// Forget windows that have already closed.
    fn evict_closed(&self) {
        let now = self.clock.now_ms();
        self.last_accepted
            .retain(|_, last| now.saturating_sub(*last) < self.window_ms);
    }
}

impl Stage for RateLimiter {
    fn name(&self) -> &'static str {
        "rate-limiter"
    }

    fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        if let Some(envelope) = message.envelope() {
            if envelope.recipient() == self.me {
                if let Some(message_type) = envelope.visible_message_type() {
                    let sender = envelope.sender();
                    if message_type.is_control() && !self.try_acquire(message_type, sender) {
                        tracing::debug!(%from, peer = %sender, ?message_type, "rate limited");
                        return Err(PipelineError::RateLimited {
                            message_type,
                            sender,
                        });
                    }
                }
            }
        }
        Ok(vec![Action::Inbound { from, message }])
    }

    fn on_tick(&self) -> Result<Vec<Action>, PipelineError> {
        self.evict_closed();
        Ok(Vec::new())
    }

    fn on_event(&self, event: NodeEvent) -> Result<Vec<Action>, PipelineError> {
        if event.is_shutdown() {
            self.last_accepted.clear();
        }
        Ok(Vec::new())
    }
}
