//! Per-conversation admission control.
//!
//! The [`SessionGuard`] holds one in-flight slot per conversation id. An
//! exchange must hold the [`Lease`] for its conversation while it runs; a
//! second admission for the same id is rejected with [`Error::Busy`] until the
//! lease is released. Releasing is unconditional: dropping a lease releases it,
//! so success, failure, cancellation, and panics all free the slot.
//!
//! The slot also carries the conversation's pending one-shot tool toggles.
//! They can only change while the conversation is idle, are snapshotted into
//! the lease at admission, and reset to default when the lease is released.

use crate::types::ToolFlags;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct InFlight {
    lease_id: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct Slot {
    in_flight: Option<InFlight>,
    pending_flags: ToolFlags,
}

impl Slot {
    fn is_idle_default(&self) -> bool {
        self.in_flight.is_none() && self.pending_flags.is_empty()
    }
}

/// Enforces at most one in-flight exchange per conversation id.
///
/// Cloning is cheap; clones share the same slots.
#[derive(Debug, Clone, Default)]
pub struct SessionGuard {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    next_lease: Arc<AtomicU64>,
}

impl SessionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the in-flight slot for `conversation_id`.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] if a lease for the same conversation is outstanding.
    pub fn admit(&self, conversation_id: &str) -> Result<Lease> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(conversation_id.to_string()).or_default();

        if slot.in_flight.is_some() {
            log::debug!("Rejecting admission for busy conversation {}", conversation_id);
            return Err(Error::busy(conversation_id));
        }

        let lease_id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        slot.in_flight = Some(InFlight {
            lease_id,
            token: token.clone(),
        });
        let tool_flags = slot.pending_flags;

        log::debug!("Admitted lease {} for conversation {}", lease_id, conversation_id);
        Ok(Lease {
            guard: self.clone(),
            conversation_id: conversation_id.to_string(),
            lease_id,
            token,
            tool_flags,
            released: false,
        })
    }

    /// True while a lease for the conversation is outstanding.
    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.slots
            .lock()
            .get(conversation_id)
            .is_some_and(|slot| slot.in_flight.is_some())
    }

    /// Fires the cancellation token of the conversation's in-flight exchange.
    /// Returns false if nothing was in flight.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let slots = self.slots.lock();
        match slots.get(conversation_id).and_then(|s| s.in_flight.as_ref()) {
            Some(in_flight) => {
                log::debug!(
                    "Cancelling lease {} for conversation {}",
                    in_flight.lease_id,
                    conversation_id
                );
                in_flight.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Sets the pending tool toggles for the next exchange.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while an exchange is in flight; toggles may not change
    /// under a running exchange.
    pub fn set_tool_flags(&self, conversation_id: &str, flags: ToolFlags) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(conversation_id.to_string()).or_default();
        if slot.in_flight.is_some() {
            return Err(Error::busy(conversation_id));
        }
        slot.pending_flags = flags;
        if slot.is_idle_default() {
            slots.remove(conversation_id);
        }
        Ok(())
    }

    /// Pending tool toggles for the conversation.
    pub fn tool_flags(&self, conversation_id: &str) -> ToolFlags {
        self.slots
            .lock()
            .get(conversation_id)
            .map(|slot| slot.pending_flags)
            .unwrap_or_default()
    }

    fn release(&self, conversation_id: &str, lease_id: u64) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(conversation_id) else {
            return;
        };
        // A stale lease must not free a newer holder's slot.
        let owns_slot = slot
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.lease_id == lease_id);
        if !owns_slot {
            return;
        }
        slot.in_flight = None;
        slot.pending_flags = ToolFlags::default();
        log::debug!("Released lease {} for conversation {}", lease_id, conversation_id);

        if slot.is_idle_default() {
            slots.remove(conversation_id);
        }
    }
}

/// Exclusive right to run one exchange for a conversation.
///
/// Released by [`Lease::release`] or on drop.
#[derive(Debug)]
pub struct Lease {
    guard: SessionGuard,
    conversation_id: String,
    lease_id: u64,
    token: CancellationToken,
    tool_flags: ToolFlags,
    released: bool,
}

impl Lease {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Tool toggles that were pending when the lease was admitted.
    pub fn tool_flags(&self) -> ToolFlags {
        self.tool_flags
    }

    /// Token observed by the transport and the exchange driver.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.token.clone(),
        }
    }

    /// Requests cancellation of the leased exchange.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Frees the conversation's slot and resets its tool toggles.
    pub fn release(mut self) {
        self.release_slot();
    }

    fn release_slot(&mut self) {
        if !self.released {
            self.released = true;
            self.guard.release(&self.conversation_id, self.lease_id);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_slot();
    }
}

/// Cloneable handle that can cancel a leased exchange from elsewhere.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
