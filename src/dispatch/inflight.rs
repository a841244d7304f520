//! In-flight call table.
//!
//! At most one provider call runs per fingerprint. The first caller becomes
//! the owner and receives a [`Publisher`] for the spawned call plus an
//! [`Interest`] to await it; later callers receive only an [`Interest`] on
//! the same slot. Everyone sees the same [`Outcome`].
//!
//! # Lifecycle
//!
//! - [`Publisher::publish`] removes the slot from the table, then wakes all
//!   interests. Callers arriving after removal start a new call (or hit the
//!   cache the owner just wrote).
//! - Dropping a `Publisher` unpublished (panic, runtime shutdown) still
//!   removes the slot and wakes everyone with an error.
//! - Dropping the last unresolved `Interest` cancels the slot's token so the
//!   shared call stops. A cancelled slot is never joined again; the next
//!   caller replaces it with a fresh one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::types::{Completion, Fingerprint};
use crate::{PromptgateError, Result};

/// Final result of one shared provider call.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub result: Result<Completion>,
    /// Provider attempts made by the owner.
    pub attempts: u32,
}

struct Slot {
    tx: watch::Sender<Option<Outcome>>,
    interest: AtomicUsize,
    cancel: CancellationToken,
    /// Provider attempts issued so far, visible before the outcome is.
    attempts: AtomicU32,
}

impl Slot {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            tx,
            interest: AtomicUsize::new(1),
            cancel: CancellationToken::new(),
            attempts: AtomicU32::new(0),
        }
    }

    fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Result of joining the table for a fingerprint.
pub enum Join {
    /// No call was running: the caller must run one with the publisher.
    Owner {
        publisher: Publisher,
        interest: Interest,
    },
    /// A call is already running for this fingerprint.
    Waiter(Interest),
}

/// Fingerprint → running call.
#[derive(Default)]
pub struct InFlightTable {
    slots: DashMap<Fingerprint, Arc<Slot>>,
}

impl InFlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically become owner of `fingerprint` or join its running call.
    pub fn join(self: &Arc<Self>, fingerprint: &Fingerprint) -> Join {
        match self.slots.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) if occupied.get().cancel.is_cancelled() => {
                let slot = Arc::new(Slot::new());
                occupied.insert(Arc::clone(&slot));
                self.owner(fingerprint, slot)
            }
            Entry::Occupied(occupied) => {
                let slot = Arc::clone(occupied.get());
                slot.interest.fetch_add(1, Ordering::SeqCst);
                Join::Waiter(Interest::new(Arc::clone(self), fingerprint.clone(), slot))
            }
            Entry::Vacant(vacant) => {
                let slot = Arc::new(Slot::new());
                vacant.insert(Arc::clone(&slot));
                self.owner(fingerprint, slot)
            }
        }
    }

    fn owner(self: &Arc<Self>, fingerprint: &Fingerprint, slot: Arc<Slot>) -> Join {
        Join::Owner {
            publisher: Publisher {
                table: Arc::clone(self),
                fingerprint: fingerprint.clone(),
                slot: Arc::clone(&slot),
                published: false,
            },
            interest: Interest::new(Arc::clone(self), fingerprint.clone(), slot),
        }
    }

    /// Number of calls currently running.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove `slot` if it is still the one registered for `fingerprint`.
    fn release(&self, fingerprint: &Fingerprint, slot: &Arc<Slot>) {
        self.slots
            .remove_if(fingerprint, |_, current| Arc::ptr_eq(current, slot));
    }
}

/// Owner-side handle that delivers the shared outcome.
pub struct Publisher {
    table: Arc<InFlightTable>,
    fingerprint: Fingerprint,
    slot: Arc<Slot>,
    published: bool,
}

impl Publisher {
    /// Token cancelled once every interested caller has gone away.
    pub fn cancel_token(&self) -> CancellationToken {
        self.slot.cancel.clone()
    }

    /// Count one provider attempt issued for this slot.
    pub fn record_attempt(&self) {
        self.slot.attempts.fetch_add(1, Ordering::SeqCst);
    }

    /// Release the slot, then wake every interest with `outcome`.
    pub fn publish(mut self, outcome: Outcome) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: Outcome) {
        self.table.release(&self.fingerprint, &self.slot);
        self.slot.tx.send_replace(Some(outcome));
        self.published = true;
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if !self.published {
            let err = if self.slot.cancel.is_cancelled() {
                PromptgateError::Cancelled
            } else {
                PromptgateError::Llm("in-flight provider call aborted".to_string())
            };
            let attempts = self.slot.attempts.load(Ordering::SeqCst);
            self.deliver(Outcome {
                result: Err(err),
                attempts,
            });
        }
    }
}

/// One caller's claim on a shared call.
pub struct Interest {
    table: Arc<InFlightTable>,
    fingerprint: Fingerprint,
    slot: Arc<Slot>,
    rx: watch::Receiver<Option<Outcome>>,
}

impl Interest {
    fn new(table: Arc<InFlightTable>, fingerprint: Fingerprint, slot: Arc<Slot>) -> Self {
        let rx = slot.tx.subscribe();
        Self {
            table,
            fingerprint,
            slot,
            rx,
        }
    }

    /// Provider attempts the shared call has issued so far.
    pub fn attempts(&self) -> u32 {
        self.slot.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the shared outcome.
    pub async fn wait(&mut self) -> Outcome {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Outcome {
            result: Err(PromptgateError::Cancelled),
            attempts: 0,
        })
    }
}

impl Drop for Interest {
    fn drop(&mut self) {
        // Hold the shard so no caller can join between the decrement and
        // the cancel.
        let _shard = self.table.slots.get(&self.fingerprint);
        let previous = self.slot.interest.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && !self.slot.is_resolved() {
            self.slot.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from_hex(s)
    }

    fn ok(content: &str) -> Outcome {
        Outcome {
            result: Ok(Completion {
                content: content.to_string(),
                ..Completion::default()
            }),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn second_caller_waits_on_first() {
        let table = Arc::new(InFlightTable::new());
        let Join::Owner {
            publisher,
            mut interest,
        } = table.join(&fp("a"))
        else {
            panic!("first caller should own");
        };
        let Join::Waiter(mut waiter) = table.join(&fp("a")) else {
            panic!("second caller should wait");
        };

        publisher.publish(ok("shared"));
        assert!(table.is_empty());
        assert_eq!(interest.wait().await.result.unwrap().content, "shared");
        assert_eq!(waiter.wait().await.result.unwrap().content, "shared");
    }

    #[tokio::test]
    async fn distinct_fingerprints_do_not_share() {
        let table = Arc::new(InFlightTable::new());
        assert!(matches!(table.join(&fp("a")), Join::Owner { .. }));
        assert!(matches!(table.join(&fp("b")), Join::Owner { .. }));
    }

    #[tokio::test]
    async fn dropped_publisher_wakes_waiters_with_error() {
        let table = Arc::new(InFlightTable::new());
        let Join::Owner {
            publisher,
            mut interest,
        } = table.join(&fp("a"))
        else {
            panic!("first caller should own");
        };
        drop(publisher);
        assert!(interest.wait().await.result.is_err());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn attempts_are_visible_before_publish() {
        let table = Arc::new(InFlightTable::new());
        let Join::Owner {
            publisher,
            interest,
        } = table.join(&fp("a"))
        else {
            panic!("first caller should own");
        };
        assert_eq!(interest.attempts(), 0);
        publisher.record_attempt();
        publisher.record_attempt();
        assert_eq!(interest.attempts(), 2);

        drop(interest);
        drop(publisher);
    }

    #[tokio::test]
    async fn last_interest_leaving_cancels_call() {
        let table = Arc::new(InFlightTable::new());
        let Join::Owner {
            publisher,
            interest,
        } = table.join(&fp("a"))
        else {
            panic!("first caller should own");
        };
        let Join::Waiter(waiter) = table.join(&fp("a")) else {
            panic!("second caller should wait");
        };
        let token = publisher.cancel_token();

        drop(interest);
        assert!(!token.is_cancelled());
        drop(waiter);
        assert!(token.is_cancelled());

        // A cancelled slot is replaced rather than joined.
        assert!(matches!(table.join(&fp("a")), Join::Owner { .. }));
        drop(publisher);
    }
}
