// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Token-keyed request/response correlation, sitting above the message layer's MID-keyed
//! reliability sublayer.
//!
//! The transaction table is an arena indexed by [`TransactionId`] rather than a graph of
//! `Rc`/`Arc` cycles between transaction, callback, and endpoint: a [`Transaction`] handle
//! holds only its id and a [`Weak`] reference to the owning [`TransactionTable`], so dropping
//! every handle lets the table (and in turn the endpoint manager) tear down cleanly without a
//! tracing collector.

use crate::error::Error;
use crate::message::{Message, MsgToken};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

/// Correlates an inbound response with the outbound request that asked for it: the request's
/// token plus the remote peer's address.
pub type KeyToken = (MsgToken, SocketAddr);

/// The lifecycle state of a single transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// Awaiting the first (or next, for an observation) response.
    Active,
    /// At least one response has been delivered; observations remain `Active` afterwards,
    /// non-observations move to `Finished`.
    Responded,
    /// Cancelled by the application before completion.
    Cancelled,
    /// Terminated normally (a non-observation transaction after its response, or a
    /// cancelled/errored transaction after its callbacks have fired).
    Finished,
    /// Terminated by a transport-layer error (timeout, reset, malformed response, ...).
    Failed,
}

/// Opaque identifier for a live transaction: an arena slot index paired with a generation
/// counter, so a stale id from a since-recycled slot is never mistaken for the new occupant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId {
    index: usize,
    generation: u64,
}

/// Callbacks fired as a transaction progresses. Mirrors the conceptual
/// `Transaction.Callback` interface: `on_transaction_response`, `on_transaction_cancelled`,
/// `on_transaction_exception`, `on_transaction_finished`.
pub trait TransactionCallback: Send + Sync {
    /// A response (or, for an observation, each notification) arrived.
    fn on_transaction_response(&self, message: &Message);
    /// The transaction was cancelled by the application.
    fn on_transaction_cancelled(&self) {}
    /// The transaction failed with a transport/timing error.
    fn on_transaction_exception(&self, _error: Error) {}
    /// The transaction has reached a terminal state; fires exactly once, after any other
    /// callback for this transaction.
    fn on_transaction_finished(&self) {}
}

struct Slot {
    generation: u64,
    state: TransactionState,
    key: KeyToken,
    is_observe: bool,
    callback: Arc<dyn TransactionCallback>,
    on_cancel_unobserve: Option<Box<dyn FnOnce() + Send>>,
}

/// Owns the live set of outbound request transactions for one endpoint, keyed both by
/// [`TransactionId`] (for direct handle operations) and by [`KeyToken`] (for correlating
/// inbound responses).
#[derive(Default)]
pub struct TransactionTable {
    slots: Mutex<Vec<Option<Slot>>>,
    /// The generation last assigned to each slot index, kept even after the slot is freed so
    /// reuse always increments rather than resetting (which would let a stale id alias a
    /// freshly-registered transaction at the same index).
    generations: Mutex<Vec<u64>>,
    free_list: Mutex<Vec<usize>>,
    by_token: Mutex<HashMap<KeyToken, TransactionId>>,
}

impl TransactionTable {
    /// Creates an empty transaction table.
    pub fn new() -> Arc<TransactionTable> {
        Arc::new(TransactionTable::default())
    }

    /// Registers a new transaction for `key`, returning a handle to it. `is_observe` marks
    /// the transaction as a long-lived observation, which is not automatically finished after
    /// its first response.
    pub fn register(
        self: &Arc<Self>,
        key: KeyToken,
        is_observe: bool,
        callback: Arc<dyn TransactionCallback>,
    ) -> Transaction {
        let mut slots = self.slots.lock().unwrap();
        let mut generations = self.generations.lock().unwrap();

        let index = if let Some(index) = self.free_list.lock().unwrap().pop() {
            index
        } else {
            slots.push(None);
            generations.push(0);
            slots.len() - 1
        };
        generations[index] += 1;
        let generation = generations[index];

        slots[index] = Some(Slot {
            generation,
            state: TransactionState::Active,
            key,
            is_observe,
            callback,
            on_cancel_unobserve: None,
        });

        let id = TransactionId { index, generation };
        drop(generations);
        drop(slots);
        self.by_token.lock().unwrap().insert(key, id);

        Transaction {
            id,
            table: Arc::downgrade(self),
        }
    }

    /// Sets the closure run if this transaction is cancelled while still observing, used to
    /// emit the unobserve (`GET` with `Observe=1`) request. Unlike the other transaction
    /// operations this takes the raw id since it is set immediately after registration by the
    /// same code that owns the `Transaction` handle.
    pub fn set_unobserve_action(&self, id: TransactionId, action: Box<dyn FnOnce() + Send>) {
        if let Some(Some(slot)) = self.slots.lock().unwrap().get_mut(id.index) {
            if slot.generation == id.generation {
                slot.on_cancel_unobserve = Some(action);
            }
        }
    }

    /// Delivers an inbound response matching `key`, invoking the transaction's
    /// `on_transaction_response` callback. Non-observation transactions move to `Finished`
    /// and are removed from the table; observations remain `Active` for further
    /// notifications.
    pub fn deliver_response(&self, key: KeyToken, message: &Message) -> bool {
        let id = match self.by_token.lock().unwrap().get(&key).copied() {
            Some(id) => id,
            None => return false,
        };

        let (callback, finished) = {
            let mut slots = self.slots.lock().unwrap();
            let Some(Some(slot)) = slots.get_mut(id.index) else {
                return false;
            };
            if slot.generation != id.generation {
                return false;
            }
            slot.state = TransactionState::Responded;
            let finished = !slot.is_observe;
            if finished {
                slot.state = TransactionState::Finished;
            }
            (slot.callback.clone(), finished)
        };

        callback.on_transaction_response(message);
        if finished {
            callback.on_transaction_finished();
            self.retire(id);
        }
        true
    }

    /// Fails a transaction (timeout, reset, malformed response, proxying not supported).
    pub fn fail(&self, id: TransactionId, error: Error) {
        let callback = {
            let mut slots = self.slots.lock().unwrap();
            let Some(Some(slot)) = slots.get_mut(id.index) else {
                return;
            };
            if slot.generation != id.generation || slot.state == TransactionState::Finished {
                return;
            }
            slot.state = TransactionState::Failed;
            slot.callback.clone()
        };
        callback.on_transaction_exception(error);
        callback.on_transaction_finished();
        self.retire(id);
    }

    /// Cancels a transaction. If `send_unobserve` is true and an unobserve action was
    /// registered, it runs before the callbacks fire.
    pub fn cancel(&self, id: TransactionId, send_unobserve: bool) {
        let (callback, unobserve_action) = {
            let mut slots = self.slots.lock().unwrap();
            let Some(Some(slot)) = slots.get_mut(id.index) else {
                return;
            };
            if slot.generation != id.generation || slot.state == TransactionState::Finished {
                return;
            }
            slot.state = TransactionState::Cancelled;
            let action = if send_unobserve { slot.on_cancel_unobserve.take() } else { None };
            (slot.callback.clone(), action)
        };

        if let Some(action) = unobserve_action {
            action();
        }

        callback.on_transaction_cancelled();
        callback.on_transaction_finished();
        self.retire(id);
    }

    /// Cancels every transaction currently in the table.
    pub fn cancel_all(&self, send_unobserve: bool) {
        let ids: Vec<TransactionId> = self
            .slots
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref().map(|s| TransactionId {
                    index,
                    generation: s.generation,
                })
            })
            .collect();
        for id in ids {
            self.cancel(id, send_unobserve);
        }
    }

    /// Returns the ids of all currently active (not yet finished) transactions.
    pub fn active_transaction_ids(&self) -> Vec<TransactionId> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref()
                    .filter(|s| s.state != TransactionState::Finished)
                    .map(|s| TransactionId {
                        index,
                        generation: s.generation,
                    })
            })
            .collect()
    }

    /// Returns the current state of a transaction, if the id still refers to a live slot.
    pub fn state(&self, id: TransactionId) -> Option<TransactionState> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(id.index)?.as_ref()?;
        (slot.generation == id.generation).then_some(slot.state)
    }

    fn retire(&self, id: TransactionId) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(Some(slot)) = slots.get(id.index).map(|s| s.as_ref()) {
            if slot.generation == id.generation {
                let key = slot.key;
                drop(slots);
                self.by_token.lock().unwrap().remove(&key);
                let mut slots = self.slots.lock().unwrap();
                slots[id.index] = None;
                self.free_list.lock().unwrap().push(id.index);
            }
        }
    }
}

/// A handle to a single registered transaction. Cheap to clone; all clones refer to the same
/// underlying slot via [`TransactionId`] and a weak reference to the table.
#[derive(Clone)]
pub struct Transaction {
    id: TransactionId,
    table: Weak<TransactionTable>,
}

impl Transaction {
    /// Returns this transaction's id.
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current state, if the owning table is still alive.
    pub fn state(&self) -> Option<TransactionState> {
        self.table.upgrade()?.state(self.id)
    }

    /// Returns true if the transaction is still active (not finished, cancelled, or failed).
    pub fn is_active(&self) -> bool {
        matches!(self.state(), Some(TransactionState::Active) | Some(TransactionState::Responded))
    }

    /// Returns true if the transaction was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), Some(TransactionState::Cancelled))
    }

    /// Cancels the transaction, sending an unobserve request first unless
    /// `cancel_without_unobserve` semantics were requested.
    pub fn cancel(&self) {
        if let Some(table) = self.table.upgrade() {
            table.cancel(self.id, true);
        }
    }

    /// Cancels the transaction without sending an unobserve request, even if observing.
    pub fn cancel_without_unobserve(&self) {
        if let Some(table) = self.table.upgrade() {
            table.cancel(self.id, false);
        }
    }
}
