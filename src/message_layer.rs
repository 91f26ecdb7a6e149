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

//! CON/NON/ACK/RST handling, per
//! [RFC 7252 §4](https://tools.ietf.org/html/rfc7252#section-4): message id allocation,
//! exponential-backoff retransmission of confirmable messages, and inbound duplicate
//! suppression. Sits directly on top of a [`Transport`] and below the transaction layer,
//! which correlates by token rather than message id.

use crate::behavior::BehaviorContext;
use crate::dedup::{DedupCache, DedupStatus};
use crate::error::Error;
use crate::message::{Message, MsgId, MsgType};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::transport::Transport;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// How a confirmable exchange driven by [`MessageLayer::send_confirmable`] concluded.
#[derive(Debug, Clone)]
pub enum AckOutcome {
    /// The peer acknowledged the message (a piggybacked response is `Some`).
    Acknowledged(Option<Message>),
    /// The peer could not process the message.
    Reset,
    /// `MAX_RETRANSMIT` retransmissions were sent with no reply.
    TimedOut,
}

type OutcomeCallback = Box<dyn FnOnce(AckOutcome) + Send>;

struct OutstandingCon {
    bytes: Vec<u8>,
    dest: SocketAddr,
    attempts: u32,
    /// The timeout that was just waited out (`T0` on the first retransmit, doubled on each
    /// one after). RFC 7252 §4.2 doubles this value itself, not the fixed `ACK_TIMEOUT`.
    current_timeout: std::time::Duration,
    callback: Option<OutcomeCallback>,
    retransmit_handle: Option<TaskHandle>,
}

/// A confirmable exchange held back by [`BehaviorContext::nstart`] until a slot for its
/// destination frees up.
struct QueuedCon {
    mid: MsgId,
    bytes: Vec<u8>,
    callback: OutcomeCallback,
}

/// Drives the CON/NON/ACK/RST state machine on top of a concrete [`Transport`].
///
/// An instance owns its own message-id counter, retransmission table, and inbound dedup
/// cache; an [`EndpointManager`](crate::endpoint::EndpointManager) holds one per registered
/// transport.
pub struct MessageLayer {
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    behavior: BehaviorContext,
    dedup: DedupCache,
    next_mid: AtomicU16,
    outstanding: Mutex<HashMap<(MsgId, SocketAddr), OutstandingCon>>,
    /// Exchanges waiting for an NSTART slot, per destination (RFC 7252 §4.7).
    pending: Mutex<HashMap<SocketAddr, VecDeque<QueuedCon>>>,
}

impl std::fmt::Debug for MessageLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLayer").finish_non_exhaustive()
    }
}

impl MessageLayer {
    /// Creates a new message layer atop `transport`, using `scheduler` for all timing and
    /// `behavior` for its retransmission parameters.
    pub fn new(
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        behavior: BehaviorContext,
    ) -> Arc<MessageLayer> {
        Arc::new(MessageLayer {
            transport,
            scheduler,
            behavior,
            dedup: DedupCache::new(),
            next_mid: AtomicU16::new(rand::random()),
            outstanding: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Allocates the next message id, wrapping at `u16::MAX`.
    pub fn next_msg_id(&self) -> MsgId {
        self.next_mid.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a non-confirmable message and forgets about it; NON messages are not
    /// retransmitted by the message layer itself.
    pub async fn send_non_confirmable(&self, msg: &Message, dest: SocketAddr) -> Result<(), Error> {
        debug_assert_eq!(msg.msg_type(), MsgType::Non);
        self.transport.send_to(msg.to_bytes()?, dest).await
    }

    /// Sends an already-constructed empty ACK or RST. These are never retransmitted.
    pub async fn send_empty(&self, msg: &Message, dest: SocketAddr) -> Result<(), Error> {
        self.transport.send_to(msg.to_bytes()?, dest).await
    }

    /// Sends a confirmable message, retransmitting it with exponential backoff until it is
    /// acknowledged, reset, or `MAX_RETRANSMIT` attempts are exhausted. `on_outcome` fires
    /// exactly once, from whichever task observes the terminal event.
    ///
    /// Per `NSTART` (RFC 7252 §4.7), at most `behavior.nstart` exchanges are ever outstanding
    /// against the same destination at once; beyond that, the exchange is queued and started
    /// only once an earlier one against that destination reaches a terminal outcome.
    pub fn send_confirmable(
        self: &Arc<Self>,
        msg: &Message,
        dest: SocketAddr,
        on_outcome: impl FnOnce(AckOutcome) + Send + 'static,
    ) -> Result<(), Error> {
        debug_assert_eq!(msg.msg_type(), MsgType::Con);
        let mid = msg.msg_id();
        let bytes = msg.to_bytes()?;

        let has_slot = {
            let outstanding = self.outstanding.lock().unwrap();
            let in_flight = outstanding.values().filter(|e| e.dest == dest).count() as u32;
            in_flight < self.behavior.nstart
        };

        if has_slot {
            self.start_exchange(mid, dest, bytes, Box::new(on_outcome));
        } else {
            self.pending.lock().unwrap().entry(dest).or_default().push_back(QueuedCon {
                mid,
                bytes,
                callback: Box::new(on_outcome),
            });
        }
        Ok(())
    }

    fn start_exchange(self: &Arc<Self>, mid: MsgId, dest: SocketAddr, bytes: Vec<u8>, callback: OutcomeCallback) {
        let delay = self.behavior.initial_retransmit_timeout();
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            outstanding.insert(
                (mid, dest),
                OutstandingCon {
                    bytes: bytes.clone(),
                    dest,
                    attempts: 0,
                    current_timeout: delay,
                    callback: Some(callback),
                    retransmit_handle: None,
                },
            );
        }

        self.transmit_now(mid, dest, bytes);
        self.arm_retransmit_timer(mid, dest, delay);
    }

    /// Starts the next exchange queued against `dest`, if any, now that a slot has freed up.
    fn start_next_queued(self: &Arc<Self>, dest: SocketAddr) {
        let next = {
            let mut pending = self.pending.lock().unwrap();
            let Some(queue) = pending.get_mut(&dest) else { return };
            let next = queue.pop_front();
            if queue.is_empty() {
                pending.remove(&dest);
            }
            next
        };
        if let Some(queued) = next {
            self.start_exchange(queued.mid, dest, queued.bytes, queued.callback);
        }
    }

    fn transmit_now(self: &Arc<Self>, _mid: MsgId, dest: SocketAddr, bytes: Vec<u8>) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let _ = transport.send_to(bytes, dest).await;
        });
    }

    fn arm_retransmit_timer(self: &Arc<Self>, mid: MsgId, dest: SocketAddr, delay: std::time::Duration) {
        let weak: Weak<MessageLayer> = Arc::downgrade(self);
        let handle = self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(layer) = weak.upgrade() {
                    layer.on_retransmit_timer(mid, dest);
                }
            }),
        );
        if let Some(entry) = self.outstanding.lock().unwrap().get_mut(&(mid, dest)) {
            entry.retransmit_handle = Some(handle);
        }
    }

    fn on_retransmit_timer(self: &Arc<Self>, mid: MsgId, dest: SocketAddr) {
        let next_delay = {
            let mut outstanding = self.outstanding.lock().unwrap();
            let Some(entry) = outstanding.get_mut(&(mid, dest)) else {
                return;
            };
            entry.attempts += 1;
            if entry.attempts > self.behavior.max_retransmit {
                let entry = outstanding.remove(&(mid, dest)).unwrap();
                drop(outstanding);
                if let Some(cb) = entry.callback {
                    cb(AckOutcome::TimedOut);
                }
                self.start_next_queued(dest);
                return;
            }
            let bytes = entry.bytes.clone();
            self.transmit_now(mid, dest, bytes);
            entry.current_timeout *= 2;
            Some(entry.current_timeout)
        };
        if let Some(delay) = next_delay {
            self.arm_retransmit_timer(mid, dest, delay);
        }
    }

    /// To be called by the endpoint's receive loop when an ACK with message id `mid` arrives
    /// from `from`. `piggybacked` is the response carried in the ACK, if any (non-empty code).
    pub fn handle_ack(self: &Arc<Self>, mid: MsgId, from: SocketAddr, piggybacked: Option<Message>) {
        self.complete(mid, from, AckOutcome::Acknowledged(piggybacked));
    }

    /// To be called when a RST with message id `mid` arrives from `from`.
    pub fn handle_rst(self: &Arc<Self>, mid: MsgId, from: SocketAddr) {
        self.complete(mid, from, AckOutcome::Reset);
    }

    fn complete(self: &Arc<Self>, mid: MsgId, from: SocketAddr, outcome: AckOutcome) {
        let entry = self.outstanding.lock().unwrap().remove(&(mid, from));
        if let Some(entry) = entry {
            if let Some(handle) = entry.retransmit_handle {
                handle.cancel();
            }
            if let Some(cb) = entry.callback {
                cb(outcome);
            }
        }
        self.start_next_queued(from);
    }

    /// Checks an inbound CON/NON message against the dedup cache. On [`DedupStatus::Fresh`],
    /// schedules the entry's own eviction after the appropriate lifetime for `msg_type`.
    pub fn check_inbound_duplicate(self: &Arc<Self>, mid: MsgId, from: SocketAddr, msg_type: MsgType) -> DedupStatus {
        let status = self.dedup.check_and_insert(mid, from);
        if status == DedupStatus::Fresh {
            let lifetime = if msg_type.is_con() {
                self.behavior.exchange_lifetime()
            } else {
                self.behavior.non_lifetime()
            };
            let weak: Weak<MessageLayer> = Arc::downgrade(self);
            self.scheduler.schedule(
                lifetime,
                Box::new(move || {
                    if let Some(layer) = weak.upgrade() {
                        layer.dedup.remove(mid, from);
                    }
                }),
            );
        }
        status
    }

    /// Records the outbound reply bytes for an inbound exchange, so a subsequent
    /// retransmission of the request replays this reply instead of being reprocessed.
    pub fn store_duplicate_response(&self, mid: MsgId, from: SocketAddr, response: Vec<u8>) {
        self.dedup.store_response(mid, from, response);
    }

    /// Returns the number of confirmable exchanges currently awaiting ACK/RST/timeout.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MsgCode, MsgToken, MutableMessage};
    use crate::scheduler::FakeScheduler;
    use crate::transport::LoopbackTransport;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn behavior() -> BehaviorContext {
        BehaviorContext {
            ack_timeout: Duration::from_millis(200),
            ack_random_factor: 1.0,
            max_retransmit: 2,
            nstart: 1,
            default_leisure: Duration::from_millis(500),
            probing_rate: 1,
            max_latency: Duration::from_millis(100),
        }
    }

    fn confirmable_request(mid: MsgId) -> Message {
        let mut builder = MutableMessage::new();
        builder
            .set_msg_type(MsgType::Con)
            .set_msg_code(MsgCode::MethodGet)
            .set_msg_id(mid)
            .set_msg_token(MsgToken::new(&[0x01]).unwrap());
        builder.freeze()
    }

    #[tokio::test]
    async fn times_out_after_max_retransmit_with_no_ack() {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let scheduler = FakeScheduler::new();
        let layer = MessageLayer::new(transport, scheduler.clone(), behavior());

        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = outcome.clone();
        let dest: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        layer
            .send_confirmable(&confirmable_request(1), dest, move |o| {
                *outcome2.lock().unwrap() = Some(format!("{:?}", o));
            })
            .unwrap();

        scheduler.advance(Duration::from_secs(10));
        tokio::task::yield_now().await;

        let result = outcome.lock().unwrap().clone();
        assert_eq!(result, Some("TimedOut".to_string()));
    }

    #[tokio::test]
    async fn ack_cancels_pending_retransmission() {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let scheduler = FakeScheduler::new();
        let layer = MessageLayer::new(transport, scheduler.clone(), behavior());

        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let dest: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        layer
            .send_confirmable(&confirmable_request(2), dest, move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        layer.handle_ack(2, dest, None);
        scheduler.advance(Duration::from_secs(10));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(layer.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn nstart_one_queues_a_second_exchange_until_the_first_resolves() {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let scheduler = FakeScheduler::new();
        let layer = MessageLayer::new(transport, scheduler.clone(), behavior());
        let dest: SocketAddr = "127.0.0.1:5683".parse().unwrap();

        layer.send_confirmable(&confirmable_request(1), dest, |_| {}).unwrap();
        assert_eq!(layer.outstanding_count(), 1);

        let second_started = Arc::new(AtomicU32::new(0));
        let second_started2 = second_started.clone();
        layer
            .send_confirmable(&confirmable_request(2), dest, move |_| {
                second_started2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // Queued, not yet occupying a slot.
        assert_eq!(layer.outstanding_count(), 1);

        layer.handle_ack(1, dest, None);
        // Freeing the first slot starts the queued exchange.
        assert_eq!(layer.outstanding_count(), 1);

        layer.handle_ack(2, dest, None);
        assert_eq!(second_started.load(Ordering::SeqCst), 1);
        assert_eq!(layer.outstanding_count(), 0);
    }

    #[test]
    fn second_sighting_of_same_mid_is_a_duplicate() {
        let transport: Arc<dyn Transport> = Arc::new(LoopbackTransport::new());
        let scheduler = FakeScheduler::new();
        let layer = MessageLayer::new(transport, scheduler, behavior());
        let from: SocketAddr = "127.0.0.1:5683".parse().unwrap();

        assert_eq!(layer.check_inbound_duplicate(5, from, MsgType::Con), DedupStatus::Fresh);
        assert_eq!(
            layer.check_inbound_duplicate(5, from, MsgType::Con),
            DedupStatus::DuplicateInFlight
        );
    }
}
