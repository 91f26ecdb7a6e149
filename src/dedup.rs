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

//! Message-layer duplicate detection, per
//! [RFC 7252 §4.5](https://tools.ietf.org/html/rfc7252#section-4.5): a retransmitted `CON`
//! or `NON` carrying a message id already seen from the same peer is a duplicate, and if the
//! first exchange already produced a reply, that same reply is replayed rather than
//! re-processing the request.
//!
//! Entries do not track their own expiry; the caller (the message layer) schedules a
//! one-shot [`Scheduler`](crate::scheduler::Scheduler) task to call [`DedupCache::remove`]
//! after `EXCHANGE_LIFETIME`/`NON_LIFETIME` has elapsed, matching how retransmission itself
//! is driven.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// Key identifying an inbound exchange for deduplication purposes: the message id plus the
/// remote peer's address. Multicast senders are not collapsed here (unlike response
/// correlation) because message ids are only meaningful per concrete sender.
pub type KeyMid = (crate::message::MsgId, SocketAddr);

/// The outcome of checking an inbound message id against the dedup cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupStatus {
    /// This is the first time this `(mid, addr)` pair has been seen; process it normally.
    Fresh,
    /// A duplicate of an exchange still being processed; suppress it entirely.
    DuplicateInFlight,
    /// A duplicate of a completed exchange; replay the cached reply bytes.
    DuplicateWithResponse(Vec<u8>),
}

/// Tracks recently-seen inbound message ids so retransmitted requests are recognized as
/// duplicates instead of being processed (and potentially acted upon) twice.
#[derive(Debug, Default)]
pub struct DedupCache {
    entries: Mutex<HashMap<KeyMid, Option<Vec<u8>>>>,
}

impl DedupCache {
    /// Creates an empty cache.
    pub fn new() -> DedupCache {
        DedupCache::default()
    }

    /// If `(mid, addr)` has not been seen, records it as in-flight (no response yet) and
    /// returns [`DedupStatus::Fresh`]. Otherwise returns the appropriate duplicate status.
    pub fn check_and_insert(&self, mid: crate::message::MsgId, addr: SocketAddr) -> DedupStatus {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&(mid, addr)) {
            Some(Some(bytes)) => DedupStatus::DuplicateWithResponse(bytes.clone()),
            Some(None) => DedupStatus::DuplicateInFlight,
            None => {
                entries.insert((mid, addr), None);
                DedupStatus::Fresh
            }
        }
    }

    /// Records the reply produced for a previously-inserted `(mid, addr)` pair, so that
    /// subsequent duplicates within the exchange lifetime are answered with it directly.
    pub fn store_response(&self, mid: crate::message::MsgId, addr: SocketAddr, response: Vec<u8>) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&(mid, addr)) {
            *entry = Some(response);
        }
    }

    /// Removes a single entry, called once its lifetime has elapsed.
    pub fn remove(&self, mid: crate::message::MsgId, addr: SocketAddr) {
        self.entries.lock().unwrap().remove(&(mid, addr));
    }

    /// Returns the number of entries currently tracked, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    #[test]
    fn first_sighting_is_fresh() {
        let cache = DedupCache::new();
        assert_eq!(cache.check_and_insert(42, addr()), DedupStatus::Fresh);
    }

    #[test]
    fn retransmission_before_response_is_in_flight() {
        let cache = DedupCache::new();
        cache.check_and_insert(42, addr());
        assert_eq!(cache.check_and_insert(42, addr()), DedupStatus::DuplicateInFlight);
    }

    #[test]
    fn retransmission_after_response_replays_cached_bytes() {
        let cache = DedupCache::new();
        cache.check_and_insert(42, addr());
        cache.store_response(42, addr(), vec![1, 2, 3]);
        assert_eq!(
            cache.check_and_insert(42, addr()),
            DedupStatus::DuplicateWithResponse(vec![1, 2, 3])
        );
    }

    #[test]
    fn different_peers_do_not_collide_on_the_same_mid() {
        let cache = DedupCache::new();
        cache.check_and_insert(7, addr());
        let other: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(cache.check_and_insert(7, other), DedupStatus::Fresh);
    }

    #[test]
    fn removed_entry_is_treated_as_fresh_again() {
        let cache = DedupCache::new();
        cache.check_and_insert(9, addr());
        cache.remove(9, addr());
        assert_eq!(cache.check_and_insert(9, addr()), DedupStatus::Fresh);
        assert_eq!(cache.len(), 1);
    }
}
