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

//! Server-side `Observe` subscription tracking, per
//! [RFC 7641](https://tools.ietf.org/html/rfc7641). The teacher library is purely a client
//! of remote resources and has no server-side registry of its own to adapt, so this module's
//! shape follows the capability-record/`Arc`-callback idiom used for
//! [`TransactionCallback`](crate::transaction::TransactionCallback) and the dual-key pattern
//! used by the message layer's dedup cache, rather than any single teacher file.

use crate::consts::OBSERVE_SEQUENCE_MODULUS;
use crate::message::MsgToken;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Maximum consecutive confirmable-notification timeouts tolerated before a subscriber is
/// ejected, per RFC 7641 §3.5.
pub const MAX_CONSECUTIVE_NOTIFICATION_TIMEOUTS: u32 = 4;

/// Key identifying one subscriber: the token it GETed with, plus its address.
pub type SubscriberKey = (MsgToken, SocketAddr);

/// Implements the RFC 7641 §3.4 comparison rule for deciding whether an observe sequence
/// number `new` is fresher than `old`, accounting for 24-bit wraparound and the 128-second
/// staleness bound.
pub fn is_fresher(old: u32, old_time: Duration, new: u32, new_time: Duration) -> bool {
    const HALF: i64 = 1 << 23;
    let v1 = old as i64;
    let v2 = new as i64;
    let numerically_newer = (v1 < v2 && v2 - v1 < HALF) || (v1 > v2 && v1 - v2 > HALF);
    let within_staleness_bound = new_time.saturating_sub(old_time) < Duration::from_secs(128);
    numerically_newer && within_staleness_bound
}

struct Subscriber {
    consecutive_timeouts: u32,
}

/// Tracks the subscriber set and sequence counter for a single observable resource
/// representation.
pub struct Observable {
    subscribers: Mutex<HashMap<SubscriberKey, Subscriber>>,
    sequence: AtomicU32,
    on_has_remote_observers: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    on_no_remote_observers: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl std::fmt::Debug for Observable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("observer_count", &self.get_observer_count())
            .field("sequence", &self.sequence.load(Ordering::SeqCst))
            .finish()
    }
}

impl Observable {
    /// Creates an observable with no subscribers and sequence number 0.
    pub fn new() -> Observable {
        Observable {
            subscribers: Mutex::new(HashMap::new()),
            sequence: AtomicU32::new(0),
            on_has_remote_observers: Mutex::new(None),
            on_no_remote_observers: Mutex::new(None),
        }
    }

    /// Sets the callback fired when the first subscriber registers.
    pub fn set_on_has_remote_observers(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.on_has_remote_observers.lock().unwrap() = Some(Box::new(cb));
    }

    /// Sets the callback fired after the last subscriber departs.
    pub fn set_on_no_remote_observers(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.on_no_remote_observers.lock().unwrap() = Some(Box::new(cb));
    }

    /// Registers `key` as a subscriber, firing `on_has_remote_observers` if it is the first.
    /// Returns the current sequence number, to be carried in the initial response's `Observe`
    /// option.
    pub fn subscribe(&self, key: SubscriberKey) -> u32 {
        let was_empty = {
            let mut subs = self.subscribers.lock().unwrap();
            let was_empty = subs.is_empty();
            subs.insert(key, Subscriber { consecutive_timeouts: 0 });
            was_empty
        };
        if was_empty {
            if let Some(cb) = self.on_has_remote_observers.lock().unwrap().as_ref() {
                cb();
            }
        }
        self.sequence.load(Ordering::SeqCst)
    }

    /// Removes `key` from the subscriber set, firing `on_no_remote_observers` if the set
    /// becomes empty. Used for explicit unsubscribe (`Observe=1`), reset-on-notification, and
    /// timeout ejection.
    pub fn unsubscribe(&self, key: SubscriberKey) {
        let now_empty = {
            let mut subs = self.subscribers.lock().unwrap();
            subs.remove(&key);
            subs.is_empty()
        };
        if now_empty {
            if let Some(cb) = self.on_no_remote_observers.lock().unwrap().as_ref() {
                cb();
            }
        }
    }

    /// Removes every subscriber at once (used when a resource calls `eject_observers()` to
    /// send a final `5.03` to each), returning the keys that were removed so the caller can
    /// notify each one.
    pub fn eject_observers(&self) -> Vec<SubscriberKey> {
        let keys: Vec<SubscriberKey> = {
            let mut subs = self.subscribers.lock().unwrap();
            let keys = subs.keys().copied().collect();
            subs.clear();
            keys
        };
        if !keys.is_empty() {
            if let Some(cb) = self.on_no_remote_observers.lock().unwrap().as_ref() {
                cb();
            }
        }
        keys
    }

    /// Returns the current number of subscribers.
    pub fn get_observer_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Returns the current subscriber keys, to fan a notification out to each.
    pub fn subscriber_keys(&self) -> Vec<SubscriberKey> {
        self.subscribers.lock().unwrap().keys().copied().collect()
    }

    /// Advances and returns the next sequence number, wrapping modulo 2^24, for use by
    /// `trigger()`/`trigger_with_message()` when building the next notification.
    pub fn next_sequence(&self) -> u32 {
        self.sequence
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |seq| {
                Some((seq + 1) % OBSERVE_SEQUENCE_MODULUS)
            })
            .unwrap();
        self.sequence.load(Ordering::SeqCst)
    }

    /// Records that a confirmable notification to `key` timed out. Returns true if this was
    /// the fourth consecutive timeout, at which point the subscriber has already been ejected
    /// and the caller should stop retrying it.
    pub fn record_notification_timeout(&self, key: SubscriberKey) -> bool {
        let ejected = {
            let mut subs = self.subscribers.lock().unwrap();
            match subs.get_mut(&key) {
                Some(sub) => {
                    sub.consecutive_timeouts += 1;
                    if sub.consecutive_timeouts >= MAX_CONSECUTIVE_NOTIFICATION_TIMEOUTS {
                        subs.remove(&key);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if ejected && self.get_observer_count() == 0 {
            if let Some(cb) = self.on_no_remote_observers.lock().unwrap().as_ref() {
                cb();
            }
        }
        ejected
    }

    /// Resets a subscriber's consecutive-timeout counter after a successful notification.
    pub fn record_notification_success(&self, key: SubscriberKey) {
        if let Some(sub) = self.subscribers.lock().unwrap().get_mut(&key) {
            sub.consecutive_timeouts = 0;
        }
    }
}

impl Default for Observable {
    fn default() -> Self {
        Observable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as AU32;
    use std::sync::Arc;

    fn key(b: u8) -> SubscriberKey {
        (MsgToken::new(&[b]).unwrap(), "127.0.0.1:5683".parse().unwrap())
    }

    #[test]
    fn rfc7641_comparison_handles_wraparound() {
        let t = Duration::from_secs(0);
        assert!(is_fresher(10, t, 11, t));
        assert!(!is_fresher(11, t, 10, t));
        // Wraparound: old is near the top of the range, new has wrapped to a small value.
        assert!(is_fresher(OBSERVE_SEQUENCE_MODULUS - 1, t, 2, t));
    }

    #[test]
    fn rfc7641_comparison_rejects_stale_timestamp_gap() {
        let old_time = Duration::from_secs(0);
        let new_time = Duration::from_secs(200);
        assert!(!is_fresher(1, old_time, 2, new_time));
    }

    #[test]
    fn first_and_last_subscriber_fire_callbacks_exactly_once() {
        let observable = Arc::new(Observable::new());
        let has_fired = Arc::new(AU32::new(0));
        let no_fired = Arc::new(AU32::new(0));
        {
            let h = has_fired.clone();
            observable.set_on_has_remote_observers(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let n = no_fired.clone();
            observable.set_on_no_remote_observers(move || {
                n.fetch_add(1, Ordering::SeqCst);
            });
        }

        observable.subscribe(key(1));
        observable.subscribe(key(2));
        assert_eq!(has_fired.load(Ordering::SeqCst), 1);
        assert_eq!(observable.get_observer_count(), 2);

        observable.unsubscribe(key(1));
        assert_eq!(no_fired.load(Ordering::SeqCst), 0);
        observable.unsubscribe(key(2));
        assert_eq!(no_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn four_consecutive_timeouts_eject_the_subscriber() {
        let observable = Observable::new();
        observable.subscribe(key(1));
        for _ in 0..3 {
            assert!(!observable.record_notification_timeout(key(1)));
        }
        assert!(observable.record_notification_timeout(key(1)));
        assert_eq!(observable.get_observer_count(), 0);
    }

    #[test]
    fn success_resets_the_timeout_counter() {
        let observable = Observable::new();
        observable.subscribe(key(1));
        observable.record_notification_timeout(key(1));
        observable.record_notification_timeout(key(1));
        observable.record_notification_success(key(1));
        assert!(!observable.record_notification_timeout(key(1)));
        assert!(!observable.record_notification_timeout(key(1)));
        assert!(!observable.record_notification_timeout(key(1)));
        assert!(observable.record_notification_timeout(key(1)));
    }

    #[test]
    fn eject_observers_drains_everyone_and_fires_no_observers_once() {
        let observable = Observable::new();
        let no_fired = Arc::new(AU32::new(0));
        {
            let n = no_fired.clone();
            observable.set_on_no_remote_observers(move || {
                n.fetch_add(1, Ordering::SeqCst);
            });
        }
        observable.subscribe(key(1));
        observable.subscribe(key(2));
        let ejected = observable.eject_observers();
        assert_eq!(ejected.len(), 2);
        assert_eq!(observable.get_observer_count(), 0);
        assert_eq!(no_fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequence_advances_and_wraps_at_2_24() {
        let observable = Observable::new();
        assert_eq!(observable.next_sequence(), 1);
        assert_eq!(observable.next_sequence(), 2);
        observable.sequence.store(OBSERVE_SEQUENCE_MODULUS - 1, Ordering::SeqCst);
        assert_eq!(observable.next_sequence(), 0);
    }
}
