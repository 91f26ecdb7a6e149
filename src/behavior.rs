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

//! [CoAP transmission parameters](https://tools.ietf.org/html/rfc7252#section-4.8),
//! bundled into a `BehaviorContext` that an [`EndpointManager`](crate::endpoint::EndpointManager)
//! snapshots per-transaction.

use rand::Rng;
use std::time::Duration;

/// Snapshot of the timing knobs that govern message-layer retransmission, NSTART,
/// and observe leisure. Immutable once handed to a transaction.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BehaviorContext {
    /// `ACK_TIMEOUT`: base delay before the first retransmission of a CON.
    pub ack_timeout: Duration,

    /// `ACK_RANDOM_FACTOR`: upper bound of the multiplier applied to `ack_timeout` when
    /// picking the actual initial retransmission delay.
    pub ack_random_factor: f32,

    /// `MAX_RETRANSMIT`: number of retransmissions attempted before giving up.
    pub max_retransmit: u32,

    /// `NSTART`: maximum number of simultaneous outstanding CON exchanges per destination.
    pub nstart: u32,

    /// `DEFAULT_LEISURE`: maximum delay the server may use to spread out notifications
    /// after a multicast trigger.
    pub default_leisure: Duration,

    /// `PROBING_RATE`, in bytes per second.
    pub probing_rate: u32,

    /// `MAX_LATENCY`: worst-case time a datagram takes end-to-end.
    pub max_latency: Duration,
}

impl BehaviorContext {
    /// `PROCESSING_DELAY`: time a node takes to turn a CON into an ACK. Conservatively
    /// assumed equal to `ack_timeout`, per RFC 7252 §4.8.2.
    pub fn processing_delay(&self) -> Duration {
        self.ack_timeout
    }

    /// `MAX_TRANSMIT_SPAN = ACK_TIMEOUT * (2^MAX_RETRANSMIT - 1) * ACK_RANDOM_FACTOR`.
    pub fn max_transmit_span(&self) -> Duration {
        Duration::from_secs_f32(
            self.ack_timeout.as_secs_f32()
                * ((1u32 << self.max_retransmit) as f32 - 1.0)
                * self.ack_random_factor,
        )
    }

    /// `MAX_TRANSMIT_WAIT = ACK_TIMEOUT * (2^(MAX_RETRANSMIT+1) - 1) * ACK_RANDOM_FACTOR`.
    pub fn max_transmit_wait(&self) -> Duration {
        Duration::from_secs_f32(
            self.ack_timeout.as_secs_f32()
                * ((1u32 << (self.max_retransmit + 1)) as f32 - 1.0)
                * self.ack_random_factor,
        )
    }

    /// `MAX_RTT = 2 * MAX_LATENCY + PROCESSING_DELAY`.
    pub fn max_rtt(&self) -> Duration {
        2 * self.max_latency + self.processing_delay()
    }

    /// `EXCHANGE_LIFETIME = MAX_TRANSMIT_SPAN + 2 * MAX_LATENCY + PROCESSING_DELAY`.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + 2 * self.max_latency + self.processing_delay()
    }

    /// `NON_LIFETIME = MAX_TRANSMIT_SPAN + MAX_LATENCY`.
    pub fn non_lifetime(&self) -> Duration {
        self.max_transmit_span() + self.max_latency
    }

    /// Picks the initial retransmission timeout `T0 = ack_timeout * Uniform[1, ack_random_factor]`.
    pub fn initial_retransmit_timeout(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(1.0..=self.ack_random_factor);
        Duration::from_secs_f32(self.ack_timeout.as_secs_f32() * factor)
    }
}

impl Default for BehaviorContext {
    fn default() -> Self {
        BehaviorContext {
            ack_timeout: Duration::from_millis(2000),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            default_leisure: Duration::from_millis(5000),
            probing_rate: 1,
            max_latency: Duration::from_secs(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_derived_timings_match_rfc7252_worked_example() {
        let ctx = BehaviorContext::default();
        assert_eq!(ctx.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(ctx.max_transmit_wait(), Duration::from_secs(93));
        assert_eq!(ctx.max_rtt(), Duration::from_secs(202));
        assert_eq!(ctx.exchange_lifetime(), Duration::from_secs(247));
        assert_eq!(ctx.non_lifetime(), Duration::from_secs(145));
    }

    #[test]
    fn initial_retransmit_timeout_is_within_bounds() {
        let ctx = BehaviorContext::default();
        for _ in 0..1000 {
            let t = ctx.initial_retransmit_timeout();
            assert!(t >= ctx.ack_timeout);
            assert!(t.as_secs_f32() <= ctx.ack_timeout.as_secs_f32() * ctx.ack_random_factor);
        }
    }
}
