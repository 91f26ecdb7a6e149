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

//! Pluggable datagram back-ends. [`EndpointManager`](crate::endpoint::EndpointManager) talks
//! to the network exclusively through the [`Transport`] trait, so a real UDP socket, a DTLS
//! tunnel, or an in-process loopback used for tests all look the same to the message layer.

mod loopback;
mod null;

pub use loopback::LoopbackTransport;
pub use null::NullTransport;

use crate::error::Error;
use futures::future::BoxFuture;
use std::net::SocketAddr;

/// A single inbound datagram, along with the address it arrived from.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// The raw bytes of the datagram.
    pub bytes: Vec<u8>,
    /// The address of the sender.
    pub from: SocketAddr,
}

/// A datagram transport capable of sending to and receiving from CoAP peers.
///
/// Implementations are expected to be cheaply cloneable handles to shared, `Send + Sync`
/// state (an `Arc` around a socket or an in-process channel), since [`EndpointManager`]
/// holds one per registered URI scheme and may use it from multiple tasks concurrently.
pub trait Transport: std::fmt::Debug + Send + Sync {
    /// Sends `bytes` to `dest`.
    fn send_to(&self, bytes: Vec<u8>, dest: SocketAddr) -> BoxFuture<'_, Result<(), Error>>;

    /// Waits for and returns the next inbound datagram.
    fn receive(&self) -> BoxFuture<'_, Result<Datagram, Error>>;

    /// Returns the local address this transport is bound to, if meaningful.
    fn local_addr(&self) -> Result<SocketAddr, Error>;

    /// Closes the transport. Subsequent `send_to`/`receive` calls should fail with
    /// [`Error::IllegalState`].
    fn close(&self);
}
