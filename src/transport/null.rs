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

//! A [`Transport`] that silently discards everything sent to it and never receives anything,
//! used to exercise timeout and retransmission-exhaustion paths deterministically.

use super::{Datagram, Transport};
use crate::error::Error;
use futures::future::BoxFuture;
use std::net::SocketAddr;

/// A black-hole transport: sends vanish, receives never complete.
#[derive(Debug, Default)]
pub struct NullTransport;

impl NullTransport {
    /// Creates a new null transport.
    pub fn new() -> NullTransport {
        NullTransport
    }
}

impl Transport for NullTransport {
    fn send_to(&self, _bytes: Vec<u8>, _dest: SocketAddr) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn receive(&self) -> BoxFuture<'_, Result<Datagram, Error>> {
        Box::pin(futures::future::pending())
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok("0.0.0.0:0".parse().unwrap())
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_always_succeeds_and_vanishes() {
        let transport = NullTransport::new();
        let dest: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        assert!(transport.send_to(vec![1, 2, 3], dest).await.is_ok());
    }

    #[tokio::test]
    async fn receive_never_resolves_within_a_short_timeout() {
        let transport = NullTransport::new();
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), transport.receive()).await;
        assert!(result.is_err());
    }
}
