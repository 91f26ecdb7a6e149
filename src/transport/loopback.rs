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

//! A [`Transport`] that loops every sent datagram straight back to its own receive queue,
//! for exercising the protocol core without a real socket.

use super::{Datagram, Transport};
use crate::error::Error;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};

const LOOPBACK_ADDR: &str = "127.0.0.1:5683";

/// An in-process loopback transport: everything sent is immediately available to `receive`.
#[derive(Debug)]
pub struct LoopbackTransport {
    sender: mpsc::UnboundedSender<Datagram>,
    receiver: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    closed: AtomicBool,
    local_addr: SocketAddr,
}

impl LoopbackTransport {
    /// Creates a new loopback transport bound to the standard CoAP port on localhost.
    pub fn new() -> LoopbackTransport {
        let (sender, receiver) = mpsc::unbounded_channel();
        LoopbackTransport {
            sender,
            receiver: Mutex::new(receiver),
            closed: AtomicBool::new(false),
            local_addr: LOOPBACK_ADDR.parse().unwrap(),
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        LoopbackTransport::new()
    }
}

impl Transport for LoopbackTransport {
    fn send_to(&self, bytes: Vec<u8>, dest: SocketAddr) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::IllegalState);
            }
            self.sender
                .send(Datagram {
                    bytes,
                    from: dest,
                })
                .map_err(|_| Error::IllegalState)
        })
    }

    fn receive(&self) -> BoxFuture<'_, Result<Datagram, Error>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::IllegalState);
            }
            self.receiver
                .lock()
                .await
                .recv()
                .await
                .ok_or(Error::IllegalState)
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.local_addr)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
