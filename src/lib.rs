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

//! An asynchronous implementation of the core of the Constrained Application Protocol
//! ([RFC 7252](https://tools.ietf.org/html/rfc7252)), including observing
//! ([RFC 7641](https://tools.ietf.org/html/rfc7641)) and block-wise transfers
//! ([RFC 7959](https://tools.ietf.org/html/rfc7959)).
//!
//! This crate is transport-agnostic: the [`transport`] module defines the
//! [`Transport`](transport::Transport) trait that a concrete datagram back-end (UDP, DTLS, an
//! in-process loopback, or a test double) implements, and [`endpoint::EndpointManager`] drives
//! message-layer reliability, transaction correlation, observation, and block-wise reassembly
//! on top of whichever transport is registered for a given URI scheme.

pub mod consts;
pub use consts::*;

mod error;
pub use error::Error;

mod util;

pub mod behavior;
pub use behavior::BehaviorContext;

mod content_format;
pub use content_format::ContentFormat;

mod etag;
pub use etag::ETag;

mod block;
pub use block::{BlockInfo, BlockReconstructor};

pub mod blockwise;
pub use blockwise::BlockwiseRegistry;

pub mod option;
pub mod message;

pub mod scheduler;
pub use scheduler::Scheduler;

mod dedup;

pub mod uri;
pub use uri::CoapUri;

pub mod transport;

mod message_layer;

pub mod transaction;

pub mod observer;

pub mod resource;

pub mod endpoint;
pub use endpoint::EndpointManager;

pub mod client;
pub use client::{Client, RequestBuilder};

pub mod server;
pub use server::Server;

/// Commonly used types, re-exported for convenient `use coap_core::prelude::*;` imports.
pub mod prelude {
    pub use crate::block::BlockInfo;
    pub use crate::client::{Client, RequestBuilder, Transaction};
    pub use crate::content_format::ContentFormat;
    pub use crate::endpoint::EndpointManager;
    pub use crate::error::Error;
    pub use crate::message::{Message, MsgCode, MsgId, MsgToken, MsgType, MutableMessage};
    pub use crate::option::{OptionKey, OptionNumber, OptionSet};
    pub use crate::scheduler::Scheduler;
    pub use crate::server::Server;
    pub use crate::transport::Transport;
}
