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

//! Module defining various CoAP-related constants.

/// The standard default IP port number used for CoAP-over-UDP.
pub const DEFAULT_PORT_COAP_UDP: u16 = 5683;

/// The standard default IP port number used for CoAP-over-DTLS.
pub const DEFAULT_PORT_COAP_DTLS: u16 = 5684;

/// The standard URI scheme for vanilla CoAP-over-UDP on IP networks.
pub const URI_SCHEME_COAP: &str = "coap";

/// The standard URI scheme for CoAP-over-DTLS on IP networks.
pub const URI_SCHEME_COAPS: &str = "coaps";

/// Non-standard URI scheme for an in-process loopback endpoint.
pub const URI_SCHEME_LOOPBACK: &str = "loop";

/// Non-standard URI scheme for a null (black hole) endpoint, used to exercise timeout paths.
pub const URI_SCHEME_NULL: &str = "null";

/// Value for `OptionNumber::OBSERVE` when registering an observer.
///
/// Defined by [RFC 7641](https://tools.ietf.org/html/rfc7641).
pub const OBSERVE_REGISTER: u32 = 0;

/// Value for `OptionNumber::OBSERVE` when deregistering an observer.
///
/// Defined by [RFC 7641](https://tools.ietf.org/html/rfc7641).
pub const OBSERVE_DEREGISTER: u32 = 1;

/// Upper bound (exclusive) on a CoAP `Observe` sequence number: `2^24`.
pub const OBSERVE_SEQUENCE_MODULUS: u32 = 1 << 24;

/// Maximum allowed length, in bytes, of a CoAP message token.
pub const MAX_TOKEN_LEN: usize = 8;

/// Maximum size of a CoAP option value accepted by this library.
pub const MAX_OPTION_VALUE_SIZE: usize = 1034;
