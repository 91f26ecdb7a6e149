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

use std::fmt::{Debug, Display, Formatter};

/// Type for errors encountered while encoding, decoding, sending, or receiving CoAP messages.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Error {
    /// One or more of the supplied arguments are not valid for the given operation.
    InvalidArgument,

    /// There is not enough space in the given buffer to complete the operation.
    OutOfSpace,

    /// An error was encountered while attempting to parse the data.
    ParseFailure,

    /// A token longer than 8 bytes was encountered while parsing.
    TokenTooLong,

    /// A critical option present in the message was not recognized.
    UnrecognisedCriticalOption,

    /// Operation timed out waiting for an acknowledgement.
    TransmitTimeout,

    /// Operation timed out waiting for a separate response.
    NoResponse,

    /// The remote peer sent a RST in reply to our message.
    Reset,

    /// The response was well-formed, but not appropriate for the given request.
    MalformedResponse,

    /// The selected proxy does not support proxying this kind of request.
    ProxyingNotSupported,

    /// This operation has been cancelled.
    Cancelled,

    /// The operation was attempted on a client or server that has been closed.
    IllegalState,

    /// The [message code][crate::message::MsgCode] was not recognized.
    UnknownMessageCode,

    /// An I/O error occurred while performing this operation.
    IOError,

    /// Unable to look up the given host.
    HostNotFound,

    /// The given URI scheme has no transport registered for it.
    UnsupportedUriScheme,

    /// Block arrived out of order on a stateful reassembly context.
    RequestEntityIncomplete,

    /// Total reassembled entity size exceeds the configured cap.
    RequestEntityTooLarge,

    /// More than one instance of a non-repeatable option was encountered.
    OptionNotRepeatable,

    /// An unspecified error has occurred.
    Unspecified,
}

impl std::convert::From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::IOError
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        <Self as Debug>::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl Default for Error {
    fn default() -> Self {
        Error::Unspecified
    }
}
