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

use crate::consts::MAX_TOKEN_LEN;
use crate::error::Error;
use core::ops::Deref;
use rand::RngCore;

/// A CoAP message token: 0-8 opaque bytes chosen by the requester to correlate a response
/// with its request.
#[derive(Eq, PartialEq, Hash, Copy, Clone, Ord, PartialOrd)]
pub struct MsgToken {
    len: u8,
    bytes: [u8; MAX_TOKEN_LEN],
}

impl MsgToken {
    /// The empty token, used for empty messages.
    pub const EMPTY: MsgToken = MsgToken {
        len: 0,
        bytes: [0; MAX_TOKEN_LEN],
    };

    /// Creates a new token from the given byte slice. Returns an error if `bytes` is
    /// longer than [`MAX_TOKEN_LEN`].
    pub fn new(bytes: &[u8]) -> Result<MsgToken, Error> {
        if bytes.len() > MAX_TOKEN_LEN {
            return Err(Error::TokenTooLong);
        }
        let mut buf = [0u8; MAX_TOKEN_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(MsgToken {
            len: bytes.len() as u8,
            bytes: buf,
        })
    }

    /// Generates a new random token of the given length (clamped to [`MAX_TOKEN_LEN`]).
    pub fn random(len: usize) -> MsgToken {
        let len = len.min(MAX_TOKEN_LEN);
        let mut buf = [0u8; MAX_TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut buf[..len]);
        MsgToken {
            len: len as u8,
            bytes: buf,
        }
    }

    /// Returns the length of this token, in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true if this token is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns this token's bytes as a slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Display for MsgToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MsgToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MsgToken({})", self)
    }
}

impl Default for MsgToken {
    fn default() -> Self {
        MsgToken::EMPTY
    }
}

impl Deref for MsgToken {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl core::cmp::PartialEq<[u8]> for MsgToken {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl core::convert::TryFrom<&[u8]> for MsgToken {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        MsgToken::new(value)
    }
}
