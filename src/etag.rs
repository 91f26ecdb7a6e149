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

use crate::error::Error;
use crate::util::encode_u32;
use core::convert::{From, TryFrom};
use core::ops::Deref;

/// Type for holding the value of an ETag option (1-8 opaque bytes, RFC 7252 §5.10.6).
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, Ord, PartialOrd)]
pub struct ETag {
    len: u8,
    bytes: [u8; 8],
}

impl ETag {
    /// Maximum length of an ETag, in bytes.
    pub const MAX_LEN: usize = 8;

    /// Constant representing an empty ETag.
    pub const EMPTY: ETag = ETag {
        len: 0u8,
        bytes: [0; 8],
    };

    /// Attempts to create a new ETag from the given byte slice, failing if it is
    /// longer than [`ETag::MAX_LEN`].
    pub fn new(bytes: &[u8]) -> Result<ETag, Error> {
        ETag::try_from(bytes)
    }

    /// Returns the length of this ETag in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true if the length of this ETag is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the value of this ETag as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl Default for ETag {
    fn default() -> Self {
        ETag::EMPTY
    }
}

impl Deref for ETag {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl core::cmp::PartialEq<[u8]> for ETag {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl From<u32> for ETag {
    fn from(x: u32) -> Self {
        let mut bytes = [0u8; 8];
        let len = encode_u32(x, &mut bytes).len();
        ETag { len: len as u8, bytes }
    }
}

impl From<u16> for ETag {
    fn from(x: u16) -> Self {
        ETag::from(x as u32)
    }
}

impl TryFrom<&[u8]> for ETag {
    type Error = Error;

    fn try_from(x: &[u8]) -> Result<Self, Self::Error> {
        if x.len() > Self::MAX_LEN {
            return Err(Error::InvalidArgument);
        }
        let mut bytes = [0u8; 8];
        bytes[..x.len()].copy_from_slice(x);
        Ok(ETag { len: x.len() as u8, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes() {
        let tag = ETag::new(&[0xAB, 0xCD]).unwrap();
        assert_eq!(tag.as_bytes(), &[0xAB, 0xCD]);
        assert_eq!(tag.to_string(), "ABCD");
    }

    #[test]
    fn rejects_overlong() {
        assert_eq!(ETag::new(&[0u8; 9]), Err(Error::InvalidArgument));
    }

    #[test]
    fn from_integer() {
        let tag = ETag::from(0x1234u32);
        assert_eq!(tag.as_bytes(), &[0x12, 0x34]);
    }
}
