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

use super::*;
use crate::util::{encode_u32, try_decode_u16, try_decode_u32};

/// Type describing the interpretation of an option's value.
#[derive(Debug, Copy, Eq, PartialEq, Hash, Clone)]
pub enum OptionValueType {
    /// Opaque option value.
    Opaque,
    /// Option value is determined by the presence or absence of the option.
    Flag,
    /// Big-endian unsigned integer value, leading zero bytes elided.
    Integer,
    /// UTF-8 string value.
    String,
    /// Integer value containing a [`ContentFormat`](crate::content_format::ContentFormat).
    ContentFormat,
    /// Integer value containing a [`BlockInfo`](crate::block::BlockInfo).
    Block,
}

/// Intermediate representation used when inserting a typed value into an option set.
#[doc(hidden)]
#[derive(Debug)]
pub enum OptionValue<'a> {
    Integer(u32),
    Bytes(&'a [u8]),
}

impl<'a> From<u8> for OptionValue<'a> {
    fn from(value: u8) -> Self {
        OptionValue::Integer(value as u32)
    }
}

impl<'a> From<u16> for OptionValue<'a> {
    fn from(value: u16) -> Self {
        OptionValue::Integer(value as u32)
    }
}

impl<'a> From<u32> for OptionValue<'a> {
    fn from(value: u32) -> Self {
        OptionValue::Integer(value)
    }
}

impl<'a> From<&'a [u8]> for OptionValue<'a> {
    fn from(value: &'a [u8]) -> Self {
        OptionValue::Bytes(value)
    }
}

impl<'a> From<&'a str> for OptionValue<'a> {
    fn from(value: &'a str) -> Self {
        OptionValue::Bytes(value.as_bytes())
    }
}

impl<'a> From<()> for OptionValue<'a> {
    fn from(_: ()) -> Self {
        OptionValue::Bytes(&[])
    }
}

/// Converts a raw option value byte slice into a typed Rust value.
#[doc(hidden)]
pub trait TryOptionValueFrom<'a>: Sized {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self>;
}

impl<'a> TryOptionValueFrom<'a> for &'a [u8] {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        Some(buffer)
    }
}

impl<'a> TryOptionValueFrom<'a> for u32 {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        try_decode_u32(buffer)
    }
}

impl<'a> TryOptionValueFrom<'a> for u16 {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        try_decode_u16(buffer)
    }
}

impl<'a> TryOptionValueFrom<'a> for () {
    fn try_option_value_from(_: &'a [u8]) -> Option<Self> {
        Some(())
    }
}

impl<'a> TryOptionValueFrom<'a> for &'a str {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        core::str::from_utf8(buffer).ok()
    }
}

impl<'a> From<crate::content_format::ContentFormat> for OptionValue<'a> {
    fn from(value: crate::content_format::ContentFormat) -> Self {
        OptionValue::Integer(value.0 as u32)
    }
}

impl<'a> TryOptionValueFrom<'a> for crate::content_format::ContentFormat {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        try_decode_u16(buffer).map(crate::content_format::ContentFormat)
    }
}

impl<'a> From<crate::block::BlockInfo> for OptionValue<'a> {
    fn from(value: crate::block::BlockInfo) -> Self {
        OptionValue::Integer(value.0)
    }
}

impl<'a> TryOptionValueFrom<'a> for crate::block::BlockInfo {
    fn try_option_value_from(buffer: &'a [u8]) -> Option<Self> {
        try_decode_u32(buffer).map(crate::block::BlockInfo)
    }
}

/// Converts a typed value into bytes, as it would be encoded on the wire.
pub(crate) fn option_value_to_bytes(value: OptionValue<'_>) -> Vec<u8> {
    match value {
        OptionValue::Integer(x) => {
            let mut buf = [0u8; 4];
            encode_u32(x, &mut buf).to_vec()
        }
        OptionValue::Bytes(x) => x.to_vec(),
    }
}
