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

/// Typed option key, for type-safe access to a [`OptionSet`](crate::option::OptionSet).
#[derive(Hash, PartialEq, Eq, Ord, PartialOrd)]
pub struct OptionKey<T>(pub OptionNumber, core::marker::PhantomData<fn() -> T>);

impl<T> OptionKey<T> {
    /// Creates a new instance with the given option number.
    pub const fn new(n: OptionNumber) -> OptionKey<T> {
        OptionKey(n, core::marker::PhantomData)
    }
}

impl<T> Copy for OptionKey<T> {}

impl<T> Clone for OptionKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> core::fmt::Debug for OptionKey<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl<T> core::ops::Deref for OptionKey<T> {
    type Target = OptionNumber;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Typed key for the `If-Match` option.
pub const IF_MATCH: OptionKey<&[u8]> = OptionKey::new(OptionNumber::IF_MATCH);
/// Typed key for the `Uri-Host` option.
pub const URI_HOST: OptionKey<&str> = OptionKey::new(OptionNumber::URI_HOST);
/// Typed key for the `ETag` option.
pub const ETAG: OptionKey<&[u8]> = OptionKey::new(OptionNumber::ETAG);
/// Typed key for the `If-None-Match` option.
pub const IF_NONE_MATCH: OptionKey<()> = OptionKey::new(OptionNumber::IF_NONE_MATCH);
/// Typed key for the `Observe` option.
pub const OBSERVE: OptionKey<u32> = OptionKey::new(OptionNumber::OBSERVE);
/// Typed key for the `Uri-Port` option.
pub const URI_PORT: OptionKey<u16> = OptionKey::new(OptionNumber::URI_PORT);
/// Typed key for the `Location-Path` option.
pub const LOCATION_PATH: OptionKey<&str> = OptionKey::new(OptionNumber::LOCATION_PATH);
/// Typed key for the `Uri-Path` option.
pub const URI_PATH: OptionKey<&str> = OptionKey::new(OptionNumber::URI_PATH);
/// Typed key for the `Content-Format` option.
pub const CONTENT_FORMAT: OptionKey<crate::content_format::ContentFormat> =
    OptionKey::new(OptionNumber::CONTENT_FORMAT);
/// Typed key for the `Max-Age` option.
pub const MAX_AGE: OptionKey<u32> = OptionKey::new(OptionNumber::MAX_AGE);
/// Typed key for the `Uri-Query` option.
pub const URI_QUERY: OptionKey<&str> = OptionKey::new(OptionNumber::URI_QUERY);
/// Typed key for the `Accept` option.
pub const ACCEPT: OptionKey<crate::content_format::ContentFormat> =
    OptionKey::new(OptionNumber::ACCEPT);
/// Typed key for the `Location-Query` option.
pub const LOCATION_QUERY: OptionKey<&str> = OptionKey::new(OptionNumber::LOCATION_QUERY);
/// Typed key for the `Block2` option.
pub const BLOCK2: OptionKey<crate::block::BlockInfo> = OptionKey::new(OptionNumber::BLOCK2);
/// Typed key for the `Block1` option.
pub const BLOCK1: OptionKey<crate::block::BlockInfo> = OptionKey::new(OptionNumber::BLOCK1);
/// Typed key for the `Size2` option.
pub const SIZE2: OptionKey<u32> = OptionKey::new(OptionNumber::SIZE2);
/// Typed key for the `Proxy-Uri` option.
pub const PROXY_URI: OptionKey<&str> = OptionKey::new(OptionNumber::PROXY_URI);
/// Typed key for the `Proxy-Scheme` option.
pub const PROXY_SCHEME: OptionKey<&str> = OptionKey::new(OptionNumber::PROXY_SCHEME);
/// Typed key for the `Size1` option.
pub const SIZE1: OptionKey<u32> = OptionKey::new(OptionNumber::SIZE1);
