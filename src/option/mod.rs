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

//! Types related to interpreting and handling CoAP options.

use crate::error::Error;
use std::convert::Into;

mod num;
pub use num::*;

mod key;
pub use key::*;

mod value;
pub use value::*;

use value::option_value_to_bytes;

/// An ordered collection of CoAP options, stored as owned bytes.
///
/// Options are always kept sorted by [`OptionNumber`], which is the invariant the wire codec
/// relies on to compute deltas. Within a single option number, insertion order is preserved,
/// since for repeatable options (like `Uri-Path`) the order is semantically meaningful.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OptionSet {
    entries: Vec<(OptionNumber, Vec<u8>)>,
}

impl OptionSet {
    /// Creates a new, empty option set.
    pub fn new() -> OptionSet {
        OptionSet { entries: Vec::new() }
    }

    /// Returns the number of options in this set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if this set contains no options.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all options, in ascending option-number order.
    pub fn iter(&self) -> impl Iterator<Item = (OptionNumber, &[u8])> {
        self.entries.iter().map(|(n, v)| (*n, v.as_slice()))
    }

    /// Removes all options with the given option number.
    pub fn remove(&mut self, number: OptionNumber) {
        self.entries.retain(|(n, _)| *n != number);
    }

    /// Inserts an option with a raw byte value, maintaining sort order.
    ///
    /// If the option number is not repeatable, any existing instance is replaced.
    pub fn insert_with_bytes(&mut self, number: OptionNumber, value: &[u8]) -> Result<(), Error> {
        if value.len() > crate::consts::MAX_OPTION_VALUE_SIZE {
            return Err(Error::OutOfSpace);
        }

        if !number.is_repeatable() && self.entries.iter().any(|(n, _)| *n == number) {
            return Err(Error::OptionNotRepeatable);
        }

        let pos = self
            .entries
            .iter()
            .position(|(n, _)| *n > number)
            .unwrap_or(self.entries.len());

        self.entries.insert(pos, (number, value.to_vec()));
        Ok(())
    }

    /// Inserts an option with no value.
    pub fn insert_empty(&mut self, number: OptionNumber) -> Result<(), Error> {
        self.insert_with_bytes(number, &[])
    }

    /// Inserts an option with a string value.
    pub fn insert_with_str(&mut self, number: OptionNumber, value: &str) -> Result<(), Error> {
        self.insert_with_bytes(number, value.as_bytes())
    }

    /// Inserts an option with an unsigned integer value.
    pub fn insert_with_u32(&mut self, number: OptionNumber, value: u32) -> Result<(), Error> {
        let mut buf = [0u8; 4];
        let encoded = crate::util::encode_u32(value, &mut buf);
        self.insert_with_bytes(number, encoded)
    }

    /// Inserts a typed option value using a typed [`OptionKey`].
    pub fn insert<'a, T>(&mut self, key: OptionKey<T>, value: T) -> Result<(), Error>
    where
        T: Into<OptionValue<'a>>,
    {
        self.insert_with_bytes(*key, &option_value_to_bytes(value.into()))
    }

    /// Returns the first value for the given typed option key, decoded to `T`.
    pub fn get<'a, T>(&'a self, key: OptionKey<T>) -> Option<T>
    where
        T: TryOptionValueFrom<'a>,
    {
        self.entries
            .iter()
            .find(|(n, _)| *n == *key)
            .and_then(|(_, v)| T::try_option_value_from(v))
    }

    /// Returns every value for the given typed option key, decoded to `T`.
    pub fn get_all<'a, T>(&'a self, key: OptionKey<T>) -> impl Iterator<Item = T> + 'a
    where
        T: TryOptionValueFrom<'a>,
    {
        self.entries
            .iter()
            .filter(move |(n, _)| *n == *key)
            .filter_map(|(_, v)| T::try_option_value_from(v))
    }

    /// Returns true if an option with the given number is present.
    pub fn contains(&self, number: OptionNumber) -> bool {
        self.entries.iter().any(|(n, _)| *n == number)
    }

    /// Checks whether any option number in this set is critical and unrecognized by the
    /// predicate `is_known`. Used when validating an inbound message for
    /// [`Error::UnrecognisedCriticalOption`].
    pub fn first_unrecognised_critical_option(
        &self,
        is_known: impl Fn(OptionNumber) -> bool,
    ) -> Option<OptionNumber> {
        self.entries
            .iter()
            .map(|(n, _)| *n)
            .find(|n| n.is_critical() && !is_known(*n))
    }
}

impl<'a> IntoIterator for &'a OptionSet {
    type Item = (OptionNumber, &'a [u8]);
    type IntoIter = Box<dyn Iterator<Item = (OptionNumber, &'a [u8])> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
