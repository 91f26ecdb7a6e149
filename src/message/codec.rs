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

//! Low-level message codec functions: option TLV encoding/decoding.

use crate::consts::MAX_OPTION_VALUE_SIZE;
use crate::error::Error;
use crate::option::{OptionNumber, OptionSet};

/// Calculates the encoded size of a CoAP option, given the option number of the option that
/// precedes it (for delta computation) and the length of its value.
pub fn calc_option_size(prev_key: OptionNumber, key: OptionNumber, mut value_len: usize) -> usize {
    if value_len >= 269 {
        value_len += 2;
    } else if value_len >= 13 {
        value_len += 1;
    }

    let option_delta = (key - prev_key) as u16;

    if option_delta >= 269 {
        value_len += 3;
    } else if option_delta >= 13 {
        value_len += 2;
    } else {
        value_len += 1;
    }

    value_len
}

/// Decodes one option from a `core::slice::Iter`, which can be obtained from a byte slice.
/// The iterator is then advanced past the decoded option.
///
/// Returns `Ok(None)` if it either encounters the end-of-options marker (`0xFF`) or the
/// iterator has been fully consumed.
pub fn decode_option<'a>(
    iter: &mut core::slice::Iter<'a, u8>,
    last_option: OptionNumber,
) -> Result<Option<(OptionNumber, &'a [u8])>, Error> {
    macro_rules! try_next {
        ($iter:expr, $none:expr) => {
            match ($iter).next() {
                Some(x) => *x,
                None => return $none,
            }
        };
    }

    let header: u8 = try_next!(iter, Ok(None));

    if header == 0xFF {
        return Ok(None);
    }

    let key_delta: u16 = match header >> 4 {
        13 => 13u16 + try_next!(iter, Err(Error::ParseFailure)) as u16,
        14 => {
            let msb = try_next!(iter, Err(Error::ParseFailure)) as u16;
            269u16 + try_next!(iter, Err(Error::ParseFailure)) as u16 + (msb << 8)
        }
        15 => return Err(Error::ParseFailure),
        key => key as u16,
    };

    let len = match header & 0xF {
        13 => (13 + try_next!(iter, Err(Error::ParseFailure))) as usize,
        14 => {
            let msb = try_next!(iter, Err(Error::ParseFailure)) as u16;
            (269u16 + try_next!(iter, Err(Error::ParseFailure)) as u16 + (msb << 8)) as usize
        }
        15 => return Err(Error::ParseFailure),
        len => len as usize,
    };

    if last_option.0 > u16::MAX - key_delta {
        return Err(Error::ParseFailure);
    }

    if len == 0 {
        return Ok(Some((last_option + key_delta, &[])));
    }

    let remaining = iter.as_slice();
    if len > remaining.len() {
        return Err(Error::ParseFailure);
    }
    let value: &'a [u8] = &remaining[..len];

    iter.nth(len - 1);

    Ok(Some((last_option + key_delta, value)))
}

/// Parses a block of raw option bytes (as found between the CoAP header/token and the
/// `0xFF` payload marker) into an [`OptionSet`].
pub fn decode_options(buffer: &[u8]) -> Result<OptionSet, Error> {
    let mut set = OptionSet::new();
    let mut last_option = OptionNumber::default();
    let mut iter = buffer.iter();

    while let Some((number, value)) = decode_option(&mut iter, last_option)? {
        set.insert_with_bytes(number, value)
            .map_err(|_| Error::ParseFailure)?;
        last_option = number;
    }

    Ok(set)
}

/// Encodes all parts of an option into `out` *except* the value, appending the bytes.
pub fn encode_option_header_into(
    out: &mut Vec<u8>,
    prev_key: OptionNumber,
    key: OptionNumber,
    value_len: usize,
) -> Result<(), Error> {
    if prev_key > key {
        return Err(Error::InvalidArgument);
    }

    if value_len > MAX_OPTION_VALUE_SIZE {
        log::warn!("value_len:{}, max:{}", value_len, MAX_OPTION_VALUE_SIZE);
        return Err(Error::InvalidArgument);
    }

    let mut option_delta = key - prev_key;
    let mut header_byte = 0u8;
    let mut delta_ext: Vec<u8> = Vec::new();

    if option_delta >= 269 {
        option_delta -= 269;
        header_byte |= 14 << 4;
        delta_ext.push((option_delta >> 8) as u8);
        delta_ext.push(option_delta as u8);
    } else if option_delta >= 13 {
        header_byte |= 13 << 4;
        delta_ext.push((option_delta - 13) as u8);
    } else {
        header_byte |= (option_delta << 4) as u8;
    }

    let mut len_ext: Vec<u8> = Vec::new();
    if value_len >= 269 {
        header_byte |= 14;
        len_ext.push(((value_len - 269) >> 8) as u8);
        len_ext.push((value_len - 269) as u8);
    } else if value_len >= 13 {
        header_byte |= 13;
        len_ext.push((value_len - 13) as u8);
    } else {
        header_byte |= (value_len & 15) as u8;
    }

    out.push(header_byte);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&len_ext);

    Ok(())
}

/// Encodes an option into `out`, appending the header and value bytes.
pub fn encode_option_into(
    out: &mut Vec<u8>,
    prev_key: OptionNumber,
    key: OptionNumber,
    value: &[u8],
) -> Result<(), Error> {
    encode_option_header_into(out, prev_key, key, value.len())?;
    out.extend_from_slice(value);
    Ok(())
}

/// Serializes an entire [`OptionSet`] to wire format, appending to `out`. Does not append
/// the `0xFF` payload marker.
pub fn encode_options_into(out: &mut Vec<u8>, options: &OptionSet) -> Result<(), Error> {
    let mut last_option = OptionNumber::default();
    for (number, value) in options.iter() {
        encode_option_into(out, last_option, number, value)?;
        last_option = number;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::{PROXY_URI, URI_PATH};

    #[test]
    fn round_trips_single_option() {
        let mut set = OptionSet::new();
        set.insert(URI_PATH, "time").unwrap();

        let mut buf = Vec::new();
        encode_options_into(&mut buf, &set).unwrap();

        let decoded = decode_options(&buf).unwrap();
        assert_eq!(decoded.get(URI_PATH), Some("time"));
    }

    #[test]
    fn round_trips_many_options_with_large_deltas_and_values() {
        let mut set = OptionSet::new();
        set.insert(URI_PATH, "a").unwrap();
        set.insert_with_bytes(OptionNumber::PROXY_URI, &vec![0x41u8; 300])
            .unwrap();

        let mut buf = Vec::new();
        encode_options_into(&mut buf, &set).unwrap();

        let decoded = decode_options(&buf).unwrap();
        assert_eq!(decoded.get(URI_PATH), Some("a"));
        assert!(decoded.contains(OptionNumber::PROXY_URI));
    }

    #[test]
    fn decode_rejects_truncated_option() {
        let buf = [0x01u8]; // claims 1-byte value, delta 0, but no value byte follows
        assert_eq!(decode_options(&buf), Err(Error::ParseFailure));
    }

    #[test]
    fn end_of_options_marker_stops_decoding() {
        let mut buf = vec![0xFF];
        buf.extend_from_slice(b"payload");
        let decoded = decode_options(&buf).unwrap();
        assert!(decoded.is_empty());
    }
}
