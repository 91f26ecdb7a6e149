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

use super::message::Message;

/// Helper for logging a raw, possibly-corrupt datagram: parses it if possible and
/// falls back to a hex dump otherwise.
#[derive(Copy, Clone)]
pub struct CoapByteDisplayFormatter<'buf>(pub &'buf [u8]);

impl<'buf> std::fmt::Display for CoapByteDisplayFormatter<'buf> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match Message::try_from_bytes(self.0) {
            Ok(msg) => write!(f, "{}", msg),
            Err(_) => write!(f, "<CORRUPTED {:02x?}>", self.0),
        }
    }
}

impl<'buf> std::fmt::Debug for CoapByteDisplayFormatter<'buf> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CoapByteDisplayFormatter({}, {:02x?})", self, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupted_datagram_falls_back_to_hex_dump() {
        let bytes = [0xFFu8];
        let formatted = format!("{}", CoapByteDisplayFormatter(&bytes));
        assert!(formatted.starts_with("<CORRUPTED"));
    }
}
