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

use super::codec::{decode_options, encode_options_into};
use super::msg_code::MsgCode;
use super::msg_type::MsgType;
use super::token::MsgToken;
use super::MsgId;
use crate::block::BlockInfo;
use crate::content_format::ContentFormat;
use crate::error::Error;
use crate::option::{OptionKey, OptionSet, OptionValue, TryOptionValueFrom};
use std::convert::Into;

const COAP_VERSION: u8 = 1;

/// An immutable, fully-decoded CoAP message.
///
/// Constructed either by [`Message::try_from_bytes`] (parsing a datagram) or via
/// [`MutableMessage`] (building one programmatically).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    msg_type: MsgType,
    msg_code: MsgCode,
    msg_id: MsgId,
    token: MsgToken,
    options: OptionSet,
    payload: Vec<u8>,
}

impl Message {
    /// Parses a complete CoAP message from its wire representation.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<Message, Error> {
        if bytes.len() < 4 {
            return Err(Error::ParseFailure);
        }

        let ver = bytes[0] >> 6;
        if ver != COAP_VERSION {
            return Err(Error::ParseFailure);
        }

        let msg_type = MsgType::try_from((bytes[0] >> 4) & 0b11).ok_or(Error::ParseFailure)?;
        let tkl = (bytes[0] & 0x0F) as usize;
        if tkl > crate::consts::MAX_TOKEN_LEN {
            return Err(Error::ParseFailure);
        }

        let msg_code = MsgCode::try_from(bytes[1]).ok_or(Error::UnknownMessageCode)?;
        let msg_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        if bytes.len() < 4 + tkl {
            return Err(Error::ParseFailure);
        }
        let token = MsgToken::new(&bytes[4..4 + tkl])?;

        let rest = &bytes[4 + tkl..];
        let marker_pos = rest.iter().position(|&b| b == 0xFF);
        let (opt_bytes, payload) = match marker_pos {
            Some(pos) => (&rest[..pos], rest[pos + 1..].to_vec()),
            None => (rest, Vec::new()),
        };

        if marker_pos.is_some() && payload.is_empty() {
            return Err(Error::ParseFailure);
        }

        let options = decode_options(opt_bytes)?;

        Ok(Message {
            msg_type,
            msg_code,
            msg_id,
            token,
            options,
            payload,
        })
    }

    /// Serializes this message to its wire representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);

        out.push((COAP_VERSION << 6) | ((self.msg_type as u8) << 4) | (self.token.len() as u8));
        out.push(self.msg_code.into());
        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(self.token.as_bytes());

        encode_options_into(&mut out, &self.options)?;

        if !self.payload.is_empty() {
            out.push(0xFF);
            out.extend_from_slice(&self.payload);
        }

        Ok(out)
    }

    /// Returns the message type.
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Returns the message code.
    pub fn msg_code(&self) -> MsgCode {
        self.msg_code
    }

    /// Returns the message id.
    pub fn msg_id(&self) -> MsgId {
        self.msg_id
    }

    /// Returns the message token.
    pub fn msg_token(&self) -> MsgToken {
        self.token
    }

    /// Returns the option set.
    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    /// Returns the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the payload interpreted as a UTF-8 string, if valid.
    pub fn payload_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Returns the value of a typed option, if present.
    pub fn option<'a, T>(&'a self, key: OptionKey<T>) -> Option<T>
    where
        T: TryOptionValueFrom<'a>,
    {
        self.options.get(key)
    }

    /// Returns the `Content-Format` option value, if present.
    pub fn content_format(&self) -> Option<ContentFormat> {
        self.options.get(crate::option::CONTENT_FORMAT)
    }

    /// Returns the `Accept` option value, if present.
    pub fn accept(&self) -> Option<ContentFormat> {
        self.options.get(crate::option::ACCEPT)
    }

    /// Returns the `Block1` option value, if present.
    pub fn block1(&self) -> Option<BlockInfo> {
        self.options.get(crate::option::BLOCK1)
    }

    /// Returns the `Block2` option value, if present.
    pub fn block2(&self) -> Option<BlockInfo> {
        self.options.get(crate::option::BLOCK2)
    }

    /// Returns the `Observe` option value, if present.
    pub fn observe(&self) -> Option<u32> {
        self.options.get(crate::option::OBSERVE)
    }

    /// Returns true if this message is acknowledgeable (a `CON` request or response).
    pub fn is_confirmable(&self) -> bool {
        self.msg_type == MsgType::Con
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {} mid={} tkn={}",
            self.msg_type, self.msg_code, self.msg_id, self.token
        )?;
        for (number, value) in self.options.iter() {
            write!(f, " {}={:?}", number, value)?;
        }
        if !self.payload.is_empty() {
            write!(f, " [{} byte payload]", self.payload.len())?;
        }
        Ok(())
    }
}

/// A builder for constructing a [`Message`] piece by piece.
///
/// Mirrors the accumulation style of a streaming message encoder: set the header fields,
/// insert options in ascending option-number order, then append the payload.
#[derive(Debug, Clone, Default)]
pub struct MutableMessage {
    msg_type: MsgType,
    msg_code: MsgCode,
    msg_id: MsgId,
    token: MsgToken,
    options: OptionSet,
    payload: Vec<u8>,
}

impl MutableMessage {
    /// Creates a new, empty message builder.
    pub fn new() -> MutableMessage {
        Default::default()
    }

    /// Sets the message type.
    pub fn set_msg_type(&mut self, msg_type: MsgType) -> &mut Self {
        self.msg_type = msg_type;
        self
    }

    /// Sets the message code.
    pub fn set_msg_code(&mut self, msg_code: MsgCode) -> &mut Self {
        self.msg_code = msg_code;
        self
    }

    /// Sets the message id.
    pub fn set_msg_id(&mut self, msg_id: MsgId) -> &mut Self {
        self.msg_id = msg_id;
        self
    }

    /// Sets the message token.
    pub fn set_msg_token(&mut self, token: MsgToken) -> &mut Self {
        self.token = token;
        self
    }

    /// Inserts an option with a raw byte value. Options must be inserted in ascending
    /// option-number order for repeatable options to preserve their intended ordering.
    pub fn insert_option_with_bytes(
        &mut self,
        number: crate::option::OptionNumber,
        value: &[u8],
    ) -> Result<&mut Self, Error> {
        self.options.insert_with_bytes(number, value)?;
        Ok(self)
    }

    /// Inserts a typed option value.
    pub fn insert_option<'a, T>(&mut self, key: OptionKey<T>, value: T) -> Result<&mut Self, Error>
    where
        T: Into<OptionValue<'a>>,
    {
        self.options.insert(key, value)?;
        Ok(self)
    }

    /// Appends bytes to the payload.
    pub fn append_payload_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(bytes);
        self
    }

    /// Appends a string to the payload.
    pub fn append_payload_str(&mut self, s: &str) -> &mut Self {
        self.append_payload_bytes(s.as_bytes())
    }

    /// Clears the options and payload, preserving the header fields.
    pub fn clear(&mut self) -> &mut Self {
        self.options = OptionSet::new();
        self.payload.clear();
        self
    }

    /// Consumes the builder, producing an immutable [`Message`].
    pub fn freeze(self) -> Message {
        Message {
            msg_type: self.msg_type,
            msg_code: self.msg_code,
            msg_id: self.msg_id,
            token: self.token,
            options: self.options,
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::URI_PATH;

    #[test]
    fn builds_and_serializes_a_get_request() {
        let mut builder = MutableMessage::new();
        builder
            .set_msg_type(MsgType::Con)
            .set_msg_code(MsgCode::MethodGet)
            .set_msg_id(0x1234)
            .set_msg_token(MsgToken::new(&[0xAB]).unwrap());
        builder.insert_option(URI_PATH, "time").unwrap();
        builder.append_payload_bytes(b"");

        let msg = builder.freeze();
        let bytes = msg.to_bytes().unwrap();

        let decoded = Message::try_from_bytes(&bytes).unwrap();
        assert_eq!(decoded.msg_type(), MsgType::Con);
        assert_eq!(decoded.msg_code(), MsgCode::MethodGet);
        assert_eq!(decoded.msg_id(), 0x1234);
        assert_eq!(decoded.msg_token(), msg.msg_token());
        assert_eq!(decoded.option(URI_PATH), Some("time"));
    }

    #[test]
    fn rejects_truncated_header() {
        assert_eq!(Message::try_from_bytes(&[0x40]), Err(Error::ParseFailure));
    }

    #[test]
    fn rejects_bad_version() {
        let bytes = [0x00, 0x01, 0x00, 0x00];
        assert_eq!(Message::try_from_bytes(&bytes), Err(Error::ParseFailure));
    }

    #[test]
    fn round_trips_payload_without_options() {
        let mut builder = MutableMessage::new();
        builder
            .set_msg_type(MsgType::Non)
            .set_msg_code(MsgCode::SuccessContent)
            .set_msg_id(7)
            .set_msg_token(MsgToken::EMPTY);
        builder.append_payload_bytes(b"hello");

        let msg = builder.freeze();
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::try_from_bytes(&bytes).unwrap();
        assert_eq!(decoded.payload(), b"hello");
        assert_eq!(decoded.payload_as_str(), Some("hello"));
    }

    #[test]
    fn decode_matches_hand_verified_post_packet() {
        use crate::option::URI_QUERY;

        // CON POST, mid=0x5D47, token=[0x01,0x02], Uri-Path="foo", Uri-Query="test",
        // payload {"a":1}.
        let bytes: [u8; 23] = [
            0x42, 0x02, 0x5D, 0x47, 0x01, 0x02, 0xB3, 0x66, 0x6F, 0x6F, 0x44, 0x74, 0x65, 0x73,
            0x74, 0xFF, 0x7B, 0x22, 0x61, 0x22, 0x3A, 0x31, 0x7D,
        ];

        let msg = Message::try_from_bytes(&bytes).unwrap();
        assert_eq!(msg.msg_type(), MsgType::Con);
        assert_eq!(msg.msg_code(), MsgCode::MethodPost);
        assert_eq!(msg.msg_id(), 0x5D47);
        assert_eq!(msg.msg_token().as_bytes(), &[0x01, 0x02]);
        assert_eq!(msg.option(URI_PATH), Some("foo"));
        assert_eq!(msg.option(URI_QUERY), Some("test"));
        assert_eq!(msg.payload_as_str(), Some("{\"a\":1}"));

        let round_tripped = msg.to_bytes().unwrap();
        let reparsed = Message::try_from_bytes(&round_tripped).unwrap();
        assert_eq!(reparsed, msg);
    }
}
