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

//! Block-wise transfer ([RFC 7959](https://tools.ietf.org/html/rfc7959)) reassembly and
//! segmentation, built atop the wire-format arithmetic in [`crate::block`].
//!
//! `Block1` (request segmentation) reassembly is stateful: [`Block1Reassembler`] accumulates
//! sequential blocks from the same token/peer into one payload, surfacing `4.08`/`4.13` per
//! spec.md §4.7 on out-of-order arrival or a cap overrun. `Block2` (response segmentation) is
//! stateless on the server side: [`block2_chunk`] just slices an already-materialized body;
//! the client-side equivalent reuses [`crate::block::BlockReconstructor`] directly.

use crate::block::BlockInfo;
use crate::error::Error;
use crate::message::MsgToken;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// Identifies one in-progress `Block1` upload: the sender, the token it's using, and the
/// resource path it's PUTting/POSTing to (multiple concurrent uploads to different resources
/// from the same peer must not collide).
pub type ReassemblyKey = (SocketAddr, MsgToken, String);

/// Outcome of feeding one block into a [`Block1Reassembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block1Outcome {
    /// More blocks are expected; acknowledge with `2.31 Continue` echoing this block's
    /// `num`/`szx`.
    Continue,
    /// The final block (`M=0`) arrived; here is the fully reassembled body.
    Complete(Vec<u8>),
}

/// Accumulates a single `Block1` upload.
struct Block1Reassembler {
    expected_num: u32,
    buffer: Vec<u8>,
    cap: usize,
}

impl Block1Reassembler {
    fn feed(&mut self, block: BlockInfo, payload: &[u8]) -> Result<Block1Outcome, Error> {
        if block.num() != self.expected_num {
            return Err(Error::RequestEntityIncomplete);
        }
        self.buffer.extend_from_slice(payload);
        if self.buffer.len() > self.cap {
            return Err(Error::RequestEntityTooLarge);
        }
        self.expected_num += 1;
        if block.more_flag() {
            Ok(Block1Outcome::Continue)
        } else {
            Ok(Block1Outcome::Complete(std::mem::take(&mut self.buffer)))
        }
    }
}

/// Tracks every in-progress `Block1` upload for one endpoint, keyed by
/// `(remote-peer, token, resource-path)`.
#[derive(Default)]
pub struct BlockwiseRegistry {
    uploads: Mutex<HashMap<ReassemblyKey, Block1Reassembler>>,
}

impl BlockwiseRegistry {
    /// Creates an empty registry.
    pub fn new() -> BlockwiseRegistry {
        BlockwiseRegistry::default()
    }

    /// Feeds one inbound `Block1` block into the reassembly context for `key`, creating it if
    /// this is block 0. `cap` bounds the total reassembled size (checked on every block, so it
    /// applies even if the client lies about `Size1`).
    pub fn feed_block1(
        &self,
        key: ReassemblyKey,
        block: BlockInfo,
        payload: &[u8],
        cap: usize,
    ) -> Result<Block1Outcome, Error> {
        let mut uploads = self.uploads.lock().unwrap();

        if block.num() == 0 && !uploads.contains_key(&key) {
            uploads.insert(
                key.clone(),
                Block1Reassembler {
                    expected_num: 0,
                    buffer: Vec::new(),
                    cap,
                },
            );
        }

        let result = match uploads.get_mut(&key) {
            Some(reassembler) => reassembler.feed(block, payload),
            None => Err(Error::RequestEntityIncomplete),
        };

        match &result {
            Ok(Block1Outcome::Complete(_)) | Err(_) => {
                uploads.remove(&key);
            }
            Ok(Block1Outcome::Continue) => {}
        }

        result
    }

    /// Returns the number of uploads currently in progress, for tests and diagnostics.
    pub fn in_progress_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

/// Slices `body` for a `Block2` response to a request for `requested`, clamping the size
/// downward if `requested.szx()` exceeds `max_szx` (a server may always reduce SZX). Returns
/// the payload slice and the `BlockInfo` to send back (with `M` set correctly for whether
/// this is the last chunk).
pub fn block2_chunk(body: &[u8], requested: BlockInfo, max_szx: u8) -> (&[u8], BlockInfo) {
    let szx = requested.szx().min(max_szx);
    let block_size = 1usize << (szx as u32 + 4);
    let offset = requested.num() as usize * block_size;

    if offset >= body.len() {
        return (&[], BlockInfo::new(requested.num(), false, szx).unwrap());
    }

    let end = (offset + block_size).min(body.len());
    let more = end < body.len();
    let chunk = &body[offset..end];
    (chunk, BlockInfo::new(requested.num(), more, szx).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ReassemblyKey {
        ("127.0.0.1:5683".parse().unwrap(), MsgToken::new(&[1]).unwrap(), "upload".to_string())
    }

    #[test]
    fn reassembles_sequential_blocks() {
        let registry = BlockwiseRegistry::new();
        let b0 = BlockInfo::new(0, true, 2).unwrap(); // 16-byte blocks
        let b1 = BlockInfo::new(1, false, 2).unwrap();

        assert_eq!(
            registry.feed_block1(key(), b0, &[0u8; 16], 1024).unwrap(),
            Block1Outcome::Continue
        );
        let outcome = registry.feed_block1(key(), b1, &[1u8; 8], 1024).unwrap();
        match outcome {
            Block1Outcome::Complete(body) => assert_eq!(body.len(), 24),
            other => panic!("expected Complete, got {:?}", other),
        }
        assert_eq!(registry.in_progress_count(), 0);
    }

    #[test]
    fn out_of_order_block_is_incomplete_entity() {
        let registry = BlockwiseRegistry::new();
        let b0 = BlockInfo::new(0, true, 2).unwrap();
        let b2 = BlockInfo::new(2, false, 2).unwrap();

        registry.feed_block1(key(), b0, &[0u8; 16], 1024).unwrap();
        let result = registry.feed_block1(key(), b2, &[1u8; 8], 1024);
        assert_eq!(result, Err(Error::RequestEntityIncomplete));
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let registry = BlockwiseRegistry::new();
        let b0 = BlockInfo::new(0, true, 6).unwrap(); // 1024-byte blocks
        let result = registry.feed_block1(key(), b0, &[0u8; 1024], 512);
        assert_eq!(result, Err(Error::RequestEntityTooLarge));
    }

    #[test]
    fn block2_chunk_splits_body_and_sets_more_flag() {
        let body = vec![7u8; 2800];
        let first = BlockInfo::new(0, false, 6).unwrap(); // request block 0, szx=6 (1024 bytes)
        let (chunk, info) = block2_chunk(&body, first, 6);
        assert_eq!(chunk.len(), 1024);
        assert!(info.more_flag());

        let last = BlockInfo::new(2, false, 6).unwrap();
        let (chunk, info) = block2_chunk(&body, last, 6);
        assert_eq!(chunk.len(), 2800 - 2048);
        assert!(!info.more_flag());
    }

    #[test]
    fn block2_chunk_honors_a_reduced_server_szx() {
        let body = vec![9u8; 100];
        let requested = BlockInfo::new(0, false, 6).unwrap(); // client asks for 1024-byte blocks
        let (chunk, info) = block2_chunk(&body, requested, 2); // server caps at 16-byte blocks
        assert_eq!(chunk.len(), 16);
        assert_eq!(info.szx(), 2);
        assert!(info.more_flag());
    }
}
