/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Wire framing for blocks multiplexed over a peer connection.
//!
//! Every block travels as a fixed 40-byte header followed by the raw
//! payload bytes. All header fields are little-endian `u64`:
//!
//! ```text
//! +------------+-------------+---------+--------+------------+- payload -+
//! | channel_id | sender_rank |  bytes  | nitems | first_item |   ....    |
//! +------------+-------------+---------+--------+------------+-----------+
//! ```
//!
//! A header with `bytes == 0` carries no payload and is the end-of-stream
//! sentinel for its (channel, sender) pair.

use bytes::Bytes;

use crate::block::Block;
use crate::error::Error;
use crate::error::Result;

/// Framing header preceding each block on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBlockHeader {
    /// Logical channel the block belongs to.
    pub channel_id: u64,
    /// Global rank of the sending worker.
    pub sender_rank: u64,
    /// Payload length in bytes; zero marks end-of-stream.
    pub bytes: u64,
    /// Number of items whose first byte lies in the payload.
    pub nitems: u64,
    /// Byte offset within the payload of the first such item.
    pub first_item: u64,
}

impl StreamBlockHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 40;

    /// Header describing `block` on the given channel and sender.
    pub fn for_block(channel_id: u64, sender_rank: u64, block: &Block) -> Self {
        Self {
            channel_id,
            sender_rank,
            bytes: block.len() as u64,
            nitems: block.nitems() as u64,
            first_item: block.first_item_relative() as u64,
        }
    }

    /// The end-of-stream sentinel for this channel and sender.
    pub fn end_of_stream(channel_id: u64, sender_rank: u64) -> Self {
        Self {
            channel_id,
            sender_rank,
            bytes: 0,
            nitems: 0,
            first_item: 0,
        }
    }

    /// Whether this header marks the end of its stream.
    pub fn is_end(&self) -> bool {
        self.bytes == 0
    }

    /// Serialize into the wire representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.channel_id.to_le_bytes());
        buf.extend_from_slice(&self.sender_rank.to_le_bytes());
        buf.extend_from_slice(&self.bytes.to_le_bytes());
        buf.extend_from_slice(&self.nitems.to_le_bytes());
        buf.extend_from_slice(&self.first_item.to_le_bytes());
        Bytes::from(buf)
    }

    /// Parse a wire representation previously produced by
    /// [`StreamBlockHeader::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::SIZE {
            return Err(Error::protocol(format!(
                "stream header of {} bytes, expected {}",
                buf.len(),
                Self::SIZE
            )));
        }
        let field = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[i * 8..(i + 1) * 8]);
            u64::from_le_bytes(bytes)
        };
        let header = Self {
            channel_id: field(0),
            sender_rank: field(1),
            bytes: field(2),
            nitems: field(3),
            first_item: field(4),
        };
        if header.first_item > header.bytes {
            return Err(Error::protocol(format!(
                "first item offset {} beyond payload of {} bytes",
                header.first_item, header.bytes
            )));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let header = StreamBlockHeader {
            channel_id: 7,
            sender_rank: 3,
            bytes: 4096,
            nitems: 17,
            first_item: 12,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), StreamBlockHeader::SIZE);
        assert_eq!(StreamBlockHeader::decode(&encoded).unwrap(), header);
        assert!(!header.is_end());
    }

    #[test]
    fn test_end_of_stream() {
        let header = StreamBlockHeader::end_of_stream(1, 2);
        assert!(header.is_end());
        let decoded = StreamBlockHeader::decode(&header.encode()).unwrap();
        assert!(decoded.is_end());
        assert_eq!(decoded.channel_id, 1);
        assert_eq!(decoded.sender_rank, 2);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(StreamBlockHeader::decode(&[0u8; 39]).is_err());
        let mut bad = StreamBlockHeader {
            channel_id: 0,
            sender_rank: 0,
            bytes: 8,
            nitems: 1,
            first_item: 9,
        }
        .encode()
        .to_vec();
        assert!(StreamBlockHeader::decode(&bad).is_err());
        bad.truncate(12);
        assert!(StreamBlockHeader::decode(&bad).is_err());
    }
}
