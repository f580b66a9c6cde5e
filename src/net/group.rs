/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The logical peer group consumed by the collective primitives.

use crate::error::Result;
use crate::item::Item;
use crate::item::SliceReader;

/// A logical group of peers with blocking point-to-point byte transfer.
/// Ranks are dense in `0..num_hosts`. Sends and receives on a given
/// (sender, receiver) pair are ordered; receives block until the bytes
/// arrive.
pub trait Group: Send + Sync {
    /// This peer's rank within the group.
    fn my_rank(&self) -> usize;

    /// Number of peers in the group.
    fn num_hosts(&self) -> usize;

    /// Send `data` to `peer`, blocking until handed to the transport.
    fn send_bytes(&self, peer: usize, data: &[u8]) -> Result<()>;

    /// Fill `out` with the next bytes sent by `peer`, blocking until
    /// they arrive.
    fn recv_bytes(&self, peer: usize, out: &mut [u8]) -> Result<()>;
}

/// Typed sends over a [`Group`]. Fixed-size items travel as their exact
/// encoding; variable-size items carry an 8-byte length prefix so the
/// receiver knows how much to read.
pub trait GroupExt: Group {
    /// Serialize `value` and send it to `peer`.
    fn send_to<T: Item>(&self, peer: usize, value: &T) -> Result<()> {
        let mut buf = Vec::new();
        value.serialize(&mut buf)?;
        if !T::IS_FIXED_SIZE {
            self.send_bytes(peer, &(buf.len() as u64).to_le_bytes())?;
        }
        self.send_bytes(peer, &buf)
    }

    /// Receive a value of type `T` previously sent by `peer` with
    /// [`GroupExt::send_to`].
    fn receive_from<T: Item>(&self, peer: usize) -> Result<T> {
        let len = if T::IS_FIXED_SIZE {
            T::FIXED_SIZE
        } else {
            let mut len_bytes = [0u8; 8];
            self.recv_bytes(peer, &mut len_bytes)?;
            u64::from_le_bytes(len_bytes) as usize
        };
        let mut buf = vec![0u8; len];
        self.recv_bytes(peer, &mut buf)?;
        T::deserialize(&mut SliceReader::new(&buf))
    }
}

impl<G: Group + ?Sized> GroupExt for G {}
