/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! In-process transports: a blocking group mesh for the collectives and
//! a duplex-stream connection mesh for the multiplexer. Used by tests
//! and by single-host deployments.

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc;
use std::sync::Mutex;

use crate::error::Error;
use crate::error::Result;
use crate::net::dispatcher::Connection;
use crate::net::dispatcher::Dispatcher;
use crate::net::group::Group;

/// Buffer capacity of the in-memory duplex pipes.
const DUPLEX_CAPACITY: usize = 1 << 20;

struct PeerLink {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<PipeReader>,
}

struct PipeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

/// One rank's endpoint of a fully connected in-process group.
pub struct LocalGroup {
    rank: usize,
    peers: Vec<Option<PeerLink>>,
}

impl LocalGroup {
    /// Build a fully connected mesh of `num_hosts` ranks; element `i` of
    /// the result is rank `i`'s endpoint.
    pub fn mesh(num_hosts: usize) -> Vec<LocalGroup> {
        // One unidirectional pipe per ordered pair: txs[i][j] sends from
        // i to j, rxs[i][j] receives at i what j sent.
        let mut txs: Vec<Vec<Option<mpsc::Sender<Vec<u8>>>>> =
            (0..num_hosts).map(|_| (0..num_hosts).map(|_| None).collect()).collect();
        let mut rxs: Vec<Vec<Option<mpsc::Receiver<Vec<u8>>>>> =
            (0..num_hosts).map(|_| (0..num_hosts).map(|_| None).collect()).collect();
        for i in 0..num_hosts {
            for j in 0..num_hosts {
                if i == j {
                    continue;
                }
                let (tx, rx) = mpsc::channel();
                txs[i][j] = Some(tx);
                rxs[j][i] = Some(rx);
            }
        }
        (0..num_hosts)
            .map(|i| LocalGroup {
                rank: i,
                peers: (0..num_hosts)
                    .map(|j| {
                        let tx = txs[i][j].take()?;
                        let rx = rxs[i][j].take()?;
                        Some(PeerLink {
                            tx,
                            rx: Mutex::new(PipeReader {
                                rx,
                                pending: VecDeque::new(),
                            }),
                        })
                    })
                    .collect(),
            })
            .collect()
    }
}

impl Group for LocalGroup {
    fn my_rank(&self) -> usize {
        self.rank
    }

    fn num_hosts(&self) -> usize {
        self.peers.len()
    }

    fn send_bytes(&self, peer: usize, data: &[u8]) -> Result<()> {
        let link = self.peers[peer]
            .as_ref()
            .ok_or_else(|| Error::protocol(format!("rank {} sending to itself", self.rank)))?;
        link.tx
            .send(data.to_vec())
            .map_err(|_| Error::TransportFatal(io::Error::from(io::ErrorKind::BrokenPipe)))
    }

    fn recv_bytes(&self, peer: usize, out: &mut [u8]) -> Result<()> {
        let link = self.peers[peer]
            .as_ref()
            .ok_or_else(|| Error::protocol(format!("rank {} receiving from itself", self.rank)))?;
        let mut reader = link.rx.lock().unwrap();
        while reader.pending.len() < out.len() {
            let chunk = reader
                .rx
                .recv()
                .map_err(|_| Error::TransportFatal(io::Error::from(io::ErrorKind::BrokenPipe)))?;
            reader.pending.extend(chunk);
        }
        for byte in out.iter_mut() {
            *byte = reader.pending.pop_front().unwrap_or_default();
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("num_hosts", &self.peers.len())
            .finish()
    }
}

/// Build a fully connected mesh of in-memory connections registered with
/// `dispatcher`. Row `i` of the result belongs to host `i`; the entry at
/// `[i][j]` is its connection to host `j`, with `None` on the diagonal.
pub fn connection_mesh(dispatcher: &Dispatcher, num_hosts: usize) -> Vec<Vec<Option<Connection>>> {
    let mut mesh: Vec<Vec<Option<Connection>>> = (0..num_hosts)
        .map(|_| (0..num_hosts).map(|_| None).collect())
        .collect();
    for i in 0..num_hosts {
        for j in i + 1..num_hosts {
            let (a, b) = tokio::io::duplex(DUPLEX_CAPACITY);
            mesh[i][j] = Some(dispatcher.register(a));
            mesh[j][i] = Some(dispatcher.register(b));
        }
    }
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::group::GroupExt;

    #[test]
    fn test_mesh_typed_transfer() {
        let mut groups = LocalGroup::mesh(3);
        let g2 = groups.pop().unwrap();
        let g1 = groups.pop().unwrap();
        let g0 = groups.pop().unwrap();

        let sender = std::thread::spawn(move || {
            g0.send_to(1, &42u64).unwrap();
            g0.send_to(2, &String::from("skippy")).unwrap();
        });
        let r1 = std::thread::spawn(move || g1.receive_from::<u64>(0).unwrap());
        let r2 = std::thread::spawn(move || g2.receive_from::<String>(0).unwrap());

        assert_eq!(r1.join().unwrap(), 42);
        assert_eq!(r2.join().unwrap(), "skippy");
        sender.join().unwrap();
    }

    #[test]
    fn test_per_pair_ordering() {
        let mut groups = LocalGroup::mesh(2);
        let g1 = groups.pop().unwrap();
        let g0 = groups.pop().unwrap();

        let sender = std::thread::spawn(move || {
            for i in 0..100u32 {
                g0.send_to(1, &i).unwrap();
            }
        });
        for i in 0..100u32 {
            assert_eq!(g1.receive_from::<u32>(0).unwrap(), i);
        }
        sender.join().unwrap();
    }
}
