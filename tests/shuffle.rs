/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end shuffle tests over the in-process transport: several
//! hosts, each with its own multiplexer, exchanging framed blocks over
//! duplex connections driven by one dispatcher thread, with one worker
//! thread per rank.

use std::sync::Arc;

use blockmesh::block::BlockPool;
use blockmesh::config::Config;
use blockmesh::context::Context;
use blockmesh::mux::Multiplexer;
use blockmesh::net::dispatcher::Dispatcher;
use blockmesh::net::local::connection_mesh;
use blockmesh::net::local::LocalGroup;
use blockmesh::reduce::FnPartitioner;
use blockmesh::reduce::probing::ProbingReduceTable;
use blockmesh::reduce::ReduceConfig;
use blockmesh::reduce::SlotIndex;

/// Small blocks so every exchange spans many frames.
const TEST_BLOCK_SIZE: usize = 64;

/// Build a cluster of `num_hosts` hosts with `workers_per_host` workers
/// each and run `body` on one thread per worker.
fn run_cluster<T: Send + 'static>(
    num_hosts: usize,
    workers_per_host: usize,
    config: Config,
    body: impl Fn(Context) -> T + Send + Sync + Clone + 'static,
) -> Vec<T> {
    let dispatcher = Dispatcher::new("shuffle-test-dispatcher").unwrap();
    let mesh = connection_mesh(&dispatcher, num_hosts);
    let multiplexers: Vec<Multiplexer> = mesh
        .into_iter()
        .enumerate()
        .map(|(host, row)| {
            Multiplexer::new(
                BlockPool::unbounded(),
                config.clone(),
                row,
                host,
                workers_per_host,
            )
        })
        .collect();
    let mut flow_groups: Vec<Option<LocalGroup>> = LocalGroup::mesh(num_hosts * workers_per_host)
        .into_iter()
        .map(Some)
        .collect();

    let mut handles = Vec::new();
    for host in 0..num_hosts {
        for lane in 0..workers_per_host {
            let rank = host * workers_per_host + lane;
            let context = Context::new(
                multiplexers[host].clone(),
                Arc::new(flow_groups[rank].take().unwrap()),
                lane,
            );
            let body = body.clone();
            handles.push(std::thread::spawn(move || body(context)));
        }
    }
    let results = handles.into_iter().map(|h| h.join().unwrap()).collect();
    dispatcher.shutdown();
    results
}

/// A value tagged with its sender, destination, and sequence number, so
/// misrouted or reordered items are detectable.
fn tagged(sender: usize, dest: usize, seq: usize) -> u64 {
    ((sender as u64) << 32) | ((dest as u64) << 16) | seq as u64
}

#[test]
fn test_full_exchange_preserves_per_source_order() {
    const ITEMS: usize = 200;
    let results = run_cluster(3, 1, Config::default(), move |context| {
        let channel = context.new_channel().unwrap();
        let me = context.my_rank();

        let mut writers = channel.open_writers(TEST_BLOCK_SIZE).unwrap();
        for (dest, writer) in writers.iter_mut().enumerate() {
            for seq in 0..ITEMS {
                writer.append(&tagged(me, dest, seq)).unwrap();
            }
        }
        for writer in &mut writers {
            writer.close().unwrap();
        }

        // Per-source readers: each source's items must arrive in the
        // exact order it emitted them.
        let mut readers = channel.open_readers();
        for (source, reader) in readers.iter_mut().enumerate() {
            let received = reader.read_complete::<u64>().unwrap();
            let expected: Vec<u64> = (0..ITEMS).map(|seq| tagged(source, me, seq)).collect();
            assert_eq!(received, expected, "source {source} at rank {me}");
        }

        channel.close();
        assert!(channel.closed());
        me
    });
    assert_eq!(results.len(), 3);
}

#[test]
fn test_channel_ids_agree_across_hosts() {
    let results = run_cluster(2, 1, Config::default(), |context| {
        // Two channels allocated in the same order everywhere. Data
        // travels on the second one; the first closes empty, which
        // exercises sentinel-only streams multiplexed over the same
        // connection.
        let first = context.new_channel().unwrap();
        let second = context.new_channel().unwrap();
        let ids = (first.id(), second.id());

        let mut writers = second.open_writers(TEST_BLOCK_SIZE).unwrap();
        for (dest, writer) in writers.iter_mut().enumerate() {
            writer.append(&tagged(context.my_rank(), dest, 0)).unwrap();
            writer.close().unwrap();
        }
        let mut received = second.open_reader().read_complete::<u64>().unwrap();
        received.sort_unstable();
        let mut expected: Vec<u64> = (0..2).map(|s| tagged(s, context.my_rank(), 0)).collect();
        expected.sort_unstable();
        assert_eq!(received, expected);

        first.close();
        second.close();
        ids
    });
    assert!(results.iter().all(|ids| *ids == (0, 1)));
}

#[test]
fn test_loopback_between_local_workers() {
    // Two hosts with two workers each: intra-host traffic must
    // short-circuit through the loop-back queues and inter-host traffic
    // through the shared connection, with identical semantics.
    const ITEMS: usize = 50;
    run_cluster(2, 2, Config::default(), move |context| {
        let channel = context.new_channel().unwrap();
        let me = context.my_rank();

        let mut writers = channel.open_writers(TEST_BLOCK_SIZE).unwrap();
        for (dest, writer) in writers.iter_mut().enumerate() {
            for seq in 0..ITEMS {
                writer.append(&tagged(me, dest, seq)).unwrap();
            }
            writer.close().unwrap();
        }

        let mut readers = channel.open_readers();
        for (source, reader) in readers.iter_mut().enumerate() {
            let received = reader.read_complete::<u64>().unwrap();
            let expected: Vec<u64> = (0..ITEMS).map(|seq| tagged(source, me, seq)).collect();
            assert_eq!(received, expected, "source {source} at rank {me}");
        }
        channel.close();
    });
}

#[test]
fn test_self_verify_across_the_wire() {
    let config = Config {
        self_verify: true,
        ..Config::default()
    };
    run_cluster(2, 1, config, |context| {
        let channel = context.new_channel().unwrap();
        let mut writers = channel.open_writers(TEST_BLOCK_SIZE).unwrap();
        for writer in &mut writers {
            writer.append(&String::from("fingerprinted")).unwrap();
            writer.close().unwrap();
        }
        let received = channel.open_reader().read_complete::<String>().unwrap();
        assert_eq!(received, vec!["fingerprinted"; 2]);
        channel.close();
    });
}

#[test]
fn test_scatter() {
    const TOTAL: usize = 100;
    run_cluster(2, 1, Config::default(), move |context| {
        let channel = context.new_channel().unwrap();
        if context.my_rank() == 0 {
            // Rank 0 scatters the lower half to itself and the upper
            // half to rank 1.
            let file = context.new_file();
            let mut writer = context.new_file_writer(&file).unwrap();
            for i in 0..TOTAL as u64 {
                writer.append(&i).unwrap();
            }
            writer.close().unwrap();
            channel.scatter::<u64>(&file, &[TOTAL / 2, TOTAL]).unwrap();
        } else {
            // Rank 1 contributes nothing but still closes its streams.
            let mut writers = channel.open_writers(TEST_BLOCK_SIZE).unwrap();
            for writer in &mut writers {
                writer.close().unwrap();
            }
        }

        let received = channel.open_reader().read_complete::<u64>().unwrap();
        let expected: Vec<u64> = if context.my_rank() == 0 {
            (0..TOTAL as u64 / 2).collect()
        } else {
            (TOTAL as u64 / 2..TOTAL as u64).collect()
        };
        assert_eq!(received, expected);
        channel.close();
    });
}

#[test]
fn test_caching_reader_replays() {
    run_cluster(2, 1, Config::default(), |context| {
        let channel = context.new_channel().unwrap();
        let me = context.my_rank();
        let mut writers = channel.open_writers(TEST_BLOCK_SIZE).unwrap();
        for (dest, writer) in writers.iter_mut().enumerate() {
            for seq in 0..20 {
                writer.append(&tagged(me, dest, seq)).unwrap();
            }
            writer.close().unwrap();
        }

        let first = channel
            .open_caching_reader()
            .read_complete::<u64>()
            .unwrap();
        assert_eq!(first.len(), 40);
        // The second pass replays the cached blocks.
        let second = channel
            .open_caching_reader()
            .read_complete::<u64>()
            .unwrap();
        assert_eq!(first, second);
        channel.close();
    });
}

#[test]
fn test_pre_reduce_into_shuffle() {
    // The full reduce stage: every worker pre-reduces (key, count)
    // pairs into per-partition channel writers, partitioned by key; the
    // receiving workers aggregate the per-worker partial sums.
    const KEYS: u64 = 100;
    const REPEAT: u64 = 32;
    let results = run_cluster(2, 1, Config::default(), move |context| {
        let channel = context.new_channel().unwrap();
        let num_workers = context.num_workers() as u64;

        let writers = channel.open_writers(TEST_BLOCK_SIZE).unwrap();
        // The value carries the key, so emit values alone.
        let config = ReduceConfig {
            emit_value_only: true,
            ..ReduceConfig::with_partitions(writers.len())
        };
        let mut table = ProbingReduceTable::new(
            config,
            |value: &(u64, u64)| value.0,
            |a: (u64, u64), b: (u64, u64)| (a.0, a.1 + b.1),
            FnPartitioner(move |key: &u64, partitions: usize, slots: usize| SlotIndex {
                partition: (*key % partitions as u64) as usize,
                offset: (*key % slots as u64) as usize,
            }),
            writers,
        )
        .unwrap();
        for _ in 0..REPEAT {
            for key in 0..KEYS {
                table.insert((key, 1)).unwrap();
            }
        }
        table.close_emitters().unwrap();

        // Post-reduce: merge the partial aggregates from all workers.
        let mut totals = std::collections::HashMap::new();
        let pairs = channel.open_reader().read_complete::<(u64, u64)>().unwrap();
        for (key, count) in pairs {
            assert_eq!(key % num_workers, context.my_rank() as u64);
            *totals.entry(key).or_insert(0u64) += count;
        }
        channel.close();

        assert!(totals.values().all(|&count| count == REPEAT * num_workers));
        totals.len()
    });
    // Keys split evenly between the two ranks.
    assert_eq!(results, vec![50, 50]);
}
