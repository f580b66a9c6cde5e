/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Collective communication primitives over a [`Group`].
//!
//! All routines are blocking, and every rank of the group must call them
//! in identical order. The combine operator must be associative;
//! commutativity is not assumed, so operand order is maintained
//! carefully: wherever a rank combines a received aggregate with its
//! local one, the value originating from lower ranks is the left
//! operand.

use crate::error::Error;
use crate::error::Result;
use crate::item::Item;
use crate::net::group::Group;
use crate::net::group::GroupExt;

/// Compute the prefix sum of `value` across the group by pointer
/// doubling, in ⌈log₂ P⌉ rounds.
///
/// With `inclusive`, rank `r` ends with the fold of ranks `0..=r`;
/// exclusive, with the fold of ranks `0..r` (rank 0's value is left
/// untouched).
pub fn prefix_sum<T, G, F>(group: &G, value: &mut T, op: F, inclusive: bool) -> Result<()>
where
    T: Item + Clone,
    G: Group + ?Sized,
    F: Fn(&T, &T) -> T,
{
    let rank = group.my_rank();
    let num_hosts = group.num_hosts();
    let mut first = true;
    // In the exclusive case the forwarded aggregate differs from the
    // local result, so it is tracked separately.
    let mut to_forward = value.clone();

    let mut d = 1;
    while d < num_hosts {
        if rank + d < num_hosts {
            group.send_to(rank + d, &to_forward)?;
        }
        if rank >= d {
            let received: T = group.receive_from(rank - d)?;
            // The received aggregate covers lower ranks: left operand.
            to_forward = op(&received, &to_forward);
            if !first || inclusive {
                *value = op(&received, value);
            } else {
                *value = received;
                first = false;
            }
        }
        d <<= 1;
    }
    Ok(())
}

/// Inclusive prefix sum on a hypercube; requires the number of hosts to
/// be a power of two.
pub fn prefix_sum_hypercube<T, G, F>(group: &G, value: &mut T, op: F) -> Result<()>
where
    T: Item + Clone,
    G: Group + ?Sized,
    F: Fn(&T, &T) -> T,
{
    let rank = group.my_rank();
    let num_hosts = group.num_hosts();
    if !num_hosts.is_power_of_two() {
        return Err(Error::InvalidConfig(format!(
            "hypercube prefix sum over {num_hosts} hosts"
        )));
    }
    let mut total = value.clone();

    let mut d = 1;
    while d < num_hosts {
        let peer = rank ^ d;
        group.send_to(peer, &total)?;
        let received: T = group.receive_from(peer)?;
        // The aggregate of the lower sub-cube always comes first.
        if rank & d != 0 {
            total = op(&received, &total);
            *value = op(&received, value);
        } else {
            total = op(&total, &received);
        }
        d <<= 1;
    }
    Ok(())
}

/// Broadcast rank 0's `value` to every rank along a binomial tree, in
/// ⌈log₂ P⌉ rounds.
pub fn broadcast<T, G>(group: &G, value: &mut T) -> Result<()>
where
    T: Item,
    G: Group + ?Sized,
{
    let rank = group.my_rank();
    let num_hosts = group.num_hosts();
    let mut d = 1;
    if rank > 0 {
        // The predecessor is this rank with its lowest one bit cleared.
        while rank & d == 0 {
            d <<= 1;
        }
        *value = group.receive_from(rank ^ d)?;
    } else {
        d = num_hosts.next_power_of_two();
    }
    // Send to successors at decreasing distances.
    d >>= 1;
    while d > 0 {
        if rank + d < num_hosts {
            group.send_to(rank + d, value)?;
        }
        d >>= 1;
    }
    Ok(())
}

/// Fold every rank's `value` into rank 0. Ranks other than 0 end with an
/// unspecified partial aggregate.
pub fn reduce_to_root<T, G, F>(group: &G, value: &mut T, op: F) -> Result<()>
where
    T: Item + Clone,
    G: Group + ?Sized,
    F: Fn(&T, &T) -> T,
{
    let rank = group.my_rank();
    let num_hosts = group.num_hosts();
    let mut active = true;
    let mut d = 1;
    while d < num_hosts {
        if active {
            if rank & d != 0 {
                group.send_to(rank - d, value)?;
                active = false;
            } else if rank + d < num_hosts {
                let received: T = group.receive_from(rank + d)?;
                // The received aggregate covers higher ranks.
                *value = op(value, &received);
            }
        }
        d <<= 1;
    }
    Ok(())
}

/// Fold every rank's `value` across the group; every rank ends with the
/// full aggregate. Reduce-to-root followed by broadcast.
pub fn all_reduce<T, G, F>(group: &G, value: &mut T, op: F) -> Result<()>
where
    T: Item + Clone,
    G: Group + ?Sized,
    F: Fn(&T, &T) -> T,
{
    reduce_to_root(group, value, op)?;
    broadcast(group, value)
}

/// All-reduce on a hypercube: per dimension, exchange the running
/// aggregate with the peer across that dimension and combine. Requires
/// the number of hosts to be a power of two; completes in log₂ P rounds
/// with every rank holding an identical result.
pub fn all_reduce_hypercube<T, G, F>(group: &G, value: &mut T, op: F) -> Result<()>
where
    T: Item + Clone,
    G: Group + ?Sized,
    F: Fn(&T, &T) -> T,
{
    let rank = group.my_rank();
    let num_hosts = group.num_hosts();
    if !num_hosts.is_power_of_two() {
        return Err(Error::InvalidConfig(format!(
            "hypercube all-reduce over {num_hosts} hosts"
        )));
    }
    let mut d = 1;
    while d < num_hosts {
        let peer = rank ^ d;
        group.send_to(peer, value)?;
        let received: T = group.receive_from(peer)?;
        // Keep sub-cube order so non-commutative operators agree on
        // every rank.
        if rank & d != 0 {
            *value = op(&received, value);
        } else {
            *value = op(value, &received);
        }
        d <<= 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::local::LocalGroup;

    /// Run `body` on one thread per rank over a local mesh and collect
    /// the results in rank order.
    fn on_ranks<T: Send + 'static>(
        num_hosts: usize,
        body: impl Fn(LocalGroup) -> T + Send + Sync + Clone + 'static,
    ) -> Vec<T> {
        let handles: Vec<_> = LocalGroup::mesh(num_hosts)
            .into_iter()
            .map(|group| {
                let body = body.clone();
                std::thread::spawn(move || body(group))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_prefix_sum_inclusive() {
        let results = on_ranks(8, |group| {
            let mut value = group.my_rank() as u64;
            prefix_sum(&group, &mut value, |a, b| a + b, true).unwrap();
            value
        });
        for (rank, value) in results.into_iter().enumerate() {
            let rank = rank as u64;
            assert_eq!(value, rank * (rank + 1) / 2);
        }
    }

    #[test]
    fn test_prefix_sum_exclusive() {
        let results = on_ranks(8, |group| {
            let mut value = group.my_rank() as u64;
            prefix_sum(&group, &mut value, |a, b| a + b, false).unwrap();
            value
        });
        for (rank, value) in results.into_iter().enumerate().skip(1) {
            let rank = rank as u64;
            assert_eq!(value, (rank - 1) * rank / 2);
        }
    }

    #[test]
    fn test_prefix_sum_non_commutative() {
        // String concatenation is associative but not commutative; the
        // inclusive prefix at rank r must be "01...r".
        let results = on_ranks(8, |group| {
            let mut value = group.my_rank().to_string();
            prefix_sum(&group, &mut value, |a, b| format!("{a}{b}"), true).unwrap();
            value
        });
        for (rank, value) in results.into_iter().enumerate() {
            let expected: String = (0..=rank).map(|r| r.to_string()).collect();
            assert_eq!(value, expected);
        }
    }

    #[test]
    fn test_prefix_sum_hypercube_matches_linear() {
        let results = on_ranks(8, |group| {
            let mut value = group.my_rank().to_string();
            prefix_sum_hypercube(&group, &mut value, |a, b| format!("{a}{b}")).unwrap();
            value
        });
        for (rank, value) in results.into_iter().enumerate() {
            let expected: String = (0..=rank).map(|r| r.to_string()).collect();
            assert_eq!(value, expected);
        }
    }

    #[test]
    fn test_broadcast_binomial() {
        for num_hosts in [1, 2, 3, 5, 8] {
            let results = on_ranks(num_hosts, |group| {
                let mut value = if group.my_rank() == 0 { 12345u64 } else { 0 };
                broadcast(&group, &mut value).unwrap();
                value
            });
            assert!(results.into_iter().all(|v| v == 12345));
        }
    }

    #[test]
    fn test_all_reduce_sum() {
        let results = on_ranks(8, |group| {
            let mut value = group.my_rank() as u64;
            all_reduce(&group, &mut value, |a, b| a + b).unwrap();
            value
        });
        assert!(results.into_iter().all(|v| v == 28));
    }

    #[test]
    fn test_all_reduce_odd_group_size() {
        let results = on_ranks(5, |group| {
            let mut value = group.my_rank() as u64 + 1;
            all_reduce(&group, &mut value, |a, b| a + b).unwrap();
            value
        });
        assert!(results.into_iter().all(|v| v == 15));
    }

    #[test]
    fn test_all_reduce_hypercube_non_commutative() {
        let results = on_ranks(8, |group| {
            let mut value = group.my_rank().to_string();
            all_reduce_hypercube(&group, &mut value, |a, b| format!("{a}{b}")).unwrap();
            value
        });
        let expected: String = (0..8).map(|r| r.to_string()).collect();
        assert!(results.into_iter().all(|v| v == expected));
    }

    #[test]
    fn test_hypercube_rejects_non_power_of_two() {
        let results = on_ranks(3, |group| {
            let mut value = 0u64;
            all_reduce_hypercube(&group, &mut value, |a, b| a + b).is_err()
        });
        assert!(results.into_iter().all(|failed| failed));
    }
}
