/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The error types shared by all data-plane components.

use std::io;

/// The errors produced by data-plane operations. The enum is marked
/// non-exhaustive to allow for extensibility.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A reader requested more bytes or items than its source can provide.
    #[error("data underflow: requested {requested} bytes, {available} available")]
    Underflow {
        /// Number of bytes the reader asked for.
        requested: usize,
        /// Number of bytes that could actually be produced.
        available: usize,
    },

    /// In self-verify mode, the fingerprint read from the stream did not
    /// match the fingerprint of the requested type.
    #[error(
        "item type mismatch: expected {expected_type} ({expected:#018x}), \
         read fingerprint {found:#018x}"
    )]
    TypeMismatch {
        /// Typename of the type the caller asked to deserialize.
        expected_type: &'static str,
        /// Fingerprint of the expected type.
        expected: u64,
        /// Fingerprint found in the stream.
        found: u64,
    },

    /// A reduce table was configured with inconsistent parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An operation was attempted on a closed writer, reader, or container.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// A byte block allocation would exceed the pool's byte limit.
    #[error("byte block allocation of {requested} bytes would exceed pool limit of {limit}")]
    OutOfMemory {
        /// Size of the rejected allocation.
        requested: usize,
        /// The pool's configured limit in bytes.
        limit: usize,
    },

    /// A network peer aborted or violated the stream protocol. Not
    /// recoverable; the host is expected to terminate.
    #[error("transport failure: {0}")]
    TransportFatal(#[from] io::Error),
}

impl Error {
    pub(crate) fn underflow(requested: usize, available: usize) -> Self {
        Self::Underflow {
            requested,
            available,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::TransportFatal(io::Error::new(io::ErrorKind::InvalidData, msg.into()))
    }
}

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
