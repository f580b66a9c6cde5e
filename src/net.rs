/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The transport contracts consumed by the data plane, and the local
//! (in-process) implementations used by tests and single-host runs.
//!
//! Two independent surfaces are exposed:
//!
//! * [`group::Group`]: a logical group of peers with blocking, typed
//!   point-to-point sends, used by the collective communication
//!   primitives. Workers call into it directly and block.
//! * [`dispatcher::Dispatcher`] and [`dispatcher::Connection`]: ordered
//!   asynchronous reads and writes over per-peer byte streams, driven by
//!   a single event-loop thread. Only the multiplexer touches these.
//!
//! Real socket plumbing (TCP, MPI) lives outside this crate; anything
//! satisfying [`Transport`] can be registered with a dispatcher.

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

pub mod collective;
pub mod dispatcher;
pub mod flow;
pub mod group;
pub mod local;

/// The byte stream type a [`dispatcher::Connection`] is built over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for S {}

/// Terminate the host after an unrecoverable transport error. Peer loss
/// is not recovered; per the error design, the dispatcher logs
/// best-effort and exits the process.
pub(crate) fn transport_fatal(context: &str, error: std::io::Error) -> ! {
    tracing::error!(context, error = %error, "fatal transport failure; aborting host");
    std::process::abort()
}
