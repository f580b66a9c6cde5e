/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The transport event loop.
//!
//! One [`Dispatcher`] per host owns a dedicated OS thread running a
//! current-thread runtime; all asynchronous reads and writes complete
//! there. Worker threads touch the network only by submitting operations
//! to a [`Connection`], never by performing I/O themselves.
//!
//! Each registered connection gets a reader task and a writer task. Both
//! drain their operation queues in submission order, so reads are
//! delivered and writes hit the wire exactly in the order they were
//! submitted, per connection.
//!
//! Error handling follows the host-fatal model: an I/O error or an EOF
//! in the middle of a read is unrecoverable and aborts the process. An
//! EOF that lands exactly between reads completes the pending read with
//! `None` and is the normal way a peer shutdown is observed.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::runtime;
use tokio::sync::mpsc as tokio_mpsc;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::Result;
use crate::net::transport_fatal;
use crate::net::Transport;

/// Callback invoked on the dispatcher thread when a read completes.
/// `None` reports a clean end-of-stream observed before the read began.
pub type ReadCallback = Box<dyn FnOnce(Option<BytesMut>) + Send + 'static>;

struct ReadOp {
    len: usize,
    callback: ReadCallback,
}

struct DispatcherInner {
    handle: runtime::Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Owns the event-loop thread. Cloning yields another handle to the same
/// dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Spawn the event-loop thread under the given name.
    pub fn new(name: &str) -> Result<Self> {
        let (handle_tx, handle_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let rt = match runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = handle_tx.send(Err(err));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(rt.handle().clone()));
                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })?;
        let handle = handle_rx
            .recv()
            .map_err(|_| Error::TransportFatal(io::Error::other("dispatcher thread died")))??;
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                handle,
                shutdown: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Register a byte stream, returning the connection handle its reads
    /// and writes are submitted through.
    pub fn register<S: Transport>(&self, stream: S) -> Connection {
        let (read_half, write_half) = tokio::io::split(stream);
        let (write_tx, write_rx) = tokio_mpsc::unbounded_channel();
        let (read_tx, read_rx) = tokio_mpsc::unbounded_channel();
        self.inner.handle.spawn(write_loop(write_half, write_rx));
        self.inner.handle.spawn(read_loop(read_half, read_rx));
        Connection {
            inner: Arc::new(ConnectionInner { write_tx, read_tx }),
        }
    }

    /// Stop the event loop and join its thread. In-flight operations are
    /// dropped; callers are expected to have quiesced their channels
    /// first.
    pub fn shutdown(&self) {
        if let Some(tx) = self.inner.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let joinable = self.inner.thread.lock().unwrap().take();
        if let Some(thread) = joinable {
            let _ = thread.join();
        }
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

async fn write_loop<W: tokio::io::AsyncWrite + Unpin>(
    mut writer: W,
    mut ops: tokio_mpsc::UnboundedReceiver<Vec<Bytes>>,
) {
    while let Some(parts) = ops.recv().await {
        for part in parts {
            if let Err(err) = writer.write_all(&part).await {
                transport_fatal("connection write", err);
            }
        }
    }
    // Senders gone: flush and let the stream drop.
    let _ = writer.flush().await;
}

async fn read_loop<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    mut ops: tokio_mpsc::UnboundedReceiver<ReadOp>,
) {
    while let Some(op) = ops.recv().await {
        let mut buf = BytesMut::zeroed(op.len);
        let mut filled = 0;
        while filled < op.len {
            match reader.read(&mut buf[filled..]).await {
                Ok(0) => {
                    if filled == 0 {
                        // End-of-stream on an operation boundary: the
                        // peer shut down cleanly.
                        (op.callback)(None);
                        return;
                    }
                    transport_fatal(
                        "connection read",
                        io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-frame"),
                    );
                }
                Ok(n) => filled += n,
                Err(err) => transport_fatal("connection read", err),
            }
        }
        (op.callback)(Some(buf));
    }
}

struct ConnectionInner {
    write_tx: tokio_mpsc::UnboundedSender<Vec<Bytes>>,
    read_tx: tokio_mpsc::UnboundedSender<ReadOp>,
}

/// Handle to a registered byte stream. Submitted operations complete on
/// the dispatcher thread, in submission order per connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Queue `parts` to be written to the stream back to back.
    pub fn async_write(&self, parts: Vec<Bytes>) {
        if self.inner.write_tx.send(parts).is_err() {
            tracing::warn!("write submitted to torn-down connection; dropped");
        }
    }

    /// Queue a read of exactly `len` bytes; `callback` runs on the
    /// dispatcher thread with the bytes, or with `None` on clean
    /// end-of-stream.
    pub fn async_read(&self, len: usize, callback: ReadCallback) {
        if self
            .inner
            .read_tx
            .send(ReadOp { len, callback })
            .is_err()
        {
            tracing::warn!("read submitted to torn-down connection; dropped");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}
