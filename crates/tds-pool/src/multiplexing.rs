//! Multiplexing writer: one command queue for the whole pool.
//!
//! Callers submit commands without choosing a connection. A background task
//! takes them in order, binds each to a connection through the
//! [`ConnectionSource`], and frames it without flushing. While the batch is
//! under the byte threshold and more commands are waiting it keeps going;
//! then it flushes every connection it wrote to once and reports each
//! command's write outcome. One flush is shared by the whole batch.
//!
//! ```text
//! submit ──▶ queue ──▶ bind ──▶ write_buffered ──┐
//!                ▲                               │ under threshold and
//!                └───────────────────────────────┘ queue non-empty
//!                                                ▼
//!                                    flush each connection once
//! ```
//!
//! A command that finds the pool exhausted flushes the batch before waiting
//! for a connection. The task waits for each connection's write turn, so an
//! operation that holds a turn without writing stalls the queue behind it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tds_client::{
    CommandContext, Error, IoCompletionPair, Operation, OperationFlags, OperationSlot, Protocol,
    Result,
};
use tds_codec::{CodecError, FrontendMessage};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PoolError;
use crate::source::ConnectionSource;

/// A submitted command. The message travels as the slot's payload.
struct Queued {
    slot: Arc<OperationSlot>,
    bound: oneshot::Sender<std::result::Result<Operation, PoolError>>,
    written: oneshot::Sender<Result<()>>,
}

/// Commands framed on one connection and not yet flushed.
struct Pending {
    connection: Arc<Protocol>,
    buffered: usize,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

#[derive(Default)]
struct Batch {
    connections: HashMap<u64, Pending>,
    bytes: usize,
}

impl Batch {
    fn add(
        &mut self,
        connection: &Arc<Protocol>,
        buffered: usize,
        waiter: oneshot::Sender<Result<()>>,
    ) {
        let pending = self
            .connections
            .entry(connection.id())
            .or_insert_with(|| Pending {
                connection: Arc::clone(connection),
                buffered: 0,
                waiters: Vec::new(),
            });
        self.bytes += buffered.saturating_sub(pending.buffered);
        pending.buffered = buffered;
        pending.waiters.push(waiter);
    }
}

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicU64,
    commands: AtomicU64,
}

struct Worker {
    source: Arc<ConnectionSource>,
    threshold: usize,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<Queued>) {
        while let Some(first) = queue.recv().await {
            let mut batch = Batch::default();
            let mut next = Some(first);
            while let Some(command) = next {
                self.dispatch(command, &mut batch).await;
                next = if batch.bytes < self.threshold {
                    queue.try_recv().ok()
                } else {
                    None
                };
            }
            self.flush(batch).await;
        }
        tracing::debug!("multiplexing writer stopped");
    }

    async fn dispatch(&self, command: Queued, batch: &mut Batch) {
        let Queued {
            slot,
            bound,
            written,
        } = command;
        if bound.is_closed() {
            tracing::trace!(operation = slot.id(), "submitter gone before binding");
            return;
        }
        let operation = match self.bind(&slot, batch).await {
            Ok(operation) => operation,
            Err(e) => {
                let _ = bound.send(Err(e));
                return;
            }
        };
        let connection = Arc::clone(operation.protocol());
        if let Err(Ok(operation)) = bound.send(Ok(operation)) {
            // Nothing written yet; dropping cancels it.
            drop(operation);
            return;
        }

        let Some(message) = slot.payload::<FrontendMessage>() else {
            let _ = written.send(Err(Error::Codec(CodecError::InvalidState(
                "multiplexed operation carries no message",
            ))));
            return;
        };
        match connection.write_buffered(&slot, &message).await {
            Ok(buffered) => {
                self.counters.commands.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    connection = connection.id(),
                    operation = slot.id(),
                    buffered,
                    "multiplexed command framed"
                );
                batch.add(&connection, buffered, written);
            }
            Err(e) => {
                let _ = written.send(Err(e));
            }
        }
    }

    /// Bind without waiting while the batch holds unflushed commands.
    ///
    /// Those commands may be what frees a connection, so an exhausted pool
    /// flushes them before waiting.
    async fn bind(
        &self,
        slot: &Arc<OperationSlot>,
        batch: &mut Batch,
    ) -> std::result::Result<Operation, PoolError> {
        if !batch.connections.is_empty() {
            match self.source.try_bind(slot).await {
                Err(PoolError::Exhausted) => {
                    tracing::trace!(operation = slot.id(), "pool exhausted, flushing early");
                    self.flush(std::mem::take(batch)).await;
                }
                other => return other,
            }
        }
        self.source.bind(slot).await
    }

    async fn flush(&self, batch: Batch) {
        if batch.connections.is_empty() {
            return;
        }
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            connections = batch.connections.len(),
            bytes = batch.bytes,
            "flushing multiplexed batch"
        );
        let never = CancellationToken::new();
        for pending in batch.connections.into_values() {
            let result = pending.connection.flush(&never).await.map_err(Arc::new);
            for waiter in pending.waiters {
                let _ = waiter.send(result.clone().map_err(Error::WriteFailed));
            }
        }
    }
}

/// Shared command queue over a [`ConnectionSource`].
#[derive(Debug)]
pub struct MultiplexingWriter {
    queue: mpsc::UnboundedSender<Queued>,
    task: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl MultiplexingWriter {
    /// Start the background writer for `source`.
    #[must_use]
    pub fn spawn(source: Arc<ConnectionSource>) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let worker = Worker {
            threshold: source.config().batch_threshold,
            source,
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(worker.run(receiver));
        Self {
            queue,
            task,
            counters,
        }
    }

    /// Queue a command and wait until it is bound to a connection.
    ///
    /// The returned context reads the response; its write outcome arrives
    /// once the batch holding the command has been flushed.
    pub async fn submit(
        &self,
        message: impl Into<FrontendMessage>,
        flags: OperationFlags,
        cancel: CancellationToken,
    ) -> std::result::Result<CommandContext, PoolError> {
        let slot = OperationSlot::new(flags);
        slot.attach(Arc::new(message.into()));
        let (bound_tx, bound_rx) = oneshot::channel();
        let (written_tx, written_rx) = oneshot::channel();
        self.queue
            .send(Queued {
                slot: Arc::clone(&slot),
                bound: bound_tx,
                written: written_tx,
            })
            .map_err(|_| PoolError::WriterStopped)?;

        let operation = tokio::select! {
            biased;
            bound = bound_rx => bound.map_err(|_| PoolError::WriterStopped)??,
            () = cancel.cancelled() => return Err(PoolError::Canceled),
        };
        let pair = IoCompletionPair::new(written_rx, slot);
        Ok(CommandContext::with_pair(operation, pair, cancel))
    }

    /// Number of flushed batches.
    #[must_use]
    pub fn batches(&self) -> u64 {
        self.counters.batches.load(Ordering::Relaxed)
    }

    /// Number of commands framed.
    #[must_use]
    pub fn commands(&self) -> u64 {
        self.counters.commands.load(Ordering::Relaxed)
    }

    /// Stop accepting commands and wait for queued ones to be written.
    pub async fn shutdown(self) {
        drop(self.queue);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "multiplexing writer task failed");
        }
    }
}

