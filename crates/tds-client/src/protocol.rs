//! A connection: one transport shared by a FIFO of operations.
//!
//! ## Scheduling
//!
//! Operations are admitted under a short bookkeeping lock and queued in
//! arrival order. Only the queue head is activated, which permits it to read
//! the connection; the others wait. Writes are independent of activation: any
//! admitted operation may write as soon as it holds the write turn, which is
//! granted in queue order. That is what lets requests be pipelined behind a
//! response that is still being read.
//!
//! ## Faults
//!
//! A failure that leaves the byte stream at an unknown position (a parse
//! error, a flush that did not finish, a dropped reader mid-response) faults
//! the connection. The state becomes `Completed` and every queued operation
//! completes with the same shared cause.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tds_codec::{FrontendMessage, PacketWriter, TokenReader};
use tds_protocol::{Done, EnvChange, EnvChangeType, EnvChangeValue, LoginSequence, PacketStatus};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::error::{AdmissionError, Error, Result};
use crate::operation::{Operation, OperationFlags, OperationSlot, OperationState, Outcome};
use crate::state::ConnectionState;
use crate::statement_cache::{Statement, StatementCache, StatementKind};

/// Read half of a connection's transport.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connection's transport.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Exclusive access to a connection's token stream.
pub type ReaderGuard = OwnedMutexGuard<TokenReader<BoxedRead>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct Scheduler {
    state: ConnectionState,
    queue: VecDeque<Arc<OperationSlot>>,
    /// Operations still entitled to a write, in queue order.
    writers: VecDeque<u64>,
    exclusive: Option<u64>,
    fault: Option<Arc<Error>>,
}

struct WriteSide {
    transport: BoxedWrite,
    packets: PacketWriter,
}

#[derive(Debug, Default)]
struct Session {
    database: Option<String>,
    transaction: u64,
    packet_size: usize,
}

/// A logged-in connection.
pub struct Protocol {
    id: u64,
    scheduler: Mutex<Scheduler>,
    write_notify: Notify,
    idle_notify: Notify,
    writer: tokio::sync::Mutex<WriteSide>,
    reader: Arc<tokio::sync::Mutex<TokenReader<BoxedRead>>>,
    session: Mutex<Session>,
    statements: Mutex<StatementCache>,
    retired: Mutex<Vec<i32>>,
    /// Cancelled once the connection faults, waking blocked readers.
    faulted: CancellationToken,
    flush_timeout: Duration,
}

impl Protocol {
    /// Connect over TCP and log in, all within the connect timeout.
    pub async fn open(config: &ConnectionConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let addr = config.address();
        tracing::info!(host = %config.host, port = config.port, "connecting");

        timeout(config.connect_timeout, async {
            tracing::debug!("establishing TCP connection to {}", addr);
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            Self::connect(stream, config).await
        })
        .await
        .map_err(|_| Error::ConnectTimeout)?
    }

    /// Log in over an established transport.
    ///
    /// Sends the configured PreLogin body, reads its response, then sends the
    /// Login7 body and validates the login token sequence. The negotiated
    /// packet size takes effect for every later write.
    pub async fn connect<T>(transport: T, config: &ConnectionConfig) -> Result<Arc<Self>>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(transport);
        let mut write = WriteSide {
            transport: Box::new(write_half),
            packets: PacketWriter::new(config.packet_size)?,
        };
        let read_half: BoxedRead = Box::new(read_half);
        let mut reader = TokenReader::new(read_half, config.read_buffer_capacity);

        tracing::debug!(connection = id, "sending PreLogin");
        write.send(&FrontendMessage::PreLogin(config.prelogin.clone())).await?;
        let prelogin = reader.read_message().await?;
        tracing::debug!(connection = id, len = prelogin.len(), "PreLogin response");

        tracing::debug!(connection = id, "sending Login7");
        write.send(&FrontendMessage::Login7(config.login7.clone())).await?;
        let mut sequence = LoginSequence::new();
        let outcome = loop {
            let token = reader.next_token().await?;
            if let Some(outcome) = sequence.accept(token)? {
                break outcome;
            }
        };

        let packet_size = outcome.packet_size.unwrap_or(config.packet_size);
        write.packets.set_packet_size(packet_size)?;

        tracing::info!(
            connection = id,
            database = ?outcome.database,
            packet_size,
            tds_version = outcome.login_ack.tds_version,
            prog_name = %outcome.login_ack.prog_name,
            "login completed"
        );

        Ok(Arc::new(Self {
            id,
            scheduler: Mutex::new(Scheduler {
                state: ConnectionState::Ready,
                ..Scheduler::default()
            }),
            write_notify: Notify::new(),
            idle_notify: Notify::new(),
            writer: tokio::sync::Mutex::new(write),
            reader: Arc::new(tokio::sync::Mutex::new(reader)),
            session: Mutex::new(Session {
                database: outcome.database,
                transaction: 0,
                packet_size,
            }),
            statements: Mutex::new(StatementCache::new(config.statement_cache_size)),
            retired: Mutex::new(Vec::new()),
            faulted: CancellationToken::new(),
            flush_timeout: config.flush_timeout,
        }))
    }

    /// Connection id, for logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.scheduler.lock().state
    }

    /// The cause, if the connection faulted.
    #[must_use]
    pub fn fault_cause(&self) -> Option<Arc<Error>> {
        self.scheduler.lock().fault.clone()
    }

    /// Resolves once the connection has faulted.
    pub async fn faulted(&self) {
        self.faulted.cancelled().await;
    }

    /// Number of queued operations, the active one included.
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.scheduler.lock().queue.len()
    }

    /// Check if no operation is queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.scheduler.lock().queue.is_empty()
    }

    /// Check if an operation holds the connection exclusively.
    #[must_use]
    pub fn has_exclusive(&self) -> bool {
        self.scheduler.lock().exclusive.is_some()
    }

    /// Check if an exclusive operation is queued but not yet active.
    #[must_use]
    pub fn has_pending_exclusive(&self) -> bool {
        let scheduler = self.scheduler.lock();
        match (scheduler.exclusive, scheduler.queue.front()) {
            (Some(id), Some(head)) => head.id() != id,
            _ => false,
        }
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> Option<String> {
        self.session.lock().database.clone()
    }

    /// Descriptor of the open transaction, zero when none.
    #[must_use]
    pub fn transaction_descriptor(&self) -> u64 {
        self.session.lock().transaction
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.session.lock().packet_size
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Create and enqueue a new operation.
    pub fn try_start_operation(
        self: &Arc<Self>,
        flags: OperationFlags,
    ) -> std::result::Result<Operation, AdmissionError> {
        let slot = OperationSlot::new(flags);
        self.admit(&slot)?;
        Ok(Operation::new(slot, Arc::clone(self)))
    }

    /// Enqueue a caller-created operation.
    ///
    /// The slot's own flags decide exclusivity and immediate-only admission.
    pub fn try_bind_operation(
        self: &Arc<Self>,
        slot: &Arc<OperationSlot>,
    ) -> std::result::Result<Operation, AdmissionError> {
        self.admit(slot)?;
        Ok(Operation::new(Arc::clone(slot), Arc::clone(self)))
    }

    fn admit(&self, slot: &Arc<OperationSlot>) -> std::result::Result<(), AdmissionError> {
        let is_head = {
            let mut scheduler = self.scheduler.lock();
            if !scheduler.state.is_ready() {
                return Err(AdmissionError::NotReady(scheduler.state));
            }
            if scheduler.exclusive.is_some() {
                return Err(AdmissionError::ExclusiveHeld);
            }
            if slot.flags().contains(OperationFlags::IMMEDIATE_ONLY) && !scheduler.queue.is_empty()
            {
                return Err(AdmissionError::Busy);
            }
            if slot.state() != OperationState::Pending || !slot.bind() {
                return Err(AdmissionError::AlreadyBound);
            }
            if slot.is_exclusive() {
                scheduler.exclusive = Some(slot.id());
            }
            scheduler.queue.push_back(Arc::clone(slot));
            scheduler.writers.push_back(slot.id());
            scheduler.queue.len() == 1
        };

        tracing::debug!(
            connection = self.id,
            operation = slot.id(),
            flags = ?slot.flags(),
            "operation admitted"
        );
        if is_head && slot.activate() {
            tracing::debug!(connection = self.id, operation = slot.id(), "operation activated");
        }
        Ok(())
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Complete an operation and hand the connection to the next one.
    ///
    /// Returns `false` if the operation was already complete; nothing else
    /// changes in that case. A `Faulted` outcome faults the connection.
    pub fn complete(&self, slot: &Arc<OperationSlot>, outcome: Outcome) -> bool {
        let outcome = match outcome {
            Outcome::Faulted(cause) => {
                if slot.state() == OperationState::Completed {
                    return false;
                }
                self.fault_shared(cause);
                return true;
            }
            other => other,
        };

        let canceled = matches!(outcome, Outcome::Canceled);
        if !slot.try_complete(outcome) {
            return false;
        }
        slot.set_in_flight(false);

        let (next, idle) = {
            let mut scheduler = self.scheduler.lock();
            scheduler.queue.retain(|queued| queued.id() != slot.id());
            scheduler.writers.retain(|&id| id != slot.id());
            if scheduler.exclusive == Some(slot.id()) {
                scheduler.exclusive = None;
            }
            (scheduler.queue.front().cloned(), scheduler.queue.is_empty())
        };

        tracing::debug!(
            connection = self.id,
            operation = slot.id(),
            canceled,
            "operation completed"
        );
        if let Some(next) = next {
            if next.activate() {
                tracing::debug!(connection = self.id, operation = next.id(), "operation activated");
            }
        }
        self.write_notify.notify_waiters();
        if idle {
            self.idle_notify.notify_waiters();
        }
        true
    }

    /// Fault the connection. Every queued operation completes with the
    /// returned cause; only the first fault is recorded.
    pub fn fault(&self, cause: Error) -> Arc<Error> {
        self.fault_shared(Arc::new(cause))
    }

    fn fault_shared(&self, cause: Arc<Error>) -> Arc<Error> {
        let (cause, drained) = {
            let mut scheduler = self.scheduler.lock();
            if let Some(existing) = &scheduler.fault {
                return Arc::clone(existing);
            }
            scheduler.fault = Some(Arc::clone(&cause));
            scheduler.state = ConnectionState::Completed;
            scheduler.exclusive = None;
            scheduler.writers.clear();
            let drained: SmallVec<[Arc<OperationSlot>; 8]> = scheduler.queue.drain(..).collect();
            (cause, drained)
        };

        tracing::warn!(
            connection = self.id,
            error = %cause,
            operations = drained.len(),
            "connection faulted"
        );
        self.faulted.cancel();
        for slot in drained {
            slot.set_in_flight(false);
            slot.try_complete(Outcome::Faulted(Arc::clone(&cause)));
        }
        self.write_notify.notify_waiters();
        self.idle_notify.notify_waiters();
        cause
    }

    /// Clean up after an operation whose owner went away without completing
    /// it.
    pub(crate) fn abandon(&self, slot: &Arc<OperationSlot>) {
        match slot.state() {
            OperationState::Completed => {}
            _ if slot.is_in_flight() => {
                tracing::warn!(
                    connection = self.id,
                    operation = slot.id(),
                    "operation abandoned with an unread response"
                );
                self.fault(Error::Canceled);
            }
            OperationState::Pending => {
                self.complete(slot, Outcome::Canceled);
            }
            OperationState::Activated => {
                self.complete(slot, Outcome::Success);
            }
        }
    }

    /// Cancel an operation.
    ///
    /// One with nothing on the wire is simply removed. One whose request was
    /// sent gets an attention signal and its response drained to the
    /// acknowledgement, which is only possible while it is active, nobody
    /// else is reading, and no later request is in flight behind it.
    /// Otherwise the connection is faulted.
    pub async fn cancel(&self, slot: &Arc<OperationSlot>) {
        if slot.state() == OperationState::Completed {
            return;
        }
        if !slot.is_in_flight() {
            self.complete(slot, Outcome::Canceled);
            return;
        }
        if slot.state() == OperationState::Pending {
            self.fault(Error::Canceled);
            return;
        }
        match Arc::clone(&self.reader).try_lock_owned() {
            Ok(mut reader) => {
                if let Err(e) = self.attention(slot, &mut reader).await {
                    self.fault(e);
                }
            }
            Err(_) => {
                self.fault(Error::Canceled);
            }
        }
    }

    /// Send an attention for the active operation and drain its response.
    pub(crate) async fn attention(
        &self,
        slot: &Arc<OperationSlot>,
        reader: &mut TokenReader<BoxedRead>,
    ) -> Result<()> {
        {
            let mut write = self.writer.lock().await;
            if !slot.is_in_flight() {
                // The request never reached the wire.
                drop(write);
                self.complete(slot, Outcome::Canceled);
                return Ok(());
            }
            let followers = {
                let scheduler = self.scheduler.lock();
                scheduler
                    .queue
                    .iter()
                    .any(|queued| queued.id() != slot.id() && queued.is_in_flight())
            };
            if followers {
                return Err(Error::Canceled);
            }
            write
                .packets
                .write_message(&FrontendMessage::Attention, PacketStatus::NORMAL)?;
            self.flush_locked(&mut write, &CancellationToken::new()).await?;
        }
        tracing::debug!(connection = self.id, operation = slot.id(), "attention sent");

        loop {
            let token = reader.next_token().await?;
            if token.as_done().is_some_and(Done::is_attention_ack) {
                break;
            }
        }
        slot.set_in_flight(false);
        self.complete(slot, Outcome::Canceled);
        Ok(())
    }

    // =========================================================================
    // Writing
    // =========================================================================

    async fn write_turn(&self, slot: &OperationSlot) -> Result<()> {
        loop {
            let notified = self.write_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let scheduler = self.scheduler.lock();
                if let Some(cause) = &scheduler.fault {
                    return Err(Error::ConnectionFaulted(Arc::clone(cause)));
                }
                if let Some(outcome) = slot.outcome() {
                    outcome.clone().into_result()?;
                }
                match scheduler.writers.front() {
                    Some(&id) if id == slot.id() => return Ok(()),
                    _ if !scheduler.writers.contains(&slot.id()) => {
                        return Err(Error::Codec(tds_codec::CodecError::InvalidState(
                            "operation has no write turn",
                        )));
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    fn release_write_turn(&self, slot: &OperationSlot) {
        if slot.is_exclusive() {
            return;
        }
        self.scheduler.lock().writers.retain(|&id| id != slot.id());
        self.write_notify.notify_waiters();
    }

    fn frame(
        &self,
        slot: &OperationSlot,
        write: &mut WriteSide,
        message: &FrontendMessage,
    ) -> Result<()> {
        if let Some(outcome) = slot.outcome() {
            // Completed while waiting for the writer.
            return Err(outcome.clone().into_result().err().unwrap_or(Error::Canceled));
        }
        let packet_size = self.session.lock().packet_size;
        if packet_size != write.packets.packet_size() {
            write.packets.set_packet_size(packet_size)?;
        }
        write.packets.write_message(message, PacketStatus::NORMAL)?;
        slot.set_in_flight(true);
        tracing::trace!(
            connection = self.id,
            operation = slot.id(),
            packet_type = ?message.packet_type(),
            pending = write.packets.completed_len(),
            "framed message"
        );
        Ok(())
    }

    /// Write and flush one request for an operation.
    ///
    /// Waits for the operation's write turn. A failure before any byte is
    /// handed to the transport leaves the connection intact; a failed or
    /// timed-out flush faults it.
    pub async fn write_message(
        &self,
        slot: &Arc<OperationSlot>,
        message: &FrontendMessage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let turn = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Canceled),
            turn = self.write_turn(slot) => turn,
        };
        if let Err(e) = turn {
            self.release_write_turn(slot);
            return Err(e);
        }

        let result = async {
            let mut write = self.writer.lock().await;
            self.frame(slot, &mut write, message)?;
            self.flush_locked(&mut write, cancel).await
        }
        .await;
        self.release_write_turn(slot);
        result
    }

    /// Frame a request without flushing it.
    ///
    /// Returns the number of framed bytes now waiting for [`flush`](Self::flush).
    pub async fn write_buffered(
        &self,
        slot: &Arc<OperationSlot>,
        message: &FrontendMessage,
    ) -> Result<usize> {
        self.write_turn(slot).await?;
        let result = async {
            let mut write = self.writer.lock().await;
            self.frame(slot, &mut write, message)?;
            Ok(write.packets.completed_len())
        }
        .await;
        self.release_write_turn(slot);
        result
    }

    /// Flush framed requests to the transport.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<()> {
        let mut write = self.writer.lock().await;
        self.flush_locked(&mut write, cancel).await
    }

    async fn flush_locked(&self, write: &mut WriteSide, cancel: &CancellationToken) -> Result<()> {
        let bytes = write.packets.take_completed();
        if bytes.is_empty() {
            return Ok(());
        }
        let transport = &mut write.transport;
        let sent = async {
            transport.write_all(&bytes).await?;
            transport.flush().await
        };

        let (cause, returned) = tokio::select! {
            biased;
            () = cancel.cancelled() => (Error::Canceled, Error::Canceled),
            result = timeout(self.flush_timeout, sent) => match result {
                Ok(Ok(())) => {
                    tracing::trace!(connection = self.id, len = bytes.len(), "flushed");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    let copy = io::Error::new(e.kind(), e.to_string());
                    (Error::Io(e), Error::Io(copy))
                }
                Err(_) => (Error::FlushTimeout, Error::FlushTimeout),
            },
        };
        // Part of the message may already be on the wire.
        self.fault(cause);
        Err(returned)
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Wait for exclusive access to the token stream.
    pub async fn lock_reader(&self) -> ReaderGuard {
        Arc::clone(&self.reader).lock_owned().await
    }

    /// Record an environment change from a response.
    pub fn apply_env_change(&self, env: &EnvChange) {
        let mut session = self.session.lock();
        match env.env_type {
            EnvChangeType::Database => {
                if let Some(db) = env.new_database() {
                    session.database = Some(db.to_owned());
                }
            }
            EnvChangeType::PacketSize => {
                if let Some(size) = env.new_packet_size() {
                    session.packet_size = size;
                }
            }
            EnvChangeType::BeginTransaction => {
                if let EnvChangeValue::Binary(value) = &env.new_value {
                    if value.len() >= 8 {
                        let mut descriptor = [0u8; 8];
                        descriptor.copy_from_slice(&value[..8]);
                        session.transaction = u64::from_le_bytes(descriptor);
                    }
                }
            }
            EnvChangeType::CommitTransaction | EnvChangeType::RollbackTransaction => {
                session.transaction = 0;
            }
            _ => {}
        }
        tracing::debug!(connection = self.id, env_type = ?env.env_type, "environment change");
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// The statement for a SQL text, created on first use.
    ///
    /// With the statement table disabled every call returns a fresh direct
    /// statement.
    pub fn statement(&self, sql: &str) -> Arc<Statement> {
        let mut statements = self.statements.lock();
        if !statements.is_enabled() {
            return Arc::new(Statement::new(sql, StatementKind::Direct));
        }
        if let Some(stmt) = statements.get(sql) {
            return stmt;
        }
        let stmt = Arc::new(Statement::new(sql, StatementKind::Prepared));
        if let Some(evicted) = statements.insert(Arc::clone(&stmt)) {
            if let Some(handle) = evicted.handle() {
                self.retire_handle(handle);
            }
        }
        stmt
    }

    /// Queue a prepared handle for release.
    pub fn retire_handle(&self, handle: i32) {
        tracing::trace!(connection = self.id, handle, "retiring prepared handle");
        self.retired.lock().push(handle);
    }

    /// Take the handles waiting for `sp_unprepare`.
    pub fn take_retired(&self) -> Vec<i32> {
        std::mem::take(&mut *self.retired.lock())
    }

    /// Number of statements in the table.
    #[must_use]
    pub fn cached_statements(&self) -> usize {
        self.statements.lock().len()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop admitting operations, wait for queued ones to finish, then shut
    /// the transport down.
    pub async fn close(&self) -> Result<()> {
        {
            let mut scheduler = self.scheduler.lock();
            match scheduler.state {
                ConnectionState::Created | ConnectionState::Ready => {
                    scheduler.state = ConnectionState::Draining;
                    tracing::debug!(
                        connection = self.id,
                        pending = scheduler.queue.len(),
                        "connection draining"
                    );
                }
                ConnectionState::Draining => {}
                ConnectionState::Completed => return Ok(()),
            }
        }

        loop {
            let notified = self.idle_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let scheduler = self.scheduler.lock();
                if scheduler.queue.is_empty() || scheduler.state.is_completed() {
                    break;
                }
            }
            notified.await;
        }

        self.scheduler.lock().state = ConnectionState::Completed;
        let mut write = self.writer.lock().await;
        if let Err(e) = write.transport.shutdown().await {
            tracing::debug!(connection = self.id, error = %e, "transport shutdown failed");
        }
        tracing::debug!(connection = self.id, "connection closed");
        Ok(())
    }
}

impl WriteSide {
    /// Frame and send a message outside the scheduler. Used during login.
    async fn send(&mut self, message: &FrontendMessage) -> Result<()> {
        self.packets.write_message(message, PacketStatus::NORMAL)?;
        let bytes = self.packets.take_completed();
        self.transport.write_all(&bytes).await?;
        self.transport.flush().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheduler = self.scheduler.lock();
        f.debug_struct("Protocol")
            .field("id", &self.id)
            .field("state", &scheduler.state)
            .field("pending", &scheduler.queue.len())
            .field("exclusive", &scheduler.exclusive)
            .finish_non_exhaustive()
    }
}
