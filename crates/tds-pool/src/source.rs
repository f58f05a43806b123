//! Connection source: a fixed array of connection slots.
//!
//! ## Slots
//!
//! ```text
//! Empty --claim--> Taken --open ok--> Occupied
//!   ^                |                   |
//!   +----open failed-+                   | connection completed
//!                    ^                   |
//!                    +-----reclaim-------+
//! ```
//!
//! A slot is claimed by compare-and-swap, so racing callers never open two
//! connections for the same slot; the loser moves on to another slot or
//! pipelines onto an existing connection. Nothing else in the source is
//! shared mutable state.
//!
//! ## Selection
//!
//! 1. An idle connection that can start the operation immediately.
//! 2. With pipelining, the least loaded busy connection below the depth
//!    limit.
//! 3. An empty or reclaimable slot, filled with a new connection.
//!
//! Otherwise the pool is exhausted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tds_client::{AdmissionError, Operation, OperationFlags, OperationSlot, Protocol};
use tokio::time::{Instant, timeout};

use crate::config::PoolConfig;
use crate::connector::ConnectionFactory;
use crate::error::PoolError;

const EMPTY: u8 = 0;
const TAKEN: u8 = 1;
const OCCUPIED: u8 = 2;

/// Longest pause between retries while the pool is exhausted.
const MAX_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Slot {
    state: AtomicU8,
    connection: Mutex<Option<Arc<Protocol>>>,
}

impl Slot {
    fn connection(&self) -> Option<Arc<Protocol>> {
        if self.state.load(Ordering::Acquire) != OCCUPIED {
            return None;
        }
        self.connection.lock().clone()
    }

    /// Claim an empty slot, or a slot whose connection has completed.
    fn claim(&self) -> Option<Option<Arc<Protocol>>> {
        if self
            .state
            .compare_exchange(EMPTY, TAKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Some(None);
        }
        let current = self.connection()?;
        if !current.state().is_completed() {
            return None;
        }
        self.state
            .compare_exchange(OCCUPIED, TAKEN, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let mut stored = self.connection.lock();
        if !stored.as_ref().is_some_and(|c| Arc::ptr_eq(c, &current)) {
            // Reclaimed and refilled by someone else in between.
            drop(stored);
            self.state.store(OCCUPIED, Ordering::Release);
            return None;
        }
        Some(stored.take())
    }

    fn fill(&self, connection: Arc<Protocol>) {
        *self.connection.lock() = Some(connection);
        self.state.store(OCCUPIED, Ordering::Release);
    }

    fn reset(&self) {
        *self.connection.lock() = None;
        self.state.store(EMPTY, Ordering::Release);
    }
}

/// Returns a claimed slot to `Empty` unless a connection was stored.
struct SlotClaim<'a> {
    slot: &'a Slot,
    filled: bool,
}

impl SlotClaim<'_> {
    fn fill(mut self, connection: Arc<Protocol>) {
        self.slot.fill(connection);
        self.filled = true;
    }
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.slot.reset();
        }
    }
}

/// What to admit onto the chosen connection.
enum Request<'a> {
    Start(OperationFlags),
    Bind(&'a Arc<OperationSlot>),
}

impl Request<'_> {
    fn flags(&self) -> OperationFlags {
        match self {
            Self::Start(flags) => *flags,
            Self::Bind(slot) => slot.flags(),
        }
    }

    fn admit(
        &self,
        connection: &Arc<Protocol>,
        immediate: bool,
    ) -> Result<Operation, AdmissionError> {
        match self {
            Self::Start(flags) if immediate => {
                connection.try_start_operation(*flags | OperationFlags::IMMEDIATE_ONLY)
            }
            Self::Start(flags) => connection.try_start_operation(*flags),
            Self::Bind(_) if immediate && !connection.is_idle() => Err(AdmissionError::Busy),
            Self::Bind(slot) => connection.try_bind_operation(slot),
        }
    }
}

/// A fixed set of connection slots shared by every caller of a pool.
pub struct ConnectionSource {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    slots: Box<[Slot]>,
    closed: AtomicBool,
    next_scan: AtomicUsize,
}

impl ConnectionSource {
    /// Create a source with `config.max_connections` empty slots.
    ///
    /// No connection is opened until an operation needs one.
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Arc<Self>, PoolError> {
        config.validate()?;
        let slots = (0..config.max_connections).map(|_| Slot::default()).collect();
        tracing::debug!(
            max_connections = config.max_connections,
            pipelining = config.pipelining,
            "connection source created"
        );
        Ok(Arc::new(Self {
            config,
            factory,
            slots,
            closed: AtomicBool::new(false),
            next_scan: AtomicUsize::new(0),
        }))
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live connections, in slot order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Protocol>> {
        self.slots.iter().filter_map(Slot::connection).collect()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) == OCCUPIED)
            .count()
    }

    /// Check if the source is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start an operation on the best available connection.
    ///
    /// Fails with [`PoolError::Exhausted`] when no connection can take it.
    pub async fn try_acquire(&self, flags: OperationFlags) -> Result<Operation, PoolError> {
        self.select(&Request::Start(flags)).await
    }

    /// Start an operation, waiting up to the connection timeout while the
    /// pool is exhausted.
    pub async fn acquire(&self, flags: OperationFlags) -> Result<Operation, PoolError> {
        self.wait_for(&Request::Start(flags)).await
    }

    /// Bind a caller-created operation to the best available connection.
    pub async fn try_bind(&self, slot: &Arc<OperationSlot>) -> Result<Operation, PoolError> {
        self.select(&Request::Bind(slot)).await
    }

    /// Bind a caller-created operation, waiting while the pool is exhausted.
    pub async fn bind(&self, slot: &Arc<OperationSlot>) -> Result<Operation, PoolError> {
        self.wait_for(&Request::Bind(slot)).await
    }

    async fn wait_for(&self, request: &Request<'_>) -> Result<Operation, PoolError> {
        let wait = self.config.connection_timeout;
        let deadline = Instant::now() + wait;
        let mut backoff = Duration::from_millis(1);
        loop {
            match self.select(request).await {
                Err(PoolError::Exhausted) => {}
                other => return other,
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(timeout = ?wait, "pool exhausted for the whole wait");
                return Err(PoolError::AcquisitionTimeout(wait));
            }
            tracing::trace!(?backoff, "pool exhausted, waiting");
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn select(&self, request: &Request<'_>) -> Result<Operation, PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        let start = self.next_scan.fetch_add(1, Ordering::Relaxed);

        // 1. An idle connection.
        for slot in self.scan(start) {
            let Some(connection) = slot.connection() else {
                continue;
            };
            if !connection.state().is_ready() || !connection.is_idle() {
                continue;
            }
            match request.admit(&connection, true) {
                Ok(operation) => return Ok(operation),
                Err(AdmissionError::AlreadyBound) => {
                    return Err(AdmissionError::AlreadyBound.into());
                }
                Err(_) => {}
            }
        }

        // 2. Pipeline onto the least loaded busy connection.
        let immediate_only = request.flags().contains(OperationFlags::IMMEDIATE_ONLY);
        if self.config.pipelining && !immediate_only {
            if let Some(connection) = self.least_loaded() {
                match request.admit(&connection, false) {
                    Ok(operation) => {
                        tracing::trace!(
                            connection = connection.id(),
                            pending = connection.pending_operations(),
                            "pipelined onto busy connection"
                        );
                        return Ok(operation);
                    }
                    Err(AdmissionError::AlreadyBound) => {
                        return Err(AdmissionError::AlreadyBound.into());
                    }
                    Err(e) => {
                        tracing::trace!(connection = connection.id(), error = %e, "pipeline candidate refused");
                    }
                }
            }
        }

        // 3. Open a connection in an empty or reclaimable slot.
        for (index, slot) in self.scan(start).enumerate() {
            let Some(previous) = slot.claim() else {
                continue;
            };
            if let Some(previous) = previous {
                tracing::warn!(
                    slot = index,
                    connection = previous.id(),
                    cause = ?previous.fault_cause(),
                    "reclaiming slot of completed connection"
                );
            }
            let claim = SlotClaim {
                slot,
                filled: false,
            };
            let connection = self.open().await?;
            // Admit before publishing so no one else sees it idle first.
            let operation = request.admit(&connection, false);
            claim.fill(connection);
            return Ok(operation?);
        }

        Err(PoolError::Exhausted)
    }

    async fn open(&self) -> Result<Arc<Protocol>, PoolError> {
        let wait = self.config.connection_timeout;
        match timeout(wait, self.factory.connect()).await {
            Ok(Ok(connection)) => {
                tracing::debug!(connection = connection.id(), "pool connection opened");
                Ok(connection)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to open pool connection");
                Err(PoolError::ConnectionCreation(e))
            }
            Err(_) => {
                tracing::warn!(timeout = ?wait, "opening pool connection timed out");
                Err(PoolError::ConnectionTimeout(wait))
            }
        }
    }

    /// The busy connection with the fewest queued operations that can
    /// still take pipelined work.
    fn least_loaded(&self) -> Option<Arc<Protocol>> {
        self.slots
            .iter()
            .filter_map(Slot::connection)
            .filter(|connection| {
                connection.state().is_ready()
                    && !connection.has_exclusive()
                    && connection.pending_operations() < self.config.max_pipeline_depth
            })
            .min_by_key(|connection| connection.pending_operations())
    }

    /// Slots starting at `start`, wrapping around.
    fn scan(&self, start: usize) -> impl Iterator<Item = &Slot> {
        let len = self.slots.len();
        (0..len).map(move |i| &self.slots[(start + i) % len])
    }

    /// Stop handing out connections and close every open one.
    ///
    /// Queued operations run to completion first.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for connection in self.connections() {
            if let Err(e) = connection.close().await {
                tracing::debug!(connection = connection.id(), error = %e, "close failed");
            }
        }
        tracing::info!("connection source closed");
    }
}

impl std::fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSource")
            .field("capacity", &self.capacity())
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
