//! Operations: promises of future access to a connection.
//!
//! An [`OperationSlot`] moves through
//!
//! ```text
//! Pending -> Activated -> Completed
//! Pending ------------> Completed   (canceled or faulted while queued)
//! ```
//!
//! Every transition is a compare-and-swap on the slot state, so completion
//! happens exactly once no matter how many paths race to it. Waiters park on
//! a [`Notify`] and re-check the state after each wakeup.
//!
//! The caller owns an [`Operation`]; the connection keeps a shared reference
//! to the slot only while it is queued.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::Protocol;

bitflags! {
    /// Admission options for an operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OperationFlags: u8 {
        /// Hold the connection until this operation completes. No other
        /// operation is admitted meanwhile and the write turn is kept.
        const EXCLUSIVE_USE = 0x01;
        /// Fail with `Busy` instead of queueing behind other operations.
        const IMMEDIATE_ONLY = 0x02;
    }
}

const PENDING: u8 = 0;
const ACTIVATED: u8 = 1;
const COMPLETED: u8 = 2;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Observable state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Queued, waiting for its turn.
    Pending,
    /// Permitted to read the connection.
    Activated,
    /// Terminal.
    Completed,
}

/// How an operation ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Finished normally; the connection is positioned for the next response.
    Success,
    /// Canceled before or during execution.
    Canceled,
    /// The connection failed. Every operation on it shares this cause.
    Faulted(Arc<Error>),
}

impl Outcome {
    /// Convert to a result for the caller.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Success => Ok(()),
            Self::Canceled => Err(Error::Canceled),
            Self::Faulted(cause) => Err(Error::ConnectionFaulted(cause)),
        }
    }

    /// Check if this is a fault.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }
}

/// Shared state of one operation.
pub struct OperationSlot {
    id: u64,
    flags: OperationFlags,
    state: AtomicU8,
    outcome: OnceLock<Outcome>,
    notify: Notify,
    bound: AtomicBool,
    in_flight: AtomicBool,
    payload: OnceLock<Arc<dyn Any + Send + Sync>>,
}

impl OperationSlot {
    /// Create an unbound operation.
    #[must_use]
    pub fn new(flags: OperationFlags) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            flags,
            state: AtomicU8::new(PENDING),
            outcome: OnceLock::new(),
            notify: Notify::new(),
            bound: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            payload: OnceLock::new(),
        })
    }

    /// Process-unique identity.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Admission flags.
    #[must_use]
    pub fn flags(&self) -> OperationFlags {
        self.flags
    }

    /// Check if this operation holds its connection exclusively.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.flags.contains(OperationFlags::EXCLUSIVE_USE)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> OperationState {
        match self.state.load(Ordering::Acquire) {
            PENDING => OperationState::Pending,
            ACTIVATED => OperationState::Activated,
            _ => OperationState::Completed,
        }
    }

    /// Check if the operation has been bound to a connection.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    /// The terminal outcome, once completed.
    #[must_use]
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.get()
    }

    /// Attach a typed payload. Returns `false` if one is already attached.
    pub fn attach<T: Any + Send + Sync>(&self, payload: Arc<T>) -> bool {
        self.payload.set(payload).is_ok()
    }

    /// The attached payload, if it has type `T`.
    #[must_use]
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(self.payload.get()?).downcast::<T>().ok()
    }

    /// Check if a response to this operation is still unread.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_flight(&self, in_flight: bool) {
        self.in_flight.store(in_flight, Ordering::Release);
    }

    pub(crate) fn bind(&self) -> bool {
        self.bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn activate(&self) -> bool {
        let activated = self
            .state
            .compare_exchange(PENDING, ACTIVATED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if activated {
            self.notify.notify_waiters();
        }
        activated
    }

    /// Move to `Completed`. Only the first call wins; later calls return
    /// `false` and change nothing.
    pub(crate) fn try_complete(&self, outcome: Outcome) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == COMPLETED {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                COMPLETED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // Only the winner of the swap reaches this point.
        let _ = self.outcome.set(outcome);
        self.notify.notify_waiters();
        true
    }

    /// Wait until the operation is activated.
    ///
    /// Fails if it completes first: canceled, or faulted with the
    /// connection.
    pub async fn activated(&self) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state.load(Ordering::Acquire) {
                ACTIVATED => return Ok(()),
                COMPLETED => {
                    return match self.outcome.get() {
                        Some(outcome) => outcome.clone().into_result(),
                        None => Ok(()),
                    };
                }
                _ => {}
            }
            notified.await;
        }
    }

    /// Wait for the terminal outcome.
    pub async fn completed(&self) -> Outcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }
}

impl fmt::Debug for OperationSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSlot")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("state", &self.state())
            .field("in_flight", &self.is_in_flight())
            .finish_non_exhaustive()
    }
}

/// Caller-owned handle to an admitted operation.
///
/// Dropping an operation that has not completed cleans up after it: a
/// pending one is canceled, an active one with an unread response faults the
/// connection, and an active idle one completes normally.
pub struct Operation {
    slot: Arc<OperationSlot>,
    protocol: Arc<Protocol>,
}

impl Operation {
    pub(crate) fn new(slot: Arc<OperationSlot>, protocol: Arc<Protocol>) -> Self {
        Self { slot, protocol }
    }

    /// The shared slot.
    #[must_use]
    pub fn slot(&self) -> &Arc<OperationSlot> {
        &self.slot
    }

    /// Operation id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.id()
    }

    /// The connection this operation is bound to.
    #[must_use]
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// Wait for this operation's turn, or cancel it when `cancel` fires.
    pub async fn activated(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            result = self.slot.activated() => result,
            () = cancel.cancelled() => {
                self.protocol.cancel(&self.slot).await;
                Err(Error::Canceled)
            }
        }
    }

    /// Complete normally.
    pub fn complete(self) {
        self.protocol.complete(&self.slot, Outcome::Success);
    }

    /// Complete by faulting the connection with `cause`.
    pub fn fault(self, cause: Error) -> Arc<Error> {
        self.protocol.fault(cause)
    }

    /// Cancel the operation.
    ///
    /// A queued operation is removed; an active one sends an attention and
    /// drains to its acknowledgement, or faults the connection if that is
    /// not possible.
    pub async fn cancel(self) {
        self.protocol.cancel(&self.slot).await;
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("slot", &self.slot)
            .field("connection", &self.protocol.id())
            .finish()
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.protocol.abandon(&self.slot);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_completion_is_idempotent() {
        let slot = OperationSlot::new(OperationFlags::empty());
        assert!(slot.activate());
        assert!(slot.try_complete(Outcome::Success));
        assert!(!slot.try_complete(Outcome::Canceled));
        assert!(matches!(slot.outcome(), Some(Outcome::Success)));
        assert!(!slot.activate());
        assert_eq!(slot.state(), OperationState::Completed);
    }

    #[test]
    fn test_bind_once() {
        let slot = OperationSlot::new(OperationFlags::EXCLUSIVE_USE);
        assert!(slot.is_exclusive());
        assert!(slot.bind());
        assert!(slot.is_bound());
        assert!(!slot.bind());
    }

    #[test]
    fn test_payload_downcast() {
        let slot = OperationSlot::new(OperationFlags::empty());
        assert!(slot.payload::<String>().is_none());
        assert!(slot.attach(Arc::new(String::from("SELECT 1"))));
        assert!(!slot.attach(Arc::new(5u32)));
        assert_eq!(slot.payload::<String>().unwrap().as_str(), "SELECT 1");
        assert!(slot.payload::<u32>().is_none());
    }

    #[tokio::test]
    async fn test_activated_wakes_waiter() {
        let slot = OperationSlot::new(OperationFlags::empty());
        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.activated().await })
        };
        tokio::task::yield_now().await;
        slot.activate();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_completion_before_activation_fails_waiter() {
        let slot = OperationSlot::new(OperationFlags::empty());
        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.activated().await })
        };
        tokio::task::yield_now().await;
        let cause = Arc::new(Error::ConnectionClosed);
        slot.try_complete(Outcome::Faulted(Arc::clone(&cause)));

        let err = waiter.await.unwrap().unwrap_err();
        match err {
            Error::ConnectionFaulted(shared) => assert!(Arc::ptr_eq(&shared, &cause)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(slot.completed().await.is_faulted());
    }

    #[tokio::test]
    async fn test_racing_completions_pick_one() {
        let slot = OperationSlot::new(OperationFlags::empty());
        let mut handles = Vec::new();
        for i in 0..16 {
            let slot = Arc::clone(&slot);
            handles.push(tokio::spawn(async move {
                let outcome = if i % 2 == 0 {
                    Outcome::Success
                } else {
                    Outcome::Canceled
                };
                slot.try_complete(outcome)
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
