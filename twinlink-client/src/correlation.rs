//! Correlation of outbound requests with their replies
//!
//! Every submitted operation gets a fresh [`CorrelationId`] and an entry in
//! the table. The entry is completed exactly once, by whichever of reply,
//! timeout, connection loss or shutdown removes it from the map first.
//! Continuations run after the lock is released.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use twinlink_protocol::{ClientFrame, CorrelationId, ReplyOutcome, ThingOperation};
use twinlink_utils::{OperationError, Result};

use crate::operation::OperationHandle;
use crate::transport::FrameSender;

/// Success continuation; receives `Value::Null` when the reply had no content
pub type SuccessFn = Box<dyn FnOnce(Value) + Send + 'static>;

/// Failure continuation
pub type FailureFn = Box<dyn FnOnce(OperationError) + Send + 'static>;

pub(crate) type Outcome = std::result::Result<Value, OperationError>;

/// Deadline offset used when `now + timeout` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Continuation pair attached to an operation
#[derive(Default)]
pub(crate) struct Continuations {
    pub on_success: Option<SuccessFn>,
    pub on_failure: Option<FailureFn>,
}

struct PendingOperation {
    operation: &'static str,
    deadline: Instant,
    timeout: Duration,
    continuations: Continuations,
    reply: oneshot::Sender<Outcome>,
}

impl PendingOperation {
    /// Consume the entry, running its continuation and waking the handle
    fn complete(self, correlation_id: CorrelationId, outcome: Outcome) {
        let Continuations {
            on_success,
            on_failure,
        } = self.continuations;

        let result = match &outcome {
            Ok(value) => on_success.map(|f| {
                let value = value.clone();
                catch_unwind(AssertUnwindSafe(move || f(value)))
            }),
            Err(err) => on_failure.map(|f| {
                let err = err.clone();
                catch_unwind(AssertUnwindSafe(move || f(err)))
            }),
        };
        if let Some(Err(_)) = result {
            tracing::error!(
                correlation_id,
                operation = self.operation,
                "Operation continuation panicked"
            );
        }

        // Receiver may have been dropped; the operation still counts as completed
        let _ = self.reply.send(outcome);
    }
}

/// Table of outstanding operations keyed by correlation id
pub struct CorrelationTable {
    pending: Mutex<HashMap<CorrelationId, PendingOperation>>,
    next_id: AtomicU64,
    /// Wakes the sweeper when an entry with a possibly earlier deadline arrives
    inserted: Notify,
    /// Wakes `wait_idle` callers when the table drains
    drained: Notify,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            inserted: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Register an entry, then send the request frame
    ///
    /// The entry exists before the frame leaves, so a fast reply always
    /// finds it. If the send fails the entry is withdrawn and the error
    /// returned; the continuations are dropped without running.
    pub(crate) fn submit(
        &self,
        operation: ThingOperation,
        timeout: Duration,
        continuations: Continuations,
        sender: &FrameSender,
    ) -> Result<OperationHandle> {
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let name = operation.name();
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);

        self.pending.lock().insert(
            correlation_id,
            PendingOperation {
                operation: name,
                deadline,
                timeout,
                continuations,
                reply: tx,
            },
        );
        self.inserted.notify_one();

        if let Err(e) = sender.send(ClientFrame::Request {
            correlation_id,
            operation,
        }) {
            self.withdraw(correlation_id);
            return Err(e);
        }

        tracing::debug!(correlation_id, operation = name, "Operation submitted");
        Ok(OperationHandle::new(correlation_id, rx))
    }

    /// Complete the entry matching a reply; unknown ids are dropped
    pub fn on_reply(&self, correlation_id: CorrelationId, outcome: ReplyOutcome) -> bool {
        let Some(entry) = self.remove(correlation_id) else {
            tracing::debug!(correlation_id, "Dropping reply for unknown or completed operation");
            return false;
        };

        let outcome = match outcome {
            ReplyOutcome::Success(payload) => Ok(payload.map(|p| p.into_inner()).unwrap_or(Value::Null)),
            ReplyOutcome::Failure { code, message } => {
                tracing::debug!(correlation_id, code = %code, "Operation failed remotely");
                Err(OperationError::remote(code.as_str(), message))
            }
        };
        entry.complete(correlation_id, outcome);
        true
    }

    /// Fail one outstanding entry, if it is still outstanding
    pub fn fail(&self, correlation_id: CorrelationId, error: OperationError) -> bool {
        match self.remove(correlation_id) {
            Some(entry) => {
                entry.complete(correlation_id, Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding entry; returns how many were failed
    pub fn fail_all(&self, error: OperationError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        self.drained.notify_waiters();

        for (correlation_id, entry) in drained {
            entry.complete(correlation_id, Err(error.clone()));
        }
        count
    }

    /// Fail every entry whose deadline is at or before `now`
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<_> = {
            let mut pending = self.pending.lock();
            let ids: Vec<_> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            let expired = ids
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect();
            if pending.is_empty() {
                self.drained.notify_waiters();
            }
            expired
        };

        let count = expired.len();
        for (correlation_id, entry) in expired {
            let after_ms = u64::try_from(entry.timeout.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(correlation_id, operation = entry.operation, after_ms, "Operation timed out");
            entry.complete(
                correlation_id,
                Err(OperationError::Timeout {
                    correlation_id,
                    after_ms,
                }),
            );
        }
        count
    }

    /// Earliest deadline among outstanding entries
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.lock().values().map(|entry| entry.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn contains(&self, correlation_id: CorrelationId) -> bool {
        self.pending.lock().contains_key(&correlation_id)
    }

    /// Resolve once no operation is outstanding
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Expire entries as their deadlines pass; runs until aborted
    pub async fn run_sweeper(self: Arc<Self>) {
        loop {
            let inserted = self.inserted.notified();
            tokio::pin!(inserted);
            inserted.as_mut().enable();

            self.expire(Instant::now());

            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = &mut inserted => {}
                    }
                }
                None => inserted.await,
            }
        }
    }

    fn remove(&self, correlation_id: CorrelationId) -> Option<PendingOperation> {
        let mut pending = self.pending.lock();
        let entry = pending.remove(&correlation_id);
        if entry.is_some() && pending.is_empty() {
            self.drained.notify_waiters();
        }
        entry
    }

    /// Remove an entry without running its continuations
    fn withdraw(&self, correlation_id: CorrelationId) {
        if let Some(entry) = self.remove(correlation_id) {
            tracing::debug!(correlation_id, operation = entry.operation, "Operation withdrawn, send failed");
        }
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending", &self.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use twinlink_protocol::{ErrorCode, JsonValue};

    fn channel() -> (FrameSender, mpsc::UnboundedReceiver<ClientFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FrameSender::new(tx), rx)
    }

    fn retrieve() -> ThingOperation {
        ThingOperation::Retrieve {
            thing_id: "myThing".into(),
        }
    }

    /// Continuations that count how often each side ran
    fn counting() -> (Continuations, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let s = successes.clone();
        let f = failures.clone();
        (
            Continuations {
                on_success: Some(Box::new(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                })),
                on_failure: Some(Box::new(move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                })),
            },
            successes,
            failures,
        )
    }

    #[tokio::test]
    async fn test_submit_registers_before_sending() {
        let table = CorrelationTable::new();
        let (sender, mut rx) = channel();

        let handle = table
            .submit(retrieve(), Duration::from_secs(10), Continuations::default(), &sender)
            .unwrap();
        assert_eq!(handle.correlation_id(), 1);
        assert!(table.contains(1));

        match rx.recv().await {
            Some(ClientFrame::Request { correlation_id, operation }) => {
                assert_eq!(correlation_id, 1);
                assert_eq!(operation, retrieve());
            }
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let table = CorrelationTable::new();
        let (sender, _rx) = channel();

        let ids: Vec<_> = (0..5)
            .map(|_| {
                table
                    .submit(retrieve(), Duration::from_secs(10), Continuations::default(), &sender)
                    .unwrap()
                    .correlation_id()
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(table.len(), 5);
    }

    #[tokio::test]
    async fn test_reply_completes_once() {
        let table = CorrelationTable::new();
        let (sender, _rx) = channel();
        let (continuations, successes, failures) = counting();

        let handle = table
            .submit(retrieve(), Duration::from_secs(10), continuations, &sender)
            .unwrap();

        let thing = serde_json::json!({"thingId": "myThing"});
        assert!(table.on_reply(1, ReplyOutcome::Success(Some(JsonValue::new(thing.clone())))));
        // Duplicate reply is dropped
        assert!(!table.on_reply(1, ReplyOutcome::Success(None)));

        assert_eq!(handle.await.unwrap(), thing);
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_empty_success_is_null() {
        let table = CorrelationTable::new();
        let (sender, _rx) = channel();

        let handle = table
            .submit(retrieve(), Duration::from_secs(10), Continuations::default(), &sender)
            .unwrap();
        table.on_reply(1, ReplyOutcome::Success(None));
        assert_eq!(handle.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_remote_failure() {
        let table = CorrelationTable::new();
        let (sender, _rx) = channel();
        let (continuations, successes, failures) = counting();

        let handle = table
            .submit(retrieve(), Duration::from_secs(10), continuations, &sender)
            .unwrap();
        table.on_reply(
            1,
            ReplyOutcome::Failure {
                code: ErrorCode::ThingNotFound,
                message: "myThing".into(),
            },
        );

        assert_eq!(
            handle.await.unwrap_err(),
            OperationError::remote("ThingNotFound", "myThing")
        );
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_reply_is_ignored() {
        let table = CorrelationTable::new();
        assert!(!table.on_reply(99, ReplyOutcome::Success(None)));
    }

    #[tokio::test]
    async fn test_send_failure_withdraws_entry() {
        let table = CorrelationTable::new();
        let (sender, rx) = channel();
        drop(rx);
        let (continuations, successes, failures) = counting();

        let result = table.submit(retrieve(), Duration::from_secs(10), continuations, &sender);
        assert!(result.is_err());
        assert!(table.is_empty());
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_times_out_and_late_reply_is_dropped() {
        let table = Arc::new(CorrelationTable::new());
        let (sender, _rx) = channel();
        let (continuations, successes, failures) = counting();
        let sweeper = tokio::spawn(table.clone().run_sweeper());

        let handle = table
            .submit(retrieve(), Duration::from_millis(500), continuations, &sender)
            .unwrap();

        assert_eq!(
            handle.await.unwrap_err(),
            OperationError::Timeout {
                correlation_id: 1,
                after_ms: 500
            }
        );
        assert!(!table.on_reply(1, ReplyOutcome::Success(None)));
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_picks_up_earlier_deadline() {
        let table = Arc::new(CorrelationTable::new());
        let (sender, _rx) = channel();
        let sweeper = tokio::spawn(table.clone().run_sweeper());

        let slow = table
            .submit(retrieve(), Duration::from_secs(60), Continuations::default(), &sender)
            .unwrap();
        let fast = table
            .submit(retrieve(), Duration::from_millis(100), Continuations::default(), &sender)
            .unwrap();

        let started = Instant::now();
        assert!(matches!(fast.await, Err(OperationError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(table.contains(slow.correlation_id()));

        sweeper.abort();
    }

    #[tokio::test]
    async fn test_expire_only_past_deadlines() {
        let table = CorrelationTable::new();
        let (sender, _rx) = channel();
        table
            .submit(retrieve(), Duration::from_secs(1), Continuations::default(), &sender)
            .unwrap();
        table
            .submit(retrieve(), Duration::from_secs(60), Continuations::default(), &sender)
            .unwrap();

        assert_eq!(table.expire(Instant::now() + Duration::from_secs(2)), 1);
        assert!(!table.contains(1));
        assert!(table.contains(2));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_is_clamped() {
        let table = CorrelationTable::new();
        let (sender, _rx) = channel();
        let handle = table
            .submit(retrieve(), Duration::MAX, Continuations::default(), &sender)
            .unwrap();

        assert!(table.contains(handle.correlation_id()));
        let deadline = table.next_deadline().unwrap();
        assert!(deadline > Instant::now() + Duration::from_secs(86400 * 365));

        assert_eq!(table.expire(Instant::now() + Duration::from_secs(3600)), 0);
        assert!(table.contains(handle.correlation_id()));

        table.on_reply(handle.correlation_id(), ReplyOutcome::Success(None));
        assert_eq!(handle.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let table = CorrelationTable::new();
        let (sender, _rx) = channel();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                table
                    .submit(retrieve(), Duration::from_secs(10), Continuations::default(), &sender)
                    .unwrap()
            })
            .collect();

        assert_eq!(table.fail_all(OperationError::ConnectionLost), 3);
        assert!(table.is_empty());
        for handle in handles {
            assert_eq!(handle.await.unwrap_err(), OperationError::ConnectionLost);
        }
        assert_eq!(table.fail_all(OperationError::ConnectionLost), 0);
    }

    #[tokio::test]
    async fn test_fail_single_entry() {
        let table = CorrelationTable::new();
        let (sender, _rx) = channel();
        let handle = table
            .submit(retrieve(), Duration::from_secs(10), Continuations::default(), &sender)
            .unwrap();

        assert!(table.fail(1, OperationError::ShuttingDown));
        assert!(!table.fail(1, OperationError::ShuttingDown));
        assert_eq!(handle.await.unwrap_err(), OperationError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let table = Arc::new(CorrelationTable::new());
        let (sender, _rx) = channel();

        // Empty table is idle immediately
        table.wait_idle().await;

        table
            .submit(retrieve(), Duration::from_secs(10), Continuations::default(), &sender)
            .unwrap();

        let waiter = tokio::spawn({
            let table = table.clone();
            async move { table.wait_idle().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        table.on_reply(1, ReplyOutcome::Success(None));
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_continuation_still_wakes_handle() {
        let table = CorrelationTable::new();
        let (sender, _rx) = channel();

        let handle = table
            .submit(
                retrieve(),
                Duration::from_secs(10),
                Continuations {
                    on_success: Some(Box::new(|_| panic!("handler bug"))),
                    on_failure: None,
                },
                &sender,
            )
            .unwrap();

        table.on_reply(1, ReplyOutcome::Success(None));
        assert_eq!(handle.await.unwrap(), Value::Null);
    }

    #[test]
    fn test_dropped_handle_still_completes() {
        let table = CorrelationTable::new();
        let (sender, _rx) = channel();
        let (continuations, successes, _) = counting();

        let handle = table
            .submit(retrieve(), Duration::from_secs(10), continuations, &sender)
            .unwrap();
        drop(handle);

        assert!(table.on_reply(1, ReplyOutcome::Success(None)));
        assert_eq!(successes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_reply_and_failure_complete_once() {
        for _ in 0..50 {
            let table = Arc::new(CorrelationTable::new());
            let (sender, _rx) = channel();
            let (continuations, successes, failures) = counting();
            table
                .submit(retrieve(), Duration::from_secs(10), continuations, &sender)
                .unwrap();

            let replier = {
                let table = table.clone();
                std::thread::spawn(move || table.on_reply(1, ReplyOutcome::Success(None)))
            };
            let failer = {
                let table = table.clone();
                std::thread::spawn(move || table.fail_all(OperationError::ConnectionLost))
            };
            replier.join().unwrap();
            failer.join().unwrap();

            assert_eq!(
                successes.load(Ordering::SeqCst) + failures.load(Ordering::SeqCst),
                1
            );
        }
    }

    #[test]
    fn test_concurrent_reply_and_timeout_complete_once() {
        for _ in 0..50 {
            let table = Arc::new(CorrelationTable::new());
            let (sender, _rx) = channel();
            let (continuations, successes, failures) = counting();
            table
                .submit(retrieve(), Duration::from_secs(10), continuations, &sender)
                .unwrap();
            let far_future = Instant::now() + Duration::from_secs(3600);

            let replier = {
                let table = table.clone();
                std::thread::spawn(move || table.on_reply(1, ReplyOutcome::Success(None)))
            };
            let sweeper = {
                let table = table.clone();
                std::thread::spawn(move || table.expire(far_future))
            };
            let replied = replier.join().unwrap();
            let expired = sweeper.join().unwrap();

            assert_eq!(usize::from(replied) + expired, 1);
            assert_eq!(
                successes.load(Ordering::SeqCst) + failures.load(Ordering::SeqCst),
                1
            );
            assert!(table.is_empty());
        }
    }
}
