//! Cancellable asynchronous operations.
//!
//! An [`Operation`] runs a future on the tokio runtime and hands its output to
//! a delivery closure. [`Operation::cancel`] can be called from any thread,
//! any number of times. Once it returns, the delivery closure is guaranteed
//! never to run, even if the future had already completed on another worker
//! thread: delivery and cancellation serialize on the same [`DeliveryGate`].
//!
//! ```rust,ignore
//! let op = Operation::spawn(service.take_turn(&id, bytes, None), move |result| {
//!     let _ = events.send(DriverEvent::Submitted { generation, result });
//! });
//! // Later, if the caller lost interest:
//! op.cancel();
//! ```

use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::task::AbortHandle;
use tracing::trace;

// ── DeliveryGate ────────────────────────────────────────────────────

/// A lock-guarded open/closed flag that makes delivery and cancellation
/// mutually exclusive.
///
/// [`deliver`](Self::deliver) runs its closure while holding the lock, so a
/// concurrent [`close`](Self::close) from another thread either happens
/// before (and the closure is skipped) or waits until the delivery is over.
/// The lock is re-entrant: a delivered closure may close its own gate, for
/// example by dropping the handler that owns it.
#[derive(Debug, Default)]
pub struct DeliveryGate {
    closed: ReentrantMutex<Cell<bool>>,
}

impl DeliveryGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the gate. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        !self.closed.lock().replace(true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().get()
    }

    /// Runs `f` unless the gate is closed.
    pub fn deliver<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let closed = self.closed.lock();
        if closed.get() {
            return None;
        }
        Some(f())
    }

    /// Closes the gate and, if this call closed it, runs `f`.
    ///
    /// `f` sees a closed gate, so nothing else is delivered through it once
    /// `f` starts.
    pub fn deliver_final<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let closed = self.closed.lock();
        if closed.replace(true) {
            return None;
        }
        Some(f())
    }
}

// ── Operation ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct OperationInner {
    gate: DeliveryGate,
    task: Mutex<Option<AbortHandle>>,
    finished: AtomicBool,
}

/// Handle to an in-flight asynchronous unit of work.
///
/// Cloning the handle shares the same operation. Dropping every handle does
/// **not** cancel the work; cancellation is always explicit.
#[derive(Debug, Clone)]
pub struct Operation {
    inner: Arc<OperationInner>,
}

impl Operation {
    /// Spawns `future` and passes its output to `deliver` unless the
    /// operation is cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, D>(future: F, deliver: D) -> Self
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        D: FnOnce(F::Output) + Send + 'static,
    {
        let inner = Arc::new(OperationInner::default());
        let task_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let output = future.await;
            if task_inner.gate.deliver(|| deliver(output)).is_none() {
                trace!("operation result dropped after cancellation");
            }
            task_inner.finished.store(true, Ordering::Release);
        });

        *inner.task.lock() = Some(handle.abort_handle());
        // `cancel` may have raced us before the abort handle was stored.
        if inner.gate.is_closed() {
            handle.abort();
        }

        Self { inner }
    }

    /// Fires `deliver` once `delay` has elapsed.
    pub fn delay<D>(delay: Duration, deliver: D) -> Self
    where
        D: FnOnce() + Send + 'static,
    {
        Self::spawn(tokio::time::sleep(delay), move |()| deliver())
    }

    /// Cancels the operation. Idempotent and callable from any thread.
    ///
    /// After this returns, the delivery closure will not run.
    pub fn cancel(&self) {
        if !self.inner.gate.close() {
            return;
        }
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        trace!("operation cancelled");
    }

    /// Stops delivery but lets the underlying work run to completion.
    ///
    /// Used for remote calls whose side effect should still land even though
    /// nobody is interested in the answer any more.
    pub fn abandon(&self) {
        if self.inner.gate.close() {
            trace!("operation abandoned");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.gate.is_closed()
    }

    /// Returns `true` once the future has completed and delivery was
    /// attempted.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }
}

// ── OperationSet ────────────────────────────────────────────────────

/// A group of operations cancelled together.
#[derive(Debug, Default)]
pub struct OperationSet {
    ops: Vec<Operation>,
}

impl OperationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        // Forget operations that already ran to completion.
        self.ops.retain(|op| !op.is_finished());
        self.ops.push(op);
    }

    /// Cancels every operation in the set and empties it.
    pub fn cancel_all(&mut self) {
        for op in self.ops.drain(..) {
            op.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn delivers_result_when_not_cancelled() {
        let (tx, rx) = oneshot::channel();
        let op = Operation::spawn(async { 7 }, move |v| {
            let _ = tx.send(v);
        });
        assert_eq!(rx.await.unwrap(), 7);
        tokio::task::yield_now().await;
        assert!(!op.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_completion_suppresses_delivery() {
        let delivered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&delivered);
        let op = Operation::delay(Duration::from_secs(5), move || {
            flag.store(true, Ordering::SeqCst);
        });
        op.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!delivered.load(Ordering::SeqCst));
        assert!(op.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_after_completion_before_delivery_suppresses_it() {
        // The future is done, but the gate is held closed before the
        // spawned task gets to deliver.
        let delivered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&delivered);
        let op = Operation::spawn(std::future::ready(()), move |()| {
            flag.store(true, Ordering::SeqCst);
        });
        op.cancel();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(!delivered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let op = Operation::spawn(std::future::pending::<()>(), |()| {});
        op.cancel();
        op.cancel();
        assert!(op.is_cancelled());
        let clone = op.clone();
        clone.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn abandoned_work_still_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicBool::new(false));
        let (ran_flag, delivered_flag) = (Arc::clone(&ran), Arc::clone(&delivered));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let op = Operation::spawn(
            async move {
                let _ = release_rx.await;
                ran_flag.store(true, Ordering::SeqCst);
            },
            move |()| delivered_flag.store(true, Ordering::SeqCst),
        );
        op.abandon();
        release_tx.send(()).unwrap();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert!(ran.load(Ordering::SeqCst));
        assert!(!delivered.load(Ordering::SeqCst));
        assert!(op.is_finished());
    }

    #[test]
    fn gate_close_reports_first_caller_only() {
        let gate = DeliveryGate::new();
        assert!(gate.deliver(|| 1).is_some());
        assert!(gate.close());
        assert!(!gate.close());
        assert!(gate.deliver(|| 1).is_none());
    }

    #[test]
    fn delivery_may_close_its_own_gate() {
        let gate = DeliveryGate::new();
        let closed_inside = gate.deliver(|| gate.close());
        assert_eq!(closed_inside, Some(true));
        assert!(gate.is_closed());
        assert!(gate.deliver(|| ()).is_none());
    }

    #[test]
    fn final_delivery_runs_once_with_the_gate_closed() {
        let gate = DeliveryGate::new();
        let seen = gate.deliver_final(|| (gate.is_closed(), gate.close()));
        assert_eq!(seen, Some((true, false)));
        assert!(gate.deliver_final(|| ()).is_none());
    }

    #[test]
    fn close_from_another_thread_waits_for_delivery() {
        let gate = Arc::new(DeliveryGate::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let delivering = Arc::clone(&gate);
        let worker = std::thread::spawn(move || {
            delivering.deliver(|| {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        });
        entered_rx.recv().unwrap();

        let closing = Arc::clone(&gate);
        let closer = std::thread::spawn(move || closing.close());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!closer.is_finished());

        release_tx.send(()).unwrap();
        assert!(worker.join().unwrap().is_some());
        assert!(closer.join().unwrap());
    }

    #[tokio::test]
    async fn operation_set_cancels_everything() {
        let mut set = OperationSet::new();
        let a = Operation::spawn(std::future::pending::<()>(), |()| {});
        let b = Operation::spawn(std::future::pending::<()>(), |()| {});
        set.push(a.clone());
        set.push(b.clone());
        assert_eq!(set.len(), 2);
        set.cancel_all();
        assert!(set.is_empty());
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Whatever the interleaving, nothing is delivered after `cancel()`
        /// returned, and nothing is delivered twice.
        #[test]
        fn cancel_suppresses_late_delivery(work_yields in 0usize..8, cancel_yields in 0usize..8) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async move {
                let deliveries = Arc::new(AtomicUsize::new(0));
                let counter = Arc::clone(&deliveries);
                let op = Operation::spawn(
                    async move {
                        for _ in 0..work_yields {
                            tokio::task::yield_now().await;
                        }
                    },
                    move |()| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                );

                let canceller = op.clone();
                let observed = Arc::clone(&deliveries);
                let at_cancel = tokio::spawn(async move {
                    for _ in 0..cancel_yields {
                        tokio::task::yield_now().await;
                    }
                    canceller.cancel();
                    observed.load(Ordering::SeqCst)
                })
                .await
                .expect("cancel task");

                for _ in 0..16 {
                    tokio::task::yield_now().await;
                }
                let final_count = deliveries.load(Ordering::SeqCst);
                assert!(final_count <= 1);
                assert_eq!(final_count, at_cancel);
            });
        }
    }
}
