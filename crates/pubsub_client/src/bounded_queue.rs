//! A task scheduler refusing work beyond a fixed number of outstanding tasks.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    time::Duration,
};

use snafu::{ResultExt, Snafu, ensure};
use tokio::{
    runtime::{Handle, TryCurrentError},
    task::{JoinError, JoinHandle},
    time::{self, Instant, MissedTickBehavior},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    #[snafu(display(
        "queue capacity exceeded (capacity={capacity}, queue_depth={queue_depth}, incoming={incoming})"
    ))]
    CapacityExceeded {
        capacity: usize,
        queue_depth: usize,
        incoming: usize,
    },

    #[snafu(display("was expecting a non-zero positive capacity"))]
    ZeroCapacity,

    #[snafu(display("was expecting a non-zero period"))]
    ZeroPeriod,

    #[snafu(display("no tokio runtime to schedule tasks on: {source}"))]
    NoRuntime { source: TryCurrentError },
}

/// Spawns delayed, periodic and immediate tasks on a tokio runtime, rejecting any
/// submission that would take the number of outstanding tasks above `capacity`.
///
/// A task is outstanding from submission until it completes or is cancelled; periodic
/// tasks stay outstanding until cancelled. Rejection is synchronous and leaves the queue
/// untouched.
#[derive(Clone, Debug)]
pub struct BoundedTaskQueue {
    capacity: usize,
    queue_depth: Arc<Mutex<usize>>,
    runtime: Handle,
}

impl BoundedTaskQueue {
    /// Creates a queue spawning on the current tokio runtime.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        let runtime = Handle::try_current().context(NoRuntimeSnafu)?;
        Self::with_runtime(capacity, runtime)
    }

    pub fn with_runtime(capacity: usize, runtime: Handle) -> Result<Self, QueueError> {
        ensure!(capacity > 0, ZeroCapacitySnafu);
        Ok(Self {
            capacity,
            queue_depth: Arc::new(Mutex::new(0)),
            runtime,
        })
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of outstanding tasks.
    pub fn queue_depth(&self) -> usize {
        *lock(&self.queue_depth)
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<TaskHandle<F::Output>, QueueError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slot = self.reserve_one()?;
        Ok(self.spawn(slot, async move {
            time::sleep(delay).await;
            task.await
        }))
    }

    /// Runs `task` after `initial_delay` and then every `period`, measured between
    /// starts. Runs that fall behind are caught up back to back.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        initial_delay: Duration,
        period: Duration,
        mut task: F,
    ) -> Result<TaskHandle<()>, QueueError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        ensure!(!period.is_zero(), ZeroPeriodSnafu);
        let slot = self.reserve_one()?;
        Ok(self.spawn(slot, async move {
            let mut ticker = time::interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                task().await;
            }
        }))
    }

    /// Runs `task` after `initial_delay` and then again `delay` after each run completes.
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        mut task: F,
    ) -> Result<TaskHandle<()>, QueueError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let slot = self.reserve_one()?;
        Ok(self.spawn(slot, async move {
            time::sleep(initial_delay).await;
            loop {
                task().await;
                time::sleep(delay).await;
            }
        }))
    }

    /// Runs `task` right away.
    pub fn submit<F>(&self, task: F) -> Result<TaskHandle<F::Output>, QueueError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let slot = self.reserve_one()?;
        Ok(self.spawn(slot, task))
    }

    /// Runs every task right away. Either all of them are accepted or none is.
    pub fn submit_all<I, F>(&self, tasks: I) -> Result<Vec<TaskHandle<F::Output>>, QueueError>
    where
        I: IntoIterator<Item = F>,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let tasks: Vec<F> = tasks.into_iter().collect();
        self.reserve(tasks.len())?;
        Ok(tasks
            .into_iter()
            .map(|task| self.spawn(self.slot(), task))
            .collect())
    }

    fn reserve_one(&self) -> Result<QueueSlot, QueueError> {
        self.reserve(1)?;
        Ok(self.slot())
    }

    /// Adds `incoming` to the queue depth unless that would exceed the capacity. Every
    /// reserved unit must be handed to exactly one [`QueueSlot`].
    fn reserve(&self, incoming: usize) -> Result<(), QueueError> {
        let mut queue_depth = lock(&self.queue_depth);
        let exceeded = queue_depth
            .checked_add(incoming)
            .is_none_or(|depth| depth > self.capacity);
        ensure!(
            !exceeded,
            CapacityExceededSnafu {
                capacity: self.capacity,
                queue_depth: *queue_depth,
                incoming,
            }
        );
        *queue_depth += incoming;
        Ok(())
    }

    /// Takes ownership of one already reserved unit of depth.
    fn slot(&self) -> QueueSlot {
        QueueSlot {
            queue_depth: Arc::clone(&self.queue_depth),
        }
    }

    fn spawn<F>(&self, slot: QueueSlot, task: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = self.runtime.spawn(async move {
            let _slot = slot;
            task.await
        });
        TaskHandle { inner }
    }
}

/// One unit of queue depth, released when the owning task finishes or is cancelled.
#[derive(Debug)]
struct QueueSlot {
    queue_depth: Arc<Mutex<usize>>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        *lock(&self.queue_depth) -= 1;
    }
}

fn lock(queue_depth: &Mutex<usize>) -> MutexGuard<'_, usize> {
    queue_depth.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle of a task accepted by a [`BoundedTaskQueue`].
///
/// Awaiting it yields the task output. Dropping it detaches the task; use
/// [`cancel`](Self::cancel) to stop it.
#[derive(Debug)]
pub struct TaskHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    pub fn cancel(&self) {
        self.inner.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use tokio_test::{assert_pending, assert_ready_ok, task};

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn rejects_zero_capacity() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert!(matches!(
            BoundedTaskQueue::with_runtime(0, runtime.handle().clone()),
            Err(QueueError::ZeroCapacity)
        ));
    }

    #[test]
    fn requires_a_runtime() {
        assert!(matches!(BoundedTaskQueue::new(1), Err(QueueError::NoRuntime { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_submission_beyond_capacity() {
        let queue = BoundedTaskQueue::new(3).unwrap();

        let handles: Vec<_> = (0..3)
            .map(|index| queue.schedule(HOUR, async move { index }).unwrap())
            .collect();
        assert_eq!(queue.queue_depth(), 3);

        let error = queue.submit(async {}).unwrap_err();
        assert!(matches!(
            error,
            QueueError::CapacityExceeded { capacity: 3, queue_depth: 3, incoming: 1 }
        ));
        assert!(queue.schedule_at_fixed_rate(HOUR, HOUR, || async {}).is_err());
        assert!(queue.schedule_with_fixed_delay(HOUR, HOUR, || async {}).is_err());
        assert!(queue.submit_all(vec![async {}]).is_err());
        assert_eq!(queue.queue_depth(), 3);

        for (index, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), index);
        }
        assert_eq!(queue.queue_depth(), 0);
        assert_eq!(queue.submit(async { 7 }).unwrap().await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_task_waits_for_its_delay() {
        let queue = BoundedTaskQueue::new(1).unwrap();
        let mut handle = task::spawn(queue.schedule(Duration::from_secs(5), async { "done" }).unwrap());
        assert_pending!(handle.poll());
        // Let the worker start its delay before the clock moves.
        tokio::task::yield_now().await;

        time::advance(Duration::from_secs(4)).await;
        assert_pending!(handle.poll());
        assert_eq!(queue.queue_depth(), 1);

        time::advance(Duration::from_secs(1)).await;
        time::sleep(Duration::from_millis(1)).await;
        assert!(handle.is_woken());
        assert_eq!(assert_ready_ok!(handle.poll()), "done");
        assert_eq!(queue.queue_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_all_is_all_or_nothing() {
        let queue = BoundedTaskQueue::new(3).unwrap();

        assert!(queue.submit_all((0..4).map(|index| async move { index })).is_err());
        assert_eq!(queue.queue_depth(), 0);

        let handles = queue.submit_all((0..3).map(|index| async move { index })).unwrap();
        let mut outputs = Vec::new();
        for handle in handles {
            outputs.push(handle.await.unwrap());
        }
        assert_eq!(outputs, [0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_slot() {
        let queue = BoundedTaskQueue::new(1).unwrap();

        let handle = queue.schedule(HOUR, async {}).unwrap();
        assert!(queue.submit(async {}).is_err());

        handle.cancel();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(queue.queue_depth(), 0);
        assert!(queue.submit(async {}).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_rate_runs_periodically() {
        let queue = BoundedTaskQueue::new(1).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let handle = queue
            .schedule_at_fixed_rate(Duration::from_secs(1), Duration::from_secs(1), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(queue.queue_depth(), 1);

        handle.cancel();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(queue.queue_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_waits_for_completion() {
        let queue = BoundedTaskQueue::new(1).unwrap();
        let starts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&starts);
        let _handle = queue
            .schedule_with_fixed_delay(Duration::ZERO, Duration::from_secs(1), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    time::sleep(Duration::from_secs(1)).await;
                }
            })
            .unwrap();

        // Runs start at 0s, 2s and 4s.
        time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_submissions_never_exceed_capacity() {
        const CAPACITY: usize = 8;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .unwrap();
        let queue = BoundedTaskQueue::with_runtime(CAPACITY, runtime.handle().clone()).unwrap();

        let accepted: usize = thread::scope(|scope| {
            let submitters: Vec<_> = (0..CAPACITY + 1)
                .map(|_| {
                    let queue = queue.clone();
                    scope.spawn(move || queue.schedule(HOUR, async {}).is_ok())
                })
                .collect();
            submitters
                .into_iter()
                .map(|submitter| usize::from(submitter.join().unwrap()))
                .sum()
        });

        assert_eq!(accepted, CAPACITY);
        assert_eq!(queue.queue_depth(), CAPACITY);
        runtime.shutdown_background();
    }
}
