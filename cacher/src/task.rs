//! This module provides cache tasks and the bounded pool of workers executing them.

use std::num::NonZeroU8;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{self, Future, FutureExt};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};

use crate::rewrite;

type Job = future::BoxFuture<'static, ()>;

/// A unit of fetch-and-cache work.
///
/// Tasks are consumed once by a worker. Recursing into a stylesheet references creates new child tasks, it never mutates the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    request_url: String,
    /// Owning session, `0` when the asset is shared by every session.
    session_id: u64,
    /// Remaining recursion budget.
    depth: u8,
    /// Provenance trail, for diagnostics only.
    url_context: String,
    is_js: bool,
}

impl Task {
    /// Create a task caching an asset of a session page, following stylesheet references `depth` levels deep.
    pub fn page_asset(session_id: u64, url: impl Into<String>, depth: u8) -> Self {
        let url = url.into();

        Self {
            url_context: url.clone(),
            request_url: url,
            session_id,
            depth,
            is_js: false,
        }
    }

    /// Create a task caching a JS source file, shared by every session.
    pub fn js_file(url: impl Into<String>) -> Self {
        let url = url.into();

        Self {
            url_context: url.clone(),
            request_url: url,
            session_id: 0,
            depth: 0,
            is_js: true,
        }
    }

    /// Create a task caching an asset referenced by this one, with one less level of recursion budget.
    ///
    /// Return `None` if the recursion budget is exhausted.
    pub fn child(&self, url: impl Into<String>) -> Option<Self> {
        let depth = self.depth.checked_sub(1)?;
        let url = url.into();

        Some(Self {
            url_context: format!("{}\n  -> {url}", self.url_context),
            request_url: url,
            session_id: self.session_id,
            depth,
            is_js: false,
        })
    }

    /// Return the storage key of the asset, also used as deduplication key.
    pub fn cache_path(&self) -> String {
        if self.is_js {
            rewrite::cache_path_for_js(&self.request_url)
        } else {
            rewrite::cache_path_for_assets(self.session_id, &self.request_url)
        }
    }

    #[inline]
    pub fn request_url(&self) -> &str {
        &self.request_url
    }

    #[inline]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    #[inline]
    pub fn url_context(&self) -> &str {
        &self.url_context
    }

    #[inline]
    pub fn is_js(&self) -> bool {
        self.is_js
    }
}

/// Submission to a stopped pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task pool is stopped")]
pub struct Closed;

/// Background submission to a pool whose queue and overflow are both full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task pool is overloaded")]
pub struct Overloaded;

/// A bounded pool of workers executing asynchronous jobs in the background.
///
/// Jobs wait in a queue of fixed capacity until the next available worker picks them up, each worker running one job to completion
/// at a time. A job panicking is caught and logged, the worker then moves on to the next one.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use std::num::NonZeroU8;
/// # use asset_cacher::task::Pool;
/// let pool = Pool::start(NonZeroU8::new(3).unwrap(), 8, 8);
///
/// for i in 0..=5 {
///     pool.submit(async move { println!("Hello from job #{i}!") }).await.unwrap();
/// }
///
/// pool.stop().await;
/// # })
/// ```
#[derive(Debug)]
pub struct Pool {
    /// The pool of workers, emptied once stopped.
    workers: Mutex<Vec<Worker>>,
    /// The sending part of the queue to push jobs to the workers.
    sender: mpsc::Sender<Job>,
    /// The receiving part of the queue, shared by the workers.
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    /// Shutdown signal, workers exit after their current job once set.
    shutdown: watch::Sender<bool>,
    /// Permits for background submissions waiting for room in the full queue.
    overflow: Arc<Semaphore>,
}

impl Pool {
    /// Start a pool with `size` workers and room for `capacity` pending jobs, plus `overflow` background submissions waiting for
    /// room in the queue.
    ///
    /// # Panics
    /// This method panics if `capacity` is zero, or if called outside of a Tokio runtime.
    pub fn start(size: NonZeroU8, capacity: usize, overflow: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(false);

        let receiver = Arc::new(Mutex::new(receiver));

        static WORKER_ID: AtomicUsize = AtomicUsize::new(0);
        let size = size.get().into();
        let id = WORKER_ID.fetch_add(size, Ordering::Relaxed);

        let workers = (0..size)
            .map(|i| Worker::new(id.wrapping_add(i), Arc::clone(&receiver), shutdown.subscribe()))
            .collect();

        Self {
            workers: Mutex::new(workers),
            sender,
            receiver,
            shutdown,
            overflow: Arc::new(Semaphore::new(overflow)),
        }
    }

    /// Queue a job, waiting for room in the queue if it is full.
    pub async fn submit(&self, job: impl Future<Output = ()> + Send + 'static) -> Result<(), Closed> {
        self.sender.send(job.boxed()).await.map_err(|_| Closed)
    }

    /// Queue a job without ever waiting, which makes it suitable to submit jobs from within a worker.
    ///
    /// If the queue is full, the job waits for room in a detached task, as long as the overflow has a free slot. Otherwise the job is
    /// dropped and [`Overloaded`] is returned. Jobs submitted to a stopped pool are silently dropped.
    pub fn forget(&self, job: impl Future<Output = ()> + Send + 'static) -> Result<(), Overloaded> {
        let job = match self.sender.try_send(job.boxed()) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Task pool stopped, dropping job.");
                return Ok(());
            }
            Err(TrySendError::Full(job)) => job,
        };

        let permit = Arc::clone(&self.overflow).try_acquire_owned().map_err(|_| Overloaded)?;
        let sender = self.sender.clone();

        tokio::spawn(async move {
            if sender.send(job).await.is_err() {
                tracing::debug!("Task pool stopped, dropping job.");
            }
            drop(permit);
        });

        Ok(())
    }

    /// Stop the pool, waiting for every worker to complete its current job.
    ///
    /// Jobs still queued are dropped without being executed, and later submissions fail. Stopping an already stopped pool returns
    /// immediately, while concurrent calls wait for the first one to complete.
    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;

        if workers.is_empty() {
            return;
        }

        tracing::info!("Stopping {} workers...", workers.len());

        self.shutdown.send_replace(true);

        future::join_all(workers.drain(..).inspect(|worker| {
            tracing::debug!("Stopping worker {}...", worker.id);
        }))
        .await;

        let mut receiver = self.receiver.lock().await;
        receiver.close();

        let mut discarded = 0;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }

        tracing::info!("All workers have been stopped, {discarded} queued jobs discarded.");
    }

    /// Return `true` once the pool has been asked to stop.
    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: tokio::task::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>, mut shutdown: watch::Receiver<bool>) -> Worker {
        tracing::debug!("Starting worker {id}...");

        Worker {
            id,
            handle: tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        _ = shutdown.wait_for(|&stop| stop) => None,
                        job = async { receiver.lock().await.recv().await } => job,
                    };

                    match message {
                        Some(job) => {
                            tracing::debug!("Executing job on worker {id}...");

                            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                                tracing::error!("Job panicked on worker {id}.");
                            }
                        }
                        None => {
                            tracing::debug!("Shutting down worker {id}.");
                            break;
                        }
                    }
                }
            }),
        }
    }
}

impl Future for Worker {
    type Output = Result<(), tokio::task::JoinError>;

    #[inline]
    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use tokio::sync::{Notify, Semaphore};

    use super::*;

    #[test]
    fn test_task_child() {
        let task = Task::page_asset(42, "https://cdn.example/app.css", 1);

        let child = task.child("https://cdn.example/images/logo.png").unwrap();
        assert_eq!(child.depth(), 0);
        assert_eq!(child.session_id(), 42);
        assert!(!child.is_js());
        assert_eq!(child.url_context(), "https://cdn.example/app.css\n  -> https://cdn.example/images/logo.png");

        let grandchild = child.child("https://cdn.example/x.png");
        assert_eq!(grandchild, None);

        assert_eq!(task.depth(), 1);
    }

    #[test]
    fn test_task_cache_path() {
        let js = |session_id| Task {
            session_id,
            ..Task::js_file("http://a/x.js")
        };
        assert_eq!(js(1).cache_path(), js(2).cache_path());

        let asset = |session_id| Task::page_asset(session_id, "http://a/x.png", 5);
        assert_ne!(asset(1).cache_path(), asset(2).cache_path());
        assert_eq!(asset(1).cache_path(), asset(1).cache_path());
    }

    #[tokio::test(flavor = "multi_thread")]
    #[tracing_test::traced_test]
    async fn test_pool_executes_jobs() {
        let pool = Pool::start(NonZeroU8::new(3).unwrap(), 2, 0);
        let done = Arc::new(Semaphore::new(0));

        for _ in 0..10 {
            let done = Arc::clone(&done);
            pool.submit(async move { done.add_permits(1) }).await.unwrap();
        }

        let all = tokio::time::timeout(Duration::from_secs(5), done.acquire_many(10)).await;
        assert!(all.is_ok());

        pool.stop().await;
        assert!(logs_contain("All workers have been stopped"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_survives_panics() {
        let pool = Pool::start(NonZeroU8::new(1).unwrap(), 4, 0);
        let done = Arc::new(Notify::new());

        pool.submit(async { panic!("boom") }).await.unwrap();

        let notified = Arc::clone(&done);
        pool.submit(async move { notified.notify_one() }).await.unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(5), done.notified()).await.is_ok());

        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_stop() {
        let pool = Pool::start(NonZeroU8::new(1).unwrap(), 4, 0);

        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let executed = Arc::new(AtomicBool::new(false));

        {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            pool.submit(async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.store(true, Ordering::Release);
            })
            .await
            .unwrap();
        }

        started.notified().await;

        // queued behind the running job of the single worker
        {
            let executed = Arc::clone(&executed);
            pool.submit(async move { executed.store(true, Ordering::Release) }).await.unwrap();
        }

        pool.stop().await;

        // the running job is not cancelled, the queued one is discarded
        assert!(finished.load(Ordering::Acquire));
        assert!(!executed.load(Ordering::Acquire));
        assert!(pool.is_stopped());

        // idempotent
        tokio::time::timeout(Duration::from_secs(1), pool.stop()).await.unwrap();

        assert_eq!(pool.submit(async {}).await, Err(Closed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_backpressure() {
        let pool = Pool::start(NonZeroU8::new(1).unwrap(), 1, 0);
        let gate = Arc::new(Semaphore::new(0));

        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            pool.submit(async move {
                let _ = gate.acquire().await;
            })
            .await
            .unwrap();
        }

        // wait for the worker to pick up the first job, the second one then fills the queue
        tokio::time::sleep(Duration::from_millis(50)).await;

        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.submit(async {})).await;
        assert!(blocked.is_err(), "submission should wait for room in the queue");

        gate.add_permits(2);
        tokio::time::timeout(Duration::from_secs(5), pool.submit(async {})).await.unwrap().unwrap();

        pool.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_forget_overflow() {
        let pool = Pool::start(NonZeroU8::new(1).unwrap(), 1, 2);

        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        {
            let started = Arc::clone(&started);
            let gate = Arc::clone(&gate);
            pool.submit(async move {
                started.notify_one();
                gate.notified().await;
            })
            .await
            .unwrap();
        }

        started.notified().await;

        // one job in the queue, two waiting for room in the background
        let done = Arc::new(Semaphore::new(0));
        for _ in 0..3 {
            let done = Arc::clone(&done);
            assert_eq!(pool.forget(async move { done.add_permits(1) }), Ok(()));
        }

        assert_eq!(pool.forget(async {}), Err(Overloaded));

        gate.notify_one();

        let all = tokio::time::timeout(Duration::from_secs(5), done.acquire_many(3)).await;
        assert!(all.is_ok());

        // the overflow is released once its jobs reach the queue
        assert_eq!(pool.forget(async {}), Ok(()));

        pool.stop().await;

        assert_eq!(pool.forget(async {}), Ok(()));
    }
}
