//! This module provides the asset cacher, executing fetch-and-cache tasks on a pool of workers.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};

use crate::config::{Config, ConfigError};
use crate::download::Downloader;
use crate::error::{Error, Report};
use crate::metrics::{Counter, Metrics};
use crate::registry::TimeoutMap;
use crate::reporting::{self, ErrorSink, ErrorStream};
use crate::rewrite::{self, Rewriter};
use crate::storage::Storage;
use crate::task::{Closed, Overloaded, Pool, Task};

pub const DOWNLOADED_ASSETS: &str = "assets_downloaded";

/// How a task ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Another task is already caching, or recently cached, the same key.
    Deduplicated,
    /// The stored copy is recent enough.
    Fresh,
    /// Uploaded, with the number of child tasks submitted.
    Cached { children: usize },
}

/// Asset cacher.
///
/// Mirrors third-party assets to storage in the background: submitted tasks are executed by a bounded pool of workers, each one
/// fetching its asset, rewriting it if it is a stylesheet, uploading it, and submitting new tasks for the assets a stylesheet
/// references while the recursion budget allows it. Failures are reported to the [`ErrorStream`] returned on start.
///
/// Handles are cheap to clone and share the same pool.
///
/// # Example
/// ```no_run
/// # tokio_test::block_on(async {
/// # use std::sync::Arc;
/// # use asset_cacher::{Cacher, Config, FsStorage, Metrics};
/// let config = Config::from_env().unwrap();
/// let storage = Arc::new(FsStorage::new(&config.storage_dir));
///
/// let (cacher, mut errors) = Cacher::start(&config, storage, &Metrics::new()).unwrap();
///
/// tokio::spawn(async move {
///     while let Some(report) = errors.recv().await {
///         eprintln!("{report}");
///     }
/// });
///
/// cacher.cache_url(42, "https://cdn.example/app.css").await.unwrap();
/// cacher.cache_js_file("https://cdn.example/lib.js").await.unwrap();
///
/// // on a periodic timer
/// cacher.run_maintenance();
///
/// cacher.shutdown().await;
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct Cacher {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    registry: Arc<TimeoutMap>,
    storage: Arc<dyn Storage>,
    downloader: Downloader,
    rewriter: Rewriter,
    errors: ErrorSink,
    downloaded_assets: Counter,
    freshness_window: Duration,
    max_depth: u8,
    pool: Pool,
}

impl Cacher {
    /// Start a cacher and its pool of workers, with its own deduplication registry.
    ///
    /// # Panics
    /// This method panics if called outside of a Tokio runtime, or if the queue or error capacity is zero.
    pub fn start(config: &Config, storage: Arc<dyn Storage>, metrics: &Metrics) -> Result<(Self, ErrorStream), ConfigError> {
        let registry = Arc::new(TimeoutMap::new(config.dedup_timeout));

        Self::start_with_registry(config, storage, metrics, registry)
    }

    /// Start a cacher and its pool of workers, sharing the given deduplication registry.
    pub fn start_with_registry(
        config: &Config,
        storage: Arc<dyn Storage>,
        metrics: &Metrics,
        registry: Arc<TimeoutMap>,
    ) -> Result<(Self, ErrorStream), ConfigError> {
        let downloader = Downloader::new(config)?;
        let (errors, stream) = reporting::channel(config.error_capacity);

        let inner = Inner {
            registry,
            storage,
            downloader,
            rewriter: Rewriter::new(&config.assets_origin),
            errors,
            downloaded_assets: metrics.register_counter(DOWNLOADED_ASSETS),
            freshness_window: config.freshness_window,
            max_depth: config.max_depth,
            pool: Pool::start(config.pool_size, config.queue_capacity, config.overflow_capacity),
        };

        Ok((Self { inner: Arc::new(inner) }, stream))
    }

    /// Cache an asset of a session page, and the assets it references up to the maximum depth.
    ///
    /// Wait for room in the queue if it is full.
    pub async fn cache_url(&self, session_id: u64, full_url: &str) -> Result<(), Closed> {
        self.submit(Task::page_asset(session_id, full_url, self.inner.max_depth)).await
    }

    /// Cache a JS source file, shared by every session.
    ///
    /// Wait for room in the queue if it is full.
    pub async fn cache_js_file(&self, source_url: &str) -> Result<(), Closed> {
        self.submit(Task::js_file(source_url)).await
    }

    /// Submit any task, waiting for room in the queue if it is full.
    pub async fn submit(&self, task: Task) -> Result<(), Closed> {
        self.inner.pool.submit(Arc::clone(&self.inner).run(task)).await
    }

    /// Purge expired keys from the deduplication registry, to be called periodically.
    pub fn run_maintenance(&self) -> usize {
        self.inner.registry.purge_expired()
    }

    /// Stop the workers once their current task is complete, then close the error stream.
    ///
    /// Queued tasks are dropped. Calling it again returns immediately.
    pub async fn shutdown(&self) {
        self.inner.pool.stop().await;
        self.inner.errors.close();
    }

    /// Number of assets uploaded so far.
    #[inline]
    pub fn downloaded_assets(&self) -> u64 {
        self.inner.downloaded_assets.get()
    }

    #[inline]
    pub fn registry(&self) -> &TimeoutMap {
        &self.inner.registry
    }
}

impl Inner {
    /// Execute `task`, reporting its failure if any.
    fn run(self: Arc<Self>, task: Task) -> BoxFuture<'static, ()> {
        async move {
            tracing::debug!("Handle new task: {task:?}");

            match self.cache(&task).await {
                Ok(outcome) => tracing::debug!("Task for `{}` done: {outcome:?}", task.request_url()),
                Err(err) => self.errors.report(Report::new(task.url_context(), err)),
            }
        }
        .boxed()
    }

    async fn cache(self: &Arc<Self>, task: &Task) -> Result<Outcome, Error> {
        let cache_path = task.cache_path();

        // registered before any I/O so that concurrent duplicates all observe it
        if !self.registry.try_add(&cache_path) {
            return Ok(Outcome::Deduplicated);
        }

        if self.is_fresh(&cache_path).await {
            return Ok(Outcome::Fresh);
        }

        let asset = self.downloader.fetch(task.request_url()).await?;
        let is_css = asset.is_css();

        let css = is_css.then(|| String::from_utf8_lossy(&asset.body).into_owned());

        let content = match &css {
            Some(css) => Bytes::from(self.rewriter.rewrite_css(task.session_id(), task.request_url(), css)),
            None => asset.body.clone(),
        };

        self.storage.upload(content, &cache_path, &asset.content_type, true).await?;
        self.downloaded_assets.add(1);

        let Some(css) = css else {
            return Ok(Outcome::Cached { children: 0 });
        };

        if task.depth() == 0 {
            return Err(Error::RecursionDepthExceeded);
        }

        // references are resolved against the original stylesheet, not its rewritten copy
        let tasks: Vec<_> = rewrite::extract_urls(&css)
            .into_iter()
            .filter_map(|reference| rewrite::resolve_cachable_url(task.request_url(), reference))
            .filter_map(|url| task.child(url))
            .collect();

        let mut children = 0;
        let mut dropped = 0;
        for child in tasks {
            tracing::debug!("Submitting child task for `{}` (depth {})", child.request_url(), child.depth());

            match self.pool.forget(Arc::clone(self).run(child)) {
                Ok(()) => children += 1,
                Err(Overloaded) => dropped += 1,
            }
        }

        if dropped > 0 {
            tracing::warn!("Dropped {dropped} child tasks of `{}`, {children} submitted", task.request_url());
            return Err(Error::Overloaded { dropped });
        }

        Ok(Outcome::Cached { children })
    }

    /// Return `true` if the object stored under `cache_path` was created within the freshness window.
    async fn is_fresh(&self, cache_path: &str) -> bool {
        match self.storage.creation_time(cache_path).await {
            Ok(Some(created)) => SystemTime::now()
                .duration_since(created)
                .map_or(true, |age| age < self.freshness_window),
            Ok(None) => false,
            Err(err) => {
                tracing::warn!("Cannot get creation time of `{cache_path}`, assuming absent: {err}");
                false
            }
        }
    }
}
