//! This module provides the channel failures are reported through.
//!
//! Producers never block: the channel buffers up to a fixed number of reports and, once full, drops the oldest one to make room
//! for the newest, counting every dropped report. A slow or absent consumer thus costs reports, never throughput.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, Stream};
use tokio::sync::Notify;

use crate::error::Report;

/// Create a reporting channel buffering at most `capacity` reports.
///
/// # Panics
/// This function panics if `capacity` is zero.
pub fn channel(capacity: usize) -> (ErrorSink, ErrorStream) {
    assert!(capacity > 0, "reporting channel capacity must be positive");

    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        capacity,
        notify: Notify::new(),
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    });

    (ErrorSink { shared: Arc::clone(&shared) }, ErrorStream { shared })
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<VecDeque<Report>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// The producing half of a reporting channel.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    shared: Arc<Shared>,
}

impl ErrorSink {
    /// Push a report without ever waiting on the consumer.
    pub fn report(&self, report: Report) {
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Reporting channel closed, dropping report: {report}");
            return;
        }

        let evicted = {
            let mut queue = self.shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if queue.len() >= self.shared.capacity { queue.pop_front() } else { None };
            queue.push_back(report);
            evicted
        };

        if let Some(evicted) = evicted {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Reporting channel full, dropping oldest report: {evicted}");
        }

        // a permit is stored if the consumer is not waiting yet
        self.shared.notify.notify_one();
    }

    /// Close the channel: subsequent reports are dropped and the consumer ends once the buffer is drained.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// The consuming half of a reporting channel.
#[derive(Debug)]
pub struct ErrorStream {
    shared: Arc<Shared>,
}

impl ErrorStream {
    /// Wait for the next report.
    ///
    /// Return `None` once the channel is closed and every buffered report has been received.
    pub async fn recv(&mut self) -> Option<Report> {
        loop {
            if let Some(report) = self.try_recv() {
                return Some(report);
            }

            if self.shared.closed.load(Ordering::Acquire) {
                // a report may have been pushed right before closing
                return self.try_recv();
            }

            self.shared.notify.notified().await;
        }
    }

    /// Take the next buffered report, if any.
    pub fn try_recv(&mut self) -> Option<Report> {
        self.shared.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    /// Number of reports dropped so far, either evicted by newer ones or reported after closing.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Turn this receiver into a [`Stream`] of reports.
    pub fn into_stream(self) -> impl Stream<Item = Report> + Send + Unpin + 'static {
        Box::pin(stream::unfold(self, |mut errors| async move {
            let report = errors.recv().await?;
            Some((report, errors))
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::error::Error;

    fn report(context: &str) -> Report {
        Report::new(context, Error::RecursionDepthExceeded)
    }

    #[tokio::test]
    async fn test_drop_oldest() {
        let (sink, mut errors) = channel(2);

        sink.report(report("a"));
        sink.report(report("b"));
        sink.report(report("c"));

        assert_eq!(errors.dropped(), 1);
        assert_eq!(errors.recv().await.unwrap().context, "b");
        assert_eq!(errors.recv().await.unwrap().context, "c");
        assert!(errors.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_report_never_blocks_without_consumer() {
        let (sink, errors) = channel(8);

        let reported = tokio::time::timeout(Duration::from_secs(1), async {
            for i in 0..10_000 {
                sink.report(report(&i.to_string()));
            }
        })
        .await;

        assert!(reported.is_ok());
        assert_eq!(errors.dropped(), 10_000 - 8);
    }

    #[tokio::test]
    async fn test_recv_waits_for_report() {
        let (sink, mut errors) = channel(4);

        let consumer = tokio::spawn(async move { errors.recv().await.map(|report| report.context) });

        tokio::task::yield_now().await;
        sink.report(report("https://cdn.example/app.css"));

        assert_eq!(consumer.await.unwrap().as_deref(), Some("https://cdn.example/app.css"));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let (sink, errors) = channel(4);

        sink.report(report("a"));
        sink.close();
        sink.report(report("b"));

        let contexts: Vec<_> = errors.into_stream().map(|report| report.context).collect().await;

        assert_eq!(contexts, ["a"]);
        assert_eq!(sink.dropped(), 1);
    }
}
