//! Download scheduling: the ordered work queue, per-video cancellation,
//! and the range-limited segment fetcher.
//!
//! The worker loop itself lives in [`crate::engine`], because completing a
//! download mutates per-video state that the engine owns; this module
//! provides the pieces the workers pull from.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DownloadConfig;
use crate::error::{Error, Result};
use crate::store::SegmentKey;
use crate::video::{Priority, VideoId};

/// One queued unit of work.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub key: SegmentKey,
    pub priority: Priority,
    /// Number of failed attempts so far.
    pub attempt: u32,
}

impl DownloadTask {
    pub fn new(key: SegmentKey, priority: Priority) -> Self {
        Self {
            key,
            priority,
            attempt: 0,
        }
    }
}

/// Single ordered work queue shared by all workers.
///
/// `Urgent` tasks are inserted at the front, everything else appends;
/// relative order within a priority is preserved. A second push for a key
/// already queued is dropped, unless it carries a more urgent priority, in
/// which case the queued task is re-queued under the new priority instead
/// of being duplicated.
pub struct WorkQueue {
    tasks: Mutex<VecDeque<DownloadTask>>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn place(tasks: &mut VecDeque<DownloadTask>, task: DownloadTask) {
        if task.priority == Priority::Urgent {
            tasks.push_front(task);
        } else {
            tasks.push_back(task);
        }
    }

    /// Queue a task. Returns `false` if it was dropped (or merged) as a
    /// duplicate.
    pub fn push(&self, task: DownloadTask) -> bool {
        let mut tasks = self.tasks.lock();

        if let Some(pos) = tasks.iter().position(|t| t.key == task.key) {
            if task.priority < tasks[pos].priority {
                // Promotion: re-queue under the new priority, keeping the
                // original attempt count.
                let mut existing = tasks.remove(pos).expect("position is in range");
                debug!(
                    key = %existing.key,
                    from = %existing.priority,
                    to = %task.priority,
                    "Promoting queued download"
                );
                existing.priority = task.priority;
                Self::place(&mut tasks, existing);
            }
            return false;
        }

        Self::place(&mut tasks, task);
        drop(tasks);
        self.notify.notify_one();
        true
    }

    /// Wait for and take the frontmost task.
    pub async fn pop(&self) -> DownloadTask {
        loop {
            if let Some(task) = self.tasks.lock().pop_front() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    /// Take the frontmost task if one is queued.
    pub fn try_pop(&self) -> Option<DownloadTask> {
        self.tasks.lock().pop_front()
    }

    /// Drop queued tasks whose video is not in `keep`. Returns how many
    /// were removed.
    pub fn retain_videos(&self, keep: &HashSet<VideoId>) -> usize {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|t| keep.contains(&t.key.video));
        before - tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Ordered snapshot of queued keys, for tests and diagnostics.
    pub fn snapshot(&self) -> Vec<DownloadTask> {
        self.tasks.lock().iter().cloned().collect()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Work queue plus per-video cancellation tokens.
pub struct DownloadScheduler {
    queue: Arc<WorkQueue>,
    tokens: DashMap<VideoId, CancellationToken>,
    root: CancellationToken,
}

impl DownloadScheduler {
    /// `root` is the engine's shutdown token; per-video tokens are children
    /// of it so shutdown aborts every in-flight fetch.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new()),
            tokens: DashMap::new(),
            root,
        }
    }

    /// Queue a segment download. Duplicate requests for an already queued
    /// key are merged (see [`WorkQueue::push`]).
    pub fn enqueue(&self, video: VideoId, index: u32, priority: Priority) -> bool {
        self.queue
            .push(DownloadTask::new(SegmentKey::new(video, index), priority))
    }

    /// Re-queue a retry task, preserving its attempt count.
    pub fn requeue(&self, task: DownloadTask) -> bool {
        self.queue.push(task)
    }

    /// Wait for the next task.
    pub async fn next_task(&self) -> DownloadTask {
        self.queue.pop().await
    }

    /// Remove queued tasks for videos outside `keep` and signal their
    /// in-flight fetches to abort cooperatively. Idempotent: repeating the
    /// call with the same set is a no-op.
    pub fn cancel_all_except(&self, keep: &HashSet<VideoId>) {
        let removed = self.queue.retain_videos(keep);

        let mut cancelled = 0usize;
        self.tokens.retain(|id, token| {
            if keep.contains(id) {
                true
            } else {
                token.cancel();
                cancelled += 1;
                false
            }
        });

        if removed > 0 || cancelled > 0 {
            debug!(removed, cancelled, "Cancelled work outside the active plan");
        }
    }

    /// Cancellation token governing fetches for one video.
    pub fn video_token(&self, id: &VideoId) -> CancellationToken {
        self.tokens
            .entry(id.clone())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Ordered snapshot of the queue, for tests and diagnostics.
    pub fn queued(&self) -> Vec<DownloadTask> {
        self.queue.snapshot()
    }
}

/// Performs the actual range-limited segment fetches.
pub struct SegmentFetcher {
    client: reqwest::Client,
    config: DownloadConfig,
}

impl SegmentFetcher {
    pub fn new(config: DownloadConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Fetch one segment.
    ///
    /// Returns `Ok(None)` if the fetch was cancelled; partial data from a
    /// cancelled fetch is discarded, never cached. The timeout depends on
    /// the task's priority and counts as a retryable network failure.
    pub async fn fetch(
        &self,
        url: &str,
        expected_size: Option<u64>,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        let timeout = self.config.fetch_timeout(priority);

        let request = {
            let mut builder = self.client.get(url);
            // A declared size of 0 has no valid byte range; fetch plain
            // and let the size check handle the degenerate body.
            if let Some(size) = expected_size.filter(|s| *s > 0) {
                builder = builder.header(reqwest::header::RANGE, format!("bytes=0-{}", size - 1));
            }
            builder
        };

        let fetch = async {
            let response = request
                .send()
                .await
                .map_err(|e| Error::network(format!("GET {url}: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::network(format!("HTTP {status} from {url}")));
            }

            let data = response
                .bytes()
                .await
                .map_err(|e| Error::network(format!("Reading body of {url}: {e}")))?;

            if let Some(expected) = expected_size {
                if data.len() as u64 != expected {
                    return Err(Error::SizeMismatch {
                        expected,
                        actual: data.len() as u64,
                    });
                }
            }

            Ok(data)
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            outcome = tokio::time::timeout(timeout, fetch) => outcome,
        };

        match outcome {
            Err(_) => Err(Error::network(format!(
                "GET {url} timed out after {}s",
                timeout.as_secs()
            ))),
            Ok(result) => result.map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn key(video: &str, index: u32) -> SegmentKey {
        SegmentKey::new(VideoId::new(video), index)
    }

    fn scheduler() -> DownloadScheduler {
        DownloadScheduler::new(CancellationToken::new())
    }

    // -- WorkQueue ----------------------------------------------------------

    #[test]
    fn urgent_jumps_the_queue() {
        let q = WorkQueue::new();
        q.push(DownloadTask::new(key("a", 0), Priority::High));
        q.push(DownloadTask::new(key("a", 1), Priority::Normal));
        q.push(DownloadTask::new(key("b", 0), Priority::Urgent));

        let order: Vec<SegmentKey> = q.snapshot().into_iter().map(|t| t.key).collect();
        assert_eq!(order, vec![key("b", 0), key("a", 0), key("a", 1)]);
    }

    #[test]
    fn same_priority_preserves_fifo_order() {
        let q = WorkQueue::new();
        for i in 0..4 {
            q.push(DownloadTask::new(key("a", i), Priority::High));
        }
        let order: Vec<u32> = q.snapshot().into_iter().map(|t| t.key.index).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn duplicate_push_is_dropped() {
        let q = WorkQueue::new();
        assert!(q.push(DownloadTask::new(key("a", 0), Priority::Normal)));
        assert!(!q.push(DownloadTask::new(key("a", 0), Priority::Normal)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn duplicate_with_higher_priority_promotes() {
        let q = WorkQueue::new();
        q.push(DownloadTask::new(key("a", 3), Priority::Normal));
        q.push(DownloadTask::new(key("b", 0), Priority::Normal));

        // Scroll advanced: a#3 is now high priority. It must not be
        // duplicated, just re-queued under the new priority.
        assert!(!q.push(DownloadTask::new(key("a", 3), Priority::High)));

        let tasks = q.snapshot();
        assert_eq!(tasks.len(), 2);
        let promoted = tasks.iter().find(|t| t.key == key("a", 3)).unwrap();
        assert_eq!(promoted.priority, Priority::High);
    }

    #[test]
    fn lower_priority_duplicate_does_not_demote() {
        let q = WorkQueue::new();
        q.push(DownloadTask::new(key("a", 0), Priority::Urgent));
        q.push(DownloadTask::new(key("a", 0), Priority::Normal));

        let tasks = q.snapshot();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, Priority::Urgent);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let q = Arc::new(WorkQueue::new());
        let q2 = Arc::clone(&q);

        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(DownloadTask::new(key("a", 0), Priority::Normal));

        let task = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.key, key("a", 0));
    }

    // -- DownloadScheduler --------------------------------------------------

    #[test]
    fn cancel_all_except_drops_other_videos() {
        let s = scheduler();
        s.enqueue(VideoId::new("keep"), 0, Priority::High);
        s.enqueue(VideoId::new("drop"), 0, Priority::High);
        s.enqueue(VideoId::new("drop"), 1, Priority::Normal);

        let keep = HashSet::from([VideoId::new("keep")]);
        s.cancel_all_except(&keep);

        let remaining: Vec<SegmentKey> = s.queued().into_iter().map(|t| t.key).collect();
        assert_eq!(remaining, vec![key("keep", 0)]);
    }

    #[test]
    fn cancel_all_except_is_idempotent() {
        let s = scheduler();
        s.enqueue(VideoId::new("keep"), 0, Priority::High);
        s.enqueue(VideoId::new("drop"), 0, Priority::High);
        let drop_token = s.video_token(&VideoId::new("drop"));

        let keep = HashSet::from([VideoId::new("keep")]);
        s.cancel_all_except(&keep);
        let after_first: Vec<SegmentKey> = s.queued().into_iter().map(|t| t.key).collect();

        s.cancel_all_except(&keep);
        let after_second: Vec<SegmentKey> = s.queued().into_iter().map(|t| t.key).collect();

        assert_eq!(after_first, after_second);
        assert!(drop_token.is_cancelled());
    }

    #[test]
    fn cancel_signals_in_flight_tokens() {
        let s = scheduler();
        let kept = s.video_token(&VideoId::new("keep"));
        let dropped = s.video_token(&VideoId::new("drop"));

        s.cancel_all_except(&HashSet::from([VideoId::new("keep")]));

        assert!(!kept.is_cancelled());
        assert!(dropped.is_cancelled());
    }

    #[test]
    fn root_cancellation_reaches_video_tokens() {
        let root = CancellationToken::new();
        let s = DownloadScheduler::new(root.clone());
        let token = s.video_token(&VideoId::new("v1"));

        root.cancel();
        assert!(token.is_cancelled());
    }

    // -- SegmentFetcher -----------------------------------------------------

    fn fetcher() -> SegmentFetcher {
        SegmentFetcher::new(DownloadConfig {
            urgent_timeout_secs: 2,
            high_timeout_secs: 2,
            normal_timeout_secs: 2,
            ..DownloadConfig::default()
        })
    }

    #[tokio::test]
    async fn fetch_sends_range_header_for_known_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/seg0.m4s"))
            .and(header("range", "bytes=0-4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;

        let url = format!("{}/seg0.m4s", server.uri());
        let data = fetcher()
            .fetch(&url, Some(5), Priority::Urgent, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn zero_declared_size_fetches_without_a_range_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/seg0.m4s"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let url = format!("{}/seg0.m4s", server.uri());
        let data = fetcher()
            .fetch(&url, Some(0), Priority::Normal, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn fetch_detects_size_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"short".to_vec()))
            .mount(&server)
            .await;

        let url = format!("{}/seg0.m4s", server.uri());
        let err = fetcher()
            .fetch(&url, Some(100), Priority::High, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::SizeMismatch { expected: 100, actual: 5 });
    }

    #[tokio::test]
    async fn fetch_maps_http_error_to_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let url = format!("{}/seg0.m4s", server.uri());
        let err = fetcher()
            .fetch(&url, None, Priority::Normal, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Network(_));
    }

    #[tokio::test]
    async fn cancelled_fetch_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 64])
                    .set_delay(std::time::Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let url = format!("{}/seg0.m4s", server.uri());

        let fetcher = fetcher();
        let fetch = fetcher.fetch(&url, None, Priority::Normal, &cancel);
        tokio::pin!(fetch);

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => cancel.cancel(),
            _ = &mut fetch => panic!("fetch finished before cancellation"),
        }

        let outcome = fetch.await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn timeout_is_a_network_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 8])
                    .set_delay(std::time::Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let config = DownloadConfig {
            urgent_timeout_secs: 1,
            ..DownloadConfig::default()
        };
        let url = format!("{}/seg0.m4s", server.uri());
        let err = SegmentFetcher::new(config)
            .fetch(&url, None, Priority::Urgent, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Network(_));
        assert!(err.is_retryable());
    }
}
