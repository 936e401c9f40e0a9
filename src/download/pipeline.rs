// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Single-worker download pipeline.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

use super::types::{DownloadTask, PipelineStatus, TaskOutcome};
use crate::cache::CacheStore;
use crate::events::{CacheEvent, EventKind, EventLog};
use crate::remote::RemoteSource;
use crate::security::resilient_lock;
use crate::types::{VideoDescriptor, VideoId};

/// Maximum number of tasks waiting behind the active download.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// State shared by the handle and the worker.
struct Shared {
    /// Queued and active video ids.
    pending: Mutex<HashSet<VideoId>>,
    status_tx: watch::Sender<PipelineStatus>,
}

impl Shared {
    fn release(&self, video_id: VideoId) {
        resilient_lock(&self.pending).remove(&video_id);
    }
}

/// Handle to the background download worker.
///
/// Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct DownloadPipeline {
    tx: mpsc::Sender<DownloadTask>,
    shared: Arc<Shared>,
    store: Arc<CacheStore>,
    events: Arc<dyn EventLog>,
    status_rx: watch::Receiver<PipelineStatus>,
}

impl std::fmt::Debug for DownloadPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadPipeline")
            .field("status", &*self.status_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl DownloadPipeline {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(store: Arc<CacheStore>, source: Arc<dyn RemoteSource>, events: Arc<dyn EventLog>) -> Self {
        Self::start_with_queue_capacity(store, source, events, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn start_with_queue_capacity(
        store: Arc<CacheStore>,
        source: Arc<dyn RemoteSource>,
        events: Arc<dyn EventLog>,
        queue_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(PipelineStatus::default());
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashSet::new()),
            status_tx,
        });

        let worker = Worker {
            store: store.clone(),
            source,
            events: events.clone(),
            shared: shared.clone(),
        };
        tokio::spawn(worker.run(rx));

        Self {
            tx,
            shared,
            store,
            events,
            status_rx,
        }
    }

    /// Submit a video for background caching without waiting.
    ///
    /// Returns whether a task was queued. Nothing is queued when caching is
    /// disabled, the size is unknown or larger than the whole cache, the
    /// video is already cached, or it is already queued or downloading.
    pub fn enqueue(&self, video: &VideoDescriptor) -> bool {
        let capacity = self.store.capacity_bytes();
        if capacity == 0 || video.size_bytes == 0 || video.size_bytes > capacity {
            tracing::debug!(video_id = %video.id, size_bytes = video.size_bytes, "Not eligible for caching");
            return false;
        }

        {
            // The worker commits before it releases, so under this guard a
            // video is either still pending or already a hit.
            let mut pending = resilient_lock(&self.shared.pending);
            if pending.contains(&video.id) {
                tracing::debug!(video_id = %video.id, "Already queued or downloading");
                return false;
            }
            if self.store.lookup(video.id).is_some() {
                return false;
            }
            pending.insert(video.id);
        }

        // Counted before the send so the worker never sees a task it cannot account for.
        self.shared.status_tx.send_modify(|s| s.queued += 1);
        let task = DownloadTask::new(video.clone(), self.store.target_path(video));
        match self.tx.try_send(task) {
            Ok(()) => {
                tracing::debug!(video_id = %video.id, "Queued for caching");
                true
            }
            Err(TrySendError::Full(task)) => {
                self.shared.release(task.video_id);
                self.shared.status_tx.send_modify(|s| {
                    s.queued = s.queued.saturating_sub(1);
                    s.dropped += 1;
                });
                self.events.record(CacheEvent::for_video(
                    EventKind::QueueFull,
                    task.video_id,
                    format!("Download queue full, dropped video {}", task.video_id),
                ));
                false
            }
            Err(TrySendError::Closed(task)) => {
                self.shared.release(task.video_id);
                self.shared.status_tx.send_modify(|s| s.queued = s.queued.saturating_sub(1));
                tracing::warn!(video_id = %task.video_id, "Download worker has stopped");
                false
            }
        }
    }

    /// Whether a video is queued or downloading.
    pub fn is_pending(&self, video_id: VideoId) -> bool {
        resilient_lock(&self.shared.pending).contains(&video_id)
    }

    /// Current counters.
    pub fn status(&self) -> PipelineStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver notified after every status change.
    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status_rx.clone()
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) -> PipelineStatus {
        let mut rx = self.subscribe();
        loop {
            if rx.borrow_and_update().is_idle() {
                return rx.borrow().clone();
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

struct Worker {
    store: Arc<CacheStore>,
    source: Arc<dyn RemoteSource>,
    events: Arc<dyn EventLog>,
    shared: Arc<Shared>,
}

impl Worker {
    /// Process tasks one at a time until every handle is dropped.
    async fn run(self, mut rx: mpsc::Receiver<DownloadTask>) {
        while let Some(task) = rx.recv().await {
            let video_id = task.video_id;
            self.shared.status_tx.send_modify(|s| {
                s.queued = s.queued.saturating_sub(1);
                s.active = Some(video_id);
            });

            let outcome = self.process(&task).await;

            self.shared.release(video_id);
            self.shared.status_tx.send_modify(|s| {
                s.active = None;
                match outcome {
                    Ok(TaskOutcome::Cached) => s.succeeded += 1,
                    Ok(TaskOutcome::Skipped) => s.skipped += 1,
                    Err(_) => s.failed += 1,
                }
            });
        }
        tracing::debug!("Download worker exiting");
    }

    async fn process(&self, task: &DownloadTask) -> Result<TaskOutcome> {
        let video_id = task.video_id;

        if self.store.is_cached(video_id) {
            tracing::debug!(video_id = %video_id, "Already cached, nothing to download");
            return Ok(TaskOutcome::Skipped);
        }

        if !self.store.admit(video_id, task.expected_size_bytes) {
            self.events.record(CacheEvent::for_video(
                EventKind::AdmissionRefused,
                video_id,
                format!("Skip cache video {}: not enough space", video_id),
            ));
            return Ok(TaskOutcome::Skipped);
        }

        if let Err(e) = self
            .store
            .begin_write(video_id, &task.target_path, task.expected_size_bytes)
        {
            self.fail(task, &anyhow::Error::new(e)).await;
            bail!("could not record download intent for video {}", video_id);
        }
        self.events.record(CacheEvent::for_video(
            EventKind::DownloadStarted,
            video_id,
            format!("Start caching video {}", video_id),
        ));

        match self.store_file(task).await {
            Ok(written) => {
                self.events.record(CacheEvent::for_video(
                    EventKind::DownloadSucceeded,
                    video_id,
                    format!("Cached video {} ({} bytes)", video_id, written),
                ));
                Ok(TaskOutcome::Cached)
            }
            Err(e) => {
                self.fail(task, &e).await;
                Err(e)
            }
        }
    }

    /// Download, move into place and commit. Returns the committed size.
    async fn store_file(&self, task: &DownloadTask) -> Result<u64> {
        let written = self.transfer(task).await?;
        tokio::fs::rename(task.temp_path(), &task.target_path)
            .await
            .with_context(|| format!("Failed to move {:?} into place", task.target_path))?;
        if let Err(e) = self.store.commit(task.video_id, written, &task.target_path) {
            remove_quietly(&task.target_path).await;
            return Err(e.into());
        }
        Ok(written)
    }

    /// Stream the whole file into the temp path. Returns bytes written.
    async fn transfer(&self, task: &DownloadTask) -> Result<u64> {
        let upstream = self
            .source
            .open_file(&task.descriptor.remote_ref, None)
            .await
            .context("upstream open failed")?;
        if !upstream.is_success() {
            bail!("upstream answered HTTP {}", upstream.status);
        }

        let temp_path = task.temp_path();
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create {:?}", temp_path))?;

        let mut written = 0u64;
        let mut body = upstream.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("upstream stream error")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {:?}", temp_path))?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if written != task.expected_size_bytes {
            bail!(
                "expected {} bytes, received {}",
                task.expected_size_bytes,
                written
            );
        }
        Ok(written)
    }

    async fn fail(&self, task: &DownloadTask, error: &anyhow::Error) {
        remove_quietly(&task.temp_path()).await;
        self.store.abort_write(task.video_id);
        self.events.record(CacheEvent::for_video(
            EventKind::DownloadFailed,
            task.video_id,
            format!("Cache failed for video {}: {:#}", task.video_id, error),
        ));
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::remote::{DirEntry, RemoteError, RemoteStream};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    /// In-memory source. Files can be truncated or fail mid-stream.
    #[derive(Default)]
    struct FakeSource {
        files: HashMap<String, Vec<u8>>,
        opens: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
        truncate: bool,
        fail_mid_stream: bool,
        status: Option<u16>,
    }

    impl FakeSource {
        fn with_file(mut self, path: &str, len: usize) -> Self {
            self.files.insert(path.to_string(), vec![7u8; len]);
            self
        }
    }

    #[async_trait]
    impl RemoteSource for FakeSource {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn list_directory(&self, _path: &str) -> Result<Vec<DirEntry>, RemoteError> {
            Ok(Vec::new())
        }

        async fn open_file(&self, remote_ref: &str, _range: Option<&str>) -> Result<RemoteStream, RemoteError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate closed").forget();
            }
            let mut data = self
                .files
                .get(remote_ref)
                .cloned()
                .ok_or(RemoteError::Status(404))?;
            if self.truncate {
                data.truncate(data.len() / 2);
            }
            let mut chunks: Vec<Result<Bytes, RemoteError>> =
                data.chunks(64).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
            if self.fail_mid_stream {
                chunks.truncate(1);
                chunks.push(Err(RemoteError::Io(std::io::Error::new(
                    ErrorKind::ConnectionReset,
                    "connection reset",
                ))));
            }
            Ok(RemoteStream {
                status: self.status.unwrap_or(200),
                content_type: None,
                content_range: None,
                content_length: Some(data.len() as u64),
                accept_ranges: None,
                body: futures_util::stream::iter(chunks).boxed(),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<CacheStore>,
        events: Arc<MemoryEventLog>,
        source: Arc<FakeSource>,
        pipeline: DownloadPipeline,
    }

    fn fixture(capacity: u64, source: FakeSource) -> Fixture {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let events = Arc::new(MemoryEventLog::default());
        let store = Arc::new(CacheStore::open(dir.path(), capacity, events.clone()).expect("open store"));
        let source = Arc::new(source);
        let pipeline = DownloadPipeline::start(store.clone(), source.clone(), events.clone());
        Fixture {
            _dir: dir,
            store,
            events,
            source,
            pipeline,
        }
    }

    fn video(id: u64, size: u64) -> VideoDescriptor {
        VideoDescriptor::new(id, 1, format!("{} - Clip.mp4", id), format!("/v/{}.mp4", id), size)
    }

    #[tokio::test]
    async fn test_download_commits_file() {
        let f = fixture(10_000, FakeSource::default().with_file("/v/1.mp4", 500));
        assert!(f.pipeline.enqueue(&video(1, 500)));
        let status = f.pipeline.wait_idle().await;

        assert_eq!(status.succeeded, 1);
        let path = f.store.lookup(VideoId(1)).expect("cached");
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), 500);
        assert!(!crate::cache::part_path(&path).exists());
        assert_eq!(f.events.count(EventKind::DownloadStarted), 1);
        assert_eq!(f.events.count(EventKind::DownloadSucceeded), 1);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_while_in_flight() {
        let gate = Arc::new(Semaphore::new(0));
        let source = FakeSource {
            gate: Some(gate.clone()),
            ..FakeSource::default().with_file("/v/1.mp4", 100)
        };
        let f = fixture(10_000, source);

        assert!(f.pipeline.enqueue(&video(1, 100)));
        assert!(!f.pipeline.enqueue(&video(1, 100)));
        assert!(f.pipeline.is_pending(VideoId(1)));

        gate.add_permits(1);
        f.pipeline.wait_idle().await;
        assert!(!f.pipeline.enqueue(&video(1, 100)), "already cached");
        assert_eq!(f.source.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ineligible_videos_are_not_queued() {
        let f = fixture(1_000, FakeSource::default());
        assert!(!f.pipeline.enqueue(&video(1, 0)));
        assert!(!f.pipeline.enqueue(&video(2, 1_001)));
        assert_eq!(f.pipeline.status(), PipelineStatus::default());
    }

    #[tokio::test]
    async fn test_zero_capacity_disables_caching() {
        let f = fixture(0, FakeSource::default().with_file("/v/1.mp4", 10));
        assert!(!f.pipeline.enqueue(&video(1, 10)));
    }

    #[tokio::test]
    async fn test_truncated_transfer_leaves_nothing() {
        let source = FakeSource {
            truncate: true,
            ..FakeSource::default().with_file("/v/1.mp4", 400)
        };
        let f = fixture(10_000, source);
        f.pipeline.enqueue(&video(1, 400));
        let status = f.pipeline.wait_idle().await;

        assert_eq!(status.failed, 1);
        assert!(f.store.entry(VideoId(1)).is_none());
        assert!(!f.store.dir().join("1.mp4").exists());
        assert!(!f.store.dir().join("1.mp4.part").exists());
        let failures = f.events.of_kind(EventKind::DownloadFailed);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.starts_with("Cache failed for video 1"));
    }

    #[tokio::test]
    async fn test_stream_error_and_queue_continues() {
        let source = FakeSource {
            fail_mid_stream: true,
            ..FakeSource::default()
                .with_file("/v/1.mp4", 300)
                .with_file("/v/2.mp4", 300)
        };
        let f = fixture(10_000, source);
        f.pipeline.enqueue(&video(1, 300));
        f.pipeline.enqueue(&video(2, 300));
        let status = f.pipeline.wait_idle().await;

        assert_eq!(status.failed, 2);
        assert_eq!(f.source.opens.load(Ordering::SeqCst), 2);
        assert!(!f.store.dir().join("1.mp4.part").exists());
        assert!(!f.pipeline.is_pending(VideoId(1)));
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_failure() {
        let source = FakeSource {
            status: Some(500),
            ..FakeSource::default().with_file("/v/1.mp4", 10)
        };
        let f = fixture(10_000, source);
        f.pipeline.enqueue(&video(1, 10));
        let status = f.pipeline.wait_idle().await;
        assert_eq!(status.failed, 1);
        assert!(f.store.lookup(VideoId(1)).is_none());
    }

    #[tokio::test]
    async fn test_later_download_evicts_older_one() {
        let source = FakeSource::default()
            .with_file("/v/1.mp4", 600)
            .with_file("/v/2.mp4", 600);
        let f = fixture(1_000, source);

        f.pipeline.enqueue(&video(1, 600));
        f.pipeline.wait_idle().await;
        f.pipeline.enqueue(&video(2, 600));
        let status = f.pipeline.wait_idle().await;

        assert_eq!(status.succeeded, 2);
        assert_eq!(f.events.count(EventKind::Evicted), 1);
        assert!(f.store.lookup(VideoId(1)).is_none());
        assert!(f.store.lookup(VideoId(2)).is_some());
        assert_eq!(f.store.total_bytes(), 600);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_records() {
        let gate = Arc::new(Semaphore::new(0));
        let source = FakeSource {
            gate: Some(gate.clone()),
            ..FakeSource::default()
                .with_file("/v/1.mp4", 10)
                .with_file("/v/2.mp4", 10)
                .with_file("/v/3.mp4", 10)
        };
        let dir = TempDir::new().expect("Failed to create temp dir");
        let events = Arc::new(MemoryEventLog::default());
        let store = Arc::new(CacheStore::open(dir.path(), 10_000, events.clone()).expect("open"));
        let pipeline = DownloadPipeline::start_with_queue_capacity(store, Arc::new(source), events.clone(), 1);

        assert!(pipeline.enqueue(&video(1, 10)));
        // Let the worker pick up video 1 so the channel slot frees.
        let mut rx = pipeline.subscribe();
        while rx.borrow_and_update().active.is_none() {
            rx.changed().await.expect("worker alive");
        }
        assert!(pipeline.enqueue(&video(2, 10)));
        assert!(!pipeline.enqueue(&video(3, 10)));
        assert!(!pipeline.is_pending(VideoId(3)));
        assert_eq!(events.count(EventKind::QueueFull), 1);
        assert_eq!(pipeline.status().dropped, 1);

        gate.add_permits(2);
        let status = pipeline.wait_idle().await;
        assert_eq!(status.succeeded, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueue_downloads_once() {
        for round in 0..50 {
            let f = fixture(10_000, FakeSource::default().with_file("/v/1.mp4", 100));
            assert!(f.pipeline.enqueue(&video(1, 100)));

            let submitters: Vec<_> = (0..3)
                .map(|_| {
                    let pipeline = f.pipeline.clone();
                    tokio::spawn(async move {
                        for _ in 0..200 {
                            pipeline.enqueue(&video(1, 100));
                            tokio::task::yield_now().await;
                        }
                    })
                })
                .collect();
            for submitter in submitters {
                submitter.await.expect("submitter panicked");
            }
            let status = f.pipeline.wait_idle().await;

            assert_eq!(f.source.opens.load(Ordering::SeqCst), 1, "round {}", round);
            assert_eq!(status.failed, 0);
            assert!(f.store.lookup(VideoId(1)).is_some(), "round {}", round);
        }
    }

    /// Worker fed straight through its channel, without `enqueue`'s checks.
    fn bare_worker(
        store: Arc<CacheStore>,
        source: Arc<FakeSource>,
        events: Arc<MemoryEventLog>,
    ) -> (mpsc::Sender<DownloadTask>, watch::Receiver<PipelineStatus>) {
        let (tx, rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(PipelineStatus::default());
        let worker = Worker {
            store,
            source,
            events,
            shared: Arc::new(Shared {
                pending: Mutex::new(HashSet::new()),
                status_tx,
            }),
        };
        tokio::spawn(worker.run(rx));
        (tx, status_rx)
    }

    async fn wait_completed(rx: &mut watch::Receiver<PipelineStatus>, count: u64) -> PipelineStatus {
        loop {
            {
                let status = rx.borrow_and_update();
                if status.completed() >= count && status.active.is_none() {
                    return status.clone();
                }
            }
            rx.changed().await.expect("worker alive");
        }
    }

    async fn submit(tx: &mpsc::Sender<DownloadTask>, store: &CacheStore, video: VideoDescriptor) {
        let target = store.target_path(&video);
        tx.send(DownloadTask::new(video, target)).await.expect("worker alive");
    }

    #[tokio::test]
    async fn test_refused_admission_is_skipped_and_queue_continues() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let events = Arc::new(MemoryEventLog::default());
        let store = Arc::new(CacheStore::open(dir.path(), 1_000, events.clone()).expect("open"));
        let source = Arc::new(
            FakeSource::default()
                .with_file("/v/1.mp4", 5_000)
                .with_file("/v/2.mp4", 100),
        );
        let (tx, mut status_rx) = bare_worker(store.clone(), source.clone(), events.clone());

        submit(&tx, &store, video(1, 5_000)).await;
        submit(&tx, &store, video(2, 100)).await;
        let status = wait_completed(&mut status_rx, 2).await;

        assert_eq!(status.skipped, 1);
        assert_eq!(status.succeeded, 1);
        assert_eq!(status.failed, 0);
        assert_eq!(events.count(EventKind::AdmissionRefused), 1);
        assert!(store.entry(VideoId(1)).is_none());
        assert!(!store.dir().join("1.mp4").exists());
        assert!(!store.dir().join("1.mp4.part").exists());
        // Only the admitted video reached the source.
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
        assert!(store.lookup(VideoId(2)).is_some());
    }

    #[tokio::test]
    async fn test_worker_skips_video_cached_while_queued() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let events = Arc::new(MemoryEventLog::default());
        let store = Arc::new(CacheStore::open(dir.path(), 1_000, events.clone()).expect("open"));
        let source = Arc::new(FakeSource::default().with_file("/v/1.mp4", 100));
        let (tx, mut status_rx) = bare_worker(store.clone(), source.clone(), events.clone());

        submit(&tx, &store, video(1, 100)).await;
        submit(&tx, &store, video(1, 100)).await;
        let status = wait_completed(&mut status_rx, 2).await;

        assert_eq!(status.succeeded, 1);
        assert_eq!(status.skipped, 1);
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
        assert_eq!(events.count(EventKind::DownloadStarted), 1);
        assert!(store.entry(VideoId(1)).expect("entry").completed);
    }
}
