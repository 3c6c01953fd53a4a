//! Watcher - キューのポーリングとワーカー実行のループ
//!
//! # フロー
//! 1. MessageSource::wait_for() で次のバッチを待つ
//! 2. 空なら次のループへ（volume には触らない）
//! 3. volume のパーミッションを 0o777 にする（バッチごとに 1 回）
//! 4. メッセージごとに Worker を起動（fan-out）
//! 5. 全 Worker の終了を待つ（fan-in）
//!
//! 停止は協調的です。stop はループの先頭でのみ確認するので、
//! 実行中のポーリングやバッチは最後まで走ります。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::builder::WatcherBuilder;
use crate::domain::{Message, WatcherOptions, WorkerOptions};
use crate::error::{WatchError, WorkerError};
use crate::ports::{FileSystem, MessageSource, OPEN_PERMISSIONS, WorkerFactory};

pub struct Watcher {
    pub(super) queue_url: String,
    pub(super) worker_options: Arc<WorkerOptions>,
    pub(super) batch_limit: usize,
    pub(super) poll_timeout: Duration,
    pub(super) messages: Arc<dyn MessageSource>,
    pub(super) workers: Arc<dyn WorkerFactory>,
    pub(super) file_system: Arc<dyn FileSystem>,
    pub(super) stop_tx: Arc<watch::Sender<bool>>,
    pub(super) listening: AtomicBool,
}

/// Clears the listening flag when `listen` returns, whatever the outcome.
struct ListenGuard<'a>(&'a AtomicBool);

impl Drop for ListenGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cloneable handle that asks a `Watcher` to stop after its current batch.
#[derive(Clone)]
pub struct StopHandle {
    stop_tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        // send_replace は receiver がいなくても値を更新する
        self.stop_tx.send_replace(true);
    }
}

impl Watcher {
    /// Validate `options` and wire the production collaborators
    /// (SQS, subprocess workers, local filesystem).
    pub fn new(options: WatcherOptions) -> Result<Self, WatchError> {
        WatcherBuilder::new(options).build()
    }

    /// Same as [`Watcher::new`].
    pub fn create(options: WatcherOptions) -> Result<Self, WatchError> {
        Self::new(options)
    }

    pub fn builder(options: WatcherOptions) -> WatcherBuilder {
        WatcherBuilder::new(options)
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    pub fn worker_options(&self) -> &WorkerOptions {
        &self.worker_options
    }

    pub fn messages(&self) -> &Arc<dyn MessageSource> {
        &self.messages
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Request a cooperative stop. The in-flight poll or batch still finishes.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop_tx: Arc::clone(&self.stop_tx),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Poll, prepare volumes, run one worker per message, repeat until stopped.
    ///
    /// Any error ends the loop and is returned; restarting is up to the caller.
    /// Only one `listen` may run per watcher at a time; a concurrent second
    /// call fails with `WatchError::AlreadyListening`.
    pub async fn listen(&self) -> Result<(), WatchError> {
        if self
            .listening
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WatchError::AlreadyListening);
        }
        let _guard = ListenGuard(&self.listening);

        info!(queue_url = %self.queue_url, "watcher listening");

        while !self.is_stopped() {
            let batch = self
                .messages
                .wait_for(self.batch_limit, self.poll_timeout)
                .await?;

            if batch.is_empty() {
                debug!(queue_url = %self.queue_url, "no messages");
                // 即座に空を返す source でも stop / timer が進むように譲る
                tokio::task::yield_now().await;
                continue;
            }

            info!(count = batch.len(), "received batch");
            self.prepare_volumes().await?;
            self.run_batch(batch).await?;
        }

        info!(queue_url = %self.queue_url, "watcher stopped");
        Ok(())
    }

    async fn prepare_volumes(&self) -> Result<(), WatchError> {
        for volume in &self.worker_options.volumes {
            self.file_system
                .set_permissions(volume, OPEN_PERMISSIONS)
                .await
                .map_err(|source| WatchError::FileSystem {
                    path: volume.clone(),
                    source,
                })?;
            debug!(volume = %volume.display(), "opened volume permissions");
        }
        Ok(())
    }

    /// Start every worker, then wait for all of them.
    ///
    /// A failure does not abandon siblings: the whole batch is drained and the
    /// first error is returned.
    async fn run_batch(&self, batch: Vec<Message>) -> Result<(), WorkerError> {
        let mut running = JoinSet::new();
        for message in batch {
            let worker = self
                .workers
                .create(message, Arc::clone(&self.worker_options));
            let id = worker.message().id().clone();
            running.spawn(async move {
                let result = worker.wait_for().await;
                if let Err(err) = &result {
                    warn!(message_id = %id, error = %err, "worker failed");
                }
                result
            });
        }

        let mut first_error = None;
        while let Some(joined) = running.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(WorkerError::Panicked(e.to_string())));
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageId;
    use crate::error::QueueError;
    use crate::impls::{InMemoryMessages, LocalFileSystem, ProcessWorkerFactory};
    use crate::ports::Worker;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    // ----------------------------------------
    // Test doubles
    // ----------------------------------------

    enum Step {
        Batch(Vec<Message>),
        Fail(QueueError),
        StopThenEmpty,
        StopThenBatch(Vec<Message>),
    }

    /// Replays scripted polls, then keeps answering with empty batches.
    #[derive(Default)]
    struct ScriptedMessages {
        steps: Mutex<VecDeque<Step>>,
        polls: AtomicUsize,
        stop: Mutex<Option<StopHandle>>,
        active_workers: Arc<AtomicUsize>,
        overlapped: AtomicBool,
    }

    impl ScriptedMessages {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                ..Self::default()
            }
        }

        fn polls(&self) -> usize {
            self.polls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedMessages {
        async fn wait_for(&self, _limit: usize, _timeout: Duration) -> Result<Vec<Message>, QueueError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.active_workers.load(Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }

            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Batch(batch)) => Ok(batch),
                Some(Step::Fail(err)) => Err(err),
                Some(Step::StopThenEmpty) => {
                    if let Some(stop) = self.stop.lock().unwrap().as_ref() {
                        stop.request_stop();
                    }
                    Ok(Vec::new())
                }
                Some(Step::StopThenBatch(batch)) => {
                    if let Some(stop) = self.stop.lock().unwrap().as_ref() {
                        stop.request_stop();
                    }
                    Ok(batch)
                }
                None => Ok(Vec::new()),
            }
        }

        async fn complete(&self, _message: &Message) -> Result<(), QueueError> {
            Ok(())
        }

        async fn retry(&self, _message: &Message) -> Result<(), QueueError> {
            Ok(())
        }
    }

    struct FakeWorker {
        message: Message,
        fail: bool,
        stop: Option<StopHandle>,
        active: Arc<AtomicUsize>,
        waited: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for FakeWorker {
        fn message(&self) -> &Message {
            &self.message
        }

        async fn wait_for(self: Box<Self>) -> Result<(), WorkerError> {
            if let Some(stop) = &self.stop {
                stop.request_stop();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.waited.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(WorkerError::Failed {
                    id: self.message.id().to_string(),
                    code: Some(1),
                    signal: None,
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        created: Mutex<Vec<(MessageId, Arc<WorkerOptions>)>>,
        failing: Vec<MessageId>,
        /// handed to every worker, which requests a stop while it runs
        stop_from_worker: Mutex<Option<StopHandle>>,
        active: Arc<AtomicUsize>,
        waited: Arc<AtomicUsize>,
    }

    impl RecordingFactory {
        fn created_ids(&self) -> Vec<MessageId> {
            self.created
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }

        fn waited(&self) -> usize {
            self.waited.load(Ordering::SeqCst)
        }
    }

    impl WorkerFactory for RecordingFactory {
        fn create(&self, message: Message, options: Arc<WorkerOptions>) -> Box<dyn Worker> {
            self.created
                .lock()
                .unwrap()
                .push((message.id().clone(), options));
            self.active.fetch_add(1, Ordering::SeqCst);
            Box::new(FakeWorker {
                fail: self.failing.contains(message.id()),
                stop: self.stop_from_worker.lock().unwrap().clone(),
                message,
                active: Arc::clone(&self.active),
                waited: Arc::clone(&self.waited),
            })
        }
    }

    #[derive(Default)]
    struct RecordingFileSystem {
        calls: Mutex<Vec<(PathBuf, u32)>>,
        fail: bool,
    }

    #[async_trait]
    impl FileSystem for RecordingFileSystem {
        async fn set_permissions(&self, path: &Path, mode: u32) -> io::Result<()> {
            self.calls.lock().unwrap().push((path.to_path_buf(), mode));
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            Ok(())
        }
    }

    // ----------------------------------------
    // Helpers
    // ----------------------------------------

    fn worker_options() -> WorkerOptions {
        WorkerOptions::new("echo hello world").with_volumes(["/tmp", "/mnt"])
    }

    fn options() -> WatcherOptions {
        WatcherOptions::new("https://faker", worker_options())
    }

    fn message(id: &str) -> Message {
        Message::new(MessageId::new(id), format!("handle-{id}"), format!("body-{id}"))
    }

    struct Harness {
        watcher: Arc<Watcher>,
        messages: Arc<ScriptedMessages>,
        factory: Arc<RecordingFactory>,
        fs: Arc<RecordingFileSystem>,
    }

    fn harness(steps: Vec<Step>, factory: RecordingFactory, fs: RecordingFileSystem) -> Harness {
        let messages = Arc::new(ScriptedMessages {
            active_workers: Arc::clone(&factory.active),
            ..ScriptedMessages::new(steps)
        });
        let factory = Arc::new(factory);
        let fs = Arc::new(fs);

        let watcher = Watcher::builder(options())
            .messages(messages.clone())
            .workers(factory.clone())
            .file_system(fs.clone())
            .build()
            .unwrap();
        *messages.stop.lock().unwrap() = Some(watcher.stop_handle());

        Harness {
            watcher: Arc::new(watcher),
            messages,
            factory,
            fs,
        }
    }

    // ----------------------------------------
    // Construction
    // ----------------------------------------

    #[test]
    fn missing_worker_options_is_a_configuration_error() {
        let err = Watcher::new(WatcherOptions::default()).err().unwrap();
        assert_eq!(err.to_string(), "missing options: workerOptions");
    }

    #[test]
    fn missing_queue_url_is_a_configuration_error() {
        let options = WatcherOptions {
            worker_options: Some(worker_options()),
            ..WatcherOptions::default()
        };
        let err = Watcher::new(options).err().unwrap();
        assert!(matches!(err, WatchError::Configuration { field: "queueUrl" }));
    }

    #[test]
    fn constructor_keeps_options_and_owns_a_client() {
        let watcher = Watcher::new(options()).unwrap();
        assert_eq!(watcher.worker_options(), &worker_options());
        assert_eq!(watcher.queue_url(), "https://faker");
        assert_eq!(Arc::strong_count(watcher.messages()), 2); // watcher + worker factory
        assert!(!watcher.is_stopped());
    }

    #[test]
    fn create_matches_new() {
        let created = Watcher::create(options()).unwrap();
        let built = Watcher::new(options()).unwrap();
        assert_eq!(created.queue_url(), built.queue_url());
        assert_eq!(created.worker_options(), built.worker_options());
        assert_eq!(created.batch_limit(), built.batch_limit());
        assert_eq!(created.poll_timeout(), built.poll_timeout());
        assert_eq!(created.is_stopped(), built.is_stopped());
    }

    // ----------------------------------------
    // listen
    // ----------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn listen_polls_until_stopped() {
        let h = harness(vec![], RecordingFactory::default(), RecordingFileSystem::default());

        let listening = tokio::spawn({
            let watcher = Arc::clone(&h.watcher);
            async move { watcher.listen().await }
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        h.watcher.stop();
        listening.await.unwrap().unwrap();

        assert!(h.messages.polls() > 2, "polls = {}", h.messages.polls());
        assert!(h.factory.created_ids().is_empty());
        assert!(h.fs.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_before_listen_skips_polling() {
        let h = harness(vec![], RecordingFactory::default(), RecordingFileSystem::default());
        h.watcher.stop();
        h.watcher.listen().await.unwrap();
        assert_eq!(h.messages.polls(), 0);
    }

    #[tokio::test]
    async fn listen_runs_one_worker_per_message() {
        let h = harness(
            vec![
                Step::Batch(vec![]),
                Step::Batch(vec![message("m1"), message("m2")]),
                Step::StopThenEmpty,
            ],
            RecordingFactory::default(),
            RecordingFileSystem::default(),
        );

        h.watcher.listen().await.unwrap();

        assert_eq!(
            h.factory.created_ids(),
            vec![MessageId::new("m1"), MessageId::new("m2")]
        );
        for (_, opts) in h.factory.created.lock().unwrap().iter() {
            assert_eq!(**opts, worker_options());
        }
        assert_eq!(h.factory.waited(), 2, "waits for both workers");
        assert_eq!(h.messages.polls(), 3);

        let calls = h.fs.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                (PathBuf::from("/tmp"), 0o777),
                (PathBuf::from("/mnt"), 0o777),
            ]
        );
    }

    #[tokio::test]
    async fn batches_never_overlap() {
        let h = harness(
            vec![
                Step::Batch(vec![message("a1"), message("a2"), message("a3")]),
                Step::Batch(vec![message("b1")]),
                Step::StopThenEmpty,
            ],
            RecordingFactory::default(),
            RecordingFileSystem::default(),
        );

        h.watcher.listen().await.unwrap();

        assert_eq!(h.factory.waited(), 4);
        assert!(!h.messages.overlapped.load(Ordering::SeqCst));
        // one chmod pass per non-empty batch
        assert_eq!(h.fs.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn stop_requested_by_a_batch_poll_lets_the_batch_finish() {
        let h = harness(
            vec![
                Step::StopThenBatch(vec![message("m1"), message("m2")]),
                Step::Batch(vec![message("never")]),
            ],
            RecordingFactory::default(),
            RecordingFileSystem::default(),
        );

        h.watcher.listen().await.unwrap();

        assert_eq!(h.factory.waited(), 2, "in-flight batch ran to completion");
        assert_eq!(h.messages.polls(), 1, "no poll after the stop");
        assert_eq!(h.fs.calls.lock().unwrap().len(), 2);
        assert!(h.watcher.is_stopped());
    }

    #[tokio::test]
    async fn stop_requested_by_a_running_worker_lets_siblings_finish() {
        let h = harness(
            vec![
                Step::Batch(vec![message("a"), message("b"), message("c")]),
                Step::Batch(vec![message("never")]),
            ],
            RecordingFactory::default(),
            RecordingFileSystem::default(),
        );
        *h.factory.stop_from_worker.lock().unwrap() = Some(h.watcher.stop_handle());

        h.watcher.listen().await.unwrap();

        assert_eq!(h.factory.waited(), 3);
        assert_eq!(h.messages.polls(), 1);
        assert!(!h.factory.created_ids().contains(&MessageId::new("never")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_listen_is_rejected() {
        let h = harness(vec![], RecordingFactory::default(), RecordingFileSystem::default());

        let first = tokio::spawn({
            let watcher = Arc::clone(&h.watcher);
            async move { watcher.listen().await }
        });
        while h.messages.polls() == 0 {
            tokio::task::yield_now().await;
        }

        let err = h.watcher.listen().await.unwrap_err();
        assert!(matches!(err, WatchError::AlreadyListening));

        h.watcher.stop();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn listen_can_run_again_after_returning() {
        let h = harness(
            vec![Step::Fail(QueueError::Transport("blip".into()))],
            RecordingFactory::default(),
            RecordingFileSystem::default(),
        );

        assert!(h.watcher.listen().await.is_err());
        h.watcher.stop();
        h.watcher.listen().await.unwrap();
    }

    #[tokio::test]
    async fn failed_worker_ends_listen_after_draining_the_batch() {
        let factory = RecordingFactory {
            failing: vec![MessageId::new("bad")],
            ..RecordingFactory::default()
        };
        let h = harness(
            vec![
                Step::Batch(vec![message("bad"), message("good")]),
                Step::Batch(vec![message("never")]),
            ],
            factory,
            RecordingFileSystem::default(),
        );

        let err = h.watcher.listen().await.unwrap_err();

        assert!(matches!(
            err,
            WatchError::Worker(WorkerError::Failed { ref id, .. }) if id == "bad"
        ));
        assert_eq!(h.messages.polls(), 1, "no further polling");
        assert_eq!(h.factory.waited(), 2, "sibling still awaited");
        assert!(!h.factory.created_ids().contains(&MessageId::new("never")));
    }

    #[tokio::test]
    async fn queue_error_ends_listen() {
        let h = harness(
            vec![Step::Fail(QueueError::Transport("unreachable".into()))],
            RecordingFactory::default(),
            RecordingFileSystem::default(),
        );

        let err = h.watcher.listen().await.unwrap_err();
        assert!(matches!(err, WatchError::Queue(QueueError::Transport(_))));
        assert_eq!(h.messages.polls(), 1);
    }

    #[tokio::test]
    async fn permission_error_creates_no_workers() {
        let fs = RecordingFileSystem {
            fail: true,
            ..RecordingFileSystem::default()
        };
        let h = harness(
            vec![Step::Batch(vec![message("m1")])],
            RecordingFactory::default(),
            fs,
        );

        let err = h.watcher.listen().await.unwrap_err();
        assert!(matches!(err, WatchError::FileSystem { ref path, .. } if path == Path::new("/tmp")));
        assert!(h.factory.created_ids().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn processes_queued_messages_end_to_end() {
        let volume = tempfile::tempdir().unwrap();
        let messages = Arc::new(InMemoryMessages::new());
        messages.push("first").await;
        messages.push("second").await;

        let options = WatcherOptions::new(
            "memory://jobs",
            WorkerOptions::new(r#"echo "$Message" >> "$LOOKOUT_WORKER_VOLUMES/out.txt""#)
                .with_volumes([volume.path()]),
        )
        .with_batch_limit(10)
        .with_poll_timeout(Duration::from_millis(50));

        let watcher = Arc::new(
            Watcher::builder(options)
                .messages(messages.clone())
                .workers(Arc::new(ProcessWorkerFactory::new(messages.clone())))
                .file_system(Arc::new(LocalFileSystem))
                .build()
                .unwrap(),
        );

        let listening = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            async move { watcher.listen().await }
        });

        tokio::time::timeout(Duration::from_secs(10), async {
            while messages.completed().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        watcher.stop();
        listening.await.unwrap().unwrap();

        let out = std::fs::read_to_string(volume.path().join("out.txt")).unwrap();
        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["first", "second"]);
        assert_eq!(messages.in_flight_len().await, 0);
    }
}
