//! A fully-faked agent context for dispatcher tests: fake queue, store,
//! publisher, metrics sink and container daemon wired into the real pool,
//! stager, executor and binder.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use nimbus_agent::{config::AgentConfig, AgentContext};
use nimbus_common::{
    CapturedStream, ContainerDaemon, DaemonError, ExecOutput, ExecRequest, MemorySample,
    MetricsSink, ObjectStore, OutcomeStatus, PublishError, QueueClient, QueueError, QueueMessage,
    ResultEnvelope, ResultPublisher, Runtime, RuntimeTable, Signal, StoreError,
};
use nimbus_executor::{Executor, OutputBinder, Stager, WarmPool};
use tempfile::TempDir;
use tokio::sync::Mutex;

pub struct FakeQueue {
    pending: Mutex<VecDeque<QueueMessage>>,
    pub deleted: Mutex<Vec<String>>,
    pub extended: Mutex<Vec<String>>,
}

impl FakeQueue {
    pub fn with_messages(messages: Vec<QueueMessage>) -> Self {
        Self {
            pending: Mutex::new(messages.into()),
            deleted: Mutex::new(Vec::new()),
            extended: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl QueueClient for FakeQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>, QueueError> {
        let batch: Vec<QueueMessage> = {
            let mut pending = self.pending.lock().await;
            let take = pending.len().min(10);
            pending.drain(..take).collect()
        };
        if batch.is_empty() {
            // Simulates the long-poll wait so the intake loop does not spin.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(batch)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.deleted.lock().await.push(receipt_handle.to_string());
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        _seconds: u32,
    ) -> Result<(), QueueError> {
        self.extended.lock().await.push(receipt_handle.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStore {
    pub objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub puts: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl FakeStore {
    pub async fn insert(&self, bucket: &str, key: &str, body: Vec<u8>) {
        self.objects
            .lock()
            .await
            .insert((bucket.to_string(), key.to_string()), body);
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .await
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("s3://{bucket}/{key}")))
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        self.puts
            .lock()
            .await
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePublisher {
    pub published: Mutex<Vec<ResultEnvelope>>,
    pub attempts: AtomicUsize,
    pub failing: AtomicBool,
}

#[async_trait]
impl ResultPublisher for FakePublisher {
    async fn publish(&self, envelope: &ResultEnvelope) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError("bus down".to_string()));
        }
        self.published.lock().await.push(envelope.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMetrics {
    pub exits: Mutex<Vec<OutcomeStatus>>,
    pub peaks: Mutex<Vec<(String, u64)>>,
}

#[async_trait]
impl MetricsSink for FakeMetrics {
    async fn record_peak_memory(&self, function_id: &str, _runtime: Runtime, bytes: u64) {
        self.peaks
            .lock()
            .await
            .push((function_id.to_string(), bytes));
    }

    async fn record_exit(&self, status: OutcomeStatus) {
        self.exits.lock().await.push(status);
    }
}

#[derive(Debug, Clone)]
pub struct LaunchBehavior {
    pub delay: Duration,
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Default for LaunchBehavior {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

/// Fake daemon that answers housekeeping execs (`mkdir`, `test`, `rm`,
/// `/bin/sh`) with success and runs the launch command per the configured
/// behavior.
#[derive(Default)]
pub struct FakeDaemon {
    counter: AtomicUsize,
    pub removed: Mutex<Vec<String>>,
    pub kill_log: Mutex<Vec<(String, Signal)>>,
    pub launches: Mutex<Vec<(String, Vec<String>)>>,
    pub behavior: Mutex<LaunchBehavior>,
    /// Files materialized under `<dst>/output/` by `copy_out`.
    pub output_files: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    pub rss_bytes: AtomicUsize,
}

impl FakeDaemon {
    pub async fn set_behavior(&self, behavior: LaunchBehavior) {
        *self.behavior.lock().await = behavior;
    }
}

#[async_trait]
impl ContainerDaemon for FakeDaemon {
    async fn create(&self, _image: &str, _name: &str) -> Result<String, DaemonError> {
        Ok(format!("c{}", self.counter.fetch_add(1, Ordering::SeqCst)))
    }

    async fn start(&self, _container_id: &str) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn exec(&self, container_id: &str, req: ExecRequest) -> Result<ExecOutput, DaemonError> {
        let head = req.argv.first().map(String::as_str).unwrap_or_default();
        if matches!(head, "mkdir" | "test" | "rm" | "/bin/sh") {
            return Ok(ExecOutput {
                exit_code: 0,
                stdout: CapturedStream::default(),
                stderr: CapturedStream::default(),
                duration: Duration::ZERO,
            });
        }

        self.launches
            .lock()
            .await
            .push((container_id.to_string(), req.argv.clone()));
        let behavior = self.behavior.lock().await.clone();
        if !behavior.delay.is_zero() {
            tokio::time::sleep(behavior.delay).await;
        }
        Ok(ExecOutput {
            exit_code: behavior.exit_code,
            stdout: CapturedStream {
                bytes: behavior.stdout,
                truncated: false,
            },
            stderr: CapturedStream {
                bytes: behavior.stderr,
                truncated: false,
            },
            duration: behavior.delay,
        })
    }

    async fn copy_in(
        &self,
        _container_id: &str,
        _src_dir: &Path,
        _dst_path: &str,
    ) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn copy_out(
        &self,
        _container_id: &str,
        _src_path: &str,
        dst_dir: &Path,
    ) -> Result<(), DaemonError> {
        let root = dst_dir.join("output");
        std::fs::create_dir_all(&root).unwrap();
        for (rel, data) in self.output_files.lock().await.iter() {
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, data).unwrap();
        }
        Ok(())
    }

    async fn stats(&self, _container_id: &str) -> Result<MemorySample, DaemonError> {
        Ok(MemorySample {
            rss_bytes: self.rss_bytes.load(Ordering::Relaxed) as u64,
        })
    }

    async fn kill(&self, container_id: &str, signal: Signal) -> Result<(), DaemonError> {
        self.kill_log
            .lock()
            .await
            .push((container_id.to_string(), signal));
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), DaemonError> {
        self.removed.lock().await.push(container_id.to_string());
        Ok(())
    }

    async fn set_memory_limit(
        &self,
        _container_id: &str,
        _limit_bytes: u64,
    ) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), DaemonError> {
        Ok(())
    }
}

pub struct Harness {
    pub ctx: Arc<AgentContext>,
    pub queue: Arc<FakeQueue>,
    pub store: Arc<FakeStore>,
    pub publisher: Arc<FakePublisher>,
    pub metrics: Arc<FakeMetrics>,
    pub daemon: Arc<FakeDaemon>,
    scratch: TempDir,
    outputs: TempDir,
}

pub async fn harness(messages: Vec<QueueMessage>) -> Harness {
    let scratch = TempDir::new().unwrap();
    let outputs = TempDir::new().unwrap();

    let mut config = AgentConfig::default();
    config.sqs.queue_url = "https://sqs.test/queue".to_string();
    config.sqs.visibility_timeout_seconds = 2;
    config.s3.code_bucket = "code-bucket".to_string();
    config.s3.user_data_bucket = "user-data".to_string();
    config.docker.default_timeout_ms = 1_000;
    config.warm_pool.enabled = false;
    config.warm_pool.python_size = 1;
    config.task_base_dir = scratch.path().to_path_buf();
    config.output.base_dir = outputs.path().to_path_buf();

    let queue = Arc::new(FakeQueue::with_messages(messages));
    let store = Arc::new(FakeStore::default());
    let publisher = Arc::new(FakePublisher::default());
    let metrics = Arc::new(FakeMetrics::default());
    let daemon = Arc::new(FakeDaemon::default());

    let table = Arc::new(RuntimeTable::new(
        config.runtime_images(),
        config.docker.default_timeout_ms,
    ));
    let daemon_dyn: Arc<dyn ContainerDaemon> = daemon.clone();
    let pool = Arc::new(WarmPool::new(
        daemon_dyn.clone(),
        &table,
        &config.pool_settings(),
    ));

    let stager = Stager::new(store.clone(), config.stage_config());
    let binder = OutputBinder::new(store.clone(), config.output_config());
    let executor = Executor::new(daemon_dyn.clone());

    let ctx = Arc::new(AgentContext {
        config,
        table,
        queue: queue.clone(),
        store: store.clone(),
        publisher: publisher.clone(),
        metrics: metrics.clone(),
        daemon: daemon_dyn,
        pool,
        stager,
        binder,
        executor,
    });

    Harness {
        ctx,
        queue,
        store,
        publisher,
        metrics,
        daemon,
        scratch,
        outputs,
    }
}

pub fn message(body: &str, receipt: &str) -> QueueMessage {
    QueueMessage {
        body: body.to_string(),
        receipt_handle: receipt.to_string(),
    }
}

pub fn zip_bundle(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::{Cursor, Write};
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 3s");
}
