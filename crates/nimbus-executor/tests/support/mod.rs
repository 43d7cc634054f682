//! Deterministic fakes for the capability traits, used across the
//! integration tests.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use nimbus_common::{
    CapturedStream, ContainerDaemon, DaemonError, ExecOutput, ExecRequest, MemorySample,
    ObjectStore, Signal, StoreError,
};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ExecBehavior {
    pub delay: Duration,
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub truncated_stdout: bool,
}

impl Default for ExecBehavior {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated_stdout: false,
        }
    }
}

#[derive(Default)]
pub struct FakeDaemon {
    counter: AtomicUsize,
    pub created: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub exec_log: Mutex<Vec<(String, Vec<String>)>>,
    pub kill_log: Mutex<Vec<(String, Signal)>>,
    pub memory_limits: Mutex<Vec<(String, u64)>>,
    pub copied_in: Mutex<Vec<(String, String)>>,
    /// Files (relative path, bytes) materialized under `<dst>/output/` by
    /// `copy_out`.
    pub output_files: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    pub behavior: Mutex<ExecBehavior>,
    pub fail_create: Mutex<bool>,
    pub rss_bytes: AtomicU64,
}

impl FakeDaemon {
    pub async fn set_behavior(&self, behavior: ExecBehavior) {
        *self.behavior.lock().await = behavior;
    }

    pub async fn created_count(&self) -> usize {
        self.created.lock().await.len()
    }

    pub async fn removed_count(&self) -> usize {
        self.removed.lock().await.len()
    }
}

#[async_trait]
impl ContainerDaemon for FakeDaemon {
    async fn create(&self, _image: &str, _name: &str) -> Result<String, DaemonError> {
        if *self.fail_create.lock().await {
            return Err(DaemonError::ResourceExhausted("create disabled".into()));
        }
        let id = format!("c{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.created.lock().await.push(id.clone());
        Ok(id)
    }

    async fn start(&self, _container_id: &str) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn exec(&self, container_id: &str, req: ExecRequest) -> Result<ExecOutput, DaemonError> {
        self.exec_log
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
                truncated: behavior.truncated_stdout,
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
        container_id: &str,
        _src_dir: &Path,
        dst_path: &str,
    ) -> Result<(), DaemonError> {
        self.copied_in
            .lock()
            .await
            .push((container_id.to_string(), dst_path.to_string()));
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
            rss_bytes: self.rss_bytes.load(Ordering::Relaxed),
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
        container_id: &str,
        limit_bytes: u64,
    ) -> Result<(), DaemonError> {
        self.memory_limits
            .lock()
            .await
            .push((container_id.to_string(), limit_bytes));
        Ok(())
    }

    async fn ping(&self) -> Result<(), DaemonError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStore {
    pub objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub puts: Mutex<HashMap<(String, String), Vec<u8>>>,
    pub failing_put_keys: Mutex<HashSet<String>>,
}

impl FakeStore {
    pub async fn insert(&self, bucket: &str, key: &str, body: Vec<u8>) {
        self.objects
            .lock()
            .await
            .insert((bucket.to_string(), key.to_string()), body);
    }

    pub async fn fail_puts_for(&self, key: &str) {
        self.failing_put_keys.lock().await.insert(key.to_string());
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
        if self.failing_put_keys.lock().await.contains(key) {
            return Err(StoreError::Transport(format!("injected failure for {key}")));
        }
        self.puts
            .lock()
            .await
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }
}

/// Build an in-memory zip from (name, contents) pairs.
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
