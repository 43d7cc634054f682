//! Workspace staging: download the code bundle, extract it with path
//! sanitization, detect the runtime and inject the tree into a rented
//! container.
//!
//! Staging is split in two so the download can start before a container is
//! acquired: [`Stager::prepare`] is purely host-side, [`Stager::inject`]
//! needs a rented slot.

use std::{
    fs,
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use nimbus_common::{
    AgentError, ContainerDaemon, ExecRequest, JobRequest, ObjectStore, Runtime, RuntimeTable,
    StageError, StageErrorKind, StoreError,
};
use tracing::{debug, info, instrument, warn};

use crate::pool::SlotLease;

const COPY_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Host-side scratch root; one directory per request underneath.
    pub task_base_dir: PathBuf,
    /// Fallback bucket when the request does not name one.
    pub code_bucket: String,
    /// In-container workspace root.
    pub work_dir_root: String,
    pub max_bundle_bytes: u64,
    pub max_expanded_bytes: u64,
}

/// A scratch directory that removes itself when the bundle is dropped.
#[derive(Debug)]
pub(crate) struct ScratchDir(PathBuf);

impl ScratchDir {
    pub(crate) fn create(path: PathBuf) -> std::io::Result<Self> {
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "failed to clean scratch dir");
            }
        }
    }
}

/// A materialized, validated bundle waiting for a container.
#[derive(Debug)]
pub struct StagedBundle {
    pub request_id: String,
    pub runtime: Runtime,
    argv: Vec<String>,
    scratch: ScratchDir,
}

impl StagedBundle {
    pub fn path(&self) -> &Path {
        self.scratch.path()
    }
}

/// What the executor runs: the descriptor's argv with the injected
/// workspace as its working directory.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub argv: Vec<String>,
    pub workdir: String,
}

pub struct Stager {
    store: Arc<dyn ObjectStore>,
    cfg: StageConfig,
}

impl Stager {
    pub fn new(store: Arc<dyn ObjectStore>, cfg: StageConfig) -> Self {
        Self { store, cfg }
    }

    /// Host-side staging: scratch dir, download, extraction, detection.
    #[instrument(skip(self, request, table), fields(request_id = %request.request_id))]
    pub async fn prepare(
        &self,
        request: &JobRequest,
        table: &RuntimeTable,
    ) -> Result<StagedBundle, StageError> {
        let scratch = ScratchDir::create(self.cfg.task_base_dir.join(&request.request_id))
            .map_err(|e| {
                StageError::new(
                    StageErrorKind::Transport,
                    format!("failed to create scratch dir: {e}"),
                )
            })?;

        let bucket = if request.s3_bucket.trim().is_empty() {
            self.cfg.code_bucket.as_str()
        } else {
            request.s3_bucket.as_str()
        };

        let archive = self
            .store
            .get(bucket, &request.s3_key)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(detail) => {
                    StageError::new(StageErrorKind::CodeMissing, detail)
                }
                StoreError::Transport(detail) => {
                    StageError::new(StageErrorKind::Transport, detail)
                }
            })?;

        if archive.len() as u64 > self.cfg.max_bundle_bytes {
            return Err(StageError::new(
                StageErrorKind::CodeOversized,
                format!(
                    "bundle is {} bytes, cap is {}",
                    archive.len(),
                    self.cfg.max_bundle_bytes
                ),
            ));
        }
        debug!(bytes = archive.len(), %bucket, key = %request.s3_key, "bundle downloaded");

        let root = scratch.path().to_path_buf();
        let cap = self.cfg.max_expanded_bytes;
        let extracted =
            tokio::task::spawn_blocking(move || extract_archive(archive, &root, cap))
                .await
                .map_err(|e| {
                    StageError::new(StageErrorKind::Archive, format!("extraction panicked: {e}"))
                })??;

        let descriptor = table.descriptor(request.runtime);
        let missing: Vec<&str> = descriptor
            .required_files
            .iter()
            .filter(|f| !scratch.path().join(f).is_file())
            .copied()
            .collect();
        if !missing.is_empty() {
            let detected: Vec<&str> = table
                .iter()
                .filter(|d| {
                    d.required_files
                        .iter()
                        .all(|f| scratch.path().join(f).is_file())
                })
                .map(|d| d.runtime.as_str())
                .collect();
            return Err(StageError::new(
                StageErrorKind::RuntimeMismatch,
                format!(
                    "runtime {} requires {:?}; bundle matches {:?}",
                    request.runtime, missing, detected
                ),
            ));
        }

        info!(
            request_id = %request.request_id,
            runtime = %request.runtime,
            files = extracted,
            "bundle staged"
        );
        Ok(StagedBundle {
            request_id: request.request_id.clone(),
            runtime: request.runtime,
            argv: descriptor.launch_argv(),
            scratch,
        })
    }

    /// Copy the staged tree into the rented container and create the
    /// `output/` directory. Records the workspace on the lease so the pool
    /// wipes it at return.
    #[instrument(skip(self, daemon, lease, bundle), fields(request_id = %bundle.request_id))]
    pub async fn inject(
        &self,
        daemon: &dyn ContainerDaemon,
        lease: &mut SlotLease,
        bundle: &StagedBundle,
    ) -> Result<LaunchPlan, AgentError> {
        let workdir = format!(
            "{}/{}",
            self.cfg.work_dir_root.trim_end_matches('/'),
            bundle.request_id
        );

        let mkdir = ExecRequest::new(vec![
            "mkdir".to_string(),
            "-p".to_string(),
            format!("{workdir}/output"),
        ]);
        let out = daemon.exec(&lease.container_id, mkdir).await?;
        if out.exit_code != 0 {
            return Err(AgentError::Internal(format!(
                "mkdir of workspace {workdir} exited {}",
                out.exit_code
            )));
        }

        // The workspace exists from here on; make sure the pool wipes it
        // even if the copy below fails halfway.
        lease.workspace = Some(workdir.clone());

        daemon
            .copy_in(&lease.container_id, bundle.path(), &workdir)
            .await?;

        debug!(container_id = %lease.container_id, %workdir, "workspace injected");
        Ok(LaunchPlan {
            argv: bundle.argv.clone(),
            workdir,
        })
    }
}

/// Extract a zip archive under `root` with traversal and expansion
/// defenses. Validates every entry name before writing anything, so a
/// traversal attempt leaves no file behind.
fn extract_archive(bytes: Vec<u8>, root: &Path, cap: u64) -> Result<usize, StageError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| StageError::new(StageErrorKind::Archive, format!("unreadable archive: {e}")))?;

    // Pass 1: names and declared sizes.
    let mut declared = 0u64;
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| {
            StageError::new(StageErrorKind::Archive, format!("unreadable entry: {e}"))
        })?;
        let name = entry.name();
        if name.contains('\0') {
            return Err(StageError::new(
                StageErrorKind::Traversal,
                "entry name contains NUL",
            ));
        }
        if entry.enclosed_name().is_none() {
            return Err(StageError::new(
                StageErrorKind::Traversal,
                format!("entry escapes the scratch root: {name}"),
            ));
        }
        declared += entry.size();
        if declared > cap {
            return Err(StageError::new(
                StageErrorKind::ExpansionLimit,
                format!("declared expansion exceeds {cap} bytes"),
            ));
        }
    }

    // Pass 2: extraction, with the cap enforced on actual bytes as well
    // (declared sizes can lie).
    let mut written = 0u64;
    let mut files = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| {
            StageError::new(StageErrorKind::Archive, format!("unreadable entry: {e}"))
        })?;
        let rel = match entry.enclosed_name() {
            Some(p) => p.to_owned(),
            None => {
                return Err(StageError::new(
                    StageErrorKind::Traversal,
                    "entry escapes the scratch root",
                ))
            }
        };
        let dst = root.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&dst).map_err(|e| io_stage("create dir", &dst, e))?;
            continue;
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| io_stage("create dir", parent, e))?;
        }
        let mut out = fs::File::create(&dst).map_err(|e| io_stage("create file", &dst, e))?;
        written += copy_capped(&mut entry, &mut out, cap - written)?;
        files += 1;
    }
    Ok(files)
}

fn io_stage(op: &str, path: &Path, err: std::io::Error) -> StageError {
    StageError::new(
        StageErrorKind::Transport,
        format!("{op} {}: {err}", path.display()),
    )
}

fn copy_capped(src: &mut impl Read, dst: &mut impl Write, budget: u64) -> Result<u64, StageError> {
    let mut copied = 0u64;
    let mut buf = [0u8; COPY_CHUNK];
    loop {
        let n = src.read(&mut buf).map_err(|e| {
            StageError::new(StageErrorKind::Archive, format!("read failed: {e}"))
        })?;
        if n == 0 {
            return Ok(copied);
        }
        copied += n as u64;
        if copied > budget {
            return Err(StageError::new(
                StageErrorKind::ExpansionLimit,
                "actual expansion exceeds the configured cap",
            ));
        }
        dst.write_all(&buf[..n]).map_err(|e| {
            StageError::new(StageErrorKind::Transport, format!("write failed: {e}"))
        })?;
    }
}
