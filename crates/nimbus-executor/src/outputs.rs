//! Output binding: after a terminated execution, harvest whatever the job
//! wrote under its `output/` directory and upload it to the user-data
//! bucket under a deterministic prefix.
//!
//! Binding is best-effort by contract: per-file upload failures are logged
//! and skipped, and the manifest records only what actually landed. The
//! execution outcome is never demoted by binder failures.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use nimbus_common::{ContainerDaemon, ExecRequest, ObjectStore, OutputArtifact};
use tracing::{debug, info, instrument, warn};

use crate::stage::ScratchDir;

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub enabled: bool,
    /// Host-side scratch root for harvested files.
    pub base_dir: PathBuf,
    pub s3_prefix: String,
    pub user_data_bucket: String,
    pub work_dir_root: String,
}

pub struct OutputBinder {
    store: Arc<dyn ObjectStore>,
    cfg: OutputConfig,
}

impl OutputBinder {
    pub fn new(store: Arc<dyn ObjectStore>, cfg: OutputConfig) -> Self {
        Self { store, cfg }
    }

    /// Harvest and upload the job's output files, returning the manifest of
    /// everything that made it to storage.
    #[instrument(skip(self, daemon, container_id))]
    pub async fn harvest(
        &self,
        daemon: &dyn ContainerDaemon,
        container_id: &str,
        request_id: &str,
    ) -> Vec<OutputArtifact> {
        if !self.cfg.enabled {
            return Vec::new();
        }
        if self.cfg.user_data_bucket.trim().is_empty() {
            warn!("output binding enabled but no user-data bucket configured");
            return Vec::new();
        }

        let container_output = format!(
            "{}/{}/output",
            self.cfg.work_dir_root.trim_end_matches('/'),
            request_id
        );

        let probe = ExecRequest::new(vec![
            "test".to_string(),
            "-d".to_string(),
            container_output.clone(),
        ]);
        match daemon.exec(container_id, probe).await {
            Ok(out) if out.exit_code == 0 => {}
            Ok(_) => {
                debug!("no output directory in container");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "failed probing output directory");
                return Vec::new();
            }
        }

        let scratch = match ScratchDir::create(self.cfg.base_dir.join(request_id)) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to create harvest scratch dir");
                return Vec::new();
            }
        };

        if let Err(e) = daemon
            .copy_out(container_id, &container_output, scratch.path())
            .await
        {
            warn!(error = %e, "failed copying output directory out of container");
            return Vec::new();
        }

        // The copy-out tar carries the `output/` directory itself.
        let harvest_root = {
            let nested = scratch.path().join("output");
            if nested.is_dir() {
                nested
            } else {
                scratch.path().to_path_buf()
            }
        };

        let files = {
            let root = harvest_root.clone();
            match tokio::task::spawn_blocking(move || walk_files(&root)).await {
                Ok(Ok(files)) => files,
                Ok(Err(e)) => {
                    warn!(error = %e, "failed walking harvested files");
                    return Vec::new();
                }
                Err(e) => {
                    warn!(error = %e, "harvest walk panicked");
                    return Vec::new();
                }
            }
        };

        let mut manifest = Vec::new();
        for rel in files {
            let abs = harvest_root.join(&rel);
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            let body = match tokio::fs::read(&abs).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(file = %rel_str, error = %e, "failed reading harvested file");
                    continue;
                }
            };
            let size_bytes = body.len() as u64;
            let key = format!("{}/{}/{}", self.cfg.s3_prefix, request_id, rel_str);
            match self.store.put(&self.cfg.user_data_bucket, &key, body).await {
                Ok(()) => {
                    manifest.push(OutputArtifact {
                        path: rel_str,
                        size_bytes,
                        locator: format!("s3://{}/{}", self.cfg.user_data_bucket, key),
                    });
                }
                Err(e) => {
                    warn!(file = %rel_str, error = %e, "output upload failed; skipping file");
                }
            }
        }

        if !manifest.is_empty() {
            info!(count = manifest.len(), "output files uploaded");
        }
        manifest
    }
}

/// Regular files under `root`, as paths relative to it.
fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    fn visit(dir: &Path, root: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                visit(&path, root, out)?;
            } else if path.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_path_buf());
                }
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    if root.is_dir() {
        visit(root, root, &mut out)?;
    }
    out.sort();
    Ok(out)
}
