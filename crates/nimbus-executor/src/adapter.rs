//! Bollard-backed implementation of the [`ContainerDaemon`] contract.
//!
//! Containers are created with `auto-remove` off and a sleep-forever
//! entrypoint so they stay alive between executions; user code runs through
//! the exec API. The job's memory cap is applied to the running container at
//! rent time via the update endpoint, so idle pool containers reserve
//! nothing.

use std::{io::Cursor, path::Path, sync::Arc, time::Instant};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
        LogOutput, RemoveContainerOptions, StatsOptions, UpdateContainerOptions,
        UploadToContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    models::HostConfig,
    Docker,
};
use futures::StreamExt;
use nimbus_common::{
    CapturedStream, ContainerDaemon, DaemonError, ExecOutput, ExecRequest, MemorySample, Signal,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

/// Keeps the last `cap` bytes of a stream and remembers whether anything
/// was dropped. Bounds agent memory under pathological output floods.
#[derive(Debug)]
pub struct TailBuffer {
    cap: usize,
    buf: Vec<u8>,
    truncated: bool,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Vec::new(),
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            if !self.buf.is_empty() || chunk.len() > self.cap {
                self.truncated = true;
            }
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.truncated = true;
        }
        self.buf.extend_from_slice(chunk);
    }

    pub fn into_captured(self) -> CapturedStream {
        CapturedStream {
            bytes: self.buf,
            truncated: self.truncated,
        }
    }
}

pub struct DockerDaemon {
    docker: Arc<Docker>,
}

impl DockerDaemon {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }
}

fn map_err(op: &str, err: BollardError) -> DaemonError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 if message.contains("image") => DaemonError::ImageMissing(message),
            404 => DaemonError::NotFound(message),
            _ => DaemonError::ResourceExhausted(format!("{op}: {message}")),
        },
        BollardError::RequestTimeoutError => DaemonError::Timeout(op.to_string()),
        other => DaemonError::Unavailable(format!("{op}: {other}")),
    }
}

fn host_io(op: &str, err: impl std::fmt::Display) -> DaemonError {
    DaemonError::ResourceExhausted(format!("{op}: {err}"))
}

#[async_trait]
impl ContainerDaemon for DockerDaemon {
    #[instrument(skip(self))]
    async fn create(&self, image: &str, name: &str) -> Result<String, DaemonError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(false),
            host_config: Some(HostConfig {
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_err("create", e))?;
        debug!(container_id = %created.id, %image, "container created");
        Ok(created.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), DaemonError> {
        self.docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(|e| map_err("start", e))
    }

    #[instrument(skip(self, req), fields(argv = ?req.argv))]
    async fn exec(&self, container_id: &str, req: ExecRequest) -> Result<ExecOutput, DaemonError> {
        let started = Instant::now();
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions::<String> {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(req.stdin.is_some()),
                    cmd: Some(req.argv.clone()),
                    working_dir: req.workdir.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_err("exec create", e))?;

        let mut stdout = TailBuffer::new(req.stream_cap);
        let mut stderr = TailBuffer::new(req.stream_cap);

        match self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: false,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| map_err("exec start", e))?
        {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                if let Some(payload) = &req.stdin {
                    if let Err(e) = input.write_all(payload).await {
                        warn!(error = %e, "failed writing exec stdin");
                    }
                    if let Err(e) = input.shutdown().await {
                        warn!(error = %e, "failed closing exec stdin");
                    }
                }
                while let Some(entry) = output.next().await {
                    match entry {
                        Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "exec output stream error");
                            break;
                        }
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_err("exec inspect", e))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout: stdout.into_captured(),
            stderr: stderr.into_captured(),
            duration: started.elapsed(),
        })
    }

    async fn copy_in(
        &self,
        container_id: &str,
        src_dir: &Path,
        dst_path: &str,
    ) -> Result<(), DaemonError> {
        let src = src_dir.to_path_buf();
        let tarball = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.append_dir_all(".", &src)?;
            builder.into_inner()
        })
        .await
        .map_err(|e| host_io("copy_in", e))?
        .map_err(|e| host_io("copy_in", e))?;

        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: dst_path.to_string(),
                    ..Default::default()
                }),
                tarball.into(),
            )
            .await
            .map_err(|e| map_err("copy_in", e))
    }

    async fn copy_out(
        &self,
        container_id: &str,
        src_path: &str,
        dst_dir: &Path,
    ) -> Result<(), DaemonError> {
        let mut stream = self.docker.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions {
                path: src_path.to_string(),
            }),
        );
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_err("copy_out", e))?;
            archive.extend_from_slice(&chunk);
        }

        let dst = dst_dir.to_path_buf();
        tokio::task::spawn_blocking(move || tar::Archive::new(Cursor::new(archive)).unpack(&dst))
            .await
            .map_err(|e| host_io("copy_out", e))?
            .map_err(|e| host_io("copy_out", e))
    }

    async fn stats(&self, container_id: &str) -> Result<MemorySample, DaemonError> {
        let mut stream = self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        match stream.next().await {
            Some(Ok(stats)) => Ok(MemorySample {
                rss_bytes: stats.memory_stats.usage.unwrap_or(0),
            }),
            Some(Err(e)) => Err(map_err("stats", e)),
            None => Err(DaemonError::NotFound(format!(
                "no stats for container {container_id}"
            ))),
        }
    }

    async fn kill(&self, container_id: &str, signal: Signal) -> Result<(), DaemonError> {
        self.docker
            .kill_container(
                container_id,
                Some(KillContainerOptions {
                    signal: signal.as_str(),
                }),
            )
            .await
            .map_err(|e| map_err("kill", e))
    }

    async fn remove(&self, container_id: &str) -> Result<(), DaemonError> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_err("remove", e))
    }

    async fn set_memory_limit(
        &self,
        container_id: &str,
        limit_bytes: u64,
    ) -> Result<(), DaemonError> {
        // The update endpoint treats 0 as "leave unchanged", so clearing a
        // previous tenant's cap means raising it out of reach instead.
        let limit = if limit_bytes == 0 {
            i64::MAX
        } else {
            limit_bytes as i64
        };
        self.docker
            .update_container(
                container_id,
                UpdateContainerOptions::<String> {
                    memory: Some(limit),
                    memory_swap: Some(limit),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_err("set_memory_limit", e))
    }

    async fn ping(&self) -> Result<(), DaemonError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| DaemonError::Unavailable(format!("ping: {e}")))
    }
}
