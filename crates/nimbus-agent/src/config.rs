//! Agent configuration: YAML file merged over defaults, with environment
//! overrides for the deployment-variable knobs.

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
};

use anyhow::Context;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use nimbus_common::{Runtime, RuntimeImages};
use nimbus_executor::PoolSettings;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    pub queue_url: String,
    pub wait_time_seconds: u32,
    pub max_number_of_messages: u32,
    pub visibility_timeout_seconds: u64,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            wait_time_seconds: 20,
            max_number_of_messages: 10,
            visibility_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub code_bucket: String,
    pub user_data_bucket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub python_image: String,
    pub cpp_image: String,
    pub nodejs_image: String,
    pub go_image: String,
    pub work_dir_root: String,
    pub default_timeout_ms: u64,
    pub output_mount_path: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            python_image: "python-base".to_string(),
            cpp_image: "gcc-base".to_string(),
            nodejs_image: "node-base".to_string(),
            go_image: "go-base".to_string(),
            work_dir_root: "/workspace-root".to_string(),
            default_timeout_ms: 10_000,
            output_mount_path: "/output".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmPoolConfig {
    pub enabled: bool,
    pub python_size: usize,
    pub cpp_size: usize,
    pub nodejs_size: usize,
    pub go_size: usize,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            python_size: 2,
            cpp_size: 1,
            nodejs_size: 1,
            go_size: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub result_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: String::new(),
            result_prefix: "result:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub enabled: bool,
    pub base_dir: PathBuf,
    pub s3_prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: PathBuf::from("/tmp/output"),
            s3_prefix: "outputs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_bundle_bytes: u64,
    pub max_expanded_bytes: u64,
    pub stream_cap_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_bundle_bytes: 50 * 1024 * 1024,
            max_expanded_bytes: 256 * 1024 * 1024,
            stream_cap_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub aws: AwsConfig,
    pub sqs: SqsConfig,
    pub s3: S3Config,
    pub docker: DockerConfig,
    pub warm_pool: WarmPoolConfig,
    pub redis: RedisConfig,
    pub output: OutputConfig,
    pub limits: LimitsConfig,
    pub task_base_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            aws: AwsConfig::default(),
            sqs: SqsConfig::default(),
            s3: S3Config::default(),
            docker: DockerConfig::default(),
            warm_pool: WarmPoolConfig::default(),
            redis: RedisConfig::default(),
            output: OutputConfig::default(),
            limits: LimitsConfig::default(),
            task_base_dir: PathBuf::from("/tmp/task"),
        }
    }
}

impl AgentConfig {
    /// Load order: explicit `--config` path, then `NIMBUS_CONFIG`, then
    /// `./config.yaml`, each merged over built-in defaults. Environment
    /// overrides win last.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AgentConfig::default()));

        let resolved: Option<PathBuf> = match path {
            Some(p) => Some(p.to_path_buf()),
            None => match env::var("NIMBUS_CONFIG") {
                Ok(p) if Path::new(&p).exists() => Some(PathBuf::from(p)),
                _ => {
                    let default = Path::new("config.yaml");
                    default.exists().then(|| default.to_path_buf())
                }
            },
        };
        if let Some(p) = &resolved {
            figment = figment.merge(Yaml::file(p));
        }

        let mut config: AgentConfig = figment
            .extract()
            .with_context(|| "failed to parse configuration")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Deployment-variable knobs are overridable without touching the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(region) = env::var("AWS_REGION") {
            self.aws.region = region;
        }
        if let Ok(url) = env::var("SQS_QUEUE_URL") {
            self.sqs.queue_url = url;
        }
        if let Ok(host) = env::var("REDIS_HOST") {
            self.redis.host = host;
        }
        if let Ok(port) = env::var("REDIS_PORT") {
            if let Ok(port) = port.parse() {
                self.redis.port = port;
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.sqs.queue_url.is_empty(), "sqs.queue_url is not set");
        anyhow::ensure!(
            self.sqs.wait_time_seconds <= 20,
            "sqs.wait_time_seconds must be at most 20"
        );
        anyhow::ensure!(
            self.docker.default_timeout_ms > 0,
            "docker.default_timeout_ms must be positive"
        );
        anyhow::ensure!(
            self.limits.stream_cap_bytes > 0,
            "limits.stream_cap_bytes must be positive"
        );
        Ok(())
    }

    pub fn runtime_images(&self) -> RuntimeImages {
        RuntimeImages {
            python: self.docker.python_image.clone(),
            cpp: self.docker.cpp_image.clone(),
            nodejs: self.docker.nodejs_image.clone(),
            go: self.docker.go_image.clone(),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        let mut sizes = HashMap::new();
        sizes.insert(Runtime::Python, self.warm_pool.python_size);
        sizes.insert(Runtime::Cpp, self.warm_pool.cpp_size);
        sizes.insert(Runtime::Nodejs, self.warm_pool.nodejs_size);
        sizes.insert(Runtime::Go, self.warm_pool.go_size);
        PoolSettings {
            enabled: self.warm_pool.enabled,
            sizes,
        }
    }

    /// Concurrency bound for the dispatcher: the sum of the per-runtime
    /// pool capacities.
    pub fn max_in_flight(&self) -> usize {
        self.pool_settings().max_in_flight()
    }

    pub fn stage_config(&self) -> nimbus_executor::StageConfig {
        nimbus_executor::StageConfig {
            task_base_dir: self.task_base_dir.clone(),
            code_bucket: self.s3.code_bucket.clone(),
            work_dir_root: self.docker.work_dir_root.clone(),
            max_bundle_bytes: self.limits.max_bundle_bytes,
            max_expanded_bytes: self.limits.max_expanded_bytes,
        }
    }

    pub fn output_config(&self) -> nimbus_executor::OutputConfig {
        nimbus_executor::OutputConfig {
            enabled: self.output.enabled,
            base_dir: self.output.base_dir.clone(),
            s3_prefix: self.output.s3_prefix.clone(),
            user_data_bucket: self.s3.user_data_bucket.clone(),
            work_dir_root: self.docker.work_dir_root.clone(),
        }
    }
}
