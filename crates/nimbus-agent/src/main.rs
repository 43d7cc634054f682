use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use bollard::Docker;
use clap::Parser;
use nimbus_agent::{
    aws::{CloudWatchSink, S3Store, SqsQueue},
    publish::RedisPublisher,
    AgentConfig, AgentContext, Dispatcher, ExitReason,
};
use nimbus_common::{ContainerDaemon, RuntimeTable};
use nimbus_executor::{DockerDaemon, Executor, OutputBinder, Stager, WarmPool};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Queue-driven function execution agent.
#[derive(Debug, Parser)]
#[command(name = "nimbus-agent", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(ExitReason::CleanShutdown) => ExitCode::SUCCESS,
        Ok(ExitReason::DaemonLost) => {
            error!("exiting after container daemon loss");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("fatal startup failure: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitReason> {
    let config = AgentConfig::load(cli.config.as_deref())?;
    config.validate()?;
    info!(
        region = %config.aws.region,
        queue = %config.sqs.queue_url,
        redis = %format!("{}:{}", config.redis.host, config.redis.port),
        warm_pool = config.warm_pool.enabled,
        "configuration loaded"
    );

    let docker = Arc::new(
        Docker::connect_with_local_defaults().context("connecting to the container daemon")?,
    );
    let daemon: Arc<dyn ContainerDaemon> = Arc::new(DockerDaemon::new(docker));
    daemon
        .ping()
        .await
        .context("container daemon did not answer ping")?;
    info!("container daemon reachable");

    let aws = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.aws.region.clone()))
        .load()
        .await;
    let queue = Arc::new(SqsQueue::new(aws_sdk_sqs::Client::new(&aws), &config.sqs));
    let store = Arc::new(S3Store::new(aws_sdk_s3::Client::new(&aws)));
    let metrics = Arc::new(CloudWatchSink::new(aws_sdk_cloudwatch::Client::new(&aws)));
    let publisher =
        Arc::new(RedisPublisher::new(&config.redis).context("building the redis publisher")?);

    let table = Arc::new(RuntimeTable::new(
        config.runtime_images(),
        config.docker.default_timeout_ms,
    ));
    let pool = Arc::new(WarmPool::new(
        Arc::clone(&daemon),
        &table,
        &config.pool_settings(),
    ));
    pool.start().await;

    let stager = Stager::new(store.clone(), config.stage_config());
    let binder = OutputBinder::new(store.clone(), config.output_config());
    let executor = Executor::new(Arc::clone(&daemon));

    let ctx = Arc::new(AgentContext {
        config,
        table,
        queue,
        store,
        publisher,
        metrics,
        daemon,
        pool,
        stager,
        binder,
        executor,
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let dispatcher = Dispatcher::new(ctx, shutdown);
    let reason = dispatcher.run().await;
    info!(?reason, "agent stopped");
    Ok(reason)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
