use std::sync::Arc;

use oj_judger::broker::{KafkaConsumer, KafkaProducer};
use oj_judger::config::JudgerConfig;
use oj_judger::processor::ProcessorLoop;
use oj_judger::store::PgStore;
use sandbox::local::LocalSandbox;
use sandbox::secure::SecureSandbox;
use sandbox::{ExecLimits, Sandbox};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = JudgerConfig::from_env();
    tracing::info!(
        sandbox_enabled = config.sandbox_enabled,
        concurrent_judges = config.concurrent_judges,
        "judger starting"
    );

    tokio::fs::create_dir_all(&config.work_dir).await?;

    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    let consumer = Arc::new(KafkaConsumer::new(
        &config.kafka_brokers,
        &config.kafka_group_id,
        &config.kafka_submission_topic,
    )?);
    let producer = Arc::new(KafkaProducer::new(
        &config.kafka_brokers,
        &config.kafka_result_topic,
    )?);

    let sandbox: Arc<dyn Sandbox> = if config.sandbox_enabled {
        Arc::new(SecureSandbox::new(config.work_dir.clone()))
    } else {
        Arc::new(LocalSandbox::new(config.work_dir.clone()))
    };

    let limits = ExecLimits::new(config.max_execution_time, config.max_memory_usage_bytes);

    let processor = ProcessorLoop::new(
        consumer,
        producer,
        store,
        sandbox,
        limits,
        config.kafka_poll_timeout,
        config.concurrent_judges,
    );

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_cancel.cancel();
    });

    processor.run(cancel).await;

    tracing::info!("judger stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
