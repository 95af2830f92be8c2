//! Run command implementation.

use crate::server::{start_server, ServerState};
use crate::ExitCode;
use anyhow::Result;
use k2m_core::config::{parse_list, FailurePolicy};
use k2m_core::health::{HealthCheck, COMPONENT_KAFKA, COMPONENT_STORE};
use k2m_core::kafka::{BrokerClient, KafkaBrokerBuilder};
use k2m_core::metrics::ConsumerMetrics;
use k2m_core::processor::ChatArchiveProcessor;
use k2m_core::shutdown::{self, ShutdownTrigger};
use k2m_core::sink::{
    DeadLetterSink, DocumentStore, MemoryStore, MongoStore, StoreDeadLetterSink, StoreSink,
};
use k2m_core::{Config, GroupConsumer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Placeholder store URI for dry runs.
const DRY_RUN_STORE: &str = "memory://dry-run";

/// Command-line overrides, applied after the file and environment.
#[derive(Debug, Default)]
pub struct Overrides {
    pub brokers: Option<String>,
    pub topics: Option<String>,
    pub consumer_group: Option<String>,
    pub dry_run: bool,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(brokers) = &self.brokers {
            config.kafka.bootstrap_servers = parse_list(brokers);
        }
        if let Some(topics) = &self.topics {
            config.kafka.topics = parse_list(topics);
        }
        if let Some(group) = &self.consumer_group {
            config.kafka.consumer_group = group.trim().to_string();
        }
        if self.dry_run && config.store.connection_string.is_empty() {
            config.store.connection_string = DRY_RUN_STORE.to_string();
        }
    }
}

/// Which signal ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Interrupt,
    Terminate,
}

/// Resolve the configuration: file, then environment, then flags.
fn resolve_config(path: Option<&Path>, overrides: &Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok());
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Run the group consumer until a signal or a fatal error.
pub async fn run(path: Option<&Path>, overrides: Overrides) -> Result<ExitCode> {
    let config = resolve_config(path, &overrides)?;

    info!(
        brokers = %config.kafka.bootstrap_servers.join(","),
        topics = %config.kafka.topics.join(","),
        group = %config.kafka.consumer_group,
        store = %config.store.redacted_connection_string(),
        dry_run = overrides.dry_run,
        "Starting group consumer"
    );

    let health = Arc::new(HealthCheck::for_consumer());
    let metrics = Arc::new(ConsumerMetrics::new()?);

    let (broker, events) = KafkaBrokerBuilder::new(config.kafka.clone())
        .with_revocation_grace(config.consumer.revocation_grace())
        .connect()
        .await?;
    let broker: Arc<dyn BrokerClient> = Arc::new(broker);
    health.mark_healthy(COMPONENT_KAFKA);

    let memory = overrides.dry_run.then(|| Arc::new(MemoryStore::new()));
    let store: Arc<dyn DocumentStore> = match &memory {
        Some(memory) => Arc::clone(memory) as Arc<dyn DocumentStore>,
        None => match MongoStore::connect(&config.store).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                if let Err(close_err) = broker.close().await {
                    warn!(error = %close_err, "Error closing broker client");
                }
                return Err(e.into());
            }
        },
    };
    health.mark_healthy(COMPONENT_STORE);

    let write_timeout = config.store.write_timeout();
    let sink = Arc::new(StoreSink::new(
        Arc::clone(&store),
        config.store.collection.clone(),
        write_timeout,
    ));
    let dead_letter = (config.consumer.failure_policy == FailurePolicy::DeadLetter).then(|| {
        Arc::new(StoreDeadLetterSink::new(
            Arc::clone(&store),
            config.store.dead_letter_collection.clone(),
            write_timeout,
        )) as Arc<dyn DeadLetterSink>
    });

    let consumer = GroupConsumer::builder(config.consumer.clone())
        .broker(broker, events)
        .processor(Arc::new(ChatArchiveProcessor::new(sink)))
        .metrics(metrics.clone())
        .health(health.clone())
        .dead_letter(dead_letter)
        .poll(
            config.kafka.batch_size,
            Duration::from_millis(config.kafka.batch_timeout_ms),
        )
        .build()?;

    let (trigger, shutdown) = shutdown::channel();
    let trigger = Arc::new(trigger);

    let server_state = Arc::new(ServerState {
        health: Arc::clone(&health),
        metrics: Arc::clone(&metrics),
        consumer: consumer.subscribe_state(),
    });
    let server = tokio::spawn(start_server(
        server_state,
        config.monitoring.health_port,
        config.monitoring.metrics_port,
        trigger.subscribe(),
    ));
    let signals = tokio::spawn(wait_for_signal(Arc::clone(&trigger)));

    let result = consumer.run(shutdown).await;

    trigger.trigger();
    if let Err(e) = server.await {
        warn!(error = %e, "HTTP server task failed");
    }
    let stop = if signals.is_finished() {
        signals.await.ok()
    } else {
        signals.abort();
        None
    };

    if let Some(memory) = &memory {
        info!(
            archived = memory.count(&config.store.collection),
            dead_lettered = memory.count(&config.store.dead_letter_collection),
            "Dry run finished"
        );
    }

    result?;
    info!("Group consumer stopped");

    Ok(match stop {
        Some(StopSignal::Interrupt) => ExitCode::SignalInterrupt,
        _ => ExitCode::Success,
    })
}

/// Wait for SIGINT or SIGTERM and fire the shutdown trigger.
async fn wait_for_signal(trigger: Arc<ShutdownTrigger>) -> StopSignal {
    let stop = wait_for_signal_inner().await;
    trigger.trigger();
    stop
}

#[cfg(unix)]
async fn wait_for_signal_inner() -> StopSignal {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            return StopSignal::Interrupt;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            StopSignal::Interrupt
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown");
            StopSignal::Terminate
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal_inner() -> StopSignal {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, initiating graceful shutdown");
    StopSignal::Interrupt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_overrides_take_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[kafka]
bootstrap_servers = ["file:9092"]
topics = ["from-file"]

[store]
connection_string = "mongodb://localhost:27017"
"#
        )
        .unwrap();

        let overrides = Overrides {
            brokers: Some(" a:9092, ,b:9092 ".into()),
            topics: Some("chat,audit".into()),
            consumer_group: Some("archivers".into()),
            dry_run: false,
        };
        let config = resolve_config(Some(file.path()), &overrides).unwrap();

        assert_eq!(config.kafka.bootstrap_servers, vec!["a:9092", "b:9092"]);
        assert_eq!(config.kafka.topics, vec!["chat", "audit"]);
        assert_eq!(config.kafka.consumer_group, "archivers");
    }

    #[test]
    fn test_dry_run_supplies_store_placeholder() {
        let mut config = Config::default();
        config.kafka.bootstrap_servers = vec!["localhost:9092".into()];
        let overrides = Overrides {
            dry_run: true,
            ..Default::default()
        };
        overrides.apply(&mut config);

        assert_eq!(config.store.connection_string, DRY_RUN_STORE);
        assert!(config.validate().is_ok());
    }
}
