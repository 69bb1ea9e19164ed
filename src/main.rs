//! ledgerd - Ledger Backend
//!
//! Boots the storage layer and the task processor:
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌───────────────┐    ┌──────────┐
//! │  Config  │───▶│  PostgreSQL  │───▶│ TaskProcessor │───▶│  Mailer  │
//! │  (YAML)  │    │ (pool+schema)│    │ (tasks table) │    │ (relay)  │
//! └──────────┘    └──────────────┘    └───────────────┘    └──────────┘
//! ```
//!
//! Runs until Ctrl-C, then drains in-flight tasks.

use std::sync::Arc;

use anyhow::Context;

use ledgerd::config::AppConfig;
use ledgerd::db::Database;
use ledgerd::mail::{EmailSender, LogEmailSender, RelayEmailSender};
use ledgerd::random::ThreadRandom;
use ledgerd::store::Store;
use ledgerd::worker::{
    ProcessorConfig, SendVerifyEmailHandler, ServeMux, TASK_SEND_VERIFY_EMAIL, TaskBroker,
    TaskProcessor,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn build_mailer(config: &AppConfig) -> anyhow::Result<Arc<dyn EmailSender>> {
    if config.email.relay_url.is_some() {
        let relay = RelayEmailSender::new(&config.email).context("mail relay client")?;
        Ok(Arc::new(relay))
    } else {
        tracing::warn!("email.relay_url not set, mail is only logged");
        Ok(Arc::new(LogEmailSender {
            from_address: config.email.sender_address.clone(),
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).context("loading configuration")?;
    let _log_guard = ledgerd::logging::init_logging(&config);

    tracing::info!("Starting ledgerd in {} mode", env);

    let db = Database::open(&config)
        .await
        .context("opening PostgreSQL")?;
    db.health_check().await?;

    let store: Arc<dyn Store> = Arc::new(db.store());
    let broker: Arc<dyn TaskBroker> = Arc::new(db.task_broker());
    let mailer = build_mailer(&config)?;

    let mut mux = ServeMux::new();
    mux.handle(
        TASK_SEND_VERIFY_EMAIL,
        Arc::new(SendVerifyEmailHandler::new(
            store.clone(),
            mailer,
            Arc::new(ThreadRandom),
            config.email.verify_host.clone(),
        )),
    );

    let processor = TaskProcessor::new(broker, mux, ProcessorConfig::from(&config.worker));
    let handle = processor
        .start()
        .context("starting task processor")?;
    tracing::info!(
        concurrency = config.worker.concurrency,
        queues = ?config.worker.queues,
        "Task processor started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received, draining tasks");

    handle.shutdown().await;
    db.close().await;

    tracing::info!("ledgerd stopped");
    Ok(())
}
