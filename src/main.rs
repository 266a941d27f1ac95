use std::sync::Arc;

use anyhow::Context;

use proposal_pilot::composer::DraftComposer;
use proposal_pilot::config::PilotConfig;
use proposal_pilot::llm::create_provider;
use proposal_pilot::logging;
use proposal_pilot::scheduler::{
    BatchScheduler, CancelSignal, alert_channel, parse_schedule, spawn_alert_logger,
    spawn_scheduled_runs,
};
use proposal_pilot::store::{LibSqlBackend, PilotStore, SubmissionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PilotConfig::from_env().context("Failed to load configuration")?;
    let _log_guard = logging::init(config.log_dir.as_deref());

    // Policy problems are fatal before any work starts.
    let policy = Arc::new(config.load_policy().context("Failed to load policy")?);

    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let store: Arc<dyn PilotStore> = backend.clone();
    let history: Arc<dyn SubmissionStore> = backend;

    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;

    eprintln!("Proposal Pilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Scope: {}/{}", config.tenant_id, config.user_id);

    let composer = Arc::new(DraftComposer::new(
        llm,
        history,
        config.llm.timeout,
        config.store_timeout,
    ));

    let (alert_tx, alert_rx) = alert_channel(64);
    let _alert_handle = spawn_alert_logger(alert_rx);

    let scheduler = Arc::new(
        BatchScheduler::new(
            store,
            composer,
            config.tenant_id.clone(),
            config.user_id.clone(),
            config.store_timeout,
        )
        .with_alerts(alert_tx),
    );

    let cancel = CancelSignal::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, finishing current item");
                cancel.cancel();
            }
        });
    }

    match &config.schedule {
        Some(expr) => {
            let schedule = parse_schedule(expr)?;
            eprintln!("   Schedule: {}", expr);
            let handle = spawn_scheduled_runs(
                scheduler,
                schedule,
                policy,
                config.run.clone(),
                cancel.clone(),
            );
            handle.await.context("Scheduled runner stopped unexpectedly")?;
        }
        None => {
            let summary = scheduler
                .execute_run(&policy, &config.run, &cancel)
                .await
                .context("Run could not start")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.errors.is_empty() {
                tracing::warn!(
                    failed = summary.errors.len(),
                    "Run finished with item errors"
                );
            }
        }
    }

    Ok(())
}
