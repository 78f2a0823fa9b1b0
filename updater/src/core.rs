use ::config::shared::UpdaterConfig;
use audience::concurrency::shutdown::create_shutdown_channel;
use audience::pipeline::{AudiencePipeline, PipelineRole};
use audience::prune::prune_audience;
use audience::queue::amqp::AmqpQueue;
use audience::queue::{ChangePublisher, TaskQueue};
use audience::source::AnalyticalSource;
use audience::source::mysql::MySqlAnalyticalSource;
use audience::store::AudienceStore;
use audience::store::postgres::{PostgresAudienceStore, create_store_pool};
use audience::types::AudienceId;
use audience::workers::scheduler::dispatch_once;
use postgres::migrations::migrate_audience_store;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::Command;
use crate::error::UpdaterResult;

/// Runs `command` against the configured store, source and broker.
pub async fn run_command(command: Command, config: UpdaterConfig) -> UpdaterResult<()> {
    info!(?command, "starting audience updater");

    match command {
        Command::Run => run_pipeline(PipelineRole::All, config).await,
        Command::Scheduler => run_pipeline(PipelineRole::Scheduler, config).await,
        Command::Worker => run_pipeline(PipelineRole::Workers, config).await,
        Command::Trigger => trigger(config).await,
        Command::Prune {
            audience_id,
            dry_run,
        } => prune(config, AudienceId::new(audience_id), dry_run).await,
        Command::Migrate => {
            migrated_store(&config).await?;
            Ok(())
        }
    }
}

/// Builds the audience store and brings its schema up to date.
async fn migrated_store(config: &UpdaterConfig) -> UpdaterResult<PostgresAudienceStore> {
    let pool = create_store_pool(&config.store);
    migrate_audience_store(&pool).await?;

    Ok(PostgresAudienceStore::new(pool))
}

async fn run_pipeline(role: PipelineRole, config: UpdaterConfig) -> UpdaterResult<()> {
    let store = migrated_store(&config).await?;

    // A scheduler-only process never queries the source.
    let source = match role {
        PipelineRole::Scheduler => MySqlAnalyticalSource::connect_lazy(&config.source),
        PipelineRole::All | PipelineRole::Workers => {
            MySqlAnalyticalSource::connect(&config.source).await?
        }
    };

    let queue = AmqpQueue::connect(config.queue.clone()).await?;

    let pipeline = AudiencePipeline::new(
        role,
        config.scheduler.clone(),
        config.worker.clone(),
        queue.clone(),
        store,
        source,
        queue.clone(),
    );

    let result = start_pipeline(pipeline).await;

    if let Err(err) = queue.close().await {
        warn!(error = %err, "failed to close broker connection");
    }

    result
}

/// Starts a pipeline and shuts it down on SIGINT or SIGTERM.
async fn start_pipeline<Q, St, So, P>(
    mut pipeline: AudiencePipeline<Q, St, So, P>,
) -> UpdaterResult<()>
where
    Q: TaskQueue + Clone + Send + Sync + 'static,
    St: AudienceStore + Clone + Send + Sync + 'static,
    So: AnalyticalSource + Clone + Send + Sync + 'static,
    P: ChangePublisher + Clone + Send + Sync + 'static,
{
    // Registered before starting so a failure leaves nothing running.
    let mut sigterm = signal(SignalKind::terminate())?;

    pipeline.start().await?;

    let shutdown_tx = pipeline.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down pipeline");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down pipeline");
            }
        }

        if let Err(err) = shutdown_tx.shutdown() {
            warn!(error = ?err, "failed to send shutdown signal");
            return;
        }

        info!("pipeline shutdown requested, settling in-flight tasks");
    });

    let result = pipeline.wait().await;

    // The pipeline may stop on its own, e.g. when the scheduler fails.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    result?;

    info!("audience pipeline stopped");

    Ok(())
}

/// Enqueues one task per audience, once.
async fn trigger(config: UpdaterConfig) -> UpdaterResult<()> {
    let store = migrated_store(&config).await?;
    let queue = AmqpQueue::connect(config.queue.clone()).await?;

    // Nothing requests shutdown, the run always covers every audience.
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let result = dispatch_once(&store, &queue, &shutdown_rx).await;

    if let Err(err) = queue.close().await {
        warn!(error = %err, "failed to close broker connection");
    }

    let report = result?;
    info!(
        enumerated = report.enumerated,
        dispatched = report.dispatched,
        failed = report.failed,
        "manual dispatch completed"
    );

    Ok(())
}

async fn prune(config: UpdaterConfig, audience_id: AudienceId, dry_run: bool) -> UpdaterResult<()> {
    let store = migrated_store(&config).await?;
    let source = MySqlAnalyticalSource::connect(&config.source).await?;
    let queue = AmqpQueue::connect(config.queue.clone()).await?;

    let result = prune_audience(&store, &source, &queue, audience_id, dry_run).await;

    if let Err(err) = queue.close().await {
        warn!(error = %err, "failed to close broker connection");
    }

    let report = result?;
    info!(
        %audience_id,
        out_of_scope = report.out_of_scope.len(),
        removed = report.removed.len(),
        member_count = report.member_count,
        published = report.published,
        dry_run,
        "prune completed"
    );

    Ok(())
}
