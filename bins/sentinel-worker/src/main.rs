mod cache;
mod executor;
mod process;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sentinel_common::broker::{self, JobRecord, Queue};
use sentinel_common::registry::LanguageRegistry;
use sentinel_common::settings::{Settings, WorkerSettings};
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::CompileCache;

/// Blocking-claim window; short enough that shutdown stays responsive.
const CLAIM_TIMEOUT_SECS: f64 = 5.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Sentinel worker booting...");

    let settings = Settings::from_env();
    let worker = WorkerSettings::from_env();

    let Some(language) = worker.language.clone() else {
        error!("LANGUAGE is not set - a worker serves exactly one language");
        std::process::exit(1);
    };

    let registry = LanguageRegistry::load(&settings.language_config_dir).map_err(|e| {
        error!(dir = %settings.language_config_dir, error = %e, "failed to load language descriptors");
        e
    })?;

    if !registry.is_supported(&language) {
        error!(
            "Language '{}' is not configured; available: {:?}",
            language,
            registry.names()
        );
        std::process::exit(1);
    }

    let queue_name = match worker.executor_id {
        Some(instance) => broker::instance_queue_name(&language, instance),
        None => broker::queue_name(&language),
    };

    let client = redis::Client::open(settings.redis_url().as_str())
        .context("failed to create Redis client")?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("failed to connect to Redis")?;
    info!("Connected to Redis: {}", settings.redis_url());
    info!(
        language = %language,
        queue = %queue_name,
        concurrency = worker.concurrency,
        "Worker is READY - waiting for jobs"
    );

    let token = CancellationToken::new();
    let shutdown_token = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal - finishing in-flight jobs");
            shutdown_token.cancel();
        }
    });

    worker_loop(
        Queue::new(queue_name, conn),
        Arc::new(registry),
        Arc::new(CompileCache::new()),
        worker.concurrency,
        token,
    )
    .await;

    info!("Worker shutdown complete - all jobs processed");
    Ok(())
}

async fn worker_loop(
    queue: Queue,
    registry: Arc<LanguageRegistry>,
    cache: Arc<CompileCache>,
    concurrency: usize,
    token: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut claim_queue = queue.clone();

    loop {
        while in_flight.try_join_next().is_some() {}

        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let claimed = tokio::select! {
            _ = token.cancelled() => {
                drop(permit);
                break;
            }
            claimed = claim_queue.claim(CLAIM_TIMEOUT_SECS) => claimed,
        };

        match claimed {
            Ok(Some(record)) => {
                let mut result_queue = queue.clone();
                let registry = registry.clone();
                let cache = cache.clone();
                in_flight.spawn(async move {
                    process_claim(&mut result_queue, &registry, &cache, record).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                debug!("Worker IDLE - no job within claim window");
                drop(permit);
            }
            Err(e) => {
                error!(error = %e, "broker error while claiming");
                drop(permit);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    if !in_flight.is_empty() {
        info!("Waiting for {} in-flight job(s) to finish", in_flight.len());
    }
    while in_flight.join_next().await.is_some() {}
}

async fn process_claim(
    queue: &mut Queue,
    registry: &LanguageRegistry,
    cache: &CompileCache,
    record: JobRecord,
) {
    let job = record.job;
    let job_id = job.id;
    info!(
        job_id = %job_id,
        language = %job.language,
        test_cases = job.test_cases.as_ref().map_or(0, |c| c.len()),
        source_size = job.code.len(),
        attempt = record.attempts_made + 1,
        phase = "claimed",
        "Worker BUSY - processing job"
    );

    let Some(descriptor) = registry.get(&job.language) else {
        // The dispatcher validates languages, so this is config drift
        // between the two processes.
        error!(job_id = %job_id, language = %job.language, "no descriptor for claimed job");
        surface_failure(queue, &job_id, format!("Unsupported language: {}", job.language)).await;
        return;
    };

    report_progress(queue, &job_id, 10).await;

    let result = executor::run(
        descriptor,
        &job.code,
        &job.input,
        job.test_cases.as_deref(),
        cache,
    )
    .await;

    info!(
        job_id = %job_id,
        phase = "executed",
        status = ?result.status,
        execution_ms = result.execution_time,
        "Execution completed"
    );

    report_progress(queue, &job_id, 100).await;

    match queue.complete(&job_id, &result).await {
        Ok(()) => {
            info!(job_id = %job_id, phase = "completed", "Result persisted");
        }
        Err(e) => {
            error!(job_id = %job_id, phase = "persist_failed", error = %e, "Failed to persist result");
            surface_failure(queue, &job_id, format!("Failed to persist result: {e}")).await;
        }
    }
}

async fn report_progress(queue: &mut Queue, job_id: &Uuid, progress: u8) {
    if let Err(e) = queue.update_progress(job_id, progress).await {
        warn!(job_id = %job_id, progress, error = %e, "failed to report progress");
    }
}

/// Surface a worker-side failure to the broker, which retries with backoff
/// until the job's attempts are exhausted.
async fn surface_failure(queue: &mut Queue, job_id: &Uuid, reason: String) {
    match queue.fail(job_id, &reason).await {
        Ok(true) => warn!(job_id = %job_id, reason = %reason, "job scheduled for retry"),
        Ok(false) => error!(job_id = %job_id, reason = %reason, "job failed permanently"),
        Err(e) => error!(job_id = %job_id, error = %e, "failed to record job failure"),
    }
}
