// HTTP route handlers for the Sentinel dispatcher

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use redis::RedisResult;
use sentinel_common::broker::{self, Queue, RetryPolicy};
use sentinel_common::types::{Job, JobState, QueueSnapshot, TestCase, TestCaseResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub code: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub test_cases: Option<Vec<TestCaseInput>>,
}

#[derive(Debug, Deserialize)]
pub struct TestCaseInput {
    pub input: String,
    pub expected: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub id: String,
    pub status: &'static str,
    pub timestamp: String,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub id: String,
    pub status: &'static str,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_cases: Option<Vec<TestCaseResult>>,
}

fn bad_request(message: String) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "failed", "message": message })),
    )
        .into_response()
}

fn internal_error(message: &str) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "failed", "message": message })),
    )
        .into_response()
}

/// POST /execute - validate, place, and enqueue a job
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let code = payload.code.unwrap_or_default();
    let language = payload.language.unwrap_or_default();
    if code.is_empty() || language.is_empty() {
        return bad_request("Both code and language are required".to_string());
    }
    if !state.registry.is_supported(&language) {
        return bad_request(format!("Unsupported language: {language}"));
    }

    let test_cases: Option<Vec<TestCase>> = payload.test_cases.and_then(|cases| {
        if cases.is_empty() {
            None
        } else {
            Some(
                cases
                    .into_iter()
                    .map(|c| TestCase {
                        input: c.input,
                        expected: c.expected,
                    })
                    .collect(),
            )
        }
    });

    let job = Job {
        id: Uuid::new_v4(),
        language: language.clone(),
        code,
        input: payload.input.unwrap_or_default(),
        test_cases,
        created_at: Utc::now(),
    };

    let queue_name = match select_queue(&state, &language).await {
        Ok(name) => name,
        Err(e) => {
            error!(language = %language, error = %e, "failed to inspect queue depths");
            return internal_error("Failed to queue job");
        }
    };

    let mut queue = Queue::new(queue_name.clone(), state.redis.clone());
    match queue.add(&job, &RetryPolicy::default()).await {
        Ok(()) => {
            info!(
                job_id = %job.id,
                language = %language,
                queue = %queue_name,
                test_cases = job.test_cases.as_ref().map_or(0, |c| c.len()),
                "Job queued"
            );
            (
                StatusCode::OK,
                Json(SubmitResponse {
                    id: job.id.to_string(),
                    status: "queued",
                    timestamp: Utc::now().to_rfc3339(),
                    message: "Job queued for execution",
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "failed to queue job");
            internal_error("Failed to queue job")
        }
    }
}

/// Pick the queue for a language. With several instances, depths are read
/// fresh on every request - a cached depth would defeat the balancer.
async fn select_queue(state: &AppState, language: &str) -> RedisResult<String> {
    let names = broker::queue_names(language, state.settings.executor_instances);
    if names.len() == 1 {
        return Ok(names.into_iter().next().expect("one queue name"));
    }
    let mut depths = Vec::with_capacity(names.len());
    for name in names {
        let mut queue = Queue::new(name.clone(), state.redis.clone());
        let counts = queue.counts().await?;
        depths.push((name, counts.waiting));
    }
    Ok(pick_least_loaded(&depths).to_string())
}

/// Lowest waiting depth wins; ties go to the earlier-listed instance.
fn pick_least_loaded(depths: &[(String, u64)]) -> &str {
    let mut best = &depths[0];
    for candidate in &depths[1..] {
        if candidate.1 < best.1 {
            best = candidate;
        }
    }
    &best.0
}

fn all_queue_names(state: &AppState) -> Vec<String> {
    state
        .registry
        .list()
        .into_iter()
        .flat_map(|d| broker::queue_names(&d.name, state.settings.executor_instances))
        .collect()
}

/// GET /job/:id - look a job up across every queue
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(job_id) = Uuid::parse_str(&id) else {
        return bad_request("Invalid job ID format".to_string());
    };

    for queue_name in all_queue_names(&state) {
        let mut queue = Queue::new(queue_name, state.redis.clone());
        match queue.get_by_id(&job_id).await {
            Ok(Some(record)) => return render_job(&id, record),
            Ok(None) => continue,
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to query job status");
                return internal_error("Failed to query job status");
            }
        }
    }

    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "id": id,
            "status": "failed",
            "message": "Job not found"
        })),
    )
        .into_response()
}

fn render_job(id: &str, record: broker::JobRecord) -> axum::response::Response {
    let mut body = JobStatusResponse {
        id: id.to_string(),
        status: record.state.client_status(),
        timestamp: Utc::now().to_rfc3339(),
        progress: None,
        output: None,
        error: None,
        execution_time: None,
        test_cases: None,
    };

    match record.state {
        JobState::Waiting | JobState::Active => {
            body.progress = Some(record.progress);
        }
        JobState::Completed => {
            if let Some(result) = record.result {
                body.output = Some(result.output);
                body.error = Some(result.error);
                body.execution_time = Some(result.execution_time);
                body.test_cases = result.test_cases;
            }
        }
        JobState::Failed => {
            body.error = record.failed_reason;
        }
    }

    (StatusCode::OK, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerLoad {
    container_id: String,
    language: String,
    waiting: u64,
    active: u64,
    completed: u64,
    failed: u64,
    total_jobs: u64,
}

/// GET /load - per-queue counters plus totals
pub async fn get_load(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut containers = Vec::new();
    let mut total_waiting = 0u64;
    let mut total_active = 0u64;

    for queue_name in all_queue_names(&state) {
        let mut queue = Queue::new(queue_name.clone(), state.redis.clone());
        let counts = match queue.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                error!(queue = %queue_name, error = %e, "failed to read queue counters");
                return internal_error("Failed to read load report");
            }
        };
        let snapshot = snapshot_of(&queue_name, &counts);
        total_waiting += snapshot.waiting;
        total_active += snapshot.active;
        containers.push(ContainerLoad {
            container_id: queue_name,
            total_jobs: snapshot.waiting + snapshot.active + snapshot.completed + snapshot.failed,
            language: snapshot.language,
            waiting: snapshot.waiting,
            active: snapshot.active,
            completed: snapshot.completed,
            failed: snapshot.failed,
        });
    }

    (
        StatusCode::OK,
        Json(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "containers": containers,
            "totalWaiting": total_waiting,
            "totalActive": total_active,
        })),
    )
        .into_response()
}

/// GET /health - broker ping plus per-queue readiness
pub async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut conn = state.redis.clone();
    let redis_ok = broker::ping(&mut conn).await.is_ok();

    let mut queues = BTreeMap::new();
    let mut all_ready = true;
    for queue_name in all_queue_names(&state) {
        let mut queue = Queue::new(queue_name.clone(), state.redis.clone());
        let ready = redis_ok && queue.is_ready().await;
        all_ready &= ready;
        queues.insert(queue_name, if ready { "healthy" } else { "unhealthy" });
    }

    let status = if !redis_ok {
        "unhealthy"
    } else if all_ready {
        "healthy"
    } else {
        "degraded"
    };

    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "timestamp": Utc::now().to_rfc3339(),
            "redis": if redis_ok { "connected" } else { "unreachable" },
            "queues": queues,
        })),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LanguageSummary {
    name: String,
    display_name: String,
}

/// GET /languages - the registry's public listing
pub async fn list_languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let languages: Vec<LanguageSummary> = state
        .registry
        .list()
        .into_iter()
        .map(|d| LanguageSummary {
            name: d.name.clone(),
            display_name: d.display_name.clone(),
        })
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "count": languages.len(),
            "languages": languages,
        })),
    )
        .into_response()
}

/// Derive the read-only snapshot of a queue from its name and counters.
fn snapshot_of(queue_name: &str, counts: &broker::QueueCounts) -> QueueSnapshot {
    QueueSnapshot {
        language: broker::queue_language(queue_name).to_string(),
        instance_id: broker::queue_instance_id(queue_name).to_string(),
        waiting: counts.waiting,
        active: counts.active,
        completed: counts.completed,
        failed: counts.failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depths(pairs: &[(&str, u64)]) -> Vec<(String, u64)> {
        pairs.iter().map(|(n, d)| (n.to_string(), *d)).collect()
    }

    #[test]
    fn least_loaded_queue_wins() {
        let depths = depths(&[
            ("python-executor-1", 4),
            ("python-executor-2", 1),
            ("python-executor-3", 2),
        ]);
        assert_eq!(pick_least_loaded(&depths), "python-executor-2");
    }

    #[test]
    fn placement_ties_break_to_the_earlier_instance() {
        let depths = depths(&[
            ("python-executor-1", 2),
            ("python-executor-2", 2),
            ("python-executor-3", 2),
        ]);
        assert_eq!(pick_least_loaded(&depths), "python-executor-1");
    }

    #[test]
    fn zero_depth_beats_everything() {
        let depths = depths(&[("python-executor-1", 3), ("python-executor-2", 0)]);
        assert_eq!(pick_least_loaded(&depths), "python-executor-2");
    }

    #[test]
    fn snapshot_parses_instance_from_queue_name() {
        let counts = broker::QueueCounts {
            waiting: 1,
            active: 2,
            completed: 3,
            failed: 4,
        };
        let snapshot = snapshot_of("python-executor-2", &counts);
        assert_eq!(snapshot.language, "python");
        assert_eq!(snapshot.instance_id, "2");
        assert_eq!(snapshot.waiting, 1);
    }
}
