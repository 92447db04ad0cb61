//! Job management API handlers, including the resumable SSE event feed

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use storyreel_common::{Error, Result};

use crate::api::middleware::{CurrentUser, JobsState};
use crate::domain::entities::{Job, JobEventRecord, JobTask};

/// Buffer depth for live event subscriptions; slow clients that overflow it
/// recover by reconnecting with their last-seen seq
const EVENT_STREAM_BUFFER: usize = 128;

/// Heartbeat comment interval on the SSE feed
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Job plus its task DAG
#[derive(Debug, Serialize)]
pub struct JobWithTasksResponse {
    pub job: Job,
    pub tasks: Vec<JobTask>,
}

/// Query parameters for the event stream
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub from_seq: Option<i64>,
}

/// Start a job for a project. An `Idempotency-Key` header collapses repeated
/// calls to a single job.
pub async fn start_job(
    CurrentUser { user_id, .. }: CurrentUser,
    State(state): State<JobsState>,
    Path(project_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Job>)> {
    let trace_id = trace_id_from_headers(&headers);
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let job = state
        .scheduler
        .start_job(user_id, project_id, trace_id, idempotency_key)?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Get a job with its tasks
pub async fn get_job(
    CurrentUser { user_id, .. }: CurrentUser,
    State(state): State<JobsState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobWithTasksResponse>> {
    let job = state.scheduler.get_job(job_id)?;
    if job.user_id != user_id {
        return Err(Error::Authorization("no access to job".to_string()));
    }
    let tasks = state.scheduler.get_job_tasks(job_id)?;
    Ok(Json(JobWithTasksResponse { job, tasks }))
}

/// Request cooperative cancellation
pub async fn cancel_job(
    CurrentUser { user_id, .. }: CurrentUser,
    State(state): State<JobsState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>> {
    let job = state.scheduler.cancel_job(user_id, job_id)?;
    Ok(Json(job))
}

/// Retry a terminal failed/canceled job
pub async fn retry_job(
    CurrentUser { user_id, .. }: CurrentUser,
    State(state): State<JobsState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Job>> {
    let trace_id = trace_id_from_headers(&headers);
    let job = state.scheduler.retry_job(user_id, job_id, trace_id)?;
    Ok(Json(job))
}

/// Stream a job's events as SSE, resumable by sequence number.
///
/// The cursor comes from the `from_seq` query parameter or the
/// `Last-Event-ID` header (0 when absent or malformed). The handler
/// subscribes to the hub before replaying the log so no event can fall
/// between replay and live tail; the tail dedupes on `seq`. The stream
/// closes after the job's terminal event.
pub async fn stream_job_events(
    CurrentUser { user_id, .. }: CurrentUser,
    State(state): State<JobsState>,
    Path(job_id): Path<Uuid>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<Sse<impl futures_core::Stream<Item = std::result::Result<Event, Infallible>>>> {
    let job = state.store.get_job(job_id)?;
    if job.user_id != user_id {
        return Err(Error::Authorization("no access to job".to_string()));
    }

    let mut from_seq = parse_last_event_seq(&headers);
    if let Some(q) = params.from_seq {
        if q > 0 {
            from_seq = q;
        }
    }

    let sub = state.hub.subscribe(job_id, EVENT_STREAM_BUFFER);
    let backlog = state.scheduler.list_events_from(job_id, from_seq)?;
    let store = Arc::clone(&state.store);

    let stream = async_stream::stream! {
        let mut sub = sub;
        let mut last_seq = from_seq;
        let mut done = false;
        for event in &backlog {
            last_seq = event.seq;
            done = event.event_type.is_terminal();
            yield Ok(sse_event(event));
        }

        // Nothing to replay and the job is already terminal: the client has
        // seen the final event, so there is no tail to wait for.
        if backlog.is_empty() && store.get_job(job_id).map(|j| j.is_terminal()).unwrap_or(true) {
            done = true;
        }

        while !done {
            let Some(event) = sub.receiver.recv().await else {
                break;
            };
            if event.seq <= last_seq {
                continue;
            }
            last_seq = event.seq;
            done = event.event_type.is_terminal();
            yield Ok(sse_event(&event));
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("ping")))
}

fn sse_event(event: &JobEventRecord) -> Event {
    Event::default()
        .id(event.seq.to_string())
        .event(event.event_type.to_string())
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

fn trace_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Parse the reconnection cursor from a `Last-Event-ID` header value.
/// Accepts a bare sequence or a `{prefix}:{seq}` form; anything else is 0.
fn parse_last_event_seq(headers: &HeaderMap) -> i64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit(':').next())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|n| *n >= 0)
        .unwrap_or(0)
}
