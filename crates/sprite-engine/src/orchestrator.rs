//! Submit / poll / fetch against a queue-based inference API, plus the single
//! synchronous call used for direct endpoints.
//!
//! Every path ends in a [`JobOutcome`]: remote rejections, unreachable remotes
//! and deadline expiry are values tagged with the stage they happened in.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::Method;
use serde_json::{json, Map, Value};
use sprite_contracts::jobs::{
    validate_endpoint_id, validate_https_url, JobOutcome, JobRequest, JobStage, RequestId,
    ValidationError,
};

use crate::config::DEFAULT_POLL_INTERVAL;
use crate::transport::{Clock, HttpReply, Transport};

const QUEUE_STATUS_COMPLETED: &str = "COMPLETED";
const QUEUE_STATUS_FAILED: &str = "FAILED";
const UNREACHABLE_STATUS: u16 = 502;
const TIMEOUT_STATUS: u16 = 504;

#[derive(Clone)]
pub struct JobOrchestrator {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    queue_base: String,
    direct_base: String,
    poll_interval: Duration,
}

/// Where a queued job stands after the poll loop.
#[derive(Debug)]
enum PollState {
    Completed,
    Failed(JobOutcome),
    TimedOut,
    StatusError(JobOutcome),
}

struct QueuedJob {
    request_id: RequestId,
    status_url: String,
    result_url: String,
    deadline_ms: u64,
}

impl JobOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        queue_base: &str,
        direct_base: &str,
    ) -> Self {
        Self {
            transport,
            clock,
            queue_base: queue_base.trim_end_matches('/').to_string(),
            direct_base: direct_base.trim_end_matches('/').to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn execute(&self, request: &JobRequest) -> JobOutcome {
        self.run_queued(&request.endpoint, &request.input, request.timeout_ms)
    }

    pub fn run_direct(&self, endpoint: &str, input: &Map<String, Value>) -> JobOutcome {
        if !validate_endpoint_id(endpoint) {
            return JobOutcome::rejected(
                JobStage::Result,
                &ValidationError::InvalidEndpoint(endpoint.to_string()),
            );
        }
        let url = format!("{}/{}", self.direct_base, endpoint);
        let body = Value::Object(input.clone());
        match self.transport.send_json(Method::POST, &url, Some(&body)) {
            Ok(reply) if reply.is_success() => JobOutcome::success(reply.data),
            Ok(reply) => {
                warn!("direct call {endpoint} rejected ({})", reply.status);
                JobOutcome::failure(reply.status, JobStage::Result, None, reply.data)
            }
            Err(err) => unreachable_failure(JobStage::Result, None, &err),
        }
    }

    pub fn run_queued(
        &self,
        endpoint: &str,
        input: &Map<String, Value>,
        timeout_ms: u64,
    ) -> JobOutcome {
        if !validate_endpoint_id(endpoint) {
            return JobOutcome::rejected(
                JobStage::Submit,
                &ValidationError::InvalidEndpoint(endpoint.to_string()),
            );
        }

        let submitted_at = self.clock.now_ms();
        let submit_url = format!("{}/{}", self.queue_base, endpoint);
        let body = Value::Object(input.clone());
        let submit = match self.transport.send_json(Method::POST, &submit_url, Some(&body)) {
            Ok(reply) => reply,
            Err(err) => return unreachable_failure(JobStage::Submit, None, &err),
        };
        if !submit.is_success() {
            warn!("submit to {endpoint} rejected ({})", submit.status);
            return JobOutcome::failure(submit.status, JobStage::Submit, None, submit.data);
        }

        let Some(request_id) = submit
            .data
            .get("request_id")
            .and_then(Value::as_str)
            .and_then(|raw| RequestId::parse(raw).ok())
        else {
            return JobOutcome::failure(
                UNREACHABLE_STATUS,
                JobStage::Submit,
                None,
                json!({ "error": "No valid request_id", "raw": submit.data }),
            );
        };
        info!("queued {endpoint} as {request_id}");

        let job = QueuedJob {
            status_url: format!(
                "{}/{}/requests/{}/status",
                self.queue_base, endpoint, request_id
            ),
            result_url: format!("{}/{}/requests/{}", self.queue_base, endpoint, request_id),
            request_id,
            deadline_ms: submitted_at.saturating_add(timeout_ms),
        };

        match self.poll(&job) {
            PollState::Completed => self.fetch(&job),
            PollState::Failed(outcome) | PollState::StatusError(outcome) => outcome,
            PollState::TimedOut => {
                warn!("{} timed out after {timeout_ms}ms", job.request_id);
                JobOutcome::failure(
                    TIMEOUT_STATUS,
                    JobStage::Status,
                    Some(&job.request_id),
                    json!({ "error": "Timeout" }),
                )
            }
        }
    }

    /// Serial status checks until a terminal state or the deadline. The
    /// final sleep is shortened so the last check lands on the deadline.
    fn poll(&self, job: &QueuedJob) -> PollState {
        loop {
            let now = self.clock.now_ms();
            if now >= job.deadline_ms {
                return PollState::TimedOut;
            }

            let reply = match self.transport.send_json(Method::GET, &job.status_url, None) {
                Ok(reply) => reply,
                Err(err) => {
                    return PollState::StatusError(unreachable_failure(
                        JobStage::Status,
                        Some(&job.request_id),
                        &err,
                    ))
                }
            };
            if !reply.is_success() {
                return PollState::StatusError(JobOutcome::failure(
                    reply.status,
                    JobStage::Status,
                    Some(&job.request_id),
                    reply.data,
                ));
            }

            let state = reply
                .data
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            debug!("{} status {state:?}", job.request_id);
            match state {
                QUEUE_STATUS_COMPLETED => return PollState::Completed,
                QUEUE_STATUS_FAILED => return PollState::Failed(self.fetch_failure(job)),
                _ => {}
            }

            let remaining = job.deadline_ms.saturating_sub(self.clock.now_ms());
            if remaining == 0 {
                return PollState::TimedOut;
            }
            self.clock
                .sleep(self.poll_interval.min(Duration::from_millis(remaining)));
        }
    }

    /// The remote marked the job failed; its result resource carries the
    /// error detail.
    fn fetch_failure(&self, job: &QueuedJob) -> JobOutcome {
        match self.transport.send_json(Method::GET, &job.result_url, None) {
            Ok(HttpReply { status, data }) => {
                let status = if (200..300).contains(&status) {
                    UNREACHABLE_STATUS
                } else {
                    status
                };
                JobOutcome::failure(status, JobStage::Result, Some(&job.request_id), data)
            }
            Err(err) => unreachable_failure(JobStage::Result, Some(&job.request_id), &err),
        }
    }

    fn fetch(&self, job: &QueuedJob) -> JobOutcome {
        let result = match self.transport.send_json(Method::GET, &job.result_url, None) {
            Ok(reply) => reply,
            Err(err) => {
                return unreachable_failure(JobStage::Result, Some(&job.request_id), &err)
            }
        };
        if !result.is_success() {
            return JobOutcome::failure(
                result.status,
                JobStage::Result,
                Some(&job.request_id),
                result.data,
            );
        }

        let pointer = result
            .data
            .get("response_url")
            .and_then(Value::as_str)
            .filter(|url| validate_https_url(url))
            .map(str::to_string);
        let Some(pointer) = pointer else {
            return JobOutcome::success(result.data);
        };
        match self.transport.send_json(Method::GET, &pointer, None) {
            Ok(reply) if reply.is_success() => JobOutcome::success(reply.data),
            Ok(reply) => {
                debug!("response pointer answered {}; keeping result body", reply.status);
                JobOutcome::success(result.data)
            }
            Err(err) => {
                debug!("response pointer unreachable ({err:#}); keeping result body");
                JobOutcome::success(result.data)
            }
        }
    }
}

fn unreachable_failure(
    stage: JobStage,
    request_id: Option<&RequestId>,
    err: &anyhow::Error,
) -> JobOutcome {
    warn!("{} stage failed: {err:#}", stage.as_str());
    JobOutcome::failure(
        UNREACHABLE_STATUS,
        stage,
        request_id,
        json!({ "error": format!("{err:#}") }),
    )
}
