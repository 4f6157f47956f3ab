use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_QUEUED_TIMEOUT_MS: u64 = 240_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid request id: {0}")]
    InvalidRequestId(String),
    #[error("Not an absolute https URL: {0}")]
    InsecureUrl(String),
}

/// Endpoint identifiers are path fragments such as `fal-ai/nano-banana-2`.
pub fn validate_endpoint_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '/' | '-'))
}

pub fn validate_request_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
}

pub fn validate_https_url(value: &str) -> bool {
    url::Url::parse(value)
        .map(|parsed| parsed.scheme() == "https")
        .unwrap_or(false)
}

pub fn require_https_url(value: &str) -> Result<&str, ValidationError> {
    if validate_https_url(value) {
        Ok(value)
    } else {
        Err(ValidationError::InsecureUrl(value.to_string()))
    }
}

/// Queue identifier handed out by the remote on submit.
///
/// Only constructible through validation, so it is always safe to splice into
/// follow-up status and result URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        if validate_request_id(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(ValidationError::InvalidRequestId(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub endpoint: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl JobRequest {
    pub fn new(
        endpoint: impl Into<String>,
        input: Map<String, Value>,
        timeout_ms: u64,
    ) -> Result<Self, ValidationError> {
        let request = Self {
            endpoint: endpoint.into(),
            input,
            timeout_ms,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if validate_endpoint_id(&self.endpoint) {
            Ok(())
        } else {
            Err(ValidationError::InvalidEndpoint(self.endpoint.clone()))
        }
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_QUEUED_TIMEOUT_MS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Submit,
    Status,
    Result,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Status => "status",
            Self::Result => "result",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub status: u16,
    pub stage: JobStage,
    pub request_id: Option<RequestId>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success { data: Value },
    Failure(JobFailure),
}

impl JobOutcome {
    pub fn success(data: Value) -> Self {
        Self::Success { data }
    }

    pub fn failure(
        status: u16,
        stage: JobStage,
        request_id: Option<&RequestId>,
        data: Value,
    ) -> Self {
        Self::Failure(JobFailure {
            status,
            stage,
            request_id: request_id.cloned(),
            data,
        })
    }

    /// Local rejection that never reached the network.
    pub fn rejected(stage: JobStage, err: &ValidationError) -> Self {
        Self::failure(400, stage, None, json!({ "error": err.to_string() }))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Success { .. } => 200,
            Self::Failure(failure) => failure.status,
        }
    }

    pub fn stage(&self) -> Option<JobStage> {
        match self {
            Self::Success { .. } => None,
            Self::Failure(failure) => Some(failure.stage),
        }
    }

    pub fn data(&self) -> &Value {
        match self {
            Self::Success { data } => data,
            Self::Failure(failure) => &failure.data,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Success { data } => json!({
                "ok": true,
                "status": 200,
                "data": data,
            }),
            Self::Failure(failure) => json!({
                "ok": false,
                "status": failure.status,
                "stage": failure.stage.as_str(),
                "requestId": failure
                    .request_id
                    .as_ref()
                    .map(RequestId::as_str)
                    .unwrap_or(""),
                "data": failure.data,
            }),
        }
    }
}

/// Best human-readable message from a remote error body.
pub fn pick_error_message(data: &Value, fallback: &str) -> String {
    if let Some(detail) = data.get("detail").and_then(Value::as_array) {
        let message = detail
            .iter()
            .filter_map(|entry| match entry {
                Value::String(text) => Some(text.as_str()),
                other => other.get("msg").and_then(Value::as_str),
            })
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" | ");
        if !message.is_empty() {
            return message;
        }
    }
    for key in ["error", "raw"] {
        if let Some(text) = data
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
        {
            return text.to_string();
        }
    }
    fallback.to_string()
}
