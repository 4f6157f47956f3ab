use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::{json, Value};

/// Status code plus JSON body of one remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub data: Value,
}

impl HttpReply {
    pub fn new(status: u16, data: Value) -> Self {
        Self { status, data }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound HTTP as seen by the orchestrator and the offline pipelines.
///
/// `Err` means the remote could not be reached or the body could not be
/// read. Any status code the remote answered with is an `Ok` reply.
pub trait Transport: Send + Sync {
    fn send_json(&self, method: Method, url: &str, body: Option<&Value>) -> Result<HttpReply>;

    /// Downloads raw bytes; non-success statuses are errors.
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;

    fn put_bytes(&self, url: &str, content_type: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Monotonic time and sleeping, injected so polling can be driven by tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

pub struct FalHttpTransport {
    api_key: String,
    http: HttpClient,
}

impl FalHttpTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http: HttpClient::new(),
        }
    }

    fn authorization(&self) -> String {
        format!("Key {}", self.api_key)
    }
}

impl Transport for FalHttpTransport {
    fn send_json(&self, method: Method, url: &str, body: Option<&Value>) -> Result<HttpReply> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .header(AUTHORIZATION, self.authorization());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .with_context(|| format!("{method} {url} failed"))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .with_context(|| format!("{method} {url} body read failed"))?;
        Ok(HttpReply::new(status, parse_body(&text)))
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.authorization())
            .send()
            .with_context(|| format!("failed downloading {url}"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!("Download failed ({code}): {}", truncate_text(&body, 512));
        }
        Ok(response
            .bytes()
            .with_context(|| format!("failed reading bytes from {url}"))?
            .to_vec())
    }

    fn put_bytes(&self, url: &str, content_type: &str, bytes: Vec<u8>) -> Result<()> {
        let response = self
            .http
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .with_context(|| format!("PUT {url} failed"))?;
        if !response.status().is_success() {
            bail!("Storage PUT failed ({})", response.status().as_u16());
        }
        Ok(())
    }
}

/// Empty bodies read as `{}`; anything that is not JSON is kept as `{raw}`.
pub fn parse_body(text: &str) -> Value {
    if text.is_empty() {
        return json!({});
    }
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "raw": text }))
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
