use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use reqwest::Method;
use serde_json::Value;

use crate::orchestrator::JobOrchestrator;
use crate::transport::{Clock, HttpReply, Transport};

pub(crate) const QUEUE: &str = "https://queue.test";
pub(crate) const DIRECT: &str = "https://run.test";

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Json(u16, Value),
    Bytes(Vec<u8>),
    Unreachable,
}

#[derive(Debug)]
struct Route {
    method: Method,
    url: String,
    replies: VecDeque<Reply>,
}

/// In-memory remote. Each route answers its queued replies in order and
/// keeps repeating the last one.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<(Method, String)>>,
    bodies: Mutex<Vec<(String, Value)>>,
    uploads: Mutex<Vec<(String, usize)>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn on(&self, method: Method, url: &str, reply: Reply) -> &Self {
        let mut routes = self.routes.lock().unwrap_or_else(|err| err.into_inner());
        match routes
            .iter_mut()
            .find(|route| route.method == method && route.url == url)
        {
            Some(route) => route.replies.push_back(reply),
            None => routes.push(Route {
                method,
                url: url.to_string(),
                replies: VecDeque::from([reply]),
            }),
        }
        self
    }

    pub(crate) fn json(&self, method: Method, url: &str, status: u16, data: Value) -> &Self {
        self.on(method, url, Reply::Json(status, data))
    }

    pub(crate) fn calls(&self) -> Vec<(Method, String)> {
        self.calls
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub(crate) fn count(&self, method: &Method, url: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(called, called_url)| called == method && called_url == url)
            .count()
    }

    /// JSON bodies sent to `url`, oldest first.
    pub(crate) fn bodies(&self, url: &str) -> Vec<Value> {
        self.bodies
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .iter()
            .filter(|(sent_to, _)| sent_to == url)
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub(crate) fn uploads(&self) -> Vec<(String, usize)> {
        self.uploads
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    fn next(&self, method: &Method, url: &str) -> Result<Reply> {
        self.calls
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push((method.clone(), url.to_string()));
        let mut routes = self.routes.lock().unwrap_or_else(|err| err.into_inner());
        let route = routes
            .iter_mut()
            .find(|route| &route.method == method && route.url == url)
            .ok_or_else(|| anyhow!("no scripted route for {method} {url}"))?;
        let reply = if route.replies.len() > 1 {
            route.replies.pop_front()
        } else {
            route.replies.front().cloned()
        };
        reply.ok_or_else(|| anyhow!("route {method} {url} has no replies"))
    }
}

impl Transport for ScriptedTransport {
    fn send_json(&self, method: Method, url: &str, body: Option<&Value>) -> Result<HttpReply> {
        if let Some(body) = body {
            self.bodies
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .push((url.to_string(), body.clone()));
        }
        match self.next(&method, url)? {
            Reply::Json(status, data) => Ok(HttpReply::new(status, data)),
            Reply::Bytes(_) => bail!("route {url} serves bytes"),
            Reply::Unreachable => bail!("connection refused ({url})"),
        }
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        match self.next(&Method::GET, url)? {
            Reply::Bytes(bytes) => Ok(bytes),
            Reply::Json(status, _) => bail!("Download failed ({status})"),
            Reply::Unreachable => bail!("connection refused ({url})"),
        }
    }

    fn put_bytes(&self, url: &str, _content_type: &str, bytes: Vec<u8>) -> Result<()> {
        match self.next(&Method::PUT, url)? {
            Reply::Json(status, _) if (200..300).contains(&status) => {
                self.uploads
                    .lock()
                    .unwrap_or_else(|err| err.into_inner())
                    .push((url.to_string(), bytes.len()));
                Ok(())
            }
            Reply::Json(status, _) => bail!("Storage PUT failed ({status})"),
            _ => bail!("connection refused ({url})"),
        }
    }
}

/// Clock that only moves when slept on.
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now_ms: Mutex<u64>,
    sleeps: Mutex<Vec<u64>>,
}

impl ManualClock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn sleeps(&self) -> Vec<u64> {
        self.sleeps
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        *self.now_ms.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn sleep(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        *self.now_ms.lock().unwrap_or_else(|err| err.into_inner()) += ms;
        self.sleeps
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(ms);
    }
}

/// Scripts one queued job that completes on the first status check.
pub(crate) fn script_queue(transport: &ScriptedTransport, endpoint: &str, id: &str, result: Value) {
    let base = format!("{QUEUE}/{endpoint}");
    transport
        .json(Method::POST, &base, 200, serde_json::json!({ "request_id": id }))
        .json(
            Method::GET,
            &format!("{base}/requests/{id}/status"),
            200,
            serde_json::json!({ "status": "COMPLETED" }),
        )
        .json(Method::GET, &format!("{base}/requests/{id}"), 200, result);
}

pub(crate) fn orchestrator(
    transport: &Arc<ScriptedTransport>,
    clock: &Arc<ManualClock>,
) -> JobOrchestrator {
    JobOrchestrator::new(transport.clone(), clock.clone(), QUEUE, DIRECT)
}

/// Event types in file order; unreadable lines are skipped.
pub(crate) fn read_event_types(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
        .collect())
}
