use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use reqwest::Method;
use serde_json::{json, Map, Value};
use sprite_contracts::extract::extract_image_url;
use sprite_contracts::jobs::{pick_error_message, require_https_url};

use crate::generate::REMOVE_BG_ENDPOINT;
use crate::orchestrator::JobOrchestrator;
use crate::transport::Transport;

pub const PNG_CONTENT_TYPE: &str = "image/png";

/// Two-step storage upload: initiate returns a signed PUT target plus the
/// public URL the bytes will be served from.
pub fn upload_to_storage(
    transport: &dyn Transport,
    initiate_url: &str,
    bytes: Vec<u8>,
    content_type: &str,
    file_name: &str,
) -> Result<String> {
    let body = json!({ "file_name": file_name, "content_type": content_type });
    let reply = transport
        .send_json(Method::POST, initiate_url, Some(&body))
        .context("storage initiate failed")?;
    if !reply.is_success() {
        bail!("Storage initiate failed ({})", reply.status);
    }
    let field = |key: &str| -> Result<String> {
        let value = reply.data.get(key).and_then(Value::as_str).unwrap_or_default();
        let url = require_https_url(value)
            .with_context(|| format!("storage initiate returned no usable {key}"))?;
        Ok(url.to_string())
    };
    let upload_url = field("upload_url")?;
    let file_url = field("file_url")?;
    transport.put_bytes(&upload_url, content_type, bytes)?;
    Ok(file_url)
}

/// Direct background removal; returns the URL of the cut-out image.
pub fn remove_background(orchestrator: &JobOrchestrator, image_url: &str) -> Result<String> {
    let mut input = Map::new();
    input.insert("image_url".to_string(), Value::String(image_url.to_string()));
    let outcome = orchestrator.run_direct(REMOVE_BG_ENDPOINT, &input);
    if !outcome.is_success() {
        bail!(
            "BRIA failed ({}): {}",
            outcome.status(),
            pick_error_message(outcome.data(), "background removal failed")
        );
    }
    let url = extract_image_url(outcome.data());
    if url.is_empty() {
        bail!("BRIA returned no image URL");
    }
    Ok(url)
}

/// Downloads `url` into `path` and hands the bytes back.
pub fn download_to(transport: &dyn Transport, url: &str, path: &Path) -> Result<Vec<u8>> {
    let bytes = transport.fetch_bytes(url)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(bytes)
}
