//! Locating the rewritten prompt and the output image inside provider
//! responses whose shape is not known ahead of time.
//!
//! Both extractors try a short list of well-known fields first and fall back
//! to a depth-first walk over the whole `Value` tree. A miss is an empty
//! string, never an error.

use serde_json::Value;

use crate::jobs::validate_https_url;

const PREFERRED_TEXT_POINTERS: [&str; 7] = [
    "/output",
    "/text",
    "/result/output",
    "/result/text",
    "/choices/0/message/content",
    "/output/choices/0/message/content",
    "/result/choices/0/message/content",
];
const SCANNED_TEXT_KEYS: [&str; 3] = ["text", "content", "output"];
const MIN_SCANNED_TEXT_CHARS: usize = 20;

const IMAGE_EXTENSIONS: [&str; 5] = [".png", ".jpg", ".jpeg", ".webp", ".gif"];
const MEDIA_HOST_MARKERS: [&str; 3] = ["fal.media", "images", "cdn"];
const CONTROL_URL_PREFIXES: [&str; 4] = ["status", "cancel", "request", "response"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    PreferredField,
    DeepScan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionCandidate {
    pub value: String,
    pub provenance: Provenance,
}

impl ExtractionCandidate {
    fn preferred(value: &str) -> Self {
        Self {
            value: value.to_string(),
            provenance: Provenance::PreferredField,
        }
    }

    fn scanned(value: &str) -> Self {
        Self {
            value: value.to_string(),
            provenance: Provenance::DeepScan,
        }
    }
}

pub fn extract_text(payload: &Value) -> String {
    if let Some(preferred) = PREFERRED_TEXT_POINTERS
        .iter()
        .filter_map(|pointer| payload.pointer(pointer))
        .map(normalize_message_content)
        .find(|text| !text.is_empty())
    {
        return clean_prompt_text(&preferred);
    }

    let mut stack = vec![payload];
    while let Some(current) = stack.pop() {
        match current {
            Value::Array(items) => stack.extend(items.iter().rev()),
            Value::Object(fields) => {
                let mut nested = Vec::new();
                for (key, value) in fields {
                    match value {
                        Value::String(text) if SCANNED_TEXT_KEYS.contains(&key.as_str()) => {
                            let cleaned = clean_prompt_text(text);
                            if cleaned.chars().count() > MIN_SCANNED_TEXT_CHARS {
                                return cleaned;
                            }
                        }
                        Value::Array(_) | Value::Object(_) => nested.push(value),
                        _ => {}
                    }
                }
                stack.extend(nested.into_iter().rev());
            }
            _ => {}
        }
    }
    String::new()
}

/// Every image reference found in `payload`, preferred fields first, in
/// first-seen order without duplicates. Not yet filtered to https.
pub fn image_candidates(payload: &Value) -> Vec<ExtractionCandidate> {
    let mut candidates = Vec::new();
    if let Some(url) = payload.pointer("/image/url").and_then(Value::as_str) {
        candidates.push(ExtractionCandidate::preferred(url));
    }
    if let Some(images) = payload.get("images").and_then(Value::as_array) {
        for image in images {
            let url = match image {
                Value::String(url) => Some(url.as_str()),
                other => other.get("url").and_then(Value::as_str),
            };
            if let Some(url) = url {
                candidates.push(ExtractionCandidate::preferred(url));
            }
        }
    }

    // (node, under an excluded control-URL key)
    let mut stack: Vec<(&Value, bool)> = vec![(payload, false)];
    while let Some((current, excluded)) = stack.pop() {
        match current {
            Value::Array(items) => {
                for item in items {
                    if let Value::String(text) = item {
                        if !excluded && looks_like_image_url(text) {
                            candidates.push(ExtractionCandidate::scanned(text));
                        }
                    }
                }
                stack.extend(
                    items
                        .iter()
                        .filter(|item| item.is_object() || item.is_array())
                        .rev()
                        .map(|item| (item, excluded)),
                );
            }
            Value::Object(fields) => {
                let mut nested = Vec::new();
                for (key, value) in fields {
                    let key_excluded = excluded || is_control_url_key(key);
                    match value {
                        Value::String(text) => {
                            if !key_excluded && looks_like_image_url(text) {
                                candidates.push(ExtractionCandidate::scanned(text));
                            }
                        }
                        Value::Array(_) | Value::Object(_) => nested.push((value, key_excluded)),
                        _ => {}
                    }
                }
                stack.extend(nested.into_iter().rev());
            }
            _ => {}
        }
    }

    let mut unique: Vec<ExtractionCandidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !unique.iter().any(|seen| seen.value == candidate.value) {
            unique.push(candidate);
        }
    }
    unique
}

pub fn extract_image_url(payload: &Value) -> String {
    image_candidates(payload)
        .into_iter()
        .find(|candidate| validate_https_url(&candidate.value))
        .map(|candidate| candidate.value)
        .unwrap_or_default()
}

fn normalize_message_content(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                other => part_text(other),
            })
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string(),
        Value::Object(_) => part_text(value).unwrap_or_default().trim().to_string(),
        _ => String::new(),
    }
}

fn part_text(value: &Value) -> Option<&str> {
    ["text", "content"]
        .iter()
        .filter_map(|key| value.get(key).and_then(Value::as_str))
        .find(|text| !text.is_empty())
}

/// Drops a surrounding markdown code fence (```` ```lang ```` … ```` ``` ````).
fn clean_prompt_text(text: &str) -> String {
    let mut body = text;
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.trim_start_matches(|ch: char| ch.is_ascii_alphabetic());
        body = rest.strip_prefix('\n').unwrap_or(rest);
    }
    body.strip_suffix("```").unwrap_or(body).trim().to_string()
}

fn looks_like_image_url(value: &str) -> bool {
    if !value.starts_with("http") {
        return false;
    }
    let lowered = value.to_ascii_lowercase();
    let has_extension = IMAGE_EXTENSIONS.iter().any(|ext| {
        lowered.match_indices(ext).any(|(idx, _)| {
            matches!(lowered[idx + ext.len()..].chars().next(), None | Some('?'))
        })
    });
    has_extension
        || MEDIA_HOST_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
}

/// `status_url`, `cancelUrl`, `response_url` and friends point at queue
/// control resources, never at the produced media.
fn is_control_url_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    CONTROL_URL_PREFIXES.iter().any(|prefix| {
        lowered.match_indices(prefix).any(|(idx, _)| {
            let rest = &lowered[idx + prefix.len()..];
            rest.starts_with("url") || rest.starts_with("_url")
        })
    })
}
