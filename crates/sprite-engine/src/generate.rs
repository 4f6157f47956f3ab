//! Prompt → sprite sheet: LLM rewrite, sheet generation and a best-effort
//! transparent variant. Only the sheet itself is mandatory; the other two
//! steps degrade to warnings.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sprite_contracts::extract::{extract_image_url, extract_text};
use sprite_contracts::jobs::{pick_error_message, validate_https_url};
use sprite_contracts::prompts::{
    build_rewrite_system_prompt, build_sprite_prompt, clamp_grid, default_prompt,
    rewrite_user_prompt, DEFAULT_GRID,
};
use thiserror::Error;
use uuid::Uuid;

use crate::orchestrator::JobOrchestrator;

pub const SPRITE_ENDPOINT: &str = "fal-ai/nano-banana-2";
pub const SPRITE_EDIT_ENDPOINT: &str = "fal-ai/nano-banana-pro/edit";
pub const REMOVE_BG_ENDPOINT: &str = "fal-ai/bria/background/remove";
pub const REWRITE_ENDPOINT: &str = "openrouter/router";
pub const REWRITE_MODEL: &str = "openai/gpt-4o-mini";
pub const REWRITE_TIMEOUT_MS: u64 = 120_000;
pub const SPRITE_TIMEOUT_MS: u64 = 240_000;
pub const SPRITE_RESOLUTION: &str = "2K";

const NO_SPRITE_URL_STATUS: u16 = 502;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpriteRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub grid_size: Option<u32>,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpriteGeneration {
    pub prompt_original: String,
    pub prompt_rewritten: String,
    pub sprite_url: String,
    pub transparent_sprite_url: String,
    pub warnings: Vec<String>,
    pub grid_size: u32,
    pub resolution: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({status})")]
pub struct GenerationError {
    pub status: u16,
    pub message: String,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct SpritePipeline {
    orchestrator: JobOrchestrator,
}

impl SpritePipeline {
    pub fn new(orchestrator: JobOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &JobOrchestrator {
        &self.orchestrator
    }

    pub fn generate(&self, request: &SpriteRequest) -> Result<SpriteGeneration, GenerationError> {
        let original = request
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_prompt(Uuid::new_v4().as_u128()));
        let grid_size = clamp_grid(request.grid_size.unwrap_or(DEFAULT_GRID));
        let mut warnings = Vec::new();

        let rewritten = self.rewrite_prompt(&original, grid_size, &mut warnings);
        let reference = request
            .image_url
            .as_deref()
            .and_then(|url| accepted_reference(url, &mut warnings));

        let sprite_url = match self.generate_sprite(&rewritten, grid_size, reference) {
            Ok(url) => url,
            Err(err) => return Err(GenerationError { warnings, ..err }),
        };
        let transparent_sprite_url = self.cut_out(&sprite_url, &mut warnings);

        Ok(SpriteGeneration {
            prompt_original: original,
            prompt_rewritten: rewritten,
            sprite_url,
            transparent_sprite_url,
            warnings,
            grid_size,
            resolution: SPRITE_RESOLUTION.to_string(),
        })
    }

    /// Returns the rewritten prompt, or `base_prompt` with a warning recorded.
    pub fn rewrite_prompt(
        &self,
        base_prompt: &str,
        grid_size: u32,
        warnings: &mut Vec<String>,
    ) -> String {
        let input = map_object(json!({
            "model": REWRITE_MODEL,
            "prompt": rewrite_user_prompt(base_prompt, grid_size),
            "system_prompt": build_rewrite_system_prompt(grid_size),
            "max_tokens": 420,
            "temperature": 0.65,
        }));
        let outcome = self
            .orchestrator
            .run_queued(REWRITE_ENDPOINT, &input, REWRITE_TIMEOUT_MS);
        if !outcome.is_success() {
            let message = pick_error_message(outcome.data(), "Rewrite failed");
            warn!("prompt rewrite skipped: {message}");
            warnings.push(format!("Rewrite skipped: {message}"));
            return base_prompt.to_string();
        }
        let rewritten = extract_text(outcome.data());
        if rewritten.is_empty() {
            warnings.push("Rewrite returned unexpected format. Original prompt kept.".to_string());
            return base_prompt.to_string();
        }
        rewritten
    }

    /// Queues the sheet generation and returns its image URL. Errors carry
    /// the remote status and the best available message, without warnings.
    pub fn generate_sprite(
        &self,
        prompt: &str,
        grid_size: u32,
        reference_image: Option<&str>,
    ) -> Result<String, GenerationError> {
        let mut input = map_object(json!({
            "prompt": build_sprite_prompt(prompt, grid_size),
            "aspect_ratio": "1:1",
            "resolution": SPRITE_RESOLUTION,
            "num_images": 1,
            "output_format": "png",
            "safety_tolerance": 2,
        }));
        let endpoint = match reference_image {
            Some(url) => {
                input.insert("image_urls".to_string(), json!([url]));
                SPRITE_EDIT_ENDPOINT
            }
            None => {
                input.insert("expand_prompt".to_string(), Value::Bool(true));
                SPRITE_ENDPOINT
            }
        };

        let outcome = self
            .orchestrator
            .run_queued(endpoint, &input, SPRITE_TIMEOUT_MS);
        if !outcome.is_success() {
            return Err(GenerationError {
                status: outcome.status(),
                message: pick_error_message(outcome.data(), "Sprite generation failed"),
                warnings: Vec::new(),
            });
        }
        let url = extract_image_url(outcome.data());
        if url.is_empty() {
            return Err(GenerationError {
                status: NO_SPRITE_URL_STATUS,
                message: "No image URL in sprite result".to_string(),
                warnings: Vec::new(),
            });
        }
        info!("sprite sheet ready at {url}");
        Ok(url)
    }

    /// Direct background removal of the finished sheet. Empty on failure.
    fn cut_out(&self, sprite_url: &str, warnings: &mut Vec<String>) -> String {
        let input = map_object(json!({ "image_url": sprite_url }));
        let outcome = self.orchestrator.run_direct(REMOVE_BG_ENDPOINT, &input);
        if !outcome.is_success() {
            let message = pick_error_message(outcome.data(), "BRIA failed");
            warn!("background removal skipped: {message}");
            warnings.push(format!("BG removal skipped: {message}"));
            return String::new();
        }
        let url = extract_image_url(outcome.data());
        if url.is_empty() {
            warnings.push("BG removal succeeded but no output URL.".to_string());
        }
        url
    }
}

/// Reference images go to the edit endpoint as-is: hosted https files or
/// inline `data:image/` URLs.
fn accepted_reference<'a>(url: &'a str, warnings: &mut Vec<String>) -> Option<&'a str> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    if validate_https_url(url) || url.starts_with("data:image/") {
        return Some(url);
    }
    warnings.push("Reference image ignored: expected an https or data:image URL.".to_string());
    None
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::Method;
    use serde_json::json;

    use super::*;
    use crate::testing::{
        orchestrator, script_queue, ManualClock, ScriptedTransport, DIRECT, QUEUE,
    };

    const SHEET: &str = "https://v3.fal.media/files/sheet.png";
    const CUTOUT: &str = "https://v3.fal.media/files/cutout.png";
    const CHOREOGRAPHY: &str =
        "CHARACTER: a round slime with a tiny crown.\nCHOREOGRAPHY: it squashes, hops and lands.";

    fn pipeline(transport: &Arc<ScriptedTransport>) -> SpritePipeline {
        SpritePipeline::new(orchestrator(transport, &ManualClock::new()))
    }

    fn request(prompt: &str) -> SpriteRequest {
        SpriteRequest {
            prompt: Some(prompt.to_string()),
            grid_size: Some(3),
            image_url: None,
        }
    }

    #[test]
    fn full_run_rewrites_generates_and_cuts_out() -> anyhow::Result<()> {
        let transport = ScriptedTransport::new();
        script_queue(&transport, REWRITE_ENDPOINT, "rw-1", json!({"output": CHOREOGRAPHY}));
        script_queue(
            &transport,
            SPRITE_ENDPOINT,
            "sp-1",
            json!({"images": [{"url": SHEET}]}),
        );
        transport.json(
            Method::POST,
            &format!("{DIRECT}/{REMOVE_BG_ENDPOINT}"),
            200,
            json!({"image": {"url": CUTOUT}}),
        );

        let generation = pipeline(&transport).generate(&request("  bouncy slime  "))?;

        assert_eq!(generation.prompt_original, "bouncy slime");
        assert_eq!(generation.prompt_rewritten, CHOREOGRAPHY);
        assert_eq!(generation.sprite_url, SHEET);
        assert_eq!(generation.transparent_sprite_url, CUTOUT);
        assert_eq!(generation.grid_size, 3);
        assert!(generation.warnings.is_empty());
        assert_eq!(
            transport.count(&Method::POST, &format!("{QUEUE}/{SPRITE_EDIT_ENDPOINT}")),
            0
        );
        let json = serde_json::to_value(&generation)?;
        assert_eq!(json["transparentSpriteUrl"], CUTOUT);
        Ok(())
    }

    #[test]
    fn rewrite_failure_keeps_the_original_prompt() -> anyhow::Result<()> {
        let transport = ScriptedTransport::new();
        transport.json(
            Method::POST,
            &format!("{QUEUE}/{REWRITE_ENDPOINT}"),
            401,
            json!({"error": "Invalid key"}),
        );
        script_queue(
            &transport,
            SPRITE_ENDPOINT,
            "sp-2",
            json!({"images": [SHEET]}),
        );
        transport.json(
            Method::POST,
            &format!("{DIRECT}/{REMOVE_BG_ENDPOINT}"),
            500,
            json!({"error": "model crashed"}),
        );

        let generation = pipeline(&transport).generate(&request("leaf bunny"))?;

        assert_eq!(generation.prompt_rewritten, "leaf bunny");
        assert_eq!(generation.sprite_url, SHEET);
        assert_eq!(generation.transparent_sprite_url, "");
        assert_eq!(generation.warnings.len(), 2);
        assert_eq!(generation.warnings[0], "Rewrite skipped: Invalid key");
        assert_eq!(generation.warnings[1], "BG removal skipped: model crashed");
        Ok(())
    }

    #[test]
    fn unreadable_rewrite_is_a_warning() {
        let transport = ScriptedTransport::new();
        script_queue(&transport, REWRITE_ENDPOINT, "rw-3", json!({"output": ""}));
        let mut warnings = Vec::new();
        let prompt = pipeline(&transport).rewrite_prompt("crystal fox", 4, &mut warnings);
        assert_eq!(prompt, "crystal fox");
        assert_eq!(
            warnings,
            vec!["Rewrite returned unexpected format. Original prompt kept.".to_string()]
        );
    }

    #[test]
    fn sprite_failure_is_fatal_and_keeps_warnings() {
        let transport = ScriptedTransport::new();
        transport.json(
            Method::POST,
            &format!("{QUEUE}/{REWRITE_ENDPOINT}"),
            500,
            json!({}),
        );
        transport.json(
            Method::POST,
            &format!("{QUEUE}/{SPRITE_ENDPOINT}"),
            422,
            json!({"detail": [{"msg": "prompt rejected"}, {"msg": "unsafe"}]}),
        );

        let err = pipeline(&transport).generate(&request("thunder puppy")).err();

        assert_eq!(
            err,
            Some(GenerationError {
                status: 422,
                message: "prompt rejected | unsafe".to_string(),
                warnings: vec!["Rewrite skipped: Rewrite failed".to_string()],
            })
        );
        assert_eq!(
            transport.count(&Method::POST, &format!("{DIRECT}/{REMOVE_BG_ENDPOINT}")),
            0
        );
    }

    #[test]
    fn missing_sprite_url_is_a_502() {
        let transport = ScriptedTransport::new();
        script_queue(&transport, REWRITE_ENDPOINT, "rw-4", json!({"output": CHOREOGRAPHY}));
        script_queue(
            &transport,
            SPRITE_ENDPOINT,
            "sp-4",
            json!({"images": [], "status_url": "https://queue.test/x.png"}),
        );

        let err = pipeline(&transport).generate(&request("pastel ghost")).err();

        assert_eq!(err.as_ref().map(|err| err.status), Some(502));
        assert_eq!(
            err.map(|err| err.message),
            Some("No image URL in sprite result".to_string())
        );
    }

    #[test]
    fn reference_image_routes_to_the_edit_endpoint() -> anyhow::Result<()> {
        let transport = ScriptedTransport::new();
        script_queue(&transport, REWRITE_ENDPOINT, "rw-5", json!({"output": CHOREOGRAPHY}));
        script_queue(
            &transport,
            SPRITE_EDIT_ENDPOINT,
            "sp-5",
            json!({"images": [{"url": SHEET}]}),
        );
        transport.json(
            Method::POST,
            &format!("{DIRECT}/{REMOVE_BG_ENDPOINT}"),
            200,
            json!({"image": {"url": CUTOUT}}),
        );

        let generation = pipeline(&transport).generate(&SpriteRequest {
            prompt: Some("candy golem".to_string()),
            grid_size: Some(9),
            image_url: Some("https://cdn.test/ref.png".to_string()),
        })?;

        assert_eq!(generation.grid_size, 6);
        assert_eq!(
            transport.count(&Method::POST, &format!("{QUEUE}/{SPRITE_ENDPOINT}")),
            0
        );
        assert_eq!(
            transport.count(&Method::POST, &format!("{QUEUE}/{SPRITE_EDIT_ENDPOINT}")),
            1
        );
        Ok(())
    }

    #[test]
    fn insecure_reference_is_ignored_with_a_warning() {
        let mut warnings = Vec::new();
        assert_eq!(accepted_reference("http://x.test/a.png", &mut warnings), None);
        assert_eq!(warnings.len(), 1);
        assert_eq!(
            accepted_reference("data:image/png;base64,AAAA", &mut warnings),
            Some("data:image/png;base64,AAAA")
        );
        assert_eq!(accepted_reference("   ", &mut warnings), None);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn blank_prompt_gets_a_generated_one() {
        let transport = ScriptedTransport::new();
        transport.json(
            Method::POST,
            &format!("{QUEUE}/{REWRITE_ENDPOINT}"),
            500,
            json!({}),
        );
        transport.json(
            Method::POST,
            &format!("{QUEUE}/{SPRITE_ENDPOINT}"),
            500,
            json!({}),
        );
        let err = pipeline(&transport)
            .generate(&SpriteRequest {
                prompt: Some("   ".to_string()),
                ..SpriteRequest::default()
            })
            .err();
        assert_eq!(err.map(|err| err.message), Some("Sprite generation failed".to_string()));

        let bodies = transport.bodies(&format!("{QUEUE}/{REWRITE_ENDPOINT}"));
        let prompt = bodies
            .first()
            .and_then(|body| body["prompt"].as_str())
            .unwrap_or_default();
        let subjects = [
            "baby dragon",
            "crystal fox",
            "tiny samurai cat",
            "sparkle unicorn",
            "bamboo panda warrior",
        ];
        assert!(prompt.ends_with(", isometric action RPG"), "{prompt}");
        assert!(subjects.iter().any(|subject| prompt.contains(subject)), "{prompt}");
    }
}
