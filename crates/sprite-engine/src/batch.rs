//! Offline showcase filling: many random prompts through the generate
//! pipeline, a fixed-size chunk of worker threads at a time.

use std::fs;
use std::path::PathBuf;
use std::thread;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sprite_contracts::events::{
    now_utc_iso, EventPayload, EventWriter, CHUNK_SAVED, ITEM_FAILED, ITEM_FINISHED,
    RUN_FINISHED, RUN_STARTED,
};
use sprite_contracts::prompts::{clamp_grid, random_prompt, slugify, DEFAULT_GRID};
use sprite_contracts::showcase::{ShowcaseIndex, ShowcaseRecord, SHOWCASE_DIR};
use uuid::Uuid;

use crate::generate::SpritePipeline;
use crate::media;

pub const MIN_COUNT: usize = 1;
pub const MAX_COUNT: usize = 200;
pub const DEFAULT_COUNT: usize = 10;
pub const MAX_BATCH_CONCURRENCY: usize = 20;

const SLUG_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub count: usize,
    pub grid_size: u32,
    pub concurrency: usize,
    pub fresh: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            count: DEFAULT_COUNT,
            grid_size: DEFAULT_GRID,
            concurrency: MAX_BATCH_CONCURRENCY,
            fresh: false,
        }
    }
}

impl BatchOptions {
    pub fn clamped(&self) -> Self {
        Self {
            count: self.count.clamp(MIN_COUNT, MAX_COUNT),
            grid_size: clamp_grid(self.grid_size),
            concurrency: self.concurrency.clamp(1, MAX_BATCH_CONCURRENCY),
            fresh: self.fresh,
        }
    }
}

/// One item that did not make it, by position in the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub index: usize,
    pub label: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub total_records: usize,
    pub failures: Vec<ItemFailure>,
}

pub struct BatchGenerator {
    pipeline: SpritePipeline,
    root: PathBuf,
    events: Option<EventWriter>,
}

impl BatchGenerator {
    pub fn new(pipeline: SpritePipeline, root: impl Into<PathBuf>) -> Self {
        Self {
            pipeline,
            root: root.into(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Generates `options.count` random prompts.
    pub fn run(&self, options: &BatchOptions) -> Result<BatchReport> {
        let options = options.clamped();
        let prompts = (0..options.count)
            .map(|_| random_prompt(Uuid::new_v4().as_u128()))
            .collect();
        self.run_prompts(&options, prompts)
    }

    pub fn run_prompts(&self, options: &BatchOptions, prompts: Vec<String>) -> Result<BatchReport> {
        let grid_size = clamp_grid(options.grid_size);
        let concurrency = options.concurrency.clamp(1, MAX_BATCH_CONCURRENCY);
        let index = ShowcaseIndex::under(&self.root);
        let showcase_dir = self.root.join(SHOWCASE_DIR);

        if options.fresh {
            info!("clearing {}", showcase_dir.display());
            if showcase_dir.exists() {
                fs::remove_dir_all(&showcase_dir)
                    .with_context(|| format!("failed to clear {}", showcase_dir.display()))?;
            }
            index.reset()?;
        }
        fs::create_dir_all(&showcase_dir)
            .with_context(|| format!("failed to create {}", showcase_dir.display()))?;
        let start = index.load()?.len();

        self.emit(
            RUN_STARTED,
            json!({
                "command": "batch",
                "count": prompts.len(),
                "grid_size": grid_size,
                "concurrency": concurrency,
            }),
        )?;
        info!(
            "generating {} sprites @ {grid_size}x{grid_size} ({concurrency} concurrent)",
            prompts.len()
        );

        let mut report = BatchReport::default();
        for (chunk_no, chunk) in prompts.chunks(concurrency).enumerate() {
            let offset = start + chunk_no * concurrency;
            let results = run_chunk(chunk, |j, prompt| {
                self.generate_one(offset + j, prompt, grid_size)
            });

            let mut records = Vec::new();
            for (j, (prompt, result)) in chunk.iter().zip(results).enumerate() {
                let position = offset + j;
                match result {
                    Ok(record) => {
                        info!("[{position}] {prompt} ✓");
                        self.emit(
                            ITEM_FINISHED,
                            json!({ "index": position, "sprite_url": record.sprite_url }),
                        )?;
                        report.succeeded += 1;
                        records.push(record);
                    }
                    Err(err) => {
                        let error = format!("{err:#}");
                        warn!("[{position}] {prompt} ✗ {error}");
                        self.emit(
                            ITEM_FAILED,
                            json!({ "index": position, "prompt": prompt, "error": error }),
                        )?;
                        report.failed += 1;
                        report.failures.push(ItemFailure {
                            index: position,
                            label: prompt.clone(),
                            error,
                        });
                    }
                }
            }

            let saved = records.len();
            report.total_records = index.append(records)?.len();
            self.emit(
                CHUNK_SAVED,
                json!({ "chunk": chunk_no, "saved": saved, "total": report.total_records }),
            )?;
        }
        if prompts.is_empty() {
            report.total_records = start;
        }

        self.emit(
            RUN_FINISHED,
            json!({ "succeeded": report.succeeded, "failed": report.failed }),
        )?;
        info!(
            "done: {} succeeded, {} failed, {} entries in {}",
            report.succeeded,
            report.failed,
            report.total_records,
            index.path().display()
        );
        Ok(report)
    }

    fn generate_one(
        &self,
        position: usize,
        prompt: &str,
        grid_size: u32,
    ) -> Result<ShowcaseRecord> {
        let mut warnings = Vec::new();
        let rewritten = self.pipeline.rewrite_prompt(prompt, grid_size, &mut warnings);
        for warning in &warnings {
            debug!("[{position}] {warning}");
        }
        let sprite_url = self.pipeline.generate_sprite(&rewritten, grid_size, None)?;

        let file_name = format!("{position:03}-{}.png", slugify(prompt, SLUG_CHARS));
        let path = self.root.join(SHOWCASE_DIR).join(&file_name);
        let transport = self.pipeline.orchestrator().transport();
        let bytes = media::download_to(transport, &sprite_url, &path)?;
        debug!("[{position}] saved {} ({} KB)", path.display(), bytes.len() / 1024);

        Ok(ShowcaseRecord {
            prompt: prompt.to_string(),
            prompt_rewritten: rewritten,
            sprite_url: format!("/{SHOWCASE_DIR}/{file_name}"),
            grid_size,
            generated_at: now_utc_iso(),
            transparent_url: None,
            gif_url: None,
            extra: Map::new(),
        })
    }

    fn emit(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(events) = &self.events {
            events.emit(event_type, into_payload(payload))?;
        }
        Ok(())
    }
}

/// Runs `task` once per item on scoped threads and waits for all of them.
/// Results come back in item order; a panicking task is an `Err`.
pub(crate) fn run_chunk<T, R, F>(items: &[T], task: F) -> Vec<Result<R>>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> Result<R> + Sync,
{
    thread::scope(|scope| {
        let task = &task;
        let handles: Vec<_> = items
            .iter()
            .enumerate()
            .map(|(j, item)| scope.spawn(move || task(j, item)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("worker thread panicked")))
            })
            .collect()
    })
}

pub(crate) fn into_payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use reqwest::Method;
    use serde_json::json;

    use super::*;
    use crate::generate::{REWRITE_ENDPOINT, SPRITE_ENDPOINT};
    use crate::testing::{
        orchestrator, read_event_types, script_queue, ManualClock, Reply, ScriptedTransport,
        QUEUE,
    };

    const SHEET: &str = "https://v3.fal.media/files/sheet.png";

    fn scripted() -> Arc<ScriptedTransport> {
        let transport = ScriptedTransport::new();
        transport.json(
            Method::POST,
            &format!("{QUEUE}/{REWRITE_ENDPOINT}"),
            500,
            json!({}),
        );
        transport.on(Method::GET, SHEET, Reply::Bytes(vec![7; 2048]));
        transport
    }

    fn generator(transport: &Arc<ScriptedTransport>, root: &Path) -> BatchGenerator {
        BatchGenerator::new(
            SpritePipeline::new(orchestrator(transport, &ManualClock::new())),
            root,
        )
    }

    fn existing_record(prompt: &str) -> ShowcaseRecord {
        ShowcaseRecord {
            prompt: prompt.to_string(),
            prompt_rewritten: prompt.to_string(),
            sprite_url: "/showcase/000-old.png".to_string(),
            grid_size: 4,
            generated_at: String::new(),
            transparent_url: None,
            gif_url: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn chunks_append_successes_and_report_failures() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let index = ShowcaseIndex::under(temp.path());
        index.save(&[existing_record("old")])?;

        let transport = scripted();
        let submit = format!("{QUEUE}/{SPRITE_ENDPOINT}");
        script_queue(
            &transport,
            SPRITE_ENDPOINT,
            "sp-1",
            json!({"images": [{"url": SHEET}]}),
        );
        transport
            .json(Method::POST, &submit, 422, json!({"detail": [{"msg": "unsafe"}]}))
            .json(Method::POST, &submit, 200, json!({"request_id": "sp-1"}));

        let events = EventWriter::new(temp.path().join("events.jsonl"), "run-1");
        let report = generator(&transport, temp.path())
            .with_events(events.clone())
            .run_prompts(
                &BatchOptions {
                    concurrency: 1,
                    grid_size: 3,
                    ..BatchOptions::default()
                },
                vec![
                    "Bouncy Slime".to_string(),
                    "leaf bunny".to_string(),
                    "pastel ghost".to_string(),
                ],
            )?;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total_records, 3);
        assert_eq!(report.failures[0].index, 2);
        assert_eq!(report.failures[0].error, "unsafe (422)");

        let records = index.load()?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].sprite_url, "/showcase/001-bouncy-slime.png");
        assert_eq!(records[1].prompt_rewritten, "Bouncy Slime");
        assert_eq!(records[1].grid_size, 3);
        assert_eq!(records[2].sprite_url, "/showcase/003-pastel-ghost.png");
        assert!(temp.path().join("showcase/001-bouncy-slime.png").exists());
        assert!(!temp.path().join("showcase/002-leaf-bunny.png").exists());

        assert_eq!(
            read_event_types(events.path())?,
            vec![
                RUN_STARTED,
                ITEM_FINISHED,
                CHUNK_SAVED,
                ITEM_FAILED,
                CHUNK_SAVED,
                ITEM_FINISHED,
                CHUNK_SAVED,
                RUN_FINISHED,
            ]
        );
        Ok(())
    }

    #[test]
    fn concurrent_chunk_keeps_prompt_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let transport = scripted();
        script_queue(&transport, SPRITE_ENDPOINT, "sp-9", json!({"images": [SHEET]}));

        let prompts: Vec<String> = (0..5).map(|n| format!("hero {n}")).collect();
        let report = generator(&transport, temp.path()).run_prompts(
            &BatchOptions {
                concurrency: 4,
                ..BatchOptions::default()
            },
            prompts,
        )?;

        assert_eq!(report.succeeded, 5);
        let urls: Vec<String> = ShowcaseIndex::under(temp.path())
            .load()?
            .into_iter()
            .map(|record| record.sprite_url)
            .collect();
        assert_eq!(
            urls,
            (0..5)
                .map(|n| format!("/showcase/{n:03}-hero-{n}.png"))
                .collect::<Vec<_>>()
        );
        Ok(())
    }

    #[test]
    fn fresh_run_clears_previous_showcase() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let index = ShowcaseIndex::under(temp.path());
        index.save(&[existing_record("old"), existing_record("older")])?;
        let stale = temp.path().join("showcase").join("000-old.png");
        fs::create_dir_all(stale.parent().unwrap_or(temp.path()))?;
        fs::write(&stale, b"stale")?;

        let transport = scripted();
        script_queue(&transport, SPRITE_ENDPOINT, "sp-2", json!({"images": [SHEET]}));
        generator(&transport, temp.path()).run_prompts(
            &BatchOptions {
                fresh: true,
                ..BatchOptions::default()
            },
            vec!["crystal fox".to_string()],
        )?;

        assert!(!stale.exists());
        let records = index.load()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sprite_url, "/showcase/000-crystal-fox.png");
        Ok(())
    }

    #[test]
    fn options_are_clamped() {
        let options = BatchOptions {
            count: 0,
            grid_size: 40,
            concurrency: 99,
            fresh: false,
        }
        .clamped();
        assert_eq!((options.count, options.grid_size, options.concurrency), (1, 6, 20));
    }

    #[test]
    fn panicking_task_becomes_an_error() {
        let results = run_chunk(&[1, 2, 3], |_, value: &i32| {
            if *value == 2 {
                panic!("boom");
            }
            Ok(value * 10)
        });
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().ok(), Some(&10));
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().ok(), Some(&30));
    }
}
