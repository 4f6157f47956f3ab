//! Showcase post-processing: transparent cut-out and looping GIF for every
//! indexed sprite sheet, reusing outputs already on disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use sprite_contracts::events::{
    EventWriter, CHUNK_SAVED, ITEM_FAILED, ITEM_FINISHED, RUN_FINISHED, RUN_STARTED,
};
use sprite_contracts::prompts::DEFAULT_GRID;
use sprite_contracts::showcase::{ShowcaseIndex, ShowcaseRecord};

use crate::batch::{into_payload, run_chunk, ItemFailure};
use crate::media::{self, PNG_CONTENT_TYPE};
use crate::orchestrator::JobOrchestrator;
use crate::transcode::{
    transcode_sprite_sheet, AlphaCleanup, TranscodeOptions, DEFAULT_FPS, DEFAULT_FRAME_SIZE,
};

pub const MAX_PROCESS_CONCURRENCY: usize = 10;
pub const DEFAULT_PROCESS_CONCURRENCY: usize = 5;
pub const MIN_GIF_SIZE: u32 = 64;
pub const MAX_GIF_SIZE: u32 = 512;

const LABEL_CHARS: usize = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOptions {
    pub concurrency: usize,
    pub frame_size: u32,
    pub fps: u32,
    pub regen_gif: bool,
    pub cleanup: AlphaCleanup,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_PROCESS_CONCURRENCY,
            frame_size: DEFAULT_FRAME_SIZE,
            fps: DEFAULT_FPS,
            regen_gif: false,
            cleanup: AlphaCleanup::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub processed: usize,
    pub failed: usize,
    pub failures: Vec<ItemFailure>,
}

/// What happened to one record's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Cached,
    Built,
}

/// A record after its cut-out step. The GIF step can still fail without
/// discarding a cut-out that already landed on disk.
struct Processed {
    record: ShowcaseRecord,
    cut_out: Step,
    gif: Result<Step>,
}

impl Step {
    fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Built => "built",
        }
    }
}

pub struct ShowcaseProcessor {
    orchestrator: JobOrchestrator,
    storage_initiate_url: String,
    root: PathBuf,
    events: Option<EventWriter>,
}

impl ShowcaseProcessor {
    pub fn new(
        orchestrator: JobOrchestrator,
        storage_initiate_url: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            orchestrator,
            storage_initiate_url: storage_initiate_url.into(),
            root: root.into(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Processes every record, saving the index after each chunk. A failed
    /// item keeps whatever outputs it finished before the failure.
    pub fn run(&self, options: &ProcessOptions) -> Result<ProcessReport> {
        let index = ShowcaseIndex::under(&self.root);
        if !index.path().exists() {
            bail!("Could not read {}", index.path().display());
        }
        let mut records = index.load()?;
        let concurrency = options.concurrency.clamp(1, MAX_PROCESS_CONCURRENCY);

        self.emit(
            RUN_STARTED,
            json!({
                "command": "process",
                "items": records.len(),
                "concurrency": concurrency,
                "frame_size": options.frame_size,
            }),
        )?;
        info!(
            "processing {} items ({concurrency} concurrent, {}px frames)",
            records.len(),
            options.frame_size
        );

        let mut report = ProcessReport::default();
        let mut start = 0;
        let mut chunk_no = 0;
        while start < records.len() {
            let end = (start + concurrency).min(records.len());
            let results = run_chunk(&records[start..end], |_, record| {
                self.process_one(record.clone(), options)
            });

            for (offset, result) in results.into_iter().enumerate() {
                let position = start + offset;
                let outcome = result.and_then(|processed| {
                    let Processed {
                        record,
                        cut_out,
                        gif,
                    } = processed;
                    records[position] = record;
                    gif.map(|gif| (cut_out, gif))
                });
                match outcome {
                    Ok((cut_out, gif)) => {
                        let updated = &records[position];
                        info!(
                            "[{}/{}] {} cutout {} gif {} ✓",
                            position + 1,
                            records.len(),
                            item_label(updated),
                            cut_out.as_str(),
                            gif.as_str()
                        );
                        self.emit(
                            ITEM_FINISHED,
                            json!({
                                "index": position,
                                "cutout": cut_out.as_str(),
                                "gif": gif.as_str(),
                                "gif_url": updated.gif_url,
                            }),
                        )?;
                        report.processed += 1;
                    }
                    Err(err) => {
                        let error = format!("{err:#}");
                        let label = item_label(&records[position]);
                        warn!("[{}/{}] {label} ✗ {error}", position + 1, records.len());
                        self.emit(
                            ITEM_FAILED,
                            json!({ "index": position, "error": error }),
                        )?;
                        report.failed += 1;
                        report.failures.push(ItemFailure {
                            index: position,
                            label,
                            error,
                        });
                    }
                }
            }

            index.save(&records)?;
            self.emit(CHUNK_SAVED, json!({ "chunk": chunk_no, "through": end }))?;
            start = end;
            chunk_no += 1;
        }

        self.emit(
            RUN_FINISHED,
            json!({ "processed": report.processed, "failed": report.failed }),
        )?;
        info!(
            "done: {} processed, {} failed ({})",
            report.processed,
            report.failed,
            index.path().display()
        );
        Ok(report)
    }

    fn process_one(
        &self,
        mut record: ShowcaseRecord,
        options: &ProcessOptions,
    ) -> Result<Processed> {
        let sprite_path = record.sprite_path(&self.root);
        if !sprite_path.exists() {
            bail!("File not found: {}", record.sprite_url);
        }
        let transparent_path = record.transparent_path(&self.root);
        let gif_path = record.gif_path(&self.root);

        let cutout_cached = record.transparent_url.is_some() && transparent_path.exists();
        let (transparent, cut_out) = if cutout_cached {
            let bytes = fs::read(&transparent_path)
                .with_context(|| format!("failed reading {}", transparent_path.display()))?;
            (bytes, Step::Cached)
        } else {
            let bytes = self.cut_out(&sprite_path, &transparent_path)?;
            record.transparent_url = Some(record.transparent_url_for());
            (bytes, Step::Built)
        };

        let gif = if record.gif_url.is_some() && gif_path.exists() && !options.regen_gif {
            Ok(Step::Cached)
        } else {
            build_gif(&mut record, &transparent, &transparent_path, &gif_path, options)
        };

        Ok(Processed {
            record,
            cut_out,
            gif,
        })
    }

    /// Upload → background removal → download into `target`.
    fn cut_out(&self, sprite_path: &Path, target: &Path) -> Result<Vec<u8>> {
        let transport = self.orchestrator.transport();
        let bytes = fs::read(sprite_path)
            .with_context(|| format!("failed reading {}", sprite_path.display()))?;
        let file_name = sprite_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("sprite.png");
        let remote_url = media::upload_to_storage(
            transport,
            &self.storage_initiate_url,
            bytes,
            PNG_CONTENT_TYPE,
            file_name,
        )?;
        let transparent_url = media::remove_background(&self.orchestrator, &remote_url)?;
        media::download_to(transport, &transparent_url, target)
    }

    fn emit(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(events) = &self.events {
            events.emit(event_type, into_payload(payload))?;
        }
        Ok(())
    }
}

fn build_gif(
    record: &mut ShowcaseRecord,
    transparent: &[u8],
    transparent_path: &Path,
    gif_path: &Path,
    options: &ProcessOptions,
) -> Result<Step> {
    let transcode = TranscodeOptions {
        grid_size: match record.grid_size {
            0 => DEFAULT_GRID,
            grid => grid,
        },
        frame_size: options.frame_size,
        fps: options.fps,
        cleanup: options.cleanup,
    };
    let bytes = transcode_sprite_sheet(transparent, &transcode)
        .with_context(|| format!("gif from {}", transparent_path.display()))?;
    fs::write(gif_path, &bytes)
        .with_context(|| format!("failed to write {}", gif_path.display()))?;
    debug!("wrote {} ({} KB)", gif_path.display(), bytes.len() / 1024);
    record.gif_url = Some(record.gif_url_for());
    Ok(Step::Built)
}

fn item_label(record: &ShowcaseRecord) -> String {
    record.prompt.chars().take(LABEL_CHARS).collect()
}
