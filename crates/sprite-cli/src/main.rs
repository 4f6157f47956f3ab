use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::{Map, Value};
use sprite_contracts::events::EventWriter;
use sprite_contracts::jobs::DEFAULT_QUEUED_TIMEOUT_MS;
use sprite_contracts::prompts::{clamp_grid, DEFAULT_GRID};
use sprite_contracts::showcase::data_url;
use sprite_engine::batch::{BatchGenerator, BatchOptions, DEFAULT_COUNT, MAX_BATCH_CONCURRENCY};
use sprite_engine::process::{
    ProcessOptions, ShowcaseProcessor, DEFAULT_PROCESS_CONCURRENCY, MAX_GIF_SIZE, MIN_GIF_SIZE,
};
use sprite_engine::transcode::{DEFAULT_FPS, DEFAULT_FRAME_SIZE};
use sprite_engine::{
    transcode_sprite_sheet, FalConfig, SpritePipeline, SpriteRequest, TranscodeOptions, Transport,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "sprite", version, about = "Animated sprite sheets from a prompt")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Rewrite a prompt, generate one sheet and cut it out.
    Generate(GenerateArgs),
    /// Fill the showcase with random prompts.
    Batch(BatchArgs),
    /// Add transparent PNGs and GIFs to every showcase entry.
    Process(ProcessArgs),
    /// Turn a local sprite sheet into a looping GIF.
    Transcode(TranscodeArgs),
    /// Call one endpoint and print the job outcome.
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long, default_value_t = DEFAULT_GRID)]
    grid: u32,
    #[arg(long)]
    image_url: Option<String>,
    /// Local reference image, sent inline.
    #[arg(long, conflicts_with = "image_url")]
    image: Option<PathBuf>,
    /// Writes sprite.png and sprite.gif here.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    key: Option<String>,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long, default_value_t = DEFAULT_COUNT)]
    count: usize,
    #[arg(long, default_value_t = DEFAULT_GRID)]
    grid: u32,
    #[arg(long)]
    fresh: bool,
    #[arg(long, default_value_t = MAX_BATCH_CONCURRENCY)]
    concurrency: usize,
    #[arg(long, default_value = "public")]
    root: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    key: Option<String>,
}

#[derive(Debug, Parser)]
struct ProcessArgs {
    #[arg(long, default_value_t = DEFAULT_PROCESS_CONCURRENCY)]
    concurrency: usize,
    #[arg(long, default_value_t = DEFAULT_FRAME_SIZE)]
    gif_size: u32,
    #[arg(long)]
    regen_gif: bool,
    #[arg(long, default_value = "public")]
    root: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    key: Option<String>,
}

#[derive(Debug, Parser)]
struct TranscodeArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value_t = DEFAULT_GRID)]
    grid: u32,
    #[arg(long, default_value_t = DEFAULT_FRAME_SIZE)]
    frame_size: u32,
    #[arg(long, default_value_t = DEFAULT_FPS)]
    fps: u32,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    endpoint: String,
    /// JSON object sent as the request body.
    #[arg(long, default_value = "{}")]
    input: String,
    #[arg(long)]
    queued: bool,
    #[arg(long, default_value_t = DEFAULT_QUEUED_TIMEOUT_MS)]
    timeout_ms: u64,
    #[arg(long)]
    key: Option<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sprite error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Batch(args) => run_batch(args),
        Command::Process(args) => run_process(args),
        Command::Transcode(args) => run_transcode(args),
        Command::Run(args) => run_job(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let config = FalConfig::from_env().with_api_key(args.key);
    let pipeline = SpritePipeline::new(config.orchestrator()?);
    let image_url = match &args.image {
        Some(path) => Some(reference_data_url(path)?),
        None => args.image_url,
    };
    let request = SpriteRequest {
        prompt: args.prompt,
        grid_size: Some(args.grid),
        image_url,
    };

    let generation = match pipeline.generate(&request) {
        Ok(generation) => generation,
        Err(err) => {
            for warning in &err.warnings {
                warn!("{warning}");
            }
            return Err(err.into());
        }
    };
    for warning in &generation.warnings {
        warn!("{warning}");
    }
    println!("{}", serde_json::to_string_pretty(&generation)?);

    if let Some(out) = args.out {
        let transport = pipeline.orchestrator().transport();
        fs::create_dir_all(&out).with_context(|| format!("failed to create {}", out.display()))?;
        let sheet = transport.fetch_bytes(&generation.sprite_url)?;
        write_output(&out.join("sprite.png"), &sheet)?;

        let source = if generation.transparent_sprite_url.is_empty() {
            sheet
        } else {
            let cutout = transport.fetch_bytes(&generation.transparent_sprite_url)?;
            write_output(&out.join("sprite-transparent.png"), &cutout)?;
            cutout
        };
        let options = TranscodeOptions {
            grid_size: generation.grid_size,
            ..TranscodeOptions::default()
        };
        write_output(&out.join("sprite.gif"), &transcode_sprite_sheet(&source, &options)?)?;
    }
    Ok(0)
}

fn run_batch(args: BatchArgs) -> Result<i32> {
    let config = FalConfig::from_env().with_api_key(args.key);
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.root.join("events.jsonl"));
    let options = BatchOptions {
        count: args.count,
        grid_size: args.grid,
        concurrency: args.concurrency,
        fresh: args.fresh,
    };
    let generator = BatchGenerator::new(SpritePipeline::new(config.orchestrator()?), &args.root)
        .with_events(EventWriter::new(events_path, new_run_id()));
    let report = generator.run(&options)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

fn run_process(args: ProcessArgs) -> Result<i32> {
    let config = FalConfig::from_env().with_api_key(args.key);
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.root.join("events.jsonl"));
    let options = ProcessOptions {
        concurrency: args.concurrency,
        frame_size: args.gif_size.clamp(MIN_GIF_SIZE, MAX_GIF_SIZE),
        regen_gif: args.regen_gif,
        ..ProcessOptions::default()
    };
    let processor = ShowcaseProcessor::new(
        config.orchestrator()?,
        config.storage_initiate_url.clone(),
        &args.root,
    )
    .with_events(EventWriter::new(events_path, new_run_id()));
    let report = processor.run(&options)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(0)
}

fn run_transcode(args: TranscodeArgs) -> Result<i32> {
    let sheet = fs::read(&args.input)
        .with_context(|| format!("failed reading {}", args.input.display()))?;
    let options = TranscodeOptions {
        grid_size: clamp_grid(args.grid),
        frame_size: args.frame_size.clamp(MIN_GIF_SIZE, MAX_GIF_SIZE),
        fps: args.fps.max(1),
        ..TranscodeOptions::default()
    };
    let gif = transcode_sprite_sheet(&sheet, &options)?;
    write_output(&args.out, &gif)?;
    info!("wrote {} ({} bytes)", args.out.display(), gif.len());
    Ok(0)
}

fn run_job(args: RunArgs) -> Result<i32> {
    let config = FalConfig::from_env().with_api_key(args.key);
    let input = parse_input(&args.input)?;
    let orchestrator = config.orchestrator()?;
    let outcome = if args.queued {
        orchestrator.run_queued(&args.endpoint, &input, args.timeout_ms)
    } else {
        orchestrator.run_direct(&args.endpoint, &input)
    };
    println!("{}", serde_json::to_string_pretty(&outcome.to_json())?);
    Ok(if outcome.is_success() { 0 } else { 1 })
}

fn parse_input(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("--input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => bail!("--input must be a JSON object"),
    }
}

fn reference_data_url(path: &Path) -> Result<String> {
    let content_type = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => bail!("unsupported reference image {}", path.display()),
    };
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(data_url(content_type, &bytes))
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}
