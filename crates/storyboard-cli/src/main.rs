use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use storyboard_contracts::dossiers::{DossierRegistry, JsonDossierRegistry};
use storyboard_contracts::events::ProgressLog;
use storyboard_contracts::media::{extension_for_mime, ImageSource};
use storyboard_contracts::story::{
    ApplyOutcome, AspectRatio, Frame, FrameId, InvocationTicket, StoryStore,
};
use storyboard_engine::{
    default_capability_registry, AdaptationRequest, AdaptationResult, AdaptationTarget, Pipeline,
    PipelineConfig, ProgressEvent, ProgressFanout, ProgressSink,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_FAILED: i32 = 1;
const EXIT_RECOVERABLE: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "storyboard-rs", version, about = "Storyboard frame adaptation CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an empty project file.
    Init(InitArgs),
    /// Adapt an existing frame or a new sketch into the story.
    Adapt(AdaptArgs),
    /// List remembered characters, objects and locations.
    Dossiers(DossiersArgs),
    /// List frames that were made from the same source image.
    Scenes(ScenesArgs),
    /// Settle frames left generating by an adaptation that never finished.
    Repair(RepairArgs),
    /// Show the progress log written by `adapt --events`.
    Progress(ProgressArgs),
}

#[derive(Debug, Parser)]
struct InitArgs {
    #[arg(long)]
    project: PathBuf,
    #[arg(long, default_value = "16:9")]
    aspect_ratio: AspectRatio,
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Parser)]
struct AdaptArgs {
    #[arg(long)]
    project: PathBuf,
    #[arg(long, conflicts_with = "sketch", required_unless_present = "sketch")]
    frame: Option<String>,
    #[arg(long)]
    sketch: Option<PathBuf>,
    #[arg(long)]
    instruction: String,
    #[arg(long, default_value = "gemini")]
    provider: String,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dossiers: Option<PathBuf>,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    analysis_model: Option<String>,
    #[arg(long)]
    synthesis_model: Option<String>,
}

#[derive(Debug, Parser)]
struct DossiersArgs {
    #[arg(long)]
    dossiers: PathBuf,
}

#[derive(Debug, Parser)]
struct ScenesArgs {
    #[arg(long)]
    project: PathBuf,
    #[arg(long)]
    hash: String,
}

#[derive(Debug, Parser)]
struct RepairArgs {
    #[arg(long)]
    project: PathBuf,
}

#[derive(Debug, Parser)]
struct ProgressArgs {
    #[arg(long)]
    events: PathBuf,
    #[arg(long)]
    invocation: Option<String>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("storyboard-rs error: {err:#}");
            std::process::exit(EXIT_FAILED);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init(args) => run_init(args),
        Command::Adapt(args) => run_adapt(args),
        Command::Dossiers(args) => run_dossiers(args),
        Command::Scenes(args) => run_scenes(args),
        Command::Repair(args) => run_repair(args),
        Command::Progress(args) => run_progress(args),
    }
}

fn run_init(args: InitArgs) -> Result<i32> {
    if args.project.exists() && !args.force {
        bail!(
            "{} already exists (pass --force to overwrite)",
            args.project.display()
        );
    }
    let mut store = StoryStore::new(&args.project);
    store.aspect_ratio = args.aspect_ratio;
    store.save()?;
    println!("{}", store.story_id);
    Ok(0)
}

/// An invocation that has been recorded in the project file but whose
/// result has not been applied yet.
#[derive(Debug)]
struct StartedAdaptation {
    story_id: String,
    frame_id: FrameId,
    ticket: InvocationTicket,
    request: AdaptationRequest,
}

fn run_adapt(args: AdaptArgs) -> Result<i32> {
    let dossiers_path = args
        .dossiers
        .clone()
        .unwrap_or_else(|| default_dossiers_path(&args.project));
    let dossiers: Arc<dyn DossierRegistry> = Arc::new(JsonDossierRegistry::new(dossiers_path));

    let mut config = PipelineConfig::from_env();
    if let Some(language) = args.language.clone() {
        config.story_language = language;
    }
    if args.analysis_model.is_some() {
        config.analysis_model = args.analysis_model.clone();
    }
    if args.synthesis_model.is_some() {
        config.synthesis_model = args.synthesis_model.clone();
    }
    let capabilities = default_capability_registry();
    let pipeline = Pipeline::from_registry(config, &capabilities, &args.provider, dossiers)?;

    let started = start_adaptation(
        &args.project,
        args.frame.as_deref(),
        args.sketch.as_deref(),
        &args.instruction,
    )?;
    let frame_id = started.frame_id.clone();

    let log_progress = |event: &ProgressEvent| {
        info!(stage = event.stage.as_str(), "{}", event.message);
    };
    let progress_log = args
        .events
        .as_ref()
        .map(|path| ProgressLog::new(path, started.story_id.clone()));
    let mut sinks: Vec<&dyn ProgressSink> = vec![&log_progress];
    if let Some(log) = progress_log.as_ref() {
        sinks.push(log);
    }
    let progress = ProgressFanout::new(sinks);

    // The project stays unlocked while the stages run.
    let outcome =
        pipeline.run_invocation(started.ticket.invocation_id.clone(), &started.request, &progress);
    match outcome {
        Ok(result) => {
            let applied = finish_adaptation(&args.project, &started.ticket, &result)?;
            if applied != ApplyOutcome::Applied {
                warn!(frame = %frame_id, outcome = ?applied, "adaptation result was not applied");
            }
            if let Some(out) = args.out.as_ref() {
                write_image(out, &result.image.bytes)?;
                info!(path = %out.display(), mime = %result.image.mime_type, "frame written");
            }
            let summary = json!({
                "frame_id": frame_id.as_str(),
                "invocation_id": result.invocation_id,
                "applied": applied == ApplyOutcome::Applied,
                "display_prompt": result.display_prompt,
                "source_hash": result.source_hash,
                "image_extension": extension_for_mime(&result.image.mime_type),
                "dossier": result.dossier,
                "brief": result.brief,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(0)
        }
        Err(err) => {
            let message = err.user_message();
            let recorded = fail_adaptation(&args.project, &started.ticket, &message)?;
            if recorded != ApplyOutcome::Applied {
                warn!(frame = %frame_id, outcome = ?recorded, "failure was not recorded");
            }
            eprintln!("{message}");
            Ok(if err.recoverable().is_some() {
                EXIT_RECOVERABLE
            } else {
                EXIT_FAILED
            })
        }
    }
}

/// Picks or creates the target frame and takes a ticket for it, all under
/// the project lock.
fn start_adaptation(
    project: &Path,
    frame: Option<&str>,
    sketch: Option<&Path>,
    instruction: &str,
) -> Result<StartedAdaptation> {
    StoryStore::update(project, |store| {
        let (frame_id, target) = match (frame, sketch) {
            (Some(raw), _) => {
                let id = FrameId::from(raw);
                let frame = store
                    .frame(&id)
                    .with_context(|| format!("frame {id} not found in {}", project.display()))?;
                (id, AdaptationTarget::from_frame(frame)?)
            }
            (None, Some(path)) => {
                let aspect_ratio = store.aspect_ratio;
                let id = store.push_frame(
                    Frame::pending(instruction, "Queued").with_aspect_ratio(aspect_ratio),
                );
                let target = AdaptationTarget::new(
                    ImageSource::Asset {
                        path: path.to_path_buf(),
                    },
                    aspect_ratio,
                )
                .in_slot(id.clone());
                (id, target)
            }
            (None, None) => bail!("either --frame or --sketch is required"),
        };
        let ticket = store.begin_invocation(&frame_id, "Reading the scene...")?;
        Ok(StartedAdaptation {
            story_id: store.story_id.clone(),
            frame_id,
            ticket,
            request: AdaptationRequest {
                target,
                frames: store.snapshot(),
                instruction: instruction.to_string(),
                known_dossier: None,
            },
        })
    })
}

/// Re-reads the project under its lock and applies the result only if no
/// newer invocation has claimed the frame since `ticket` was issued.
fn finish_adaptation(
    project: &Path,
    ticket: &InvocationTicket,
    result: &AdaptationResult,
) -> Result<ApplyOutcome> {
    StoryStore::update(project, |store| {
        Ok(store.apply_adaptation(
            ticket,
            result.image.to_data_url(),
            result.display_prompt.clone(),
            Some(result.source_hash.clone()),
        ))
    })
}

fn fail_adaptation(
    project: &Path,
    ticket: &InvocationTicket,
    message: &str,
) -> Result<ApplyOutcome> {
    StoryStore::update(project, |store| Ok(store.fail_invocation(ticket, message)))
}

fn run_dossiers(args: DossiersArgs) -> Result<i32> {
    let registry = JsonDossierRegistry::new(&args.dossiers);
    let entries = registry.list();
    if entries.is_empty() {
        println!("No dossiers in {}", args.dossiers.display());
        return Ok(0);
    }
    for dossier in entries {
        let short_hash: String = dossier.source_hash.chars().take(12).collect();
        println!(
            "{short_hash}  {:<9} {:<24} {}",
            dossier.kind.as_str(),
            dossier.role_label,
            dossier.last_used.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(0)
}

fn run_scenes(args: ScenesArgs) -> Result<i32> {
    let store = StoryStore::load(&args.project)?;
    let frames = store.list_by_source_hash(args.hash.trim());
    if frames.is_empty() {
        println!("No frames share source {}", args.hash.trim());
        return Ok(0);
    }
    for frame in frames {
        let position = store
            .position(&frame.id)
            .map(|idx| idx.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{position:>3}  {}  v{}/{}  {}",
            frame.id,
            frame.active_version_index + 1,
            frame.image_versions.len(),
            frame.prompt
        );
    }
    Ok(0)
}

fn run_repair(args: RepairArgs) -> Result<i32> {
    let settled = StoryStore::update(&args.project, |store| Ok(store.settle_interrupted()))?;
    println!("Settled {settled} interrupted frame(s)");
    Ok(0)
}

fn run_progress(args: ProgressArgs) -> Result<i32> {
    let records = ProgressLog::read(&args.events)?;
    let wanted = args.invocation.as_deref();
    for record in records
        .iter()
        .filter(|record| wanted.map_or(true, |id| record.invocation_id == id))
    {
        println!(
            "{}  {}  {:<18} {}",
            record.ts.format("%H:%M:%S%.3f"),
            record.invocation_id,
            record.stage,
            record.message
        );
    }
    Ok(0)
}

/// `story.json` keeps its dossiers in `story.dossiers.json`.
fn default_dossiers_path(project: &Path) -> PathBuf {
    project.with_extension("dossiers.json")
}

fn write_image(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes).with_context(|| format!("failed writing {}", path.display()))
}
