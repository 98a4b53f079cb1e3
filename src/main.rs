use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use narrate_core::ids::{ChapterId, ChunkId, ProjectId};
use narrate_engine::{detect_chapters, ChapterService, Providers};
use narrate_settings::{load_settings, load_settings_from_path, NarrateSettings};
use narrate_store::Database;
use narrate_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "narrate", version, about = "Turn book chapters into verified narration")]
struct Cli {
    /// Settings file (defaults to ~/.narrate/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a project from a text file, one chapter per detected heading.
    Import {
        file: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long)]
        author: Option<String>,
    },
    Projects,
    Chapters { project: ProjectId },
    Chunks { chapter: ChapterId },
    /// Synthesize, verify and (once complete) stitch a chapter.
    Process { chapter: ChapterId },
    /// Redo one chunk; the chapter is not restitched.
    Reprocess {
        chunk: ChunkId,
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
    ReprocessFlagged { chapter: ChapterId },
    Exclude { chunk: ChunkId },
    Restitch {
        chapter: ChapterId,
        /// Leave these chunks out of this version only.
        #[arg(long)]
        exclude: Vec<ChunkId>,
    },
    Status { chapter: ChapterId },
    /// Word timings for the chapter's active audio.
    Sync { chapter: ChapterId },
    History { chunk: ChunkId },
    Versions { chapter: ChapterId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;

    let _telemetry = init_telemetry(&TelemetryConfig::from_names(
        &settings.logging.level,
        settings
            .logging
            .modules
            .iter()
            .map(|(module, level)| (module.as_str(), level.as_str())),
        settings.logging.json,
    ));

    let service = open_service(settings)?;
    run(&service, cli.command).await
}

fn open_service(settings: NarrateSettings) -> anyhow::Result<ChapterService> {
    let db = Database::open(&settings.storage.database_path).with_context(|| {
        format!(
            "failed to open database at {}",
            settings.storage.database_path.display()
        )
    })?;
    let providers = Providers::http(&settings).context("failed to build providers")?;
    Ok(ChapterService::new(db, providers, settings))
}

async fn run(service: &ChapterService, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Import {
            file,
            title,
            author,
        } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let detected = detect_chapters(&text)?;
            if detected.is_empty() {
                bail!("{} contains no text", file.display());
            }
            let project = service.create_project(&title, author.as_deref())?;
            let mut chapters = Vec::with_capacity(detected.len());
            for chapter in detected {
                let row = service.add_chapter(&project.id, chapter.number, &chapter.title, &chapter.text)?;
                chapters.push(json!({
                    "id": row.id,
                    "sequence": row.sequence,
                    "title": row.title,
                    "chars": row.text.len(),
                }));
            }
            tracing::info!(project_id = %project.id, chapters = chapters.len(), "imported");
            print_json(&json!({ "project": project, "chapters": chapters }))
        }
        Command::Projects => print_json(&service.projects()?),
        Command::Chapters { project } => {
            let chapters: Vec<_> = service
                .chapters(&project)?
                .into_iter()
                .map(|c| json!({ "id": c.id, "sequence": c.sequence, "title": c.title }))
                .collect();
            print_json(&chapters)
        }
        Command::Chunks { chapter } => print_json(&service.chunks(&chapter)?),
        Command::Process { chapter } => {
            let job = service.process_chapter(&chapter);
            tokio::pin!(job);
            let report = tokio::select! {
                report = &mut job => report?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!(%chapter, "interrupted, letting in-flight chunks finish");
                    service.cancel(&chapter);
                    job.await?
                }
            };
            print_json(&report)
        }
        Command::Reprocess { chunk, reason } => {
            print_json(&service.reprocess_chunk(&chunk, &reason).await?)
        }
        Command::ReprocessFlagged { chapter } => {
            print_json(&service.reprocess_flagged(&chapter).await?)
        }
        Command::Exclude { chunk } => print_json(&service.exclude_chunk(&chunk)?),
        Command::Restitch { chapter, exclude } => {
            print_json(&service.restitch(&chapter, &exclude).await?)
        }
        Command::Status { chapter } => print_json(&service.chapter_status(&chapter)?),
        Command::Sync { chapter } => print_json(&service.sync_data(&chapter)?),
        Command::History { chunk } => print_json(&service.artifact_history(&chunk)?),
        Command::Versions { chapter } => print_json(&service.chapter_audio_versions(&chapter)?),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
