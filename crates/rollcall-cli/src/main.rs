use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use rollcall_core::references::load_reference_dir;
use rollcall_core::{
    spawn_extractor, AttendanceService, Config, DayKey, Embedding, EmbeddingExtractor,
    EuclideanMatcher, ExtractionError, FaceEmbedding, Identity, RawImage,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Match distance threshold; overrides ROLLCALL_MATCH_THRESHOLD
    #[arg(long, global = true)]
    threshold: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered identities
    Identities,
    /// List the configured categories
    Categories,
    /// Register (or replace) an identity's embedding
    Register {
        /// Identity key (e.g. "jane_doe")
        identity: String,
        /// Display name; derived from the key when omitted
        #[arg(short, long)]
        name: Option<String>,
        /// External ID such as a student number
        #[arg(short, long)]
        external_id: Option<String>,
        /// JSON file holding the embedding vector
        #[arg(long)]
        embedding: PathBuf,
    },
    /// Remove an identity's embedding and roster counters
    Remove {
        identity: String,
    },
    /// Match embeddings from a JSON file (one vector or an array of vectors)
    Match {
        #[arg(long)]
        embedding: PathBuf,
    },
    /// Mark attendance for an identity
    Mark {
        identity: String,
        category: String,
        /// Timestamp as YYYY-MM-DDTHH:MM:SS; defaults to now
        #[arg(long)]
        at: Option<String>,
    },
    /// Show roster counters for an identity
    Roster {
        identity: String,
    },
    /// List days an identity missed a category
    Absent {
        identity: String,
        category: String,
    },
    /// Show the ledger for one day
    Day {
        /// Date as YYYY-MM-DD; defaults to today
        #[arg(long)]
        date: Option<String>,
    },
    /// Per-category standing and absences for an identity
    Report {
        identity: String,
    },
    /// Standing of every identity in one category
    CategoryReport {
        category: String,
        /// Date treated as today; defaults to today
        #[arg(long)]
        date: Option<String>,
    },
    /// Rebuild roster counters from ledger history
    RebuildRoster,
    /// Rebuild the gallery from reference photos and their embedding sidecars
    Enroll {
        /// Reference photo directory; defaults to ROLLCALL_KNOWN_FACES_DIR
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

/// Embeddings file: a single vector or a list of vectors.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    One(Embedding),
    Many(Vec<Embedding>),
}

/// Extractor for embeddings computed offline: `alice.jpg` is described by
/// `alice.embeddings.json`, an array of `{region, embedding}` objects.
struct SidecarExtractor;

impl SidecarExtractor {
    fn sidecar_path(image: &Path) -> PathBuf {
        image.with_extension("embeddings.json")
    }
}

impl EmbeddingExtractor for SidecarExtractor {
    fn extract(&mut self, image: &RawImage) -> Result<Vec<FaceEmbedding>, ExtractionError> {
        let source = image
            .source
            .as_deref()
            .ok_or_else(|| ExtractionError::Failure("image has no source path".into()))?;
        let path = Self::sidecar_path(source);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "no embedding sidecar");
                return Ok(Vec::new());
            }
            Err(e) => return Err(ExtractionError::Failure(format!("{}: {e}", path.display()))),
        };
        serde_json::from_str(&text)
            .map_err(|e| ExtractionError::Failure(format!("{}: {e}", path.display())))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_embeddings(path: &Path) -> Result<Vec<Embedding>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: EmbeddingFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing embeddings in {}", path.display()))?;
    Ok(match file {
        EmbeddingFile::One(e) => vec![e],
        EmbeddingFile::Many(list) => list,
    })
}

fn parse_day(date: Option<String>) -> Result<DayKey> {
    match date {
        Some(s) => s.parse().with_context(|| format!("invalid date {s:?}, expected YYYY-MM-DD")),
        None => Ok(DayKey::from(Local::now().date_naive())),
    }
}

fn parse_timestamp(at: Option<String>) -> Result<NaiveDateTime> {
    match at {
        Some(s) => NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S")
            .with_context(|| format!("invalid timestamp {s:?}, expected YYYY-MM-DDTHH:MM:SS")),
        None => Ok(Local::now().naive_local()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let mut service = AttendanceService::open_dir(&config)
        .with_context(|| format!("opening attendance data in {}", config.data_dir.display()))?;
    if let Some(threshold) = cli.threshold {
        if !(threshold.is_finite() && threshold > 0.0) {
            bail!("threshold must be a positive number, got {threshold}");
        }
        service = service.with_matcher(Box::new(EuclideanMatcher::new(threshold)));
    }

    match cli.command {
        Commands::Identities => print_json(&service.identities()?)?,
        Commands::Categories => {
            let names: Vec<&str> = service.categories().iter().map(|c| c.as_str()).collect();
            print_json(&names)?;
        }
        Commands::Register {
            identity,
            name,
            external_id,
            embedding,
        } => {
            let mut embeddings = read_embeddings(&embedding)?;
            if embeddings.len() != 1 {
                bail!("expected exactly one embedding, found {}", embeddings.len());
            }
            let mut id = match name {
                Some(name) => Identity::new(identity.as_str(), name),
                None => Identity::from_file_stem(&identity),
            };
            id.external_id = external_id;
            let replaced = service.register_identity(id, embeddings.remove(0))?;
            println!(
                "{} {identity}",
                if replaced.is_some() { "Replaced" } else { "Registered" }
            );
        }
        Commands::Remove { identity } => {
            if service.remove_identity(&identity)? {
                println!("Removed {identity}");
            } else {
                println!("No such identity: {identity}");
            }
        }
        Commands::Match { embedding } => {
            let probes = read_embeddings(&embedding)?;
            let results = service.match_frame(&probes)?;
            let known = results.iter().filter(|r| r.is_known()).count();
            tracing::info!(probes = results.len(), known, "matched");
            print_json(&results)?;
        }
        Commands::Mark { identity, category, at } => {
            let now = parse_timestamp(at)?;
            print_json(&service.mark_attendance(&identity, &category, now)?)?;
        }
        Commands::Roster { identity } => print_json(&service.roster_snapshot(&identity)?)?,
        Commands::Absent { identity, category } => {
            print_json(&service.absent_dates(&identity, &category)?)?;
        }
        Commands::Day { date } => {
            let day = parse_day(date)?;
            print_json(&serde_json::json!({
                "date": day,
                "attendance": service.day_attendance(day)?,
            }))?;
        }
        Commands::Report { identity } => print_json(&service.identity_report(&identity)?)?,
        Commands::CategoryReport { category, date } => {
            let day = parse_day(date)?;
            print_json(&service.category_report(&category, day)?)?;
        }
        Commands::RebuildRoster => {
            service.rebuild_roster()?;
            println!("Roster rebuilt");
        }
        Commands::Enroll { dir } => {
            let dir = dir.unwrap_or_else(|| config.known_faces_dir.clone());
            let sources = load_reference_dir(&dir)
                .with_context(|| format!("reading reference photos in {}", dir.display()))?;
            let extractor = spawn_extractor(SidecarExtractor, config.extraction_timeout)?;
            tracing::info!(
                dir = %dir.display(),
                images = sources.len(),
                timeout_ms = extractor.timeout().as_millis() as u64,
                "enrolling from reference photos"
            );
            let report = service.rebuild_store_with(&extractor, sources).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}
