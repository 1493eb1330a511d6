use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dedupvault_engine::{
    DedupEngine, DeleteOutcome, EngineConfig, FileRecord, IngestMeta, RecordId,
};
use serde_json::json;

const STDIN_PATH: &str = "-";

#[derive(Parser)]
#[command(name = "dvault")]
#[command(about = "Content-addressable deduplicating file vault", long_about = None)]
pub struct Cli {
    /// Engine config file (.toml or .json).
    #[arg(short, long, env = "DVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides `data_dir` from the config file.
    #[arg(short, long, env = "DVAULT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// JSON logs and JSON command output.
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Ingest files concurrently; `-` reads stdin.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(short, long, default_value = "")]
        media_type: String,
        /// Display name for stdin uploads.
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Show one record and the bytes it saves.
    Show { id: String },
    /// Write a record's content to stdout.
    Cat { id: String },
    /// Delete a record under the configured delete policy.
    Delete { id: String },
    /// Recompute and print storage statistics.
    Stats,
    /// List all records, newest first.
    List,
    /// Check records, index keys and stored content for consistency.
    Verify,
    /// Compact the write-ahead log.
    Checkpoint,
}

impl Cli {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.engine_config()?;
        let engine = Arc::new(
            tokio::task::spawn_blocking(move || DedupEngine::open(config))
                .await?
                .context("opening data directory")?,
        );

        match self.command {
            Command::Ingest {
                ref paths,
                ref media_type,
                ref name,
            } => self.ingest(&engine, paths, media_type, name.as_deref()).await,
            Command::Show { ref id } => self.show(&engine, id).await,
            Command::Cat { ref id } => self.cat(&engine, id).await,
            Command::Delete { ref id } => self.delete(&engine, id).await,
            Command::Stats => self.stats(&engine).await,
            Command::List => self.list(&engine).await,
            Command::Verify => self.verify(&engine).await,
            Command::Checkpoint => blocking(&engine, |e| e.checkpoint()).await,
        }
    }

    async fn ingest(
        &self,
        engine: &Arc<DedupEngine>,
        paths: &[PathBuf],
        media_type: &str,
        stdin_name: Option<&str>,
    ) -> Result<()> {
        let stdin = Path::new(STDIN_PATH);
        if paths.iter().filter(|p| p.as_path() == stdin).count() > 1 {
            anyhow::bail!("stdin can only be ingested once");
        }
        let stdin_meta = match stdin_name {
            Some(name) => Some(IngestMeta::new(name, media_type)),
            None if paths.iter().any(|p| p.as_path() == stdin) => {
                anyhow::bail!("--name is required when ingesting stdin")
            }
            None => None,
        };

        let tasks: Vec<_> = paths
            .iter()
            .map(|path| {
                let engine = Arc::clone(engine);
                let path = path.clone();
                let media_type = media_type.to_string();
                let stdin_meta = stdin_meta.clone();
                tokio::task::spawn_blocking(move || {
                    let result = match stdin_meta {
                        Some(meta) if path.as_path() == Path::new(STDIN_PATH) => {
                            engine.ingest(std::io::stdin().lock(), meta)
                        }
                        _ => engine.ingest_path(&path, media_type),
                    };
                    (path, result)
                })
            })
            .collect();

        let mut failed = 0usize;
        for task in tasks {
            let (path, result) = task.await?;
            match result {
                Ok(record) => self.print_record(&record)?,
                Err(e) => {
                    failed += 1;
                    tracing::error!(path = %path.display(), error = %e, "Ingest failed");
                }
            }
        }
        if failed > 0 {
            anyhow::bail!("{} of {} uploads failed", failed, paths.len());
        }
        Ok(())
    }

    async fn show(&self, engine: &Arc<DedupEngine>, id: &str) -> Result<()> {
        let id = parse_id(id)?;
        let (record, saved) =
            blocking(engine, move |e| Ok((e.get(&id)?, e.storage_saved(&id)?))).await?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "record": record, "storage_saved": saved }))?
            );
        } else {
            println!("ID:          {}", record.id);
            println!("Name:        {}", record.display_name);
            println!("Media type:  {}", record.media_type);
            println!("Size:        {}", format_bytes(record.size_bytes));
            println!("Digest:      {}", record.digest);
            println!("Created:     {}", record.created_at);
            match record.canonical_ref {
                Some(canonical) => println!("Duplicate of: {}", canonical),
                None => println!("Canonical:   yes (saves {})", format_bytes(saved)),
            }
        }
        Ok(())
    }

    async fn cat(&self, engine: &Arc<DedupEngine>, id: &str) -> Result<()> {
        let id = parse_id(id)?;
        let engine = Arc::clone(engine);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut content = engine.open_content(&id)?;
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            std::io::copy(&mut content, &mut out)?;
            out.flush()?;
            Ok(())
        })
        .await?
    }

    async fn delete(&self, engine: &Arc<DedupEngine>, id: &str) -> Result<()> {
        let id = parse_id(id)?;
        let outcome = blocking(engine, move |e| e.delete(&id)).await?;

        let (summary, value) = match outcome {
            DeleteOutcome::Duplicate { canonical } => (
                format!("Deleted duplicate of {}", canonical),
                json!({ "deleted": id, "outcome": "duplicate", "canonical": canonical }),
            ),
            DeleteOutcome::LastReference { digest } => (
                format!("Deleted last reference; content {} released", digest),
                json!({ "deleted": id, "outcome": "last_reference", "digest": digest }),
            ),
            DeleteOutcome::Promoted {
                new_canonical,
                repointed,
            } => (
                format!(
                    "Deleted canonical; {} promoted, {} duplicates re-pointed",
                    new_canonical, repointed
                ),
                json!({
                    "deleted": id,
                    "outcome": "promoted",
                    "new_canonical": new_canonical,
                    "repointed": repointed,
                }),
            ),
        };
        if self.json {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", summary);
        }
        Ok(())
    }

    async fn stats(&self, engine: &Arc<DedupEngine>) -> Result<()> {
        let stats = blocking(engine, |e| e.statistics()).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&*stats)?);
        } else {
            println!("Files:          {}", stats.total_files);
            println!("Unique:         {}", stats.unique_files);
            println!("Duplicates:     {}", stats.duplicate_files);
            println!("Logical size:   {}", format_bytes(stats.total_logical_bytes));
            println!("Stored size:    {}", format_bytes(stats.actual_bytes));
            println!("Saved:          {}", format_bytes(stats.bytes_saved));
            println!("Dedup ratio:    {:.2}x", stats.dedup_ratio());
        }
        Ok(())
    }

    async fn list(&self, engine: &Arc<DedupEngine>) -> Result<()> {
        let records = blocking(engine, |e| e.list()).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&records)?);
            return Ok(());
        }
        println!(
            "{:<36} {:<5} {:>12} {:<16} {}",
            "ID", "KIND", "SIZE", "DIGEST", "NAME"
        );
        println!("{}", "-".repeat(90));
        for record in &records {
            println!(
                "{:<36} {:<5} {:>12} {:<16} {}",
                record.id,
                if record.is_duplicate { "dup" } else { "canon" },
                format_bytes(record.size_bytes),
                &record.digest.to_hex()[..16],
                record.display_name
            );
        }
        Ok(())
    }

    async fn verify(&self, engine: &Arc<DedupEngine>) -> Result<()> {
        let report = blocking(engine, |e| e.verify()).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            for issue in &report.issues {
                println!("{}", issue);
            }
            println!(
                "{} records checked, {} issues",
                report.records_checked,
                report.issues.len()
            );
        }
        if !report.is_clean() {
            anyhow::bail!("integrity check found {} issues", report.issues.len());
        }
        Ok(())
    }

    fn print_record(&self, record: &FileRecord) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(record)?);
        } else {
            match record.canonical_ref {
                Some(canonical) => println!(
                    "{}  {}  duplicate of {}",
                    record.id, record.display_name, canonical
                ),
                None => println!(
                    "{}  {}  stored {}",
                    record.id,
                    record.display_name,
                    format_bytes(record.size_bytes)
                ),
            }
        }
        Ok(())
    }
}

/// Run an engine call on the blocking pool.
async fn blocking<T, F>(engine: &Arc<DedupEngine>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&DedupEngine) -> dedupvault_engine::Result<T> + Send + 'static,
{
    let engine = Arc::clone(engine);
    Ok(tokio::task::spawn_blocking(move || f(&engine)).await??)
}

fn parse_id(id: &str) -> Result<RecordId> {
    id.parse::<RecordId>()
        .with_context(|| format!("invalid record id '{}'", id))
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
