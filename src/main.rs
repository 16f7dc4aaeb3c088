mod crawler;
mod db;
mod parser;
mod settings;
mod sitemap;

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::warn;

use crawler::{Fetcher, FetcherKind};
use parser::ContentRules;
use settings::{Overrides, Profile, Settings, Variant};

#[derive(Parser)]
#[command(
    name = "docs_crawler",
    about = "Crawl documentation sites into heading-scoped JSON records"
)]
struct Cli {
    /// Built-in site profile used as the base configuration
    #[arg(long, value_enum, default_value = "nextjs", global = true)]
    profile: Profile,
    /// TOML file layered over the profile
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Start URL (repeatable); replaces the configured ones
    #[arg(long = "start-url", global = true)]
    start_urls: Vec<String>,
    /// Only follow links whose path starts with this prefix
    #[arg(long, global = true)]
    link_prefix: Option<String>,
    #[arg(long, value_enum, global = true)]
    variant: Option<Variant>,
    /// Concurrent fetches
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "http", global = true)]
    fetcher: FetcherKind,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue start URLs (and sitemap entries, if configured)
    Init,
    /// Fetch unvisited pages, following documentation links
    Crawl {
        /// Max pages to fetch (default: until the queue is empty)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Build heading trees for fetched pages
    Process {
        /// Max pages to process (default: all unprocessed)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Crawl + process in one pipeline
    Run {
        /// Max pages to fetch
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Write every record as JSON Lines
    Export {
        /// Output file (default: docs-<timestamp>.jsonl)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Print one record
    Show {
        url: String,
    },
    /// Show crawl statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = settings::load(
        cli.profile,
        cli.config.as_deref(),
        Overrides {
            start_urls: cli.start_urls,
            link_path_prefix: cli.link_prefix,
            variant: cli.variant,
            concurrency: cli.concurrency,
            db_path: cli.db,
        },
    )?;

    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn)?;

    let result = match cli.command {
        Commands::Init => {
            let inserted = crawler::seed(&conn, &settings).await?;
            println!("Queued {} new URLs.", inserted);
            Ok(())
        }
        Commands::Crawl { limit } => {
            if db::fetch_unvisited(&conn, Some(1))?.is_empty() {
                println!("No unvisited pages. Run 'init' first or all pages are fetched.");
                return Ok(());
            }
            let fetcher = Fetcher::new(cli.fetcher, &settings)?;
            let stats = crawler::crawl(&conn, &settings, fetcher, limit).await?;
            println!(
                "Done: {} fetched ({} ok, {} errors), {} new links queued.",
                stats.total, stats.ok, stats.errors, stats.discovered
            );
            Ok(())
        }
        Commands::Process { limit } => {
            let pages = db::fetch_unprocessed(&conn, limit)?;
            if pages.is_empty() {
                println!("No unprocessed pages. Run 'crawl' first.");
                return Ok(());
            }
            println!("Processing {} pages...", pages.len());
            let counts = process_pages(&conn, &pages, &settings)?;
            counts.print();
            Ok(())
        }
        Commands::Run { limit } => {
            if db::fetch_unvisited(&conn, Some(1))?.is_empty() {
                crawler::seed(&conn, &settings).await?;
            }

            // Phase 1: Crawl (streaming to DB)
            let t_crawl = Instant::now();
            let fetcher = Fetcher::new(cli.fetcher, &settings)?;
            let stats = crawler::crawl(&conn, &settings, fetcher, limit).await?;
            println!(
                "Fetched {} pages ({} ok, {} errors) in {:.1}s",
                stats.total,
                stats.ok,
                stats.errors,
                t_crawl.elapsed().as_secs_f64()
            );

            // Phase 2: Process
            let t_process = Instant::now();
            let unprocessed = db::fetch_unprocessed(&conn, None)?;
            if unprocessed.is_empty() {
                println!("Nothing to process.");
                return Ok(());
            }
            println!("Processing {} pages...", unprocessed.len());
            let counts = process_pages(&conn, &unprocessed, &settings)?;
            println!("Processed in {:.1}s", t_process.elapsed().as_secs_f64());
            counts.print();
            Ok(())
        }
        Commands::Export { out } => {
            let path = out.unwrap_or_else(default_export_path);
            let written = export(&conn, &path)?;
            println!("Wrote {} records to {}", written, path.display());
            Ok(())
        }
        Commands::Show { url } => match db::fetch_record(&conn, &url)? {
            Some(record) => {
                let value: serde_json::Value = serde_json::from_str(&record)?;
                println!("{}", serde_json::to_string_pretty(&value)?);
                Ok(())
            }
            None => {
                println!("No record for {}", url);
                Ok(())
            }
        },
        Commands::Stats => {
            let s = db::get_stats(&conn)?;
            println!("Queued:    {}", s.total);
            println!("Visited:   {}", s.visited);
            println!("Unvisited: {}", s.unvisited);
            println!("Fetched:   {}", s.fetched);
            println!("Errors:    {}", s.errors);
            println!("Processed: {}", s.processed);
            println!("Sections:  {}", s.sections);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

struct ProcessCounts {
    pages: usize,
    sections: usize,
    orphans: usize,
}

impl ProcessCounts {
    fn print(&self) {
        println!(
            "Saved {} records, {} sections ({} without a heading).",
            self.pages, self.sections, self.orphans,
        );
    }
}

fn process_pages(
    conn: &rusqlite::Connection,
    pages: &[db::FetchedPage],
    settings: &Settings,
) -> anyhow::Result<ProcessCounts> {
    use indicatif::{ProgressBar, ProgressStyle};
    use rayon::prelude::*;

    let rules = ContentRules::from_settings(settings)?;

    let pb = ProgressBar::new(pages.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
            .progress_chars("#>-"),
    );

    let mut counts = ProcessCounts {
        pages: 0,
        sections: 0,
        orphans: 0,
    };

    for chunk in pages.chunks(500) {
        let records: Vec<_> = chunk
            .par_iter()
            .map(|page| (page.page_data_id, parser::process_page(page, &rules)))
            .collect();

        let mut rows = Vec::with_capacity(records.len());
        for (page_data_id, record) in records {
            let sections = record.structure.node_count();
            if sections == 0 {
                warn!("No headings or content found on {}", record.url);
            }
            counts.sections += sections;
            counts.orphans += record.structure.0.iter().filter(|n| n.is_orphan()).count();
            rows.push(db::RecordRow {
                page_data_id,
                url: record.url.clone(),
                title: record.title.clone(),
                last_updated: record.last_updated.clone(),
                sections,
                record: serde_json::to_string(&record)?,
            });
        }

        counts.pages += rows.len();
        db::save_records(conn, &rows)?;
        pb.inc(chunk.len() as u64);
    }

    pb.finish_and_clear();
    Ok(counts)
}

fn export(conn: &rusqlite::Connection, path: &Path) -> anyhow::Result<usize> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    let records = db::fetch_records(conn)?;
    for record in &records {
        writeln!(out, "{}", record)?;
    }
    out.flush()?;
    Ok(records.len())
}

fn default_export_path() -> PathBuf {
    PathBuf::from(chrono::Local::now().format("docs-%Y%m%d-%H%M%S.jsonl").to_string())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
