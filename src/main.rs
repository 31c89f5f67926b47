use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lyrics_audit::analyze::run_analyze;
use lyrics_audit::config::Config;
use lyrics_audit::fetch::{run_fetch, FetchOptions};
use lyrics_audit::layout::run_layout;
use lyrics_audit::logging::init_logging;
use lyrics_audit::progress::{format_duration, set_log_only};
use lyrics_audit::provider::FallbackProvider;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "lyrics-audit")]
#[command(about = "Build a lyrics corpus for a music library and audit it for profanity")]
struct Cli {
    /// Project root; every path resolves against it
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Config file (default: <root>/lyrics-audit.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Show only errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log-only mode: no progress bars, periodic log lines instead (for tail -f)
    #[arg(long, global = true)]
    log_only: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Derive the canonical library and lyric file tree from an album manifest
    Layout(LayoutArgs),
    /// Fetch lyrics for tracks without a cached result
    Fetch(FetchArgs),
    /// Score cached lyrics and write the analysis report
    Analyze(AnalyzeArgs),
}

#[derive(Args)]
struct LayoutArgs {
    /// Markdown album list, JSON manifest, or <Artist>/<Album>/<Track> directory
    #[arg(long)]
    input: PathBuf,

    /// Report what would be created without touching disk
    #[arg(short = 'n', long)]
    dry_run: bool,
}

#[derive(Args)]
struct FetchArgs {
    /// List eligible tracks without querying the provider
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Re-fetch tracks that already have a found/not-found result
    #[arg(long)]
    force: bool,

    /// Fetch at most N tracks
    #[arg(long)]
    limit: Option<usize>,

    /// Only albums whose title contains this (case-insensitive)
    #[arg(long)]
    album: Option<String>,

    /// Only albums released this year
    #[arg(long)]
    year: Option<u16>,

    /// Worker threads (default from config)
    #[arg(long)]
    workers: Option<usize>,

    /// Also write run stats as JSON to this file
    #[arg(long)]
    stats: Option<PathBuf>,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// Lexicon file (`term [= weight]` per line); built-in list when unset
    #[arg(long)]
    lexicon: Option<PathBuf>,

    /// Print the summary without writing the report
    #[arg(short = 'n', long)]
    dry_run: bool,
}

fn print_banner_end(elapsed: Duration) {
    println!("  Elapsed: {}", format_duration(elapsed));
    println!("{:=<60}", "");
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet)?;
    set_log_only(cli.log_only);

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("Invalid --root {}", cli.root.display()))?;
    let config = Config::load(&root, cli.config.as_deref())?;
    let paths = config.stage_paths(&root);
    let start = Instant::now();

    match cli.command {
        Command::Layout(args) => {
            let report = run_layout(&paths, &config, &args.input, args.dry_run)?;
            println!("\n{:=<60}", "");
            println!("Layout {}", if args.dry_run { "dry run complete" } else { "complete" });
            println!("  Albums: {}", report.albums);
            println!("  Tracks: {} ({} new)", report.tracks, report.new_tracks);
            println!("  Skipped entries: {}", report.skipped_entries);
            println!("  Directories created: {}", report.dirs_created);
            println!("  Files created: {}", report.files_created);
            println!(
                "  library.json: {}",
                if report.library_changed { "updated" } else { "unchanged" }
            );
            print_banner_end(start.elapsed());
        }
        Command::Fetch(args) => {
            let mut fetch_config = config.clone();
            if let Some(workers) = args.workers {
                fetch_config.fetch.workers = workers;
            }
            fetch_config.validate()?;
            let opts = FetchOptions {
                dry_run: args.dry_run,
                force: args.force,
                limit: args.limit,
                album: args.album,
                year: args.year,
                workers: args.workers,
            };
            let provider = FallbackProvider::from_config(&fetch_config.fetch).context("Failed to create lyrics providers")?;
            let report = run_fetch(&paths, &fetch_config, &opts, &provider)?;

            println!("\n{:=<60}", "");
            println!("Fetch {}", if args.dry_run { "dry run complete" } else { "complete" });
            println!("  Eligible: {}", report.eligible);
            println!("  Skipped (already cached): {}", report.skipped_cached);
            if !args.dry_run {
                println!("  Attempted: {}", report.attempted());
                println!("  Found: {}", report.found);
                println!("  Not found: {}", report.not_found);
                println!("  Failed: {}", report.failed);
                println!("  Provider requests: {}", report.provider_requests);
            }
            if report.duplicates_skipped > 0 {
                println!("  Duplicate ids skipped: {}", report.duplicates_skipped);
            }
            if report.restored_files > 0 {
                println!("  Lyric files restored from cache: {}", report.restored_files);
            }
            print_banner_end(start.elapsed());
            if report.failed > 0 {
                println!("Re-run `lyrics-audit fetch` to retry the {} failed track(s); cached results are not re-fetched.", report.failed);
            }

            if let Some(stats_path) = args.stats {
                report.write_to_file(&stats_path)?;
                println!("Stats written to: {}", stats_path.display());
            }
        }
        Command::Analyze(args) => {
            let report = run_analyze(&paths, &config, args.lexicon.as_deref(), args.dry_run)?;
            let c = &report.collection;
            println!("\n{:=<60}", "");
            println!("Analysis {}", if args.dry_run { "dry run complete" } else { "complete" });
            println!("  Albums: {}", c.albums);
            println!("  Tracks scored: {} of {}", c.scored_tracks, c.tracks);
            println!("  Total matches: {}", c.total_matches);
            println!("  Average matches per scored track: {:.2}", c.average_matches_per_track);
            if !args.dry_run {
                println!("  Report: {}", paths.report_file.display());
            }
            print_banner_end(start.elapsed());
        }
    }

    Ok(())
}
