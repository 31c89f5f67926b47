//! Summarize the lyrics cache: status counts and the most recent failures.
//!
//! Usage: cache-status <cache.sqlite3> [--errors N]

use anyhow::Result;
use clap::Parser;
use lyrics_audit::cache::CacheStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cache-status")]
#[command(about = "Show lyrics cache status counts and recent fetch errors")]
struct Args {
    /// Path to the cache database
    db: PathBuf,

    /// Number of recent error rows to show
    #[arg(long, default_value = "20")]
    errors: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let store = CacheStore::open_read_only(&args.db)?;

    let counts = store.status_counts()?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();

    println!("{:=<60}", "");
    println!("Lyrics cache: {}", store.path().display());
    println!("{:=<60}", "");
    for (status, n) in &counts {
        let pct = if total > 0 { 100.0 * *n as f64 / total as f64 } else { 0.0 };
        println!("  {:<10} {:>7} ({:.1}%)", status, n, pct);
    }
    println!("  {:<10} {:>7}", "total", total);

    if args.errors == 0 {
        return Ok(());
    }
    let errors = store.recent_errors(args.errors)?;
    if errors.is_empty() {
        println!("\nNo errors.");
        return Ok(());
    }

    println!("\nMost recent errors:");
    for e in &errors {
        println!(
            "  [{}] {} - {} / {} (attempts: {}, {})",
            e.track_id, e.artist, e.album, e.title, e.attempts, e.updated_at
        );
        if let Some(msg) = &e.error {
            println!("      {}", msg);
        }
    }
    Ok(())
}
