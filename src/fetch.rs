//! Fetch stage: query the provider for every track without a terminal
//! cached result and record the outcome.
//!
//! Workers pull jobs from a bounded channel and send outcomes to a single
//! writer thread, which writes lyric files atomically and commits records in
//! batched transactions. A killed run leaves rows either committed or
//! `pending`, and the next run picks up exactly those.

use crate::cache::CacheStore;
use crate::config::{Config, StagePaths};
use crate::files::{is_missing_or_empty, write_atomic};
use crate::layout::load_library;
use crate::models::{FetchReport, FetchStatus, Library, LyricsRecord, TrackId, TrackRef};
use crate::normalize::clean_lyrics_text;
use crate::progress::StageProgress;
use crate::provider::{LyricsProvider, LyricsQuery, ProviderResponse};
use crate::retry::{RateLimiter, RetryPolicy};
use crate::safety::resolve_within;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub dry_run: bool,
    /// Re-query tracks that already have a terminal result.
    pub force: bool,
    pub limit: Option<usize>,
    /// Case-insensitive substring of the album title.
    pub album: Option<String>,
    pub year: Option<u16>,
    pub workers: Option<usize>,
}

impl FetchOptions {
    fn matches(&self, t: TrackRef<'_>) -> bool {
        if let Some(filter) = &self.album {
            if !t.album.title.to_lowercase().contains(&filter.to_lowercase()) {
                return false;
            }
        }
        if let Some(year) = self.year {
            if t.album.year != Some(year) {
                return false;
            }
        }
        true
    }
}

/// One unit of work, owned so it can cross threads.
#[derive(Debug, Clone)]
pub struct TrackJob {
    pub id: TrackId,
    pub query: LyricsQuery,
    pub path: PathBuf,
    pub header: String,
}

#[derive(Debug)]
struct Outcome {
    job: TrackJob,
    record: LyricsRecord,
}

/// Track ids claimed during this run. A second claim for the same id fails.
#[derive(Debug, Default)]
pub struct RunClaims {
    claimed: Mutex<FxHashSet<TrackId>>,
}

impl RunClaims {
    pub fn claim(&self, id: &TrackId) -> bool {
        let mut claimed = match self.claimed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        claimed.insert(id.clone())
    }
}

// ============================================================================
// Lyric files
// ============================================================================

/// Header written above the lyrics in each track file.
pub fn lyric_file_header(t: TrackRef<'_>) -> String {
    let mut header = format!(
        "# {}\n\nArtist: {}\nAlbum: {}\nTrack: {}\n",
        t.track.title, t.album.artist, t.album.title, t.track.number
    );
    if let Some(year) = t.album.year {
        header.push_str(&format!("Year: {}\n", year));
    }
    header.push_str("\n---\n\n");
    header
}

fn lyric_file_contents(header: &str, lyrics: &str) -> String {
    format!("{}{}\n", header, lyrics.trim_end())
}

/// Every folder and file in the library must stay inside the lyrics directory.
fn check_library_paths(library: &Library, lyrics_dir: &Path) -> Result<()> {
    for album in &library.albums {
        resolve_within(lyrics_dir, &album.folder)?;
        for track in &album.tracks {
            resolve_within(lyrics_dir, &track.file)?;
        }
    }
    Ok(())
}

/// Re-export `found` records whose lyric file is missing or empty.
fn restore_missing_files(
    library: &Library,
    store: &CacheStore,
    lyrics_dir: &Path,
    dry_run: bool,
) -> Result<usize> {
    let statuses = store.statuses()?;
    let mut restored = 0;
    for t in library.tracks() {
        if statuses.get(&t.track.id) != Some(&FetchStatus::Found) {
            continue;
        }
        let path = resolve_within(lyrics_dir, &t.track.file)?;
        if !is_missing_or_empty(&path) {
            continue;
        }
        if dry_run {
            info!("DRY RUN: Would restore lyrics file: {}", path.display());
            restored += 1;
            continue;
        }
        let Some(record) = store.get(&t.track.id)? else {
            continue;
        };
        if let Some(lyrics) = record.lyrics.as_deref() {
            write_atomic(&path, lyric_file_contents(&lyric_file_header(t), lyrics).as_bytes())?;
            debug!("Restored lyrics file: {}", path.display());
            restored += 1;
        }
    }
    Ok(restored)
}

// ============================================================================
// Workers
// ============================================================================

/// Fetch one track with retries. Never fails: errors become an `error` record.
pub fn fetch_one<S>(
    provider: &dyn LyricsProvider,
    limiter: &RateLimiter,
    policy: &RetryPolicy,
    job: &TrackJob,
    sleep: S,
) -> LyricsRecord
where
    S: FnMut(Duration),
{
    let (result, attempts) = policy.run(
        |attempt| {
            limiter.acquire();
            debug!("Request {} for {} ({} / {})", attempt, job.id, job.query.artist, job.query.title);
            provider.fetch(&job.query)
        },
        sleep,
    );

    match result {
        Ok(ProviderResponse::Found { text, meta }) => {
            let cleaned = clean_lyrics_text(&text, &job.query.display_title);
            LyricsRecord::found(job.id.clone(), cleaned, Some(meta), attempts)
        }
        Ok(ProviderResponse::NotFound { meta }) => LyricsRecord::not_found(job.id.clone(), Some(meta), attempts),
        Err(e) => {
            warn!("Failed to fetch {} after {} attempt(s): {}", job.query.display_title, attempts, e);
            LyricsRecord::error(job.id.clone(), e.to_string(), attempts)
        }
    }
}

fn worker_loop(
    rx: Receiver<TrackJob>,
    tx: Sender<Outcome>,
    provider: &dyn LyricsProvider,
    limiter: &RateLimiter,
    policy: &RetryPolicy,
) {
    while let Ok(job) = rx.recv() {
        let record = fetch_one(provider, limiter, policy, &job, std::thread::sleep);
        if tx.send(Outcome { job, record }).is_err() {
            break;
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

#[derive(Debug, Default)]
struct WriterStats {
    found: usize,
    not_found: usize,
    failed: usize,
    provider_requests: usize,
}

/// Write the lyric file for a found outcome. A write failure turns the
/// outcome into an `error` record so the track is retried next run.
fn finalize_outcome(outcome: Outcome) -> LyricsRecord {
    let Outcome { job, record } = outcome;
    if record.status != FetchStatus::Found {
        return record;
    }
    let Some(lyrics) = record.lyrics.as_deref() else {
        return record;
    };
    let contents = lyric_file_contents(&job.header, lyrics);
    match write_atomic(&job.path, contents.as_bytes()) {
        Ok(()) => record,
        Err(e) => {
            warn!("Failed to write {}: {:#}", job.path.display(), e);
            LyricsRecord::error(job.id, format!("failed to write lyrics file: {:#}", e), record.attempts)
        }
    }
}

fn flush_batch(store: &mut CacheStore, batch: &mut Vec<LyricsRecord>) -> Result<()> {
    let applied = store.commit_batch(batch).context("Commit fetch results")?;
    if applied < batch.len() {
        debug!("{} of {} outcome(s) left terminal records unchanged", batch.len() - applied, batch.len());
    }
    batch.clear();
    Ok(())
}

fn writer_loop(store: &mut CacheStore, rx: Receiver<Outcome>, progress: &StageProgress) -> Result<WriterStats> {
    let mut stats = WriterStats::default();
    let mut batch: Vec<LyricsRecord> = Vec::with_capacity(BATCH_SIZE);
    let mut last_flush = Instant::now();
    let flush_every = Duration::from_millis(750);

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(outcome) => {
                let record = finalize_outcome(outcome);
                stats.provider_requests += record.attempts as usize;
                match record.status {
                    FetchStatus::Found => stats.found += 1,
                    FetchStatus::NotFound => stats.not_found += 1,
                    _ => stats.failed += 1,
                }
                progress.inc();
                batch.push(record);
                if batch.len() >= BATCH_SIZE || last_flush.elapsed() >= flush_every {
                    flush_batch(store, &mut batch)?;
                    last_flush = Instant::now();
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if !batch.is_empty() && last_flush.elapsed() >= flush_every {
                    flush_batch(store, &mut batch)?;
                    last_flush = Instant::now();
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                if !batch.is_empty() {
                    flush_batch(store, &mut batch)?;
                }
                break;
            }
        }
    }
    Ok(stats)
}

// ============================================================================
// Stage entry point
// ============================================================================

/// Run the fetch stage against `provider`.
pub fn run_fetch(
    paths: &StagePaths,
    config: &Config,
    opts: &FetchOptions,
    provider: &dyn LyricsProvider,
) -> Result<FetchReport> {
    let start = Instant::now();
    let library = load_library(&paths.library_file)?;
    check_library_paths(&library, &paths.lyrics_dir)
        .with_context(|| format!("Unsafe path in {}", paths.library_file.display()))?;
    info!(
        "Loaded library: {} albums, {} tracks",
        library.albums.len(),
        library.track_count()
    );

    // A dry run never creates the cache.
    let store = if opts.dry_run && !paths.cache_db.exists() {
        None
    } else {
        Some(CacheStore::open(&paths.cache_db)?)
    };
    let mut report = FetchReport::default();
    let mut statuses: FxHashMap<TrackId, FetchStatus> = FxHashMap::default();
    if let Some(store) = &store {
        report.restored_files = restore_missing_files(&library, store, &paths.lyrics_dir, opts.dry_run)?;
        statuses = store.statuses()?;
    }

    let claims = RunClaims::default();
    let mut selected: Vec<TrackRef> = Vec::new();
    for t in library.tracks() {
        if !opts.matches(t) {
            continue;
        }
        let terminal = statuses.get(&t.track.id).is_some_and(|s| s.is_terminal());
        if terminal && !opts.force {
            report.skipped_cached += 1;
            continue;
        }
        if opts.limit.is_some_and(|limit| selected.len() >= limit) {
            continue;
        }
        if !claims.claim(&t.track.id) {
            report.duplicates_skipped += 1;
            continue;
        }
        selected.push(t);
    }
    report.eligible = selected.len();
    if let Some(limit) = opts.limit {
        info!("Limit: {} track(s)", limit);
    }

    if opts.dry_run {
        for t in &selected {
            info!("DRY RUN: Would fetch lyrics for: {} ({})", t.track.title, t.album.title);
        }
        report.elapsed_seconds = start.elapsed().as_secs_f64();
        return Ok(report);
    }
    let Some(mut store) = store.filter(|_| !selected.is_empty()) else {
        report.elapsed_seconds = start.elapsed().as_secs_f64();
        return Ok(report);
    };

    store.register_pending(&selected)?;

    let mut jobs = Vec::with_capacity(selected.len());
    for t in &selected {
        jobs.push(TrackJob {
            id: t.track.id.clone(),
            query: LyricsQuery::for_track(*t),
            path: resolve_within(&paths.lyrics_dir, &t.track.file)?,
            header: lyric_file_header(*t),
        });
    }
    drop(selected);

    let workers = opts.workers.unwrap_or(config.fetch.workers).max(1);
    let limiter = RateLimiter::new(config.fetch.min_request_interval());
    let policy = RetryPolicy::from_config(&config.fetch);
    let progress = StageProgress::new("Fetching lyrics", jobs.len() as u64);
    info!(
        "Fetching {} track(s) from {} with {} worker(s), {:?} between requests",
        jobs.len(),
        provider.name(),
        workers,
        limiter.interval()
    );

    let (job_tx, job_rx) = bounded::<TrackJob>(config.fetch.queue);
    let (out_tx, out_rx) = bounded::<Outcome>(config.fetch.queue);

    let stats = std::thread::scope(|s| -> Result<WriterStats> {
        let store = &mut store;
        let progress = &progress;
        let writer = s.spawn(move || writer_loop(store, out_rx, progress));

        for _ in 0..workers {
            let rx = job_rx.clone();
            let tx = out_tx.clone();
            let limiter = &limiter;
            let policy = &policy;
            s.spawn(move || worker_loop(rx, tx, provider, limiter, policy));
        }
        drop(out_tx);
        drop(job_rx);

        for job in jobs {
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        writer.join().map_err(|_| anyhow!("DB writer thread panicked"))?
    })?;

    report.found = stats.found;
    report.not_found = stats.not_found;
    report.failed = stats.failed;
    report.provider_requests = stats.provider_requests;
    report.elapsed_seconds = start.elapsed().as_secs_f64();
    progress.finish(format!(
        "{} found, {} not found, {} failed",
        report.found, report.not_found, report.failed
    ));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::models::{Album, ProviderMeta, Track};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        answers: Mutex<VecDeque<Result<ProviderResponse, FetchError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: Vec<Result<ProviderResponse, FetchError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl LyricsProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn fetch(&self, _query: &LyricsQuery) -> Result<ProviderResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::Server(500)))
        }
    }

    fn job() -> TrackJob {
        TrackJob {
            id: TrackId::new("abc"),
            query: LyricsQuery {
                artist: "artist".into(),
                title: "song".into(),
                album: None,
                display_title: "Song".into(),
            },
            path: PathBuf::from("unused.md"),
            header: String::new(),
        }
    }

    fn meta() -> ProviderMeta {
        ProviderMeta {
            provider: "scripted".into(),
            ..Default::default()
        }
    }

    fn quick() -> (RateLimiter, RetryPolicy) {
        (
            RateLimiter::new(Duration::from_millis(1)),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        )
    }

    #[test]
    fn test_retry_exhaustion_records_error() {
        let provider = Scripted::new(vec![]);
        let (limiter, policy) = quick();
        let record = fetch_one(&provider, &limiter, &policy, &job(), |_| {});
        assert_eq!(record.status, FetchStatus::Error);
        assert_eq!(record.attempts, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert!(record.error.unwrap().contains("500"));
    }

    #[test]
    fn test_transient_then_found_is_cleaned() {
        let provider = Scripted::new(vec![
            Err(FetchError::Transport("reset".into())),
            Ok(ProviderResponse::Found {
                text: "12 Contributors\nSong Lyrics\nFirst line\n\n\n\nSecond line".into(),
                meta: meta(),
            }),
        ]);
        let (limiter, policy) = quick();
        let record = fetch_one(&provider, &limiter, &policy, &job(), |_| {});
        assert_eq!(record.status, FetchStatus::Found);
        assert_eq!(record.lyrics.as_deref(), Some("First line\n\nSecond line"));
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let provider = Scripted::new(vec![Err(FetchError::Rejected(400))]);
        let (limiter, policy) = quick();
        let record = fetch_one(&provider, &limiter, &policy, &job(), |_| {});
        assert_eq!(record.status, FetchStatus::Error);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not_found_and_blank_text_are_terminal() {
        let provider = Scripted::new(vec![
            Ok(ProviderResponse::NotFound { meta: meta() }),
            Ok(ProviderResponse::Found { text: "3 Contributors\n \n".into(), meta: meta() }),
        ]);
        let (limiter, policy) = quick();
        assert_eq!(fetch_one(&provider, &limiter, &policy, &job(), |_| {}).status, FetchStatus::NotFound);
        assert_eq!(fetch_one(&provider, &limiter, &policy, &job(), |_| {}).status, FetchStatus::NotFound);
    }

    #[test]
    fn test_run_claims_are_exclusive() {
        let claims = RunClaims::default();
        let id = TrackId::new("abc");
        assert!(claims.claim(&id));
        assert!(!claims.claim(&id));
        assert!(claims.claim(&TrackId::new("def")));
    }

    #[test]
    fn test_lyric_file_header() {
        let album = Album {
            artist: "Taylor Swift".into(),
            title: "Red".into(),
            year: Some(2012),
            folder: "Taylor Swift/Red".into(),
            tracks: vec![],
        };
        let track = Track {
            id: TrackId::new("abc"),
            number: 2,
            title: "Red".into(),
            file: "Taylor Swift/Red/02 - Red.md".into(),
        };
        let header = lyric_file_header(TrackRef { album: &album, track: &track });
        assert_eq!(
            header,
            "# Red\n\nArtist: Taylor Swift\nAlbum: Red\nTrack: 2\nYear: 2012\n\n---\n\n"
        );
        assert_eq!(lyric_file_contents(&header, "la la\n\n"), format!("{}la la\n", header));
    }

    #[test]
    fn test_write_failure_becomes_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let mut j = job();
        j.path = blocker.join("nested.md");
        let record = LyricsRecord::found(j.id.clone(), "words".into(), None, 1);
        let out = finalize_outcome(Outcome { job: j, record });
        assert_eq!(out.status, FetchStatus::Error);
        assert_eq!(out.attempts, 1);
    }

    #[test]
    fn test_options_filter() {
        let album = Album {
            artist: "A".into(),
            title: "Speak Now".into(),
            year: Some(2010),
            folder: "A/Speak Now".into(),
            tracks: vec![],
        };
        let track = Track { id: TrackId::new("x"), number: 1, title: "Mine".into(), file: "A/Speak Now/01 - Mine.md".into() };
        let t = TrackRef { album: &album, track: &track };
        assert!(FetchOptions { album: Some("speak".into()), ..Default::default() }.matches(t));
        assert!(!FetchOptions { album: Some("red".into()), ..Default::default() }.matches(t));
        assert!(FetchOptions { year: Some(2010), ..Default::default() }.matches(t));
        assert!(!FetchOptions { year: Some(2012), ..Default::default() }.matches(t));
    }
}
