//! Analysis stage: score cached lyrics against the profanity lexicon and
//! roll the results up per album and for the whole collection.
//!
//! Matching is on whole tokens after a fixed folding scheme (NFKD, combining
//! marks removed, Unicode lowercase), so results never depend on locale.
//! Token characters are letters, digits and `*`, which keeps masked
//! spellings like `d*mn` intact. When scoring, leading and trailing `*` are
//! trimmed from any token the lexicon doesn't know as-is, so emphasis such
//! as `*hell*` still matches `hell`. Multi-word terms match consecutive
//! tokens; at each position the longest matching term wins and its tokens
//! are consumed.

use crate::cache::CacheStore;
use crate::config::{Config, StagePaths};
use crate::error::{AnalysisError, CacheError};
use crate::files::write_atomic;
use crate::layout::load_library;
use crate::models::{
    Album, AlbumSummary, AnalysisEntry, AnalysisReport, CollectionSummary, FetchStatus, LexiconEntry,
    Library, LyricsRecord, TrackId, TrackReport,
};
use crate::normalize::{identity_key, is_combining_mark};
use crate::progress::StageProgress;
use crate::safety::validate_output_path;
use anyhow::{Context, Result};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};
use unicode_normalization::UnicodeNormalization;

/// Built-in lexicon, all weight 1.
pub const DEFAULT_LEXICON: &[&str] = &["whore", "damn", "goddamn", "hell", "bitch", "shit", "fuck", "dickhead"];

/// Unscored bucket for tracks with no cache record.
pub const MISSING_STATUS: &str = "missing";

// ============================================================================
// Tokenization
// ============================================================================

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || c == '*'
}

/// Fold and split text into tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    let folded: String = text
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();
    folded
        .split(|c: char| !is_token_char(c))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Lexicon
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LexiconTerm {
    /// Normalized form: tokens joined by single spaces.
    pub term: String,
    pub tokens: Vec<String>,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct Lexicon {
    terms: Vec<LexiconTerm>,
    /// Term indices keyed by first token, longest first.
    by_first: FxHashMap<String, Vec<usize>>,
    /// Every token of every term.
    vocabulary: FxHashSet<String>,
}

impl Lexicon {
    fn from_terms(terms: Vec<LexiconTerm>) -> Result<Self, AnalysisError> {
        if terms.is_empty() {
            return Err(AnalysisError::EmptyLexicon);
        }
        Ok(Self::index(terms))
    }

    fn index(terms: Vec<LexiconTerm>) -> Self {
        let mut by_first: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        for (i, t) in terms.iter().enumerate() {
            by_first.entry(t.tokens[0].clone()).or_default().push(i);
        }
        for indices in by_first.values_mut() {
            indices.sort_by(|a, b| terms[*b].tokens.len().cmp(&terms[*a].tokens.len()).then(a.cmp(b)));
        }
        let vocabulary = terms.iter().flat_map(|t| t.tokens.iter().cloned()).collect();
        Self {
            terms,
            by_first,
            vocabulary,
        }
    }

    /// Tokenize lyric text for matching. Tokens the lexicon knows verbatim
    /// are kept; others lose leading and trailing `*`, and bare runs of `*`
    /// are dropped.
    pub fn scoring_tokens(&self, text: &str) -> Vec<String> {
        tokenize(text)
            .into_iter()
            .filter_map(|t| {
                if self.vocabulary.contains(&t) {
                    return Some(t);
                }
                let trimmed = t.trim_matches('*');
                if trimmed.is_empty() {
                    None
                } else if trimmed.len() == t.len() {
                    Some(t)
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect()
    }

    pub fn builtin() -> Self {
        let terms = DEFAULT_LEXICON
            .iter()
            .map(|w| LexiconTerm {
                term: w.to_string(),
                tokens: vec![w.to_string()],
                weight: 1.0,
            })
            .collect();
        Self::index(terms)
    }

    /// Parse `term [= weight]` lines. `#` starts a comment line.
    pub fn parse(text: &str, path: &Path) -> Result<Self, AnalysisError> {
        let invalid = |line: usize, message: String| AnalysisError::LexiconInvalid {
            path: path.to_path_buf(),
            line,
            message,
        };
        let mut terms: Vec<LexiconTerm> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (term_part, weight) = match line.split_once('=') {
                Some((t, w)) => {
                    let w = w.trim();
                    let weight: f64 = w
                        .parse()
                        .map_err(|_| invalid(line_no, format!("invalid weight '{}'", w)))?;
                    if !weight.is_finite() || weight < 0.0 {
                        return Err(invalid(line_no, format!("weight must be a non-negative number, got '{}'", w)));
                    }
                    (t, weight)
                }
                None => (line, 1.0),
            };
            let tokens = tokenize(term_part);
            if tokens.is_empty() {
                return Err(invalid(line_no, format!("term '{}' has no word characters", term_part.trim())));
            }
            let term = tokens.join(" ");
            if terms.iter().any(|t| t.term == term) {
                warn!("{}:{}: duplicate lexicon term '{}' ignored", path.display(), line_no, term);
                continue;
            }
            terms.push(LexiconTerm { term, tokens, weight });
        }
        Self::from_terms(terms)
    }

    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        if !path.is_file() {
            return Err(AnalysisError::LexiconMissing(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| AnalysisError::LexiconUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn terms(&self) -> &[LexiconTerm] {
        &self.terms
    }

    pub fn entries(&self) -> Vec<LexiconEntry> {
        self.terms
            .iter()
            .map(|t| LexiconEntry {
                term: t.term.clone(),
                weight: t.weight,
            })
            .collect()
    }
}

// ============================================================================
// Scoring
// ============================================================================

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Score one lyric document.
pub fn score_lyrics(lexicon: &Lexicon, text: &str) -> AnalysisEntry {
    let tokens = lexicon.scoring_tokens(text);
    let mut entry = AnalysisEntry {
        word_count: tokens.len(),
        ..Default::default()
    };

    let mut i = 0;
    while i < tokens.len() {
        let matched = lexicon.by_first.get(&tokens[i]).and_then(|candidates| {
            candidates
                .iter()
                .map(|&idx| &lexicon.terms[idx])
                .find(|t| tokens[i..].starts_with(&t.tokens))
        });
        match matched {
            Some(term) => {
                entry.match_count += 1;
                entry.weighted_score += term.weight;
                *entry.term_counts.entry(term.term.clone()).or_insert(0) += 1;
                entry.positions.entry(term.term.clone()).or_default().push(i);
                i += term.tokens.len();
            }
            None => i += 1,
        }
    }

    entry.severity = if entry.word_count == 0 {
        0.0
    } else {
        round2(entry.weighted_score * 100.0 / entry.word_count as f64)
    };
    entry
}

fn merge_counts(into: &mut BTreeMap<String, usize>, from: &BTreeMap<String, usize>) {
    for (term, n) in from {
        *into.entry(term.clone()).or_insert(0) += n;
    }
}

fn average(total: usize, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        round2(total as f64 / count as f64)
    }
}

/// Score every track of one album. Only `found` records are scored.
pub fn summarize_album(
    album: &Album,
    records: &FxHashMap<TrackId, LyricsRecord>,
    lexicon: &Lexicon,
) -> Result<AlbumSummary, AnalysisError> {
    let mut summary = AlbumSummary {
        artist: album.artist.clone(),
        album: album.title.clone(),
        year: album.year,
        folder: album.folder.clone(),
        track_count: album.tracks.len(),
        scored_tracks: 0,
        unscored_tracks: 0,
        unscored_by_status: BTreeMap::new(),
        total_matches: 0,
        total_score: 0.0,
        average_matches_per_track: 0.0,
        term_counts: BTreeMap::new(),
        tracks: Vec::with_capacity(album.tracks.len()),
    };

    for track in &album.tracks {
        let record = records.get(&track.id);
        let status = record.map(|r| r.status);
        let analysis = match record {
            Some(r) if r.status == FetchStatus::Found => {
                let text = r.lyrics.as_deref().ok_or_else(|| CacheError::CorruptRecord {
                    track_id: track.id.to_string(),
                    message: "found record without lyrics".to_string(),
                })?;
                Some(score_lyrics(lexicon, text))
            }
            _ => None,
        };

        match &analysis {
            Some(entry) => {
                summary.scored_tracks += 1;
                summary.total_matches += entry.match_count;
                summary.total_score += entry.weighted_score;
                merge_counts(&mut summary.term_counts, &entry.term_counts);
                if entry.match_count > 0 {
                    debug!("  Found {} match(es) in {}", entry.match_count, track.title);
                }
            }
            None => {
                summary.unscored_tracks += 1;
                let key = status.map(|s| s.as_db()).unwrap_or(MISSING_STATUS);
                *summary.unscored_by_status.entry(key.to_string()).or_insert(0) += 1;
            }
        }

        summary.tracks.push(TrackReport {
            id: track.id.clone(),
            number: track.number,
            title: track.title.clone(),
            file: track.file.clone(),
            status,
            analysis,
        });
    }

    summary.average_matches_per_track = average(summary.total_matches, summary.scored_tracks);
    Ok(summary)
}

/// Build the full report. Albums are scored in parallel; output order is
/// (artist, year, title) and independent of scheduling.
pub fn analyze_library(
    library: &Library,
    records: &FxHashMap<TrackId, LyricsRecord>,
    lexicon: &Lexicon,
) -> Result<AnalysisReport, AnalysisError> {
    let mut albums: Vec<AlbumSummary> = library
        .albums
        .par_iter()
        .map(|album| summarize_album(album, records, lexicon))
        .collect::<Result<Vec<_>, _>>()?;
    albums.sort_by_cached_key(|a| (identity_key(&a.artist), a.year, identity_key(&a.album)));

    let mut collection = CollectionSummary {
        albums: albums.len(),
        ..Default::default()
    };
    for a in &albums {
        collection.tracks += a.track_count;
        collection.scored_tracks += a.scored_tracks;
        collection.unscored_tracks += a.unscored_tracks;
        collection.total_matches += a.total_matches;
        collection.total_score += a.total_score;
        merge_counts(&mut collection.term_counts, &a.term_counts);
    }
    collection.average_matches_per_track = average(collection.total_matches, collection.scored_tracks);

    Ok(AnalysisReport {
        lexicon: lexicon.entries(),
        collection,
        albums,
    })
}

fn log_summary(report: &AnalysisReport) {
    info!("=== SUMMARY ===");
    for a in &report.albums {
        if a.total_matches == 0 {
            continue;
        }
        match a.year {
            Some(y) => info!("{} ({}) - {}: {} total instances", a.album, y, a.artist, a.total_matches),
            None => info!("{} - {}: {} total instances", a.album, a.artist, a.total_matches),
        }
        for (term, n) in &a.term_counts {
            info!("  - {}: {}", term, n);
        }
    }
    let c = &report.collection;
    info!("Total instances across all albums: {}", c.total_matches);
    info!(
        "Scored {} of {} track(s); {} unscored",
        c.scored_tracks, c.tracks, c.unscored_tracks
    );
}

/// Run the analysis stage. `lexicon_override` beats the configured lexicon.
pub fn run_analyze(
    paths: &StagePaths,
    config: &Config,
    lexicon_override: Option<&Path>,
    dry_run: bool,
) -> Result<AnalysisReport> {
    let library = load_library(&paths.library_file)?;

    let lexicon_path = lexicon_override
        .or(config.analyze.lexicon.as_deref())
        .map(|p| if p.is_absolute() { p.to_path_buf() } else { paths.root.join(p) });
    let lexicon = match &lexicon_path {
        Some(p) => Lexicon::load(p)?,
        None => Lexicon::builtin(),
    };
    let words: Vec<&str> = lexicon.terms().iter().map(|t| t.term.as_str()).collect();
    info!("Analyzing lyrics for words: {:?}", words);

    validate_output_path(
        &paths.report_file,
        "json",
        &[paths.library_file.as_path(), paths.cache_db.as_path()],
    )?;

    let spinner = StageProgress::spinner("Loading lyrics cache");
    let store = CacheStore::open_read_only(&paths.cache_db)?;
    let records = store.load_all().map_err(AnalysisError::from)?;
    spinner.finish(format!("{} cached record(s)", records.len()));

    let report = analyze_library(&library, &records, &lexicon)?;
    log_summary(&report);

    if dry_run {
        info!("DRY RUN: Would save results to {}", paths.report_file.display());
    } else {
        let mut json = serde_json::to_string_pretty(&report).context("Serialize analysis report")?;
        json.push('\n');
        write_atomic(&paths.report_file, json.as_bytes())?;
        info!("Results saved to: {}", paths.report_file.display());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Track;
    use std::path::PathBuf;

    fn lexicon(text: &str) -> Lexicon {
        Lexicon::parse(text, Path::new("lexicon.txt")).unwrap()
    }

    fn album(n: usize) -> Album {
        Album {
            artist: "Artist".into(),
            title: "Album".into(),
            year: Some(2001),
            folder: "Artist/Album".into(),
            tracks: (1..=n)
                .map(|i| Track {
                    id: TrackId::new(format!("t{}", i)),
                    number: i as u32,
                    title: format!("Song {}", i),
                    file: format!("Artist/Album/{:02} - Song {}.md", i, i),
                })
                .collect(),
        }
    }

    fn found(id: &str, text: &str) -> (TrackId, LyricsRecord) {
        (TrackId::new(id), LyricsRecord::found(TrackId::new(id), text.into(), None, 1))
    }

    #[test]
    fn test_tokenize_folds_case_and_marks() {
        assert_eq!(tokenize("Ça VA, d*mn!"), vec!["ca", "va", "d*mn"]);
        assert_eq!(tokenize("don't  stop\n\nbelievin'"), vec!["don", "t", "stop", "believin"]);
        assert!(tokenize(" ,.! ").is_empty());
    }

    #[test]
    fn test_masked_term_matches_once() {
        let lex = lexicon("d*mn = 1\n");
        let entry = score_lyrics(&lex, "this is a d*mn good song");
        assert_eq!(entry.match_count, 1);
        assert_eq!(entry.word_count, 6);
        assert_eq!(entry.term_counts.get("d*mn"), Some(&1));
        assert_eq!(entry.positions.get("d*mn"), Some(&vec![3]));
        assert_eq!(entry.severity, 16.67);
    }

    #[test]
    fn test_emphasis_asterisks_do_not_hide_matches() {
        let entry = score_lyrics(&Lexicon::builtin(), "what the *hell* is this, oh **damn** ***");
        assert_eq!(entry.match_count, 2);
        assert_eq!(entry.word_count, 7);
        assert_eq!(entry.positions.get("hell"), Some(&vec![2]));

        let lex = lexicon("d*mn\nf***\n");
        let entry = score_lyrics(&lex, "a *d*mn* day, f*** that");
        assert_eq!(entry.term_counts.get("d*mn"), Some(&1));
        assert_eq!(entry.term_counts.get("f***"), Some(&1));
    }

    #[test]
    fn test_whole_tokens_only() {
        let lex = Lexicon::builtin();
        let entry = score_lyrics(&lex, "Hello shell, goddamn hellish HELL");
        assert_eq!(entry.term_counts.get("hell"), Some(&1));
        assert_eq!(entry.term_counts.get("goddamn"), Some(&1));
        assert_eq!(entry.term_counts.get("damn"), None);
        assert_eq!(entry.match_count, 2);
    }

    #[test]
    fn test_multi_word_terms_and_weights() {
        let lex = lexicon("# weights\ngod damn = 3\ndamn = 0.5\n\nhell\n");
        let entry = score_lyrics(&lex, "God damn it, damn. Hell!");
        assert_eq!(entry.term_counts.get("god damn"), Some(&1));
        assert_eq!(entry.term_counts.get("damn"), Some(&1));
        assert_eq!(entry.term_counts.get("hell"), Some(&1));
        assert_eq!(entry.weighted_score, 4.5);
    }

    #[test]
    fn test_lexicon_errors_are_fatal() {
        let p = Path::new("lex.txt");
        assert!(matches!(
            Lexicon::parse("damn = -1\n", p),
            Err(AnalysisError::LexiconInvalid { line: 1, .. })
        ));
        assert!(matches!(
            Lexicon::parse("damn\nhell = lots\n", p),
            Err(AnalysisError::LexiconInvalid { line: 2, .. })
        ));
        assert!(matches!(Lexicon::parse("# nothing\n\n", p), Err(AnalysisError::EmptyLexicon)));
        assert!(matches!(Lexicon::parse("!!!\n", p), Err(AnalysisError::LexiconInvalid { .. })));
        assert!(matches!(
            Lexicon::load(&PathBuf::from("/nonexistent/lexicon.txt")),
            Err(AnalysisError::LexiconMissing(_))
        ));
    }

    #[test]
    fn test_duplicate_terms_keep_first() {
        let lex = lexicon("Damn = 2\ndamn = 5\n");
        assert_eq!(lex.terms().len(), 1);
        assert_eq!(lex.terms()[0].weight, 2.0);
    }

    #[test]
    fn test_album_aggregation() {
        let a = album(3);
        let lex = Lexicon::builtin();
        let records: FxHashMap<TrackId, LyricsRecord> = [
            found("t1", "clean words only"),
            found("t2", "hell and more hell"),
            found("t3", "oh damn"),
        ]
        .into_iter()
        .collect();
        let s = summarize_album(&a, &records, &lex).unwrap();
        assert_eq!(s.total_matches, 3);
        assert_eq!(s.scored_tracks, 3);
        assert_eq!(s.unscored_tracks, 0);
        assert_eq!(s.average_matches_per_track, 1.0);
        assert_eq!(s.term_counts.get("hell"), Some(&2));
    }

    #[test]
    fn test_unscored_tracks_leave_the_denominator() {
        let a = album(4);
        let lex = Lexicon::builtin();
        let mut records: FxHashMap<TrackId, LyricsRecord> =
            [found("t1", "hell hell"), found("t2", "nothing here")].into_iter().collect();
        records.insert(TrackId::new("t3"), LyricsRecord::not_found(TrackId::new("t3"), None, 1));

        let s = summarize_album(&a, &records, &lex).unwrap();
        assert_eq!(s.scored_tracks, 2);
        assert_eq!(s.unscored_tracks, 2);
        assert_eq!(s.average_matches_per_track, 1.0);
        assert_eq!(s.unscored_by_status.get("not_found"), Some(&1));
        assert_eq!(s.unscored_by_status.get(MISSING_STATUS), Some(&1));
        assert!(s.tracks[2].analysis.is_none());
        assert_eq!(s.tracks[2].status, Some(FetchStatus::NotFound));
        assert_eq!(s.tracks[3].status, None);
    }

    #[test]
    fn test_report_is_deterministic_and_ordered() {
        let mut later = album(1);
        later.year = Some(2010);
        later.title = "Later".into();
        later.tracks[0].id = TrackId::new("x1");
        let lib = Library { albums: vec![later, album(2)] };
        let records: FxHashMap<TrackId, LyricsRecord> =
            [found("t1", "damn"), found("t2", "shit damn"), found("x1", "hell")].into_iter().collect();

        let lex = Lexicon::builtin();
        let first = analyze_library(&lib, &records, &lex).unwrap();
        let second = analyze_library(&lib, &records, &lex).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(first.albums[0].album, "Album");
        assert_eq!(first.albums[1].album, "Later");
        assert_eq!(first.collection.total_matches, 4);
        assert_eq!(first.collection.term_counts.get("damn"), Some(&2));
    }
}
