//! Core data models for the lyrics audit pipeline.
//!
//! This module contains the library structure produced by the scanner, the
//! cache records owned by the cache store, and the derived analysis and run
//! report types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable track identifier derived from artist, album and title content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First six characters, used to disambiguate colliding paths.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(6);
        &self.0[..end]
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Library Structure
// ============================================================================

/// Canonical library produced by the layout stage and persisted as `library.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    pub albums: Vec<Album>,
}

/// Album with its ordered tracks. `folder` is relative to the lyrics directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub artist: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    pub folder: String,
    pub tracks: Vec<Track>,
}

/// Track entry. `file` is relative to the lyrics directory, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub number: u32,
    pub title: String,
    pub file: String,
}

/// Borrowed (album, track) pair. Tracks hold no pointer back to their album.
#[derive(Debug, Clone, Copy)]
pub struct TrackRef<'a> {
    pub album: &'a Album,
    pub track: &'a Track,
}

impl Library {
    pub fn tracks(&self) -> impl Iterator<Item = TrackRef<'_>> {
        self.albums
            .iter()
            .flat_map(|album| album.tracks.iter().map(move |track| TrackRef { album, track }))
    }

    pub fn track_count(&self) -> usize {
        self.albums.iter().map(|a| a.tracks.len()).sum()
    }

    pub fn find_track(&self, id: &TrackId) -> Option<TrackRef<'_>> {
        self.tracks().find(|t| &t.track.id == id)
    }
}

// ============================================================================
// Cache Records
// ============================================================================

/// Fetch status of a lyrics record.
///
/// `Found` and `NotFound` are terminal; `Pending` and `Error` are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Pending,
    Found,
    NotFound,
    Error,
}

impl FetchStatus {
    pub fn as_db(self) -> &'static str {
        match self {
            FetchStatus::Pending => "pending",
            FetchStatus::Found => "found",
            FetchStatus::NotFound => "not_found",
            FetchStatus::Error => "error",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FetchStatus::Pending),
            "found" => Some(FetchStatus::Found),
            "not_found" => Some(FetchStatus::NotFound),
            "error" => Some(FetchStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FetchStatus::Found | FetchStatus::NotFound)
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db())
    }
}

/// What the provider told us about the matched song.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMeta {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_title: Option<String>,
    #[serde(default)]
    pub instrumental: bool,
    #[serde(default)]
    pub synced_only: bool,
}

/// Cached fetch result for one track.
///
/// Invariant: `status == Found` iff `lyrics` is non-empty. Use the
/// constructors, which uphold it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LyricsRecord {
    pub track_id: TrackId,
    pub status: FetchStatus,
    pub lyrics: Option<String>,
    /// Provider requests made for this record during the run that produced it.
    pub attempts: u32,
    pub error: Option<String>,
    pub provider: Option<ProviderMeta>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl LyricsRecord {
    pub fn pending(track_id: TrackId) -> Self {
        Self {
            track_id,
            status: FetchStatus::Pending,
            lyrics: None,
            attempts: 0,
            error: None,
            provider: None,
            fetched_at: None,
        }
    }

    /// Found record. Blank text downgrades to `NotFound`.
    pub fn found(track_id: TrackId, text: String, provider: Option<ProviderMeta>, attempts: u32) -> Self {
        if text.trim().is_empty() {
            return Self::not_found(track_id, provider, attempts);
        }
        Self {
            track_id,
            status: FetchStatus::Found,
            lyrics: Some(text),
            attempts,
            error: None,
            provider,
            fetched_at: Some(Utc::now()),
        }
    }

    pub fn not_found(track_id: TrackId, provider: Option<ProviderMeta>, attempts: u32) -> Self {
        Self {
            track_id,
            status: FetchStatus::NotFound,
            lyrics: None,
            attempts,
            error: None,
            provider,
            fetched_at: Some(Utc::now()),
        }
    }

    pub fn error(track_id: TrackId, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            track_id,
            status: FetchStatus::Error,
            lyrics: None,
            attempts,
            error: Some(message.into()),
            provider: None,
            fetched_at: Some(Utc::now()),
        }
    }

    pub fn is_consistent(&self) -> bool {
        let has_text = self.lyrics.as_deref().is_some_and(|t| !t.trim().is_empty());
        (self.status == FetchStatus::Found) == has_text
    }
}

// ============================================================================
// Analysis Models
// ============================================================================

/// Lexicon term as echoed in the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LexiconEntry {
    pub term: String,
    pub weight: f64,
}

/// Per-track scoring result. Derived on every analysis run, never cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisEntry {
    pub word_count: usize,
    pub match_count: usize,
    pub weighted_score: f64,
    /// Weighted matches per 100 words.
    pub severity: f64,
    pub term_counts: BTreeMap<String, usize>,
    /// Token offsets of each match, per term.
    pub positions: BTreeMap<String, Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackReport {
    pub id: TrackId,
    pub number: u32,
    pub title: String,
    pub file: String,
    /// `None` when the track has never been fetched.
    pub status: Option<FetchStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlbumSummary {
    pub artist: String,
    pub album: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    pub folder: String,
    pub track_count: usize,
    pub scored_tracks: usize,
    pub unscored_tracks: usize,
    /// Unscored tracks keyed by status (`missing` for never-fetched).
    pub unscored_by_status: BTreeMap<String, usize>,
    pub total_matches: usize,
    pub total_score: f64,
    /// `total_matches / scored_tracks`; unscored tracks are not in the denominator.
    pub average_matches_per_track: f64,
    pub term_counts: BTreeMap<String, usize>,
    pub tracks: Vec<TrackReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionSummary {
    pub albums: usize,
    pub tracks: usize,
    pub scored_tracks: usize,
    pub unscored_tracks: usize,
    pub total_matches: usize,
    pub total_score: f64,
    pub average_matches_per_track: f64,
    pub term_counts: BTreeMap<String, usize>,
}

/// The handoff document consumed by the site renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub lexicon: Vec<LexiconEntry>,
    pub collection: CollectionSummary,
    pub albums: Vec<AlbumSummary>,
}

// ============================================================================
// Run Reports
// ============================================================================

/// Counters for one layout run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LayoutReport {
    pub albums: usize,
    pub tracks: usize,
    pub new_tracks: usize,
    pub skipped_entries: usize,
    pub dirs_created: usize,
    pub files_created: usize,
    pub library_changed: bool,
}

/// Counters for one fetch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub eligible: usize,
    pub skipped_cached: usize,
    pub found: usize,
    pub not_found: usize,
    pub failed: usize,
    pub duplicates_skipped: usize,
    pub provider_requests: usize,
    pub restored_files: usize,
    pub elapsed_seconds: f64,
}

impl FetchReport {
    pub fn attempted(&self) -> usize {
        self.found + self.not_found + self.failed
    }

    /// Write stats to a JSON file
    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_found_with_blank_text_is_not_found() {
        let r = LyricsRecord::found(TrackId::new("abc"), "  \n ".into(), None, 1);
        assert_eq!(r.status, FetchStatus::NotFound);
        assert!(r.lyrics.is_none());
        assert!(r.is_consistent());
    }

    #[test]
    fn test_record_constructors_are_consistent() {
        let id = TrackId::new("abc");
        assert!(LyricsRecord::pending(id.clone()).is_consistent());
        assert!(LyricsRecord::found(id.clone(), "la la".into(), None, 1).is_consistent());
        assert!(LyricsRecord::not_found(id.clone(), None, 1).is_consistent());
        assert!(LyricsRecord::error(id, "boom", 3).is_consistent());
    }

    #[test]
    fn test_status_round_trip_and_terminality() {
        for s in [
            FetchStatus::Pending,
            FetchStatus::Found,
            FetchStatus::NotFound,
            FetchStatus::Error,
        ] {
            assert_eq!(FetchStatus::from_db(s.as_db()), Some(s));
        }
        assert!(FetchStatus::Found.is_terminal());
        assert!(FetchStatus::NotFound.is_terminal());
        assert!(!FetchStatus::Error.is_terminal());
        assert!(!FetchStatus::Pending.is_terminal());
        assert_eq!(FetchStatus::from_db("done"), None);
    }

    #[test]
    fn test_library_track_iteration() {
        let album = Album {
            artist: "A".into(),
            title: "B".into(),
            year: None,
            folder: "A/B".into(),
            tracks: vec![
                Track { id: TrackId::new("1"), number: 1, title: "x".into(), file: "A/B/01 - x.md".into() },
                Track { id: TrackId::new("2"), number: 2, title: "y".into(), file: "A/B/02 - y.md".into() },
            ],
        };
        let lib = Library { albums: vec![album] };
        assert_eq!(lib.track_count(), 2);
        let found = lib.find_track(&TrackId::new("2")).map(|t| t.track.title.clone());
        assert_eq!(found.as_deref(), Some("y"));
        assert!(lib.find_track(&TrackId::new("3")).is_none());
    }
}
