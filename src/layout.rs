//! Library scanner: album manifest in, canonical `library.json` and lyric
//! file tree out.
//!
//! Three manifest formats are accepted:
//! - a markdown album list (`## album: "Title" (YYYY)` followed by one track per line),
//! - a JSON manifest (`{"albums": [{"artist", "title", "year", "tracks"}]}`),
//! - a directory tree `<Artist>/<Album>/<NN - Title>.<audio ext>`.
//!
//! Bad entries are skipped and reported; they never abort the run. Track ids
//! depend only on content, and tracks already present in the previous
//! `library.json` keep their number and file, so reruns are stable.

use crate::config::{Config, StagePaths};
use crate::error::InputError;
use crate::files::{touch_if_absent, write_if_changed};
use crate::models::{Album, LayoutReport, Library, Track, TrackId};
use crate::normalize::{identity_key, sanitize_path_segment, title_from_file_stem, YEAR_SUFFIX};
use crate::safety::resolve_within;
use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// `## album: "Title" (1989)`; quotes and year optional.
static ALBUM_HEADER: Lazy<Regex> = Lazy::new(||
    Regex::new(r"(?i)^#{1,3}\s*album\s*:\s*(.*)$").unwrap()
);

/// `# artist: Name`
static ARTIST_HEADER: Lazy<Regex> = Lazy::new(||
    Regex::new(r"(?i)^#{1,3}\s*artist\s*:\s*(.*)$").unwrap()
);

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "aac", "ogg", "opus", "wav", "aiff", "wma", "alac"];

const ID_SEPARATOR: char = '\u{1f}';

// ============================================================================
// Manifest
// ============================================================================

/// An album as read from a manifest, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestAlbum {
    pub location: String,
    pub artist: Option<String>,
    pub title: String,
    pub year: Option<u16>,
    pub tracks: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Manifest {
    pub albums: Vec<ManifestAlbum>,
    pub issues: Vec<InputError>,
}

/// Read a manifest file or directory. Unreadable input is fatal.
pub fn read_manifest(input: &Path, default_artist: Option<&str>) -> Result<Manifest> {
    if input.is_dir() {
        return scan_directory(input);
    }
    let text = std::fs::read_to_string(input).with_context(|| format!("Failed to read manifest {}", input.display()))?;
    let source = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| input.display().to_string());

    let is_json = input
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        parse_json(&text, &source, default_artist)
    } else {
        Ok(parse_markdown(&text, &source, default_artist))
    }
}

fn parse_album_heading(rest: &str) -> (String, Option<u16>) {
    let rest = rest.trim();
    let year = YEAR_SUFFIX
        .captures(rest)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    let title = YEAR_SUFFIX.replace(rest, "");
    (title.trim().trim_matches('"').trim().to_string(), year)
}

/// `#` runs followed by whitespace (or nothing). `#1 Crush` is a track.
fn is_heading(line: &str) -> bool {
    line.starts_with('#')
        && line
            .trim_start_matches('#')
            .chars()
            .next()
            .map_or(true, char::is_whitespace)
}

/// Parse a markdown album list.
///
/// Lines wrapped in parentheses are section notes (`(Bonus tracks)`) and are
/// skipped without consuming a track number. Other `# ` lines are headings.
pub fn parse_markdown(text: &str, source: &str, default_artist: Option<&str>) -> Manifest {
    let mut manifest = Manifest::default();
    let mut artist: Option<String> = default_artist.map(str::to_string).filter(|a| !a.trim().is_empty());
    let mut current: Option<ManifestAlbum> = None;
    let mut skipping_album = false;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        let location = format!("{}:{}", source, idx + 1);

        if let Some(caps) = ARTIST_HEADER.captures(line) {
            let name = caps[1].trim().to_string();
            artist = if name.is_empty() { None } else { Some(name) };
            continue;
        }
        if let Some(caps) = ALBUM_HEADER.captures(line) {
            if let Some(done) = current.take() {
                manifest.albums.push(done);
            }
            let (title, year) = parse_album_heading(&caps[1]);
            if title.is_empty() {
                manifest.issues.push(InputError::MissingAlbum { location });
                skipping_album = true;
            } else {
                debug!("Found album: {} ({:?})", title, year);
                current = Some(ManifestAlbum {
                    location,
                    artist: artist.clone(),
                    title,
                    year,
                    tracks: Vec::new(),
                });
                skipping_album = false;
            }
            continue;
        }
        if line.is_empty() || is_heading(line) {
            continue;
        }
        if line.starts_with('(') && line.ends_with(')') {
            continue;
        }

        let title = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .unwrap_or(line)
            .trim();

        match current.as_mut() {
            Some(album) if !title.is_empty() => album.tracks.push(title.to_string()),
            Some(_) => manifest.issues.push(InputError::EmptyTrackTitle { location }),
            None if skipping_album => {}
            None => manifest.issues.push(InputError::Unrecognized {
                location,
                message: "track line before any album heading".to_string(),
            }),
        }
    }
    if let Some(done) = current.take() {
        manifest.albums.push(done);
    }
    manifest
}

#[derive(Debug, Deserialize)]
struct JsonManifest {
    #[serde(default)]
    albums: Vec<JsonAlbum>,
}

#[derive(Debug, Deserialize)]
struct JsonAlbum {
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    year: Option<u16>,
    #[serde(default)]
    tracks: Vec<JsonTrack>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonTrack {
    Title(String),
    Entry {
        #[serde(default)]
        title: Option<String>,
    },
}

/// Parse a JSON manifest. Invalid JSON is fatal; bad entries are reported.
pub fn parse_json(text: &str, source: &str, default_artist: Option<&str>) -> Result<Manifest> {
    let parsed: JsonManifest =
        serde_json::from_str(text).with_context(|| format!("Failed to parse JSON manifest {}", source))?;
    let mut manifest = Manifest::default();

    for (i, album) in parsed.albums.into_iter().enumerate() {
        let location = format!("{}:albums[{}]", source, i);
        let title = album.title.unwrap_or_default().trim().to_string();
        if title.is_empty() {
            manifest.issues.push(InputError::MissingAlbum { location });
            continue;
        }
        let mut tracks = Vec::with_capacity(album.tracks.len());
        for (j, track) in album.tracks.into_iter().enumerate() {
            let t = match track {
                JsonTrack::Title(t) => t,
                JsonTrack::Entry { title } => title.unwrap_or_default(),
            };
            if t.trim().is_empty() {
                manifest.issues.push(InputError::EmptyTrackTitle {
                    location: format!("{}.tracks[{}]", location, j),
                });
            } else {
                tracks.push(t.trim().to_string());
            }
        }
        manifest.albums.push(ManifestAlbum {
            location,
            artist: album
                .artist
                .filter(|a| !a.trim().is_empty())
                .or_else(|| default_artist.map(str::to_string)),
            title,
            year: album.year,
            tracks,
        });
    }
    Ok(manifest)
}

fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Scan `<dir>/<Artist>/<Album>/<track file>`. Audio files at any other depth are reported.
pub fn scan_directory(dir: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::default();
    let mut index: FxHashMap<(String, String), usize> = FxHashMap::default();

    let walker = WalkDir::new(dir).min_depth(1).follow_links(false).sort_by_file_name();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        if !entry.file_type().is_file() || !is_audio_file(entry.path()) {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let location = rel.display().to_string();
        let parts: Vec<String> = rel.iter().map(|c| c.to_string_lossy().into_owned()).collect();
        if parts.len() != 3 {
            manifest.issues.push(InputError::Unrecognized {
                location,
                message: "expected <Artist>/<Album>/<Track> layout".to_string(),
            });
            continue;
        }
        let stem = entry.path().file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let title = title_from_file_stem(&stem);
        if title.is_empty() {
            manifest.issues.push(InputError::EmptyTrackTitle { location });
            continue;
        }

        let key = (parts[0].clone(), parts[1].clone());
        let slot = match index.get(&key) {
            Some(&i) => i,
            None => {
                let (album_title, year) = parse_album_heading(&parts[1]);
                manifest.albums.push(ManifestAlbum {
                    location: format!("{}/{}", parts[0], parts[1]),
                    artist: Some(parts[0].trim().to_string()).filter(|a| !a.is_empty()),
                    title: album_title,
                    year,
                    tracks: Vec::new(),
                });
                index.insert(key, manifest.albums.len() - 1);
                manifest.albums.len() - 1
            }
        };
        manifest.albums[slot].tracks.push(title);
    }
    Ok(manifest)
}

// ============================================================================
// Library construction
// ============================================================================

fn short_hash(material: &str, len: usize) -> String {
    let digest = Sha256::digest(material.as_bytes());
    let mut h = hex::encode(digest);
    h.truncate(len);
    h
}

/// Content-derived track id. `occurrence` is 1 for the first track with a
/// given title in the album, 2 for the next, and so on.
pub fn track_id(artist: &str, album: &str, title: &str, occurrence: usize) -> TrackId {
    let mut material = String::new();
    material.push_str(&identity_key(artist));
    material.push(ID_SEPARATOR);
    material.push_str(&identity_key(album));
    material.push(ID_SEPARATOR);
    material.push_str(&identity_key(title));
    if occurrence > 1 {
        material.push_str(&format!("#{}", occurrence));
    }
    TrackId::new(short_hash(&material, 16))
}

fn album_key(artist: &str, title: &str) -> (String, String) {
    (identity_key(artist), identity_key(title))
}

fn is_safe_relative(p: &str) -> bool {
    resolve_within(Path::new(""), p).is_ok()
}

/// Result of turning a manifest into a library.
#[derive(Debug)]
pub struct BuiltLibrary {
    pub library: Library,
    pub issues: Vec<InputError>,
    pub new_tracks: usize,
}

/// A manifest album that passed validation, paired with its previous entry.
struct AcceptedAlbum<'a> {
    artist: &'a str,
    title: &'a str,
    year: Option<u16>,
    tracks: &'a [String],
    key: (String, String),
    prev: Option<&'a Album>,
}

/// Build the canonical library from a manifest.
///
/// Albums and tracks found in `previous` keep their folder, number and file.
/// Their folders are reserved before any new album is placed, so manifest
/// order never moves an existing album. New tracks are numbered after the
/// album's highest existing number.
pub fn build_library(manifest: &Manifest, previous: Option<&Library>) -> BuiltLibrary {
    let mut issues = manifest.issues.clone();

    let prev_albums: FxHashMap<(String, String), &Album> = previous
        .map(|lib| {
            lib.albums
                .iter()
                .map(|a| (album_key(&a.artist, &a.title), a))
                .collect()
        })
        .unwrap_or_default();

    let mut seen_albums: FxHashSet<(String, String)> = FxHashSet::default();
    let mut accepted: Vec<AcceptedAlbum> = Vec::with_capacity(manifest.albums.len());
    for entry in &manifest.albums {
        let Some(artist) = entry.artist.as_deref().map(str::trim).filter(|a| !a.is_empty()) else {
            issues.push(InputError::MissingArtist {
                location: entry.location.clone(),
                album: entry.title.clone(),
            });
            continue;
        };
        let title = entry.title.trim();
        if title.is_empty() {
            issues.push(InputError::MissingAlbum {
                location: entry.location.clone(),
            });
            continue;
        }
        let key = album_key(artist, title);
        if !seen_albums.insert(key.clone()) {
            issues.push(InputError::DuplicateAlbum {
                location: entry.location.clone(),
                artist: artist.to_string(),
                album: title.to_string(),
            });
            continue;
        }
        let prev = prev_albums.get(&key).copied();
        accepted.push(AcceptedAlbum {
            artist,
            title,
            year: entry.year,
            tracks: &entry.tracks,
            key,
            prev,
        });
    }

    let folders = assign_folders(&accepted, previous);

    let mut new_tracks = 0;
    let mut albums = Vec::with_capacity(accepted.len());
    for (album, folder) in accepted.iter().zip(folders) {
        let (tracks, added) = assign_tracks(album, &folder);
        new_tracks += added;
        albums.push(Album {
            artist: album.artist.to_string(),
            title: album.title.to_string(),
            year: album.year,
            folder,
            tracks,
        });
    }

    BuiltLibrary {
        library: Library { albums },
        issues,
        new_tracks,
    }
}

/// Pick a folder for every accepted album, in the same order.
///
/// Every safe folder of the previous library is reserved first, including
/// folders of albums no longer in the manifest, so a new album never lands
/// in a directory that already holds another album's lyric files.
fn assign_folders(accepted: &[AcceptedAlbum], previous: Option<&Library>) -> Vec<String> {
    let reserved: FxHashSet<String> = previous
        .map(|lib| {
            lib.albums
                .iter()
                .map(|a| &a.folder)
                .filter(|f| is_safe_relative(f))
                .map(|f| f.to_lowercase())
                .collect()
        })
        .unwrap_or_default();

    let mut used: FxHashSet<String> = FxHashSet::default();
    let mut folders: Vec<Option<String>> = accepted
        .iter()
        .map(|album| {
            let kept = album
                .prev
                .map(|a| a.folder.clone())
                .filter(|f| is_safe_relative(f) && !used.contains(&f.to_lowercase()))?;
            used.insert(kept.to_lowercase());
            Some(kept)
        })
        .collect();

    for (album, slot) in accepted.iter().zip(folders.iter_mut()) {
        if slot.is_some() {
            continue;
        }
        let taken = |f: &str| {
            let f = f.to_lowercase();
            used.contains(&f) || reserved.contains(&f)
        };
        let base = format!("{}/{}", sanitize_path_segment(album.artist), sanitize_path_segment(album.title));
        let folder = if taken(&base) {
            let suffix = short_hash(&format!("{}{}{}", album.key.0, ID_SEPARATOR, album.key.1), 6);
            format!(
                "{}/{}",
                sanitize_path_segment(album.artist),
                sanitize_path_segment(&format!("{} [{}]", album.title, suffix))
            )
        } else {
            base
        };
        used.insert(folder.to_lowercase());
        *slot = Some(folder);
    }

    folders.into_iter().flatten().collect()
}

/// Keep previous tracks where they were and number new ones after them.
/// Returns the tracks sorted by number and how many are new.
fn assign_tracks(album: &AcceptedAlbum, folder: &str) -> (Vec<Track>, usize) {
    let prev_tracks: FxHashMap<&TrackId, &Track> =
        album.prev.map(|a| a.tracks.iter().map(|t| (&t.id, t)).collect()).unwrap_or_default();
    let mut next_number = album.prev.and_then(|a| a.tracks.iter().map(|t| t.number).max()).unwrap_or(0);
    let prefix = format!("{}/", folder);

    let mut occurrences: FxHashMap<String, usize> = FxHashMap::default();
    let mut used_numbers: FxHashSet<u32> = FxHashSet::default();
    let mut used_files: FxHashSet<String> = FxHashSet::default();
    let mut pending_new: Vec<(TrackId, String)> = Vec::new();
    let mut tracks: Vec<Track> = Vec::with_capacity(album.tracks.len());

    for track_title in album.tracks {
        let n = occurrences.entry(identity_key(track_title)).or_insert(0);
        *n += 1;
        let id = track_id(album.artist, album.title, track_title, *n);

        match prev_tracks.get(&id) {
            Some(t) if is_safe_relative(&t.file) && t.file.starts_with(&prefix) => {
                used_numbers.insert(t.number);
                used_files.insert(t.file.to_lowercase());
                tracks.push(Track {
                    id,
                    number: t.number,
                    title: track_title.clone(),
                    file: t.file.clone(),
                });
            }
            _ => pending_new.push((id, track_title.clone())),
        }
    }

    let added = pending_new.len();
    for (id, track_title) in pending_new {
        next_number += 1;
        while used_numbers.contains(&next_number) {
            next_number += 1;
        }
        used_numbers.insert(next_number);

        let mut file = format!("{}{:02} - {}.md", prefix, next_number, sanitize_path_segment(&track_title));
        if used_files.contains(&file.to_lowercase()) {
            file = format!(
                "{}{:02} - {} [{}].md",
                prefix,
                next_number,
                sanitize_path_segment(&track_title),
                id.short()
            );
        }
        used_files.insert(file.to_lowercase());
        tracks.push(Track {
            id,
            number: next_number,
            title: track_title,
            file,
        });
    }
    tracks.sort_by_key(|t| t.number);
    (tracks, added)
}

// ============================================================================
// Persistence and materialization
// ============================================================================

/// Load `library.json`. A missing or unparsable file is fatal.
pub fn load_library(path: &Path) -> Result<Library> {
    if !path.is_file() {
        bail!("Library file not found: {} (run `layout` first)", path.display());
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn library_json(library: &Library) -> Result<String> {
    let mut json = serde_json::to_string_pretty(library)?;
    json.push('\n');
    Ok(json)
}

/// Create album folders and empty track files that are missing.
/// Returns `(dirs_created, files_created)`; dry-run only counts.
pub fn materialize(library: &Library, lyrics_dir: &Path, dry_run: bool) -> Result<(usize, usize)> {
    let mut dirs = 0;
    let mut files = 0;
    for album in &library.albums {
        let dir = resolve_within(lyrics_dir, &album.folder)?;
        if !dir.is_dir() {
            dirs += 1;
            if dry_run {
                info!("DRY RUN: Would create directory: {}", dir.display());
            } else {
                std::fs::create_dir_all(&dir).with_context(|| format!("Create {}", dir.display()))?;
                debug!("Created directory: {}", dir.display());
            }
        }
        for track in &album.tracks {
            let path = resolve_within(lyrics_dir, &track.file)?;
            if dry_run {
                if !path.exists() {
                    files += 1;
                    debug!("DRY RUN: Would create file: {}", path.display());
                }
            } else if touch_if_absent(&path)? {
                files += 1;
            }
        }
    }
    Ok((dirs, files))
}

/// Run the layout stage.
pub fn run_layout(paths: &StagePaths, config: &Config, input: &Path, dry_run: bool) -> Result<LayoutReport> {
    let input = if input.is_absolute() { input.to_path_buf() } else { paths.root.join(input) };
    info!("Processing: {}", input.display());

    let manifest = read_manifest(&input, config.library.default_artist.as_deref())?;
    let previous = if paths.library_file.is_file() {
        Some(load_library(&paths.library_file)?)
    } else {
        None
    };

    let built = build_library(&manifest, previous.as_ref());
    for issue in &built.issues {
        warn!("Skipped: {}", issue);
    }

    let (dirs_created, files_created) = materialize(&built.library, &paths.lyrics_dir, dry_run)?;

    let json = library_json(&built.library)?;
    let library_changed = if dry_run {
        std::fs::read_to_string(&paths.library_file).map(|old| old != json).unwrap_or(true)
    } else {
        write_if_changed(&paths.library_file, json.as_bytes())?
    };

    for album in &built.library.albums {
        match album.year {
            Some(y) => info!("  {} - {} ({}): {} tracks", album.artist, album.title, y, album.tracks.len()),
            None => info!("  {} - {}: {} tracks", album.artist, album.title, album.tracks.len()),
        }
    }

    Ok(LayoutReport {
        albums: built.library.albums.len(),
        tracks: built.library.track_count(),
        new_tracks: built.new_tracks,
        skipped_entries: built.issues.len(),
        dirs_created,
        files_created,
        library_changed,
    })
}
