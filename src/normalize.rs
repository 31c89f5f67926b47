//! Shared normalization functions.
//!
//! Three separate concerns live here, and they must not be mixed up:
//! - query normalization (what we send to the lyrics provider),
//! - identity keys (what track identifiers are derived from),
//! - path sanitization (how names become folder and file names).
//!
//! CRITICAL: identity keys and path rules are part of the on-disk addressing
//! contract. Changing them renames tracks on the next layout run.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Featured artists in brackets: "(feat. Artist)", "[ft. Someone]", "(with X)"
pub static FEAT_BRACKETED: Lazy<Regex> = Lazy::new(||
    Regex::new(r"(?i)\s*[\(\[](?:feat\.?|ft\.?|featuring|with)\s+[^)\]]*[\)\]]").unwrap()
);

/// Feat without brackets: "Song feat. Artist", "Artist ft. Someone"
pub static FEAT_TRAILING: Lazy<Regex> = Lazy::new(||
    Regex::new(r"(?i)\s+(?:feat\.?|ft\.?|featuring)\s+.+$").unwrap()
);

/// Any parenthetical or bracketed group: "(Taylor's Version)", "[Remix]"
pub static BRACKETED_GROUP: Lazy<Regex> = Lazy::new(||
    Regex::new(r"\s*[\(\[][^)\]]*[\)\]]").unwrap()
);

/// Dash-suffixed annotations: "- Remastered 2011", "- Live at Wembley", "- DJ Remix"
pub static DASH_SUFFIX: Lazy<Regex> = Lazy::new(||
    Regex::new(r"(?i)\s*[-–—]\s*(?:(?:\d{4}\s+)?(?:digital\s+)?remaster(?:ed)?(?:\s+\d{4})?|live(?:\s+(?:at|from|in)\s+.+)?|acoustic(?:\s+version)?|radio\s+edit|(?:single|album|lp)\s+version|mono|stereo|[a-z0-9\s]+\s+(?:remix|mix|edit))\s*$").unwrap()
);

/// Matches track number prefixes like "03 - ", "Track 5 - ", "01. ", "07_"
pub static TRACK_NUMBER_PREFIX: Lazy<Regex> = Lazy::new(||
    Regex::new(r"(?i)^(?:track\s*)?\d{1,4}\s*[-–—._]\s*").unwrap()
);

/// Matches track number prefix without separator: "16 Eleanor Rigby" → "Eleanor Rigby"
/// Only 1-2 digit numbers followed by an uppercase letter, so "1970 Somethin'" survives.
pub static TRACK_NUMBER_SPACE_PREFIX: Lazy<Regex> = Lazy::new(||
    Regex::new(r"^(?:0[1-9]|[1-9]\d?)\s+([A-Z])").unwrap()
);

/// Matches track number in brackets: "[01] Song", "[12] Title"
pub static TRACK_NUMBER_BRACKET: Lazy<Regex> = Lazy::new(||
    Regex::new(r"^\[\d{1,2}\]\s*").unwrap()
);

/// Matches year suffix like (1964), (2009), etc.
pub static YEAR_SUFFIX: Lazy<Regex> = Lazy::new(||
    Regex::new(r"\s*\((\d{4})\)\s*$").unwrap()
);

/// LRC time tags at line start: "[00:12.34]", "[01:02]"
pub static LRC_TIME_TAGS: Lazy<Regex> = Lazy::new(||
    Regex::new(r"^\s*(?:\[\d{1,3}:\d{2}(?:[.:]\d{1,3})?\]\s*)+").unwrap()
);

/// LRC metadata tags: "[ar:Artist]", "[length: 3:12]"
pub static LRC_META_TAG: Lazy<Regex> = Lazy::new(||
    Regex::new(r"^\s*\[[a-zA-Z]+:[^\]]*\]\s*$").unwrap()
);

pub static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").unwrap());

pub static MULTI_DASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").unwrap());

/// Language names listed in lyric-site translation headers.
const LANGUAGE_NAMES: &[&str] = &[
    "Türkçe", "Español", "Français", "Deutsch", "Italiano", "Português", "Polski",
    "Svenska", "Afrikaans", "srpski", "Українська", "Беларуская", "Slovenščina",
    "日本語", "中文", "Русский", "العربية", "हिन्दी", "Nederlands", "Norsk",
];

/// Words that mark an editorial paragraph before the lyrics start.
const BACKGROUND_INDICATORS: &[&str] = &[
    "wrote", "was", "were", "dated", "dating", "recorded", "released", "produced",
    "inspired", "about", "song is", "track is", "single", "album", "this song", "the song",
];

const MAX_SEGMENT_BYTES: usize = 120;

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
    "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Check if a character is a Unicode combining mark (diacritical mark).
pub fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF | 0xFE20..=0xFE2F)
}

/// Fold Unicode text to ASCII by applying NFKD decomposition and removing combining marks.
/// e.g., "Beyoncé" → "beyonce", "кино" → "kino"
pub fn fold_to_ascii(s: &str) -> String {
    let stripped: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    any_ascii(&stripped).to_lowercase()
}

/// Curly quotes to straight quotes, " & " to " and ", collapsed spaces.
pub fn normalize_punctuation(s: &str) -> String {
    let result = s
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{00B4}', '\u{0060}'], "'")
        .replace(" & ", " and ");
    MULTI_SPACE.replace_all(&result, " ").to_string()
}

/// Keep letters, digits and single spaces; lowercase everything.
fn strip_punctuation(s: &str) -> String {
    let kept: String = s
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c.is_whitespace() {
                Some(' ')
            } else {
                None
            }
        })
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

// ============================================================================
// QUERY NORMALIZATION
// ============================================================================

/// Normalize a track title for a provider query.
///
/// Rules, in order: punctuation normalization, featuring annotations removed,
/// every bracketed group removed, dash-suffixed version annotations removed,
/// non-alphanumeric characters removed, whitespace collapsed, lowercased.
/// Falls back to the lowercased raw title if nothing survives.
pub fn normalize_query_title(title: &str) -> String {
    let mut s = normalize_punctuation(title);
    s = FEAT_BRACKETED.replace_all(&s, "").to_string();
    s = FEAT_TRAILING.replace(&s, "").to_string();
    s = BRACKETED_GROUP.replace_all(&s, "").to_string();
    s = DASH_SUFFIX.replace(&s, "").to_string();
    let cleaned = strip_punctuation(&s);
    if cleaned.is_empty() {
        title.trim().to_lowercase()
    } else {
        cleaned
    }
}

/// Normalize an artist name for a provider query (featuring credits dropped).
pub fn normalize_query_artist(artist: &str) -> String {
    let mut s = normalize_punctuation(artist);
    s = FEAT_BRACKETED.replace_all(&s, "").to_string();
    s = FEAT_TRAILING.replace(&s, "").to_string();
    let cleaned = strip_punctuation(&s);
    if cleaned.is_empty() {
        artist.trim().to_lowercase()
    } else {
        cleaned
    }
}

/// ASCII-folded comparison key for verifying provider candidates.
pub fn match_key(s: &str) -> String {
    fold_to_ascii(s).split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// IDENTITY & PATHS
// ============================================================================

/// Identity key: NFC, lowercased, whitespace collapsed.
pub fn identity_key(s: &str) -> String {
    let composed: String = s.nfc().collect();
    composed
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Make a single path segment safe on every common filesystem.
///
/// 1. `/ \ : * ? " < > |` and control characters become `-`
/// 2. whitespace runs collapse to one space, `-` runs to one `-`
/// 3. leading/trailing whitespace, `.` and `-` are trimmed
/// 4. empty becomes `_`; reserved device names get a trailing `_`
/// 5. truncated to 120 bytes on a character boundary
pub fn sanitize_path_segment(s: &str) -> String {
    let replaced: String = s
        .chars()
        .map(|c| {
            if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control() {
                '-'
            } else {
                c
            }
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let dashed = MULTI_DASH.replace_all(&collapsed, "-");
    let is_trimmed = |c: char| c.is_whitespace() || c == '.' || c == '-';

    let mut out = truncate_on_char_boundary(dashed.trim_matches(is_trimmed), MAX_SEGMENT_BYTES)
        .trim_end_matches(is_trimmed)
        .to_string();

    if out.is_empty() {
        return "_".to_string();
    }
    let stem = out.split('.').next().unwrap_or("").to_ascii_uppercase();
    if RESERVED_DEVICE_NAMES.contains(&stem.as_str()) {
        out.push('_');
    }
    out
}

fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Derive a track title from an audio file stem: "03 - Song" → "Song".
pub fn title_from_file_stem(stem: &str) -> String {
    let mut s = TRACK_NUMBER_BRACKET.replace(stem, "").to_string();
    s = TRACK_NUMBER_PREFIX.replace(&s, "").to_string();
    s = TRACK_NUMBER_SPACE_PREFIX.replace(&s, "$1").to_string();
    if !s.contains(' ') {
        s = s.replace('_', " ");
    }
    s.trim().to_string()
}

// ============================================================================
// LYRICS TEXT
// ============================================================================

fn is_background_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    line.chars().count() > 100 && BACKGROUND_INDICATORS.iter().any(|w| lower.contains(w))
}

/// Remove lyric-site cruft from provider text.
///
/// Drops contributor counts everywhere; in the header (before the first lyric
/// line) also drops translation headers, language lists, the "<Title> Lyrics"
/// heading, "Read More" and editorial paragraphs. Blank-line runs collapse to
/// one blank line.
pub fn clean_lyrics_text(text: &str, title: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let title_lower = title.to_lowercase();
    let mut lines: Vec<&str> = Vec::new();
    let mut in_header = true;

    for line in normalized.lines() {
        let trimmed = line.trim();

        if trimmed.contains("Contributor") {
            continue;
        }
        if in_header {
            if trimmed.is_empty()
                || trimmed == "Translations"
                || trimmed == "Read More"
                || LANGUAGE_NAMES.contains(&trimmed)
                || (trimmed.ends_with(" Lyrics") && trimmed.to_lowercase().contains(&title_lower))
                || is_background_line(trimmed)
            {
                continue;
            }
            in_header = false;
        }
        lines.push(line.trim_end());
    }

    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_empty() && out.last().is_some_and(|l| l.is_empty()) {
            continue;
        }
        out.push(line);
    }
    out.join("\n").trim().to_string()
}

/// Convert synced (LRC) lyrics to plain text.
pub fn strip_lrc_timestamps(synced: &str) -> String {
    synced
        .lines()
        .filter(|l| !LRC_META_TAG.is_match(l))
        .map(|l| LRC_TIME_TAGS.replace(l, "").trim_end().to_string())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_title_strips_annotations() {
        assert_eq!(normalize_query_title("Song (feat. Someone)"), "song");
        assert_eq!(normalize_query_title("Song feat. Someone Else"), "song");
        assert_eq!(normalize_query_title("All Too Well (Taylor's Version)"), "all too well");
        assert_eq!(normalize_query_title("Track [Radio Edit]"), "track");
        assert_eq!(normalize_query_title("Hey Jude - Remastered 2015"), "hey jude");
        assert_eq!(normalize_query_title("Song - Live at Wembley"), "song");
        assert_eq!(normalize_query_title("Song - DJ Remix"), "song");
    }

    #[test]
    fn test_query_title_removes_punctuation() {
        assert_eq!(normalize_query_title("...Ready For It?"), "ready for it");
        assert_eq!(normalize_query_title("Don’t Blame Me"), "dont blame me");
        assert_eq!(normalize_query_title("Anti-Hero"), "antihero");
        assert_eq!(normalize_query_title("Rock & Roll"), "rock and roll");
    }

    #[test]
    fn test_query_title_falls_back_when_empty() {
        assert_eq!(normalize_query_title("?!"), "?!");
    }

    #[test]
    fn test_query_title_is_deterministic() {
        let a = normalize_query_title("Love Story (Taylor’s Version) [feat. X]");
        let b = normalize_query_title("Love Story (Taylor’s Version) [feat. X]");
        assert_eq!(a, b);
        assert_eq!(a, "love story");
    }

    #[test]
    fn test_query_artist() {
        assert_eq!(normalize_query_artist("Taylor Swift feat. Bon Iver"), "taylor swift");
        assert_eq!(normalize_query_artist("AC/DC"), "acdc");
        assert_eq!(normalize_query_artist("Simon & Garfunkel"), "simon and garfunkel");
    }

    #[test]
    fn test_fold_to_ascii() {
        assert_eq!(fold_to_ascii("Björk"), "bjork");
        assert_eq!(fold_to_ascii("Beyoncé"), "beyonce");
        assert_eq!(match_key("Motörhead  Live"), "motorhead live");
    }

    #[test]
    fn test_identity_key() {
        assert_eq!(identity_key("  Taylor   SWIFT "), "taylor swift");
        // Composed and decomposed forms share a key
        assert_eq!(identity_key("Beyonce\u{301}"), identity_key("Beyoncé"));
    }

    #[test]
    fn test_sanitize_path_segment() {
        assert_eq!(sanitize_path_segment("AC/DC"), "AC-DC");
        assert_eq!(sanitize_path_segment("What?"), "What");
        assert_eq!(sanitize_path_segment("...Ready For It?"), "Ready For It");
        assert_eq!(sanitize_path_segment("a  <b>  c"), "a -b- c");
        assert_eq!(sanitize_path_segment("Don't Blame Me"), "Don't Blame Me");
        assert_eq!(sanitize_path_segment("x\ty"), "x-y");
        assert_eq!(sanitize_path_segment("???"), "_");
        assert_eq!(sanitize_path_segment(""), "_");
        assert_eq!(sanitize_path_segment("con"), "con_");
        assert_eq!(sanitize_path_segment("Nul.txt"), "Nul.txt_");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let long = "é".repeat(100); // 200 bytes
        let out = sanitize_path_segment(&long);
        assert!(out.len() <= MAX_SEGMENT_BYTES);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_title_from_file_stem() {
        assert_eq!(title_from_file_stem("03 - Song Name"), "Song Name");
        assert_eq!(title_from_file_stem("[01] Song"), "Song");
        assert_eq!(title_from_file_stem("16 Eleanor Rigby"), "Eleanor Rigby");
        assert_eq!(title_from_file_stem("07_Song_Title"), "Song Title");
        assert_eq!(title_from_file_stem("1970 Somethin'"), "1970 Somethin'");
    }

    #[test]
    fn test_clean_lyrics_text_removes_cruft() {
        let raw = "\n12 Contributors\nTranslations\nEspañol\nShake It Off Lyrics\n[Verse 1]\nI stay out too late\r\n\n\n\nGot nothing in my brain\nRead More\n";
        let cleaned = clean_lyrics_text(raw, "Shake It Off");
        assert_eq!(
            cleaned,
            "[Verse 1]\nI stay out too late\n\nGot nothing in my brain\nRead More"
        );
    }

    #[test]
    fn test_clean_lyrics_text_skips_background_paragraph() {
        let para = "This song was written about a long drive home and was released as the second single from the album in the autumn of that year.";
        let raw = format!("{}\nFirst line\nSecond line", para);
        assert_eq!(clean_lyrics_text(&raw, "Whatever"), "First line\nSecond line");
    }

    #[test]
    fn test_strip_lrc_timestamps() {
        let synced = "[ar:Someone]\n[00:01.00]Hello there\n[00:05.50][01:10.00]Chorus line\n[00:09.00]";
        assert_eq!(strip_lrc_timestamps(synced), "Hello there\nChorus line");
    }
}
