//! Error taxonomy for the pipeline stages.
//!
//! Per-entry and per-track problems (`InputError`, `FetchError`) are recorded
//! and reported but never abort a run. `AnalysisError` is always fatal.
//! `CacheError` is fatal wherever it surfaces.
//! Stage entry points wrap these in `anyhow` with context.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Malformed library metadata. The affected entry is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("{location}: album '{album}' has no artist")]
    MissingArtist { location: String, album: String },
    #[error("{location}: album has no title")]
    MissingAlbum { location: String },
    #[error("{location}: empty track title")]
    EmptyTrackTitle { location: String },
    #[error("{location}: duplicate album '{album}' by '{artist}'")]
    DuplicateAlbum {
        location: String,
        artist: String,
        album: String,
    },
    #[error("{location}: {message}")]
    Unrecognized { location: String, message: String },
}

/// A failed request to the lyrics provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider returned HTTP {0}")]
    Server(u16),
    #[error("provider rejected request with HTTP {0}")]
    Rejected(u16),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Network errors, rate limits and server-side failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Transport(_) | FetchError::RateLimited { .. } | FetchError::Server(_)
        )
    }
}

/// Environment-level failure of the analysis stage.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("lexicon file not found: {}", .0.display())]
    LexiconMissing(PathBuf),
    #[error("failed to read lexicon {}: {source}", path.display())]
    LexiconUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("lexicon {}:{line}: {message}", path.display())]
    LexiconInvalid {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("lexicon contains no terms")]
    EmptyLexicon,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Failure reading or writing the lyrics cache.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cached lyrics for track {track_id} are not valid UTF-8")]
    CorruptLyrics { track_id: String },
    #[error("cached record for track {track_id} is corrupt: {message}")]
    CorruptRecord { track_id: String, message: String },
    #[error("cache database error: {0}")]
    Database(#[from] rusqlite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Transport("reset".into()).is_transient());
        assert!(FetchError::RateLimited { retry_after: None }.is_transient());
        assert!(FetchError::Server(503).is_transient());
        assert!(!FetchError::Rejected(400).is_transient());
        assert!(!FetchError::Malformed("eof".into()).is_transient());
    }

    #[test]
    fn test_input_error_message_has_location() {
        let e = InputError::MissingArtist {
            location: "albums.md:3".into(),
            album: "Red".into(),
        };
        assert_eq!(e.to_string(), "albums.md:3: album 'Red' has no artist");
    }
}
