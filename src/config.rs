//! Configuration: optional `lyrics-audit.toml` under the root plus CLI overrides.
//!
//! Every path resolves against the root directory, never the working directory.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "lyrics-audit.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub library: LibraryConfig,
    pub fetch: FetchConfig,
    pub analyze: AnalyzeConfig,
}

/// Stage artifact locations, relative to the root.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub lyrics_dir: PathBuf,
    pub library_file: PathBuf,
    pub cache_db: PathBuf,
    pub report_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            lyrics_dir: PathBuf::from("lyrics"),
            library_file: PathBuf::from("library.json"),
            cache_db: PathBuf::from("cache/lyrics.sqlite3"),
            report_file: PathBuf::from("site/lyrics_analysis.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LibraryConfig {
    /// Artist for markdown album lists that never name one.
    pub default_artist: Option<String>,
}

/// A lyrics source that can sit in the provider chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Lrclib,
    Musixmatch,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lrclib => "lrclib",
            Self::Musixmatch => "musixmatch",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Providers tried in order until one finds the lyrics.
    pub providers: Vec<ProviderKind>,
    pub provider_url: String,
    pub musixmatch_url: String,
    pub musixmatch_api_key: Option<String>,
    pub user_agent: String,
    pub workers: usize,
    pub queue: usize,
    pub min_request_interval_ms: u64,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            providers: vec![ProviderKind::Lrclib],
            provider_url: "https://lrclib.net/api".to_string(),
            musixmatch_url: "https://api.musixmatch.com/ws/1.1".to_string(),
            musixmatch_api_key: None,
            user_agent: concat!("lyrics-audit/", env!("CARGO_PKG_VERSION")).to_string(),
            workers: 4,
            queue: 64,
            min_request_interval_ms: 1500,
            timeout_secs: 10,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 16_000,
        }
    }
}

impl FetchConfig {
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzeConfig {
    /// Lexicon file; the built-in list is used when unset.
    pub lexicon: Option<PathBuf>,
}

impl Config {
    /// Load `explicit` if given (must exist), else `<root>/lyrics-audit.toml`
    /// if present, else defaults.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => {
                let p = if p.is_absolute() { p.to_path_buf() } else { root.join(p) };
                if !p.is_file() {
                    bail!("Config file not found: {}", p.display());
                }
                Some(p)
            }
            None => Some(root.join(CONFIG_FILE_NAME)).filter(|p| p.is_file()),
        };

        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                let config: Config = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
                tracing::debug!("Loaded config from {}", path.display());
                config
            }
            None => Config::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let f = &self.fetch;
        if f.providers.is_empty() {
            bail!("fetch.providers must name at least one provider");
        }
        for (i, kind) in f.providers.iter().enumerate() {
            if f.providers[..i].contains(kind) {
                bail!("fetch.providers lists {} twice", kind.as_str());
            }
        }
        let has_key = f.musixmatch_api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
        if f.providers.contains(&ProviderKind::Musixmatch) && !has_key {
            bail!("fetch.musixmatch_api_key is required when musixmatch is in fetch.providers");
        }
        if f.workers == 0 {
            bail!("fetch.workers must be at least 1");
        }
        if f.queue == 0 {
            bail!("fetch.queue must be at least 1");
        }
        if f.max_attempts == 0 {
            bail!("fetch.max_attempts must be at least 1");
        }
        if f.min_request_interval_ms == 0 {
            bail!("fetch.min_request_interval_ms must be greater than 0");
        }
        if f.timeout_secs == 0 {
            bail!("fetch.timeout_secs must be greater than 0");
        }
        if f.max_delay_ms < f.base_delay_ms {
            bail!("fetch.max_delay_ms must not be less than fetch.base_delay_ms");
        }
        Ok(())
    }

    pub fn stage_paths(&self, root: &Path) -> StagePaths {
        let resolve = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { root.join(p) };
        StagePaths {
            root: root.to_path_buf(),
            lyrics_dir: resolve(&self.paths.lyrics_dir),
            library_file: resolve(&self.paths.library_file),
            cache_db: resolve(&self.paths.cache_db),
            report_file: resolve(&self.paths.report_file),
        }
    }
}

/// Resolved absolute locations of every stage artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePaths {
    pub root: PathBuf,
    pub lyrics_dir: PathBuf,
    pub library_file: PathBuf,
    pub cache_db: PathBuf,
    pub report_file: PathBuf,
}

impl StagePaths {
    /// Default layout under `root`.
    pub fn under(root: &Path) -> Self {
        Config::default().stage_paths(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path(), None).unwrap();
        assert_eq!(config.fetch.workers, 4);
        assert_eq!(config.fetch.max_attempts, 3);
        assert_eq!(config.fetch.min_request_interval(), Duration::from_millis(1500));
        let paths = config.stage_paths(dir.path());
        assert_eq!(paths.cache_db, dir.path().join("cache/lyrics.sqlite3"));
        assert_eq!(paths.report_file, dir.path().join("site/lyrics_analysis.json"));
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[library]\ndefault_artist = \"Taylor Swift\"\n\n[fetch]\nworkers = 2\n",
        )
        .unwrap();
        let config = Config::load(dir.path(), None).unwrap();
        assert_eq!(config.library.default_artist.as_deref(), Some("Taylor Swift"));
        assert_eq!(config.fetch.workers, 2);
        assert_eq!(config.fetch.max_attempts, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[fetch]\nworkers = 0\n").unwrap();
        assert!(Config::load(dir.path(), None).is_err());

        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "[fetch]\nwrokers = 2\n").unwrap();
        assert!(Config::load(dir.path(), None).is_err());
    }

    #[test]
    fn test_provider_chain() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load(dir.path(), None).unwrap().fetch.providers, vec![ProviderKind::Lrclib]);

        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[fetch]\nproviders = [\"lrclib\", \"musixmatch\"]\nmusixmatch_api_key = \"k\"\n",
        )
        .unwrap();
        let config = Config::load(dir.path(), None).unwrap();
        assert_eq!(config.fetch.providers, vec![ProviderKind::Lrclib, ProviderKind::Musixmatch]);

        for bad in [
            "[fetch]\nproviders = []\n",
            "[fetch]\nproviders = [\"musixmatch\"]\n",
            "[fetch]\nproviders = [\"lrclib\", \"lrclib\"]\n",
            "[fetch]\nproviders = [\"genius\"]\n",
        ] {
            std::fs::write(dir.path().join(CONFIG_FILE_NAME), bad).unwrap();
            assert!(Config::load(dir.path(), None).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(dir.path(), Some(Path::new("missing.toml"))).is_err());
    }
}
