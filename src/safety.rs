//! Safety checks for paths the pipeline writes to.
//!
//! `library.json` is an editable file on disk, so relative paths read back
//! from it are confined to the lyrics directory before anything is written.
//! The analysis report is checked so it can never overwrite a stage input.

use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

/// Validates that an output path is safe to overwrite.
///
/// Checks:
/// - Output must carry the required extension (e.g., "json")
/// - Output cannot be the same as any of the provided source paths
pub fn validate_output_path(
    output: &Path,
    required_extension: &str,
    source_paths: &[&Path],
) -> Result<()> {
    let ext = output.extension().and_then(|e| e.to_str()).unwrap_or("");
    if !ext.eq_ignore_ascii_case(required_extension) {
        bail!(
            "Safety check failed: output file '{}' must have a .{} extension",
            output.display(),
            required_extension
        );
    }

    for source in source_paths {
        if output == *source {
            bail!(
                "Safety check failed: output '{}' cannot be the same as source '{}'",
                output.display(),
                source.display()
            );
        }
    }

    Ok(())
}

/// Join a `/`-separated relative path onto `base`, rejecting anything that
/// could escape it (absolute paths, `..`, drive prefixes).
pub fn resolve_within(base: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if relative.is_empty() {
        bail!("Safety check failed: empty relative path");
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!(
                "Safety check failed: '{}' escapes {}",
                relative,
                base.display()
            ),
        }
    }
    Ok(base.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_report_output() {
        let output = PathBuf::from("/music/site/lyrics_analysis.json");
        let library = PathBuf::from("/music/library.json");
        assert!(validate_output_path(&output, "json", &[&library]).is_ok());
    }

    #[test]
    fn test_wrong_extension() {
        let output = PathBuf::from("/music/site/report.sqlite3");
        let result = validate_output_path(&output, "json", &[]);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("must have a .json extension"));
    }

    #[test]
    fn test_output_equals_source() {
        let path = PathBuf::from("/music/library.json");
        let result = validate_output_path(&path, "json", &[&path]);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cannot be the same as source"));
    }

    #[test]
    fn test_resolve_within_accepts_canonical_paths() {
        let base = PathBuf::from("/music/lyrics");
        let p = resolve_within(&base, "Taylor Swift/Red/01 - State of Grace.md").unwrap();
        assert_eq!(p, base.join("Taylor Swift").join("Red").join("01 - State of Grace.md"));
    }

    #[test]
    fn test_resolve_within_rejects_escapes() {
        let base = PathBuf::from("/music/lyrics");
        assert!(resolve_within(&base, "../etc/passwd").is_err());
        assert!(resolve_within(&base, "a/../../b").is_err());
        assert!(resolve_within(&base, "/etc/passwd").is_err());
        assert!(resolve_within(&base, "").is_err());
    }
}
