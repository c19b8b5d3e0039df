//! `.env` file parsing
//!
//! The format is intentionally permissive: blank lines and `#` comments are
//! ignored, lines without `=` are skipped, and later keys overwrite earlier
//! ones. Skipped lines are kept on the side so callers can warn about them.

use crate::error::{CoreError, Result};
use crate::template::Variables;
use std::path::Path;
use tracing::{debug, info, warn};

/// Parsed contents of an env file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    /// Variables in the file, last occurrence wins
    pub vars: Variables,

    /// Lines that were neither blank, comments nor `KEY=VALUE`
    pub skipped: Vec<SkippedLine>,
}

/// A line ignored by the parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    /// 1-based line number
    pub line: usize,
    pub content: String,
}

impl EnvFile {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn into_vars(self) -> Variables {
        self.vars
    }
}

/// Parse `KEY=VALUE` text
pub fn parse_env(content: &str) -> EnvFile {
    let mut env = EnvFile::default();

    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                let value = strip_quotes(value.trim());
                env.vars.insert(key.trim().to_string(), value.to_string());
            }
            _ => env.skipped.push(SkippedLine {
                line: index + 1,
                content: line.to_string(),
            }),
        }
    }

    env
}

/// Strip one matching pair of surrounding quotes (`"value"` or `'value'`)
pub fn strip_quotes(s: &str) -> &str {
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted { &s[1..s.len() - 1] } else { s }
}

/// Read and parse an env file from disk
#[tracing::instrument]
pub fn load_env_file(path: &Path) -> Result<EnvFile> {
    let content = std::fs::read_to_string(path).map_err(|e| CoreError::IoError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let env = parse_env(&content);
    for skipped in &env.skipped {
        warn!(
            env_file = %path.display(),
            line = skipped.line,
            "Skipping line without KEY=VALUE"
        );
    }
    for key in env.vars.keys() {
        debug!(key = %key, "Loaded variable from env file");
    }

    info!(
        env_file = %path.display(),
        variable_count = env.len(),
        "Loaded variables from env file"
    );
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let env = parse_env("DB_USER=admin\nDB_PASS=secret\n");
        assert_eq!(env.get("DB_USER"), Some("admin"));
        assert_eq!(env.get("DB_PASS"), Some("secret"));
        assert_eq!(env.len(), 2);
        assert!(env.skipped.is_empty());
    }

    #[test]
    fn test_skips_blank_and_comment_lines() {
        let env = parse_env("\n# comment\n   \n  # indented comment\nKEY=value\n");
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("KEY"), Some("value"));
        assert!(env.skipped.is_empty());
    }

    #[test]
    fn test_strips_matching_quotes() {
        let env = parse_env("A=\"double\"\nB='single'\nC=\"mixed'\nD=\"\nE=''");
        assert_eq!(env.get("A"), Some("double"));
        assert_eq!(env.get("B"), Some("single"));
        assert_eq!(env.get("C"), Some("\"mixed'"));
        assert_eq!(env.get("D"), Some("\""));
        assert_eq!(env.get("E"), Some(""));
    }

    #[test]
    fn test_splits_at_first_equals() {
        let env = parse_env("URL=postgres://u:p@host/db?sslmode=require");
        assert_eq!(env.get("URL"), Some("postgres://u:p@host/db?sslmode=require"));
    }

    #[test]
    fn test_trims_key_and_value() {
        let env = parse_env("  KEY  =   \"  padded  \"   \r\n");
        assert_eq!(env.get("KEY"), Some("  padded  "));
    }

    #[test]
    fn test_last_duplicate_wins() {
        let env = parse_env("KEY=first\nKEY=second\nKEY='third'");
        assert_eq!(env.get("KEY"), Some("third"));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let env = parse_env("GOOD=1\nnot a pair\n=no-key\nALSO_GOOD=2");
        assert_eq!(env.len(), 2);
        assert_eq!(
            env.skipped,
            vec![
                SkippedLine {
                    line: 2,
                    content: "not a pair".to_string()
                },
                SkippedLine {
                    line: 3,
                    content: "=no-key".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_load_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "DB_PASS=\"x\"\n").unwrap();

        let env = load_env_file(&path).unwrap();
        assert_eq!(env.get("DB_PASS"), Some("x"));
    }

    #[test]
    fn test_load_missing_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_env_file(&dir.path().join("missing.env")).unwrap_err();
        assert!(matches!(err, CoreError::IoError { .. }));
    }
}
