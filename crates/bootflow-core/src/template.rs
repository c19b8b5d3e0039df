//! Flat `${name}` interpolation
//!
//! Every placeholder is replaced by the value of `name` (surrounding
//! whitespace trimmed) or by an empty string when the variable is missing.
//! Substituted values are inserted verbatim and never re-scanned.

use crate::error::{CoreError, Result};
use regex::{Captures, Regex};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::LazyLock;

/// Variable context for interpolation
pub type Variables = HashMap<String, String>;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{(.*?)\}").expect("placeholder pattern is valid"));

/// Substitute every `${name}` in `template`
pub fn interpolate(template: &str, vars: &Variables) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            vars.get(caps[1].trim()).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Merge variable sources, later sources overwrite earlier ones
pub fn merge_variables(sources: impl IntoIterator<Item = Variables>) -> Variables {
    let mut merged = Variables::new();
    for source in sources {
        merged.extend(source);
    }
    merged
}

/// An immutable template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
}

/// Result of rendering a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,

    /// Placeholder names that had no value and were replaced by ""
    pub missing: Vec<String>,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Distinct placeholder names, trimmed, in sorted order
    pub fn placeholders(&self) -> BTreeSet<String> {
        PLACEHOLDER
            .captures_iter(&self.source)
            .map(|caps| caps[1].trim().to_string())
            .collect()
    }

    pub fn render(&self, vars: &Variables) -> Rendered {
        let missing = self
            .placeholders()
            .into_iter()
            .filter(|name| !vars.contains_key(name))
            .collect();

        Rendered {
            text: interpolate(&self.source, vars),
            missing,
        }
    }
}

/// Load a template from disk
pub fn load_template(path: &Path) -> Result<Template> {
    let content = std::fs::read_to_string(path).map_err(|e| CoreError::IoError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    tracing::debug!("Loaded template: {}", path.display());
    Ok(Template::new(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_bootstrap_payload() {
        let base = vars(&[("DB_PASS", "x")]);
        let runtime = vars(&[("BACKUP_VOLUME_PATH", "/dev/disk/by-id/scsi-0HC_Volume_123")]);
        let merged = merge_variables([base, runtime]);

        let result = interpolate("vol=${BACKUP_VOLUME_PATH} db=${DB_PASS}", &merged);
        assert_eq!(result, "vol=/dev/disk/by-id/scsi-0HC_Volume_123 db=x");
    }

    #[test]
    fn test_missing_variable_becomes_empty() {
        let result = interpolate("a=${A} b=${B}.", &vars(&[("A", "1")]));
        assert_eq!(result, "a=1 b=.");
    }

    #[test]
    fn test_whitespace_in_placeholder_is_trimmed() {
        let result = interpolate("${  NAME }", &vars(&[("NAME", "world")]));
        assert_eq!(result, "world");
    }

    #[test]
    fn test_values_are_not_reinterpolated() {
        let v = vars(&[("A", "${B}"), ("B", "nope")]);
        assert_eq!(interpolate("${A}", &v), "${B}");
    }

    #[test]
    fn test_shell_syntax_is_left_alone() {
        let v = vars(&[("X", "1")]);
        assert_eq!(interpolate("$HOME $(date) {X} ${X}", &v), "$HOME $(date) {X} 1");
    }

    #[test]
    fn test_idempotent_without_remaining_placeholders() {
        let v = vars(&[("A", "alpha")]);
        let once = interpolate("x=${A} y=${MISSING}", &v);
        assert_eq!(interpolate(&once, &v), once);
    }

    #[test]
    fn test_merge_later_source_wins() {
        let merged = merge_variables([vars(&[("K", "env"), ("E", "1")]), vars(&[("K", "runtime")])]);
        assert_eq!(merged.get("K").map(String::as_str), Some("runtime"));
        assert_eq!(merged.get("E").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_render_reports_missing() {
        let template = Template::new("${A} ${ B } ${A} ${C}");
        let rendered = template.render(&vars(&[("A", "a")]));

        assert_eq!(rendered.text, "a  a ");
        assert_eq!(rendered.missing, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(template.placeholders().len(), 3);
    }

    #[test]
    fn test_load_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud-init.yaml");
        std::fs::write(&path, "#cloud-config\nmounts: [${BACKUP_VOLUME_PATH}]\n").unwrap();

        let template = load_template(&path).unwrap();
        assert!(template.placeholders().contains("BACKUP_VOLUME_PATH"));
    }
}
