//! Log-type rules: which files belong to which log type, and how a line of
//! text becomes facts.
//!
//! [`PatternRules`] is the built-in implementation, driven by the
//! `[log_types.*]` config sections: glob patterns select files, regex named
//! capture groups turn a matching line into fact fields.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

use crate::config::{resolve_table, Config};
use crate::models::FactDraft;

/// A line that could not be turned into facts. Counted, not fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct LineError(pub String);

/// Rule collaborator consumed by parser tasks.
pub trait LogRules: Send + Sync {
    /// Log type for a file path, if any rule set claims it.
    fn match_file(&self, path: &Path) -> Option<String>;

    /// Facts extracted from one line. An empty vector means the line is
    /// not interesting.
    fn parse_line(&self, log_type: &str, line_no: u64, line: &str)
        -> Result<Vec<FactDraft>, LineError>;

    /// Fact table for a log type.
    fn table_for(&self, log_type: &str) -> Option<String>;
}

struct CompiledRule {
    name: String,
    regex: Regex,
}

struct CompiledLogType {
    name: String,
    table: String,
    files: GlobSet,
    unmatched_is_error: bool,
    rules: Vec<CompiledRule>,
}

/// Regex + glob rules built from configuration.
pub struct PatternRules {
    types: Vec<CompiledLogType>,
    index: HashMap<String, usize>,
}

impl PatternRules {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut types = Vec::new();
        let mut index = HashMap::new();

        for (name, lt) in &config.log_types {
            let mut builder = GlobSetBuilder::new();
            for pattern in &lt.file_globs {
                builder.add(
                    Glob::new(pattern)
                        .with_context(|| format!("log_types.{}: bad glob '{}'", name, pattern))?,
                );
            }

            let mut rules = Vec::new();
            for rule in &lt.rules {
                let regex = Regex::new(&rule.pattern).with_context(|| {
                    format!("log_types.{}: rule '{}' has an invalid pattern", name, rule.name)
                })?;
                rules.push(CompiledRule {
                    name: rule.name.clone(),
                    regex,
                });
            }

            index.insert(name.clone(), types.len());
            types.push(CompiledLogType {
                name: name.clone(),
                table: resolve_table(name, lt),
                files: builder.build()?,
                unmatched_is_error: lt.unmatched_is_error,
                rules,
            });
        }

        Ok(Self { types, index })
    }
}

impl LogRules for PatternRules {
    fn match_file(&self, path: &Path) -> Option<String> {
        let name = path.file_name().map(Path::new);
        self.types
            .iter()
            .find(|t| t.files.is_match(path) || name.is_some_and(|n| t.files.is_match(n)))
            .map(|t| t.name.clone())
    }

    fn parse_line(
        &self,
        log_type: &str,
        line_no: u64,
        line: &str,
    ) -> Result<Vec<FactDraft>, LineError> {
        let lt = self
            .index
            .get(log_type)
            .map(|&i| &self.types[i])
            .ok_or_else(|| LineError(format!("unknown log type '{}'", log_type)))?;

        if line.trim().is_empty() {
            return Ok(Vec::new());
        }

        for rule in &lt.rules {
            if let Some(caps) = rule.regex.captures(line) {
                let mut fields = BTreeMap::new();
                for group in rule.regex.capture_names().flatten() {
                    if let Some(m) = caps.name(group) {
                        fields.insert(group.to_string(), m.as_str().to_string());
                    }
                }
                return Ok(vec![FactDraft {
                    rule: rule.name.clone(),
                    fields,
                }]);
            }
        }

        if lt.unmatched_is_error {
            Err(LineError(format!("line {} matches no rule", line_no)))
        } else {
            Ok(Vec::new())
        }
    }

    fn table_for(&self, log_type: &str) -> Option<String> {
        self.index.get(log_type).map(|&i| self.types[i].table.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(strict: bool) -> PatternRules {
        let cfg: Config = toml::from_str(&format!(
            r#"
[db]
path = "x"

[log_types.app]
file_globs = ["**/app*.log"]
unmatched_is_error = {}
[[log_types.app.rules]]
name = "level"
pattern = '^(?P<level>INFO|WARN|ERROR) (?P<msg>.*)$'

[log_types.access]
table = "http_facts"
file_globs = ["access.log"]
"#,
            strict
        ))
        .unwrap();
        PatternRules::from_config(&cfg).unwrap()
    }

    #[test]
    fn matches_files_by_glob() {
        let r = rules(false);
        assert_eq!(r.match_file(Path::new("logs/app-1.log")).as_deref(), Some("app"));
        assert_eq!(r.match_file(Path::new("/var/log/access.log")).as_deref(), Some("access"));
        assert_eq!(r.match_file(Path::new("notes.txt")), None);
    }

    #[test]
    fn named_captures_become_fields() {
        let r = rules(false);
        let drafts = r.parse_line("app", 1, "WARN disk almost full").unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].rule, "level");
        assert_eq!(drafts[0].fields["level"], "WARN");
        assert_eq!(drafts[0].fields["msg"], "disk almost full");
    }

    #[test]
    fn unmatched_lines_skip_or_fail() {
        assert!(rules(false).parse_line("app", 4, "garbage").unwrap().is_empty());
        let err = rules(true).parse_line("app", 4, "garbage").unwrap_err();
        assert!(err.0.contains("line 4"));
        // Blank lines are never errors.
        assert!(rules(true).parse_line("app", 5, "   ").unwrap().is_empty());
    }

    #[test]
    fn tables_resolve() {
        let r = rules(false);
        assert_eq!(r.table_for("app").as_deref(), Some("facts_app"));
        assert_eq!(r.table_for("access").as_deref(), Some("http_facts"));
        assert!(r.parse_line("missing", 1, "x").is_err());
    }
}
