//! Rule documents on disk
//!
//! A document is YAML (or JSON) holding either a single rule or a
//! `rules:` list. Each rule is decoded on its own so one bad entry does not
//! take its neighbours down with it.

use rulestream_core::{Error, Result, Rule};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Many { rules: Vec<serde_yaml::Value> },
    One(serde_yaml::Value),
}

/// Rules decoded from one or more documents
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Successfully decoded rules, in document order
    pub rules: Vec<Rule>,

    /// Entries that could not be decoded: (source, reason)
    pub errors: Vec<(String, String)>,
}

impl LoadReport {
    fn absorb(&mut self, other: LoadReport) {
        self.rules.extend(other.rules);
        self.errors.extend(other.errors);
    }

    /// Drop rules whose id was already seen, keeping the first
    fn dedup_ids(&mut self) {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        self.rules.retain(|rule| {
            if seen.insert(rule.id.clone()) {
                true
            } else {
                duplicates.push(rule.reference());
                false
            }
        });
        for reference in duplicates {
            warn!(rule = %reference, "Duplicate rule id, keeping the first definition");
            self.errors.push((reference, "duplicate rule id".to_string()));
        }
    }
}

/// Decode rules from a YAML or JSON string.
///
/// A rule without an `id` is identified by its `pack.name` reference.
pub fn parse_rules(content: &str, source: &str) -> Result<LoadReport> {
    let raw: RawDocument = serde_yaml::from_str(content)
        .map_err(|e| Error::config(format!("{}: {}", source, e)))?;

    let entries = match raw {
        RawDocument::Many { rules } => rules,
        RawDocument::One(value) => vec![value],
    };

    let mut report = LoadReport::default();
    for (position, entry) in entries.into_iter().enumerate() {
        let has_id = entry.get("id").is_some();
        match serde_yaml::from_value::<Rule>(entry) {
            Ok(mut rule) => {
                // ids must survive reloads; fall back to the rule reference
                if !has_id {
                    rule.id = rule.reference();
                }
                report.rules.push(rule)
            }
            Err(e) => {
                let location = format!("{}#{}", source, position);
                warn!(source = %location, error = %e, "Skipping invalid rule");
                report.errors.push((location, e.to_string()));
            }
        }
    }

    Ok(report)
}

/// Load rules from a single file
pub fn load_rules_file(path: impl AsRef<Path>) -> Result<LoadReport> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    parse_rules(&content, &path.display().to_string())
}

/// Load every `.yaml`, `.yml` and `.json` file in `dir`, in file name order.
/// Unreadable files are reported, not fatal.
pub fn load_rules_dir(dir: impl AsRef<Path>) -> Result<LoadReport> {
    let dir = dir.as_ref();
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml" | "json")
                )
        })
        .collect();
    files.sort();

    let mut report = LoadReport::default();
    for file in files {
        match load_rules_file(&file) {
            Ok(loaded) => {
                debug!(file = %file.display(), rules = loaded.rules.len(), "Loaded rule file");
                report.absorb(loaded);
            }
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Skipping unreadable rule file");
                report.errors.push((file.display().to_string(), e.to_string()));
            }
        }
    }

    report.dedup_ids();
    Ok(report)
}
