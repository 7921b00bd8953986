//! Rules directory backed repository

use async_trait::async_trait;
use rulestream_core::{Error, Result, Rule, RuleChange, RuleRepository};
use rulestream_rules::load_rules_dir;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rules read from YAML/JSON documents in one directory.
///
/// Every listing re-reads the directory. Invalid documents are logged and
/// left out; only a missing or unreadable directory is an error.
pub struct FileRuleRepository {
    dir: PathBuf,
    changes: broadcast::Sender<RuleChange>,
}

/// Name, modification time and size of every file in the directory
type Fingerprint = Vec<(PathBuf, Option<SystemTime>, u64)>;

impl FileRuleRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            dir: dir.into(),
            changes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Poll the directory every `interval` and announce a reload whenever
    /// its contents change
    pub fn spawn_watcher(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last = fingerprint(&self.dir).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let current = fingerprint(&self.dir).await;
                if current != last {
                    info!(dir = %self.dir.display(), "Rules directory changed");
                    last = current;
                    // no subscribers is fine
                    let _ = self.changes.send(RuleChange::Reloaded);
                }
            }
            debug!("Rules directory watcher stopped");
        })
    }
}

async fn fingerprint(dir: &Path) -> Fingerprint {
    let dir = dir.to_path_buf();
    match tokio::task::spawn_blocking(move || read_fingerprint(&dir)).await {
        Ok(files) => files,
        Err(e) => {
            warn!(error = %e, "Rules directory scan failed");
            Vec::new()
        }
    }
}

fn read_fingerprint(dir: &Path) -> Fingerprint {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Fingerprint = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            Some((entry.path(), meta.modified().ok(), meta.len()))
        })
        .collect();
    files.sort();
    files
}

#[async_trait]
impl RuleRepository for FileRuleRepository {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        let dir = self.dir.clone();
        let report = tokio::task::spawn_blocking(move || load_rules_dir(dir))
            .await
            .map_err(|e| Error::internal(format!("rule loading task failed: {}", e)))?
            .map_err(|e| Error::repository(format!("{}: {}", self.dir.display(), e)))?;

        if !report.errors.is_empty() {
            warn!(
                dir = %self.dir.display(),
                invalid = report.errors.len(),
                "Some rule documents could not be loaded"
            );
        }

        Ok(report.rules.into_iter().filter(|rule| rule.enabled).collect())
    }

    fn subscribe_to_changes(&self) -> Option<broadcast::Receiver<RuleChange>> {
        Some(self.changes.subscribe())
    }
}
