use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One progress line: which invocation reached which stage, and what the
/// user was shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(rename = "type")]
    pub stage: String,
    pub story_id: String,
    pub invocation_id: String,
    #[serde(default)]
    pub message: String,
    pub ts: DateTime<Utc>,
}

/// Append-only JSONL log of the progress events of one story.
///
/// Each record goes out in a single append so lines from concurrent runs
/// never interleave.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
    story_id: String,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>, story_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            story_id: story_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn story_id(&self) -> &str {
        &self.story_id
    }

    pub fn append(
        &self,
        invocation_id: &str,
        stage: &str,
        message: &str,
    ) -> anyhow::Result<ProgressRecord> {
        let record = ProgressRecord {
            stage: stage.to_string(),
            story_id: self.story_id.clone(),
            invocation_id: invocation_id.to_string(),
            message: message.to_string(),
            ts: Utc::now(),
        };
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        Ok(record)
    }

    /// Every record in file order. Lines that do not parse are skipped.
    pub fn read(path: &Path) -> anyhow::Result<Vec<ProgressRecord>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", path.display()))
            }
        };
        Ok(raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
