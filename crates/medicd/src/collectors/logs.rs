//! Log scraper: tails text logs and matches error patterns.
//!
//! A byte offset is kept per file. When a file shrinks or its inode changes
//! (logrotate), reading restarts at 0. Files seen for the first time are
//! read from their current end so old history is not replayed on startup.

use anyhow::{Context, Result};
use async_trait::async_trait;
use medic_common::{Issue, IssueKind, Severity};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::Collector;
use crate::config::LogCollectorConfig;

static FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b(?:unit|service|container|app)="?([A-Za-z0-9_@.:-]+)"?"#)
        .expect("valid field regex")
});

static PID_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)([A-Za-z0-9_@./-]+)\[\d+\]:").expect("valid tag regex"));

static BRACKET_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([A-Za-z][A-Za-z0-9_@.-]*)\]").expect("valid bracket regex"));

/// name, regex, kind, severity
const BUILTIN_PATTERNS: &[(&str, &str, IssueKind, Severity)] = &[
    ("port_conflict", r"(?i)address already in use", IssueKind::PortConflict, Severity::Critical),
    ("oom", r"(?i)(out of memory|oom[- ]?kill)", IssueKind::ResourcePressure, Severity::Critical),
    ("disk_full", r"(?i)no space left on device", IssueKind::ResourcePressure, Severity::Critical),
    (
        "unit_failed",
        r"(?i)(?P<subject>[A-Za-z0-9_@-]+)\.service: (main process exited|failed with result)",
        IssueKind::ServiceFailure,
        Severity::Warning,
    ),
    ("segfault", r"(?i)segfault", IssueKind::LogError, Severity::Critical),
    ("error", r"(?i)\b(error|fatal|panic)\b", IssueKind::LogError, Severity::Warning),
];

struct LogPattern {
    name: String,
    regex: Regex,
    kind: IssueKind,
    severity: Severity,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    offset: u64,
    inode: u64,
}

pub struct LogScraper {
    paths: Vec<PathBuf>,
    patterns: Vec<LogPattern>,
    max_issues: usize,
    cursors: Mutex<HashMap<PathBuf, Cursor>>,
}

impl LogScraper {
    pub fn new(config: &LogCollectorConfig) -> Result<Self> {
        let patterns = if config.patterns.is_empty() {
            BUILTIN_PATTERNS
                .iter()
                .map(|(name, re, kind, severity)| -> Result<LogPattern> {
                    Ok(LogPattern {
                        name: name.to_string(),
                        regex: Regex::new(re)?,
                        kind: *kind,
                        severity: *severity,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            config
                .patterns
                .iter()
                .map(|p| -> Result<LogPattern> {
                    Ok(LogPattern {
                        name: p.name.clone(),
                        regex: Regex::new(&p.regex)
                            .with_context(|| format!("Invalid regex for log pattern '{}'", p.name))?,
                        kind: p.kind,
                        severity: p.severity,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Self {
            paths: config.paths.clone(),
            patterns,
            max_issues: config.max_issues_per_poll.max(1),
            cursors: Mutex::new(HashMap::new()),
        })
    }

    /// Complete new lines since the last poll
    fn read_new_lines(&self, path: &Path) -> Result<Vec<String>> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let len = metadata.len();
        let inode = metadata.ino();

        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| anyhow::anyhow!("log cursor map poisoned"))?;
        let start = match cursors.get(path) {
            None => {
                cursors.insert(path.to_path_buf(), Cursor { offset: len, inode });
                debug!("Tailing {} from byte {}", path.display(), len);
                return Ok(Vec::new());
            }
            Some(c) if c.inode != inode || len < c.offset => {
                debug!("{} rotated, reading from the start", path.display());
                0
            }
            Some(c) => c.offset,
        };
        if start == len {
            return Ok(Vec::new());
        }

        let mut file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::new();
        file.take(len - start).read_to_end(&mut buf)?;

        // A trailing partial line is left for the next poll
        let complete = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        cursors.insert(
            path.to_path_buf(),
            Cursor {
                offset: start + complete as u64,
                inode,
            },
        );

        Ok(String::from_utf8_lossy(&buf[..complete])
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    fn match_line(&self, line: &str, path: &Path) -> Option<Issue> {
        for pattern in &self.patterns {
            let Some(caps) = pattern.regex.captures(line) else {
                continue;
            };
            let subject = caps
                .name("subject")
                .map(|m| m.as_str().to_string())
                .or_else(|| extract_subject(line))
                .unwrap_or_else(|| fallback_subject(path));
            debug!("{} matched '{}' for {}", path.display(), pattern.name, subject);
            return Some(
                Issue::new(self.name(), pattern.kind, subject, line.trim())
                    .with_severity(pattern.severity),
            );
        }
        None
    }
}

/// Subject from structured fields, then syslog tags
pub fn extract_subject(line: &str) -> Option<String> {
    if let Some(caps) = FIELD_RE.captures(line) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = PID_TAG_RE.captures(line) {
        let tag = &caps[1];
        // "/usr/bin/foo[12]:" -> "foo"
        return Some(tag.rsplit('/').next().unwrap_or(tag).to_string());
    }
    BRACKET_TAG_RE.captures(line).map(|caps| caps[1].to_string())
}

fn fallback_subject(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[async_trait]
impl Collector for LogScraper {
    fn name(&self) -> &str {
        "logs"
    }

    async fn poll(&self) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();
        for path in &self.paths {
            let lines = match self.read_new_lines(path) {
                Ok(lines) => lines,
                Err(e) => {
                    warn!("Skipping {}: {:#}", path.display(), e);
                    continue;
                }
            };
            for line in &lines {
                if issues.len() >= self.max_issues {
                    warn!(
                        "Log poll capped at {} issues, dropping the rest of this batch",
                        self.max_issues
                    );
                    return Ok(issues);
                }
                if let Some(issue) = self.match_line(line, path) {
                    issues.push(issue);
                }
            }
        }
        Ok(issues)
    }
}
