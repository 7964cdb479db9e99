//! Issue canonicalization.
//!
//! Repeated detections of the same underlying problem must hash identically,
//! so volatile substrings (PIDs, byte counts, UUIDs, container ids) are
//! stripped before hashing `kind + subject + normalized message`.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::types::{Issue, IssueKind};

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("valid uuid regex")
});

static HEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:0x)?[0-9a-f]*[0-9][0-9a-f]*\b").expect("valid hex regex"));

static DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid digit regex"));

static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid space regex"));

/// Known failure classes, first match wins.
static SIGNATURES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        (
            "docker_dns_failure",
            r"(temporary failure in name resolution|no such host|dns (lookup|resolution)|lookup .* on .*:\d+)",
        ),
        ("port_in_use", r"(address already in use|port .* (already )?in use|bind: .*in use)"),
        ("oom_killed", r"(out of memory|oom[- ]?kill|killed process|memory cgroup out of memory)"),
        ("disk_full", r"(no space left on device|disk (is )?full|quota exceeded)"),
        ("permission_denied", r"(permission denied|operation not permitted|eacces)"),
        ("connection_refused", r"(connection refused|econnrefused)"),
        ("timeout", r"(timed out|timeout|deadline exceeded)"),
        ("crash_loop", r"(restarting|crash ?loop|back-off restarting|exited \([1-9]\d*\))"),
        ("segfault", r"(segfault|segmentation fault|core dumped)"),
        ("http_5xx", r"\bhttp (status )?5\d\d\b|\b5\d\d (internal|bad gateway|service unavailable|gateway timeout)"),
        ("http_4xx", r"\bhttp (status )?4\d\d\b"),
        ("dependency_failed", r"(dependency failed|failed with result 'dependency')"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid signature regex")))
    .collect()
});

/// Normalize a message so volatile details do not affect the hash.
///
/// Lowercases, replaces UUIDs with `<uuid>`, digit-bearing hex tokens of 8+
/// chars with `<hex>`, every remaining digit run with `<n>`, and collapses
/// whitespace.
pub fn normalize_message(message: &str) -> String {
    let lowered = message.to_lowercase();
    let no_uuid = UUID_RE.replace_all(&lowered, "<uuid>");
    let no_hex = HEX_RE.replace_all(&no_uuid, |caps: &regex::Captures| {
        let token = &caps[0];
        if token.len() >= 8 && token.chars().any(|c| c.is_ascii_alphabetic()) {
            "<hex>".to_string()
        } else {
            token.to_string()
        }
    });
    let no_digits = DIGITS_RE.replace_all(&no_hex, "<n>");
    SPACE_RE.replace_all(no_digits.trim(), " ").into_owned()
}

/// Stable digest of `kind + subject + normalized message`; the dedup key.
pub fn canonicalize(issue: &Issue) -> String {
    let normalized = normalize_message(&issue.message);
    let mut hasher = Sha256::new();
    hasher.update(issue.kind.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(issue.subject.trim().to_lowercase().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Map a message onto a failure class used to key learned patterns.
///
/// Matching runs on the lowercased raw message (status codes matter here).
/// Falls back to the issue kind when nothing more specific matches.
pub fn classify_signature(kind: IssueKind, message: &str) -> String {
    let lowered = message.to_lowercase();
    SIGNATURES
        .iter()
        .find(|(_, re)| re.is_match(&lowered))
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| kind.as_str().to_string())
}
