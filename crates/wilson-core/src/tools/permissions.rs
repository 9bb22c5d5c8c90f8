//! Permission policy and the dangerous-command screen.
//!
//! Tool names classify under a three-level policy (allow / ask / deny) via
//! user-configured patterns. Shell commands are additionally screened against
//! a fixed set of dangerous patterns; a match forces the ask gate no matter
//! what the name policy says, and is always written to the audit trail.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

/// Outcome of classifying a tool call under the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionRule {
    Allow,
    Ask,
    Deny,
}

/// Ordered name-pattern rules; first match wins, otherwise the default.
pub struct PermissionPolicy {
    rules: Vec<(Regex, PermissionRule)>,
    default_rule: PermissionRule,
}

impl PermissionPolicy {
    pub fn allow_all() -> Self {
        Self {
            rules: Vec::new(),
            default_rule: PermissionRule::Allow,
        }
    }

    pub fn new(
        patterns: &[(String, PermissionRule)],
        default_rule: PermissionRule,
    ) -> anyhow::Result<Self> {
        let mut rules = Vec::with_capacity(patterns.len());
        for (pattern, rule) in patterns {
            let regex = Regex::new(&format!("(?i)^(?:{})$", pattern))
                .map_err(|e| anyhow::anyhow!("invalid permission pattern '{}': {}", pattern, e))?;
            rules.push((regex, *rule));
        }
        Ok(Self {
            rules,
            default_rule,
        })
    }

    pub fn classify(&self, tool_name: &str) -> PermissionRule {
        for (regex, rule) in &self.rules {
            if regex.is_match(tool_name) {
                return *rule;
            }
        }
        self.default_rule
    }
}

static DANGEROUS_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("recursive_delete", r"(?i)\brm\s+(-[a-z]+\s+)*-[a-z]*r"),
        ("wildcard_delete", r"(?i)\brm\s+(-[a-z]+\s+)*\S*\*"),
        (
            "sql_drop_or_truncate",
            r"(?i)\b(drop\s+(table|database|schema)|truncate(\s+table)?)\b",
        ),
        (
            "sql_delete_without_where",
            r"(?i)\bdelete\s+from\s+\S+\s*(;|$)",
        ),
        ("force_push", r"(?i)git\s+push\b.*\s(--force|-f)\b"),
        ("hard_reset", r"(?i)git\s+reset\s+--hard"),
        ("sudo", r"(?i)(^|[;&|]\s*)sudo\s"),
        ("chmod_777", r"chmod\s+(-[a-zA-Z]+\s+)*777\b"),
    ]
    .into_iter()
    .map(|(label, pattern)| (label, Regex::new(pattern).expect("static pattern compiles")))
    .collect()
});

/// Screen a shell command against the dangerous-pattern set. Returns the
/// label of the first matching pattern.
pub fn dangerous_command(command: &str) -> Option<&'static str> {
    DANGEROUS_PATTERNS
        .iter()
        .find(|(_, regex)| regex.is_match(command))
        .map(|(label, _)| *label)
}

/// Append-only trail of dangerous-command decisions. Written regardless of
/// the configured log level; subscriber filtering cannot drop these.
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<data_dir>/wilson/audit.jsonl`, falling back to the working dir.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("wilson"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("audit.jsonl")
    }

    pub fn record(&self, command: &str, pattern: &str, approved: bool) {
        tracing::warn!(
            target: "audit",
            command,
            pattern,
            approved,
            "dangerous command screened"
        );

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "command": command,
            "pattern": pattern,
            "approved": approved,
        });

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{}", entry));
        if let Err(e) = appended {
            tracing::error!(path = %self.path.display(), "failed to write audit entry: {}", e);
        }
    }
}
