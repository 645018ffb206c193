//! Maps the heterogeneous status/score signals content reports onto a single
//! "completed" flag.
//!
//! Score and completion are orthogonal: content-only packages never report a
//! score, so nothing here (or downstream) may require `score > 0` for completion.

use serde::{Deserialize, Serialize};

use crate::cmi::ScormVersion;

pub const DEFAULT_PASS_THRESHOLD: f64 = 0.80;

/// Business rule applied when content reports a score but no status.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CompletionPolicy {
    /// Fraction of `score_max` at which a status-less score counts as complete.
    pub pass_threshold: f64,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            pass_threshold: DEFAULT_PASS_THRESHOLD,
        }
    }
}

impl CompletionPolicy {
    pub fn new(pass_threshold: f64) -> Result<Self, String> {
        if pass_threshold.is_finite() && pass_threshold > 0.0 && pass_threshold <= 1.0 {
            Ok(Self { pass_threshold })
        } else {
            Err(format!("pass threshold must be in (0, 1], got {pass_threshold}"))
        }
    }

    pub fn is_complete(&self, version: ScormVersion, signals: &CompletionSignals<'_>) -> bool {
        map_completion(version, signals, self.pass_threshold)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionSignals<'a> {
    pub completion_status: Option<&'a str>,
    /// Only reported by SCORM 2004 content.
    pub success_status: Option<&'a str>,
    pub score_raw: Option<f64>,
    pub score_max: Option<f64>,
    pub score_scaled: Option<f64>,
}

/// Statuses that carry no determination either way.
fn is_silent(status: Option<&str>) -> bool {
    matches!(
        status.map(str::trim),
        None | Some("") | Some("unknown") | Some("not attempted") | Some("browsed")
    )
}

pub fn map_completion(version: ScormVersion, s: &CompletionSignals<'_>, pass_threshold: f64) -> bool {
    match version {
        ScormVersion::Scorm12 => {
            if matches!(s.completion_status, Some("completed") | Some("passed")) {
                return true;
            }
        }
        ScormVersion::Scorm2004 => {
            if s.completion_status == Some("completed") || s.success_status == Some("passed") {
                return true;
            }
        }
    }
    let explicit = !is_silent(s.completion_status)
        || (version == ScormVersion::Scorm2004 && !is_silent(s.success_status));
    if explicit {
        return false;
    }
    score_ratio(s).map(|r| r >= pass_threshold).unwrap_or(false)
}

fn score_ratio(s: &CompletionSignals<'_>) -> Option<f64> {
    if let Some(scaled) = s.score_scaled {
        return Some(scaled);
    }
    let raw = s.score_raw?;
    let max = s.score_max.filter(|m| *m > 0.0).unwrap_or(100.0);
    Some(raw / max)
}
