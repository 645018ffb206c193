//! SCORM CMI data model shared by the in-page runtime and the sync endpoint.

pub mod groups;
pub mod schema;
pub mod time;

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScormVersion {
    #[serde(rename = "1.2")]
    Scorm12,
    #[serde(rename = "2004")]
    Scorm2004,
}

impl ScormVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ScormVersion::Scorm12 => "1.2",
            ScormVersion::Scorm2004 => "2004",
        }
    }

    pub fn elements(self) -> &'static Elements {
        match self {
            ScormVersion::Scorm12 => &ELEMENTS_12,
            ScormVersion::Scorm2004 => &ELEMENTS_2004,
        }
    }

    /// Formats whole seconds the way this version's timespan elements expect.
    pub fn format_duration(self, secs: i64) -> String {
        match self {
            ScormVersion::Scorm12 => time::format_timespan_12(secs),
            ScormVersion::Scorm2004 => time::format_duration_2004(secs),
        }
    }

    pub fn parse_duration(self, value: &str) -> Option<i64> {
        match self {
            ScormVersion::Scorm12 => time::parse_timespan_12(value),
            ScormVersion::Scorm2004 => time::parse_duration_2004(value),
        }
    }
}

impl fmt::Display for ScormVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScormVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.2" => Ok(ScormVersion::Scorm12),
            "2004" => Ok(ScormVersion::Scorm2004),
            other => Err(format!("unsupported scorm_version {other:?}")),
        }
    }
}

/// Names of the tracked top-level elements for one SCORM version.
#[derive(Debug)]
pub struct Elements {
    pub location: &'static str,
    pub suspend_data: &'static str,
    pub completion_status: &'static str,
    pub success_status: Option<&'static str>,
    pub score_raw: &'static str,
    pub score_min: &'static str,
    pub score_max: &'static str,
    pub score_scaled: Option<&'static str>,
    pub entry: &'static str,
    pub exit: &'static str,
    pub total_time: &'static str,
    pub session_time: &'static str,
    pub learner_id: &'static str,
    pub learner_name: &'static str,
    pub credit: &'static str,
    pub mode: &'static str,
}

impl Elements {
    /// Elements content sometimes clears during its own init before reading them.
    pub fn is_bookmark(&self, element: &str) -> bool {
        element == self.location || element == self.suspend_data
    }
}

static ELEMENTS_12: Elements = Elements {
    location: "cmi.core.lesson_location",
    suspend_data: "cmi.suspend_data",
    completion_status: "cmi.core.lesson_status",
    success_status: None,
    score_raw: "cmi.core.score.raw",
    score_min: "cmi.core.score.min",
    score_max: "cmi.core.score.max",
    score_scaled: None,
    entry: "cmi.core.entry",
    exit: "cmi.core.exit",
    total_time: "cmi.core.total_time",
    session_time: "cmi.core.session_time",
    learner_id: "cmi.core.student_id",
    learner_name: "cmi.core.student_name",
    credit: "cmi.core.credit",
    mode: "cmi.core.lesson_mode",
};

static ELEMENTS_2004: Elements = Elements {
    location: "cmi.location",
    suspend_data: "cmi.suspend_data",
    completion_status: "cmi.completion_status",
    success_status: Some("cmi.success_status"),
    score_raw: "cmi.score.raw",
    score_min: "cmi.score.min",
    score_max: "cmi.score.max",
    score_scaled: Some("cmi.score.scaled"),
    entry: "cmi.entry",
    exit: "cmi.exit",
    total_time: "cmi.total_time",
    session_time: "cmi.session_time",
    learner_id: "cmi.learner_id",
    learner_name: "cmi.learner_name",
    credit: "cmi.credit",
    mode: "cmi.mode",
};

/// Renders a score the way content expects to read it back (no trailing `.0`).
pub fn format_decimal(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}
