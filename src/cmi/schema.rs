//! Enumerated element schema for the SCORM 1.2 and 2004 run-time data models.
//!
//! Array indices are written as `n` in patterns; [`normalize`] maps a concrete
//! element such as `cmi.interactions.3.objectives.0.id` onto its pattern.

use super::{time, ScormVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
    Keyword,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kind {
    Text(usize),
    Vocab(&'static [&'static str]),
    Real {
        min: Option<f64>,
        max: Option<f64>,
        blank: bool,
    },
    Integer {
        min: i64,
        max: i64,
    },
    Timespan12,
    Time12,
    Interval2004,
    Timestamp2004,
    Children(&'static str),
    Count,
    Version,
}

#[derive(Debug)]
pub struct ElementDef {
    pub pattern: &'static str,
    pub access: Access,
    pub kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueError {
    TypeMismatch,
    OutOfRange,
}

impl ElementDef {
    pub fn is_keyword(&self) -> bool {
        self.access == Access::Keyword
    }

    pub fn check_value(&self, value: &str) -> Result<(), ValueError> {
        match self.kind {
            Kind::Text(max) => {
                if value.chars().count() > max {
                    return Err(ValueError::TypeMismatch);
                }
            }
            Kind::Vocab(words) => {
                if !words.contains(&value) {
                    return Err(ValueError::TypeMismatch);
                }
            }
            Kind::Real { min, max, blank } => {
                if blank && value.is_empty() {
                    return Ok(());
                }
                let v: f64 = value.trim().parse().map_err(|_| ValueError::TypeMismatch)?;
                if !v.is_finite() {
                    return Err(ValueError::TypeMismatch);
                }
                if min.map(|m| v < m).unwrap_or(false) || max.map(|m| v > m).unwrap_or(false) {
                    return Err(ValueError::OutOfRange);
                }
            }
            Kind::Integer { min, max } => {
                let v: i64 = value.trim().parse().map_err(|_| ValueError::TypeMismatch)?;
                if v < min || v > max {
                    return Err(ValueError::OutOfRange);
                }
            }
            Kind::Timespan12 => {
                time::parse_timespan_12(value).ok_or(ValueError::TypeMismatch)?;
            }
            Kind::Time12 => {
                if !time::is_time_12(value) {
                    return Err(ValueError::TypeMismatch);
                }
            }
            Kind::Interval2004 => {
                let secs = time::parse_duration_2004(value).ok_or(ValueError::TypeMismatch)?;
                if secs > time::MAX_SPAN_SECONDS {
                    return Err(ValueError::OutOfRange);
                }
            }
            Kind::Timestamp2004 => {
                if !time::is_timestamp_2004(value) {
                    return Err(ValueError::TypeMismatch);
                }
            }
            Kind::Children(_) | Kind::Count | Kind::Version => return Err(ValueError::TypeMismatch),
        }
        Ok(())
    }
}

/// Replaces numeric path segments with `n`, returning the pattern and the indices in order.
pub fn normalize(element: &str) -> (String, Vec<usize>) {
    let mut indices = Vec::new();
    let pattern = element
        .split('.')
        .map(|seg| match seg.parse::<usize>() {
            Ok(i) if !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_digit()) => {
                indices.push(i);
                "n"
            }
            _ => seg,
        })
        .collect::<Vec<_>>()
        .join(".");
    (pattern, indices)
}

pub fn lookup(version: ScormVersion, element: &str) -> Option<&'static ElementDef> {
    let (pattern, _) = normalize(element);
    table(version).iter().find(|d| d.pattern == pattern)
}

/// Element families that behave as arrays, as `(collection prefix, member pattern prefix)`.
pub fn array_prefix(element: &str) -> Option<(String, usize)> {
    // `cmi.interactions.4.objectives.1.id` -> ("cmi.interactions.4.objectives", 1)
    let segs: Vec<&str> = element.split('.').collect();
    let pos = segs
        .iter()
        .rposition(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))?;
    let index = segs[pos].parse().ok()?;
    Some((segs[..pos].join("."), index))
}

pub fn table(version: ScormVersion) -> &'static [ElementDef] {
    match version {
        ScormVersion::Scorm12 => SCHEMA_12,
        ScormVersion::Scorm2004 => SCHEMA_2004,
    }
}

const fn def(pattern: &'static str, access: Access, kind: Kind) -> ElementDef {
    ElementDef {
        pattern,
        access,
        kind,
    }
}

const fn real(min: Option<f64>, max: Option<f64>) -> Kind {
    Kind::Real {
        min,
        max,
        blank: false,
    }
}

const SCORE_12: Kind = Kind::Real {
    min: Some(0.0),
    max: Some(100.0),
    blank: true,
};

const STATUS_12: &[&str] = &[
    "passed",
    "completed",
    "failed",
    "incomplete",
    "browsed",
    "not attempted",
];
const EXIT_12: &[&str] = &["time-out", "suspend", "logout", ""];
const ENTRY: &[&str] = &["ab-initio", "resume", ""];
const CREDIT: &[&str] = &["credit", "no-credit"];
const MODE: &[&str] = &["browse", "normal", "review"];
const TIME_LIMIT_ACTION: &[&str] = &[
    "exit,message",
    "exit,no message",
    "continue,message",
    "continue,no message",
];
const INTERACTION_TYPE_12: &[&str] = &[
    "true-false",
    "choice",
    "fill-in",
    "matching",
    "performance",
    "sequencing",
    "likert",
    "numeric",
];

use Access::{Keyword as K, ReadOnly as RO, ReadWrite as RW, WriteOnly as WO};

static SCHEMA_12: &[ElementDef] = &[
    def(
        "cmi.core._children",
        K,
        Kind::Children("student_id,student_name,lesson_location,credit,lesson_status,entry,score,total_time,lesson_mode,exit,session_time"),
    ),
    def("cmi.core.student_id", RO, Kind::Text(255)),
    def("cmi.core.student_name", RO, Kind::Text(255)),
    def("cmi.core.lesson_location", RW, Kind::Text(255)),
    def("cmi.core.credit", RO, Kind::Vocab(CREDIT)),
    def("cmi.core.lesson_status", RW, Kind::Vocab(STATUS_12)),
    def("cmi.core.entry", RO, Kind::Vocab(ENTRY)),
    def("cmi.core.score._children", K, Kind::Children("raw,min,max")),
    def("cmi.core.score.raw", RW, SCORE_12),
    def("cmi.core.score.min", RW, SCORE_12),
    def("cmi.core.score.max", RW, SCORE_12),
    def("cmi.core.total_time", RO, Kind::Timespan12),
    def("cmi.core.lesson_mode", RO, Kind::Vocab(MODE)),
    def("cmi.core.exit", WO, Kind::Vocab(EXIT_12)),
    def("cmi.core.session_time", WO, Kind::Timespan12),
    def("cmi.suspend_data", RW, Kind::Text(4096)),
    def("cmi.launch_data", RO, Kind::Text(4096)),
    def("cmi.comments", RW, Kind::Text(4096)),
    def("cmi.comments_from_lms", RO, Kind::Text(4096)),
    def("cmi.objectives._children", K, Kind::Children("id,score,status")),
    def("cmi.objectives._count", K, Kind::Count),
    def("cmi.objectives.n.id", RW, Kind::Text(255)),
    def("cmi.objectives.n.score._children", K, Kind::Children("raw,min,max")),
    def("cmi.objectives.n.score.raw", RW, SCORE_12),
    def("cmi.objectives.n.score.min", RW, SCORE_12),
    def("cmi.objectives.n.score.max", RW, SCORE_12),
    def("cmi.objectives.n.status", RW, Kind::Vocab(STATUS_12)),
    def(
        "cmi.student_data._children",
        K,
        Kind::Children("mastery_score,max_time_allowed,time_limit_action"),
    ),
    def("cmi.student_data.mastery_score", RO, real(Some(0.0), Some(100.0))),
    def("cmi.student_data.max_time_allowed", RO, Kind::Timespan12),
    def("cmi.student_data.time_limit_action", RO, Kind::Vocab(TIME_LIMIT_ACTION)),
    def(
        "cmi.student_preference._children",
        K,
        Kind::Children("audio,language,speed,text"),
    ),
    def("cmi.student_preference.audio", RW, Kind::Integer { min: -1, max: 100 }),
    def("cmi.student_preference.language", RW, Kind::Text(255)),
    def("cmi.student_preference.speed", RW, Kind::Integer { min: -100, max: 100 }),
    def("cmi.student_preference.text", RW, Kind::Integer { min: -1, max: 1 }),
    def(
        "cmi.interactions._children",
        K,
        Kind::Children("id,objectives,time,type,correct_responses,weighting,student_response,result,latency"),
    ),
    def("cmi.interactions._count", K, Kind::Count),
    def("cmi.interactions.n.id", WO, Kind::Text(255)),
    def("cmi.interactions.n.objectives._count", K, Kind::Count),
    def("cmi.interactions.n.objectives.n.id", WO, Kind::Text(255)),
    def("cmi.interactions.n.time", WO, Kind::Time12),
    def("cmi.interactions.n.type", WO, Kind::Vocab(INTERACTION_TYPE_12)),
    def("cmi.interactions.n.correct_responses._count", K, Kind::Count),
    def("cmi.interactions.n.correct_responses.n.pattern", WO, Kind::Text(255)),
    def("cmi.interactions.n.weighting", WO, real(None, None)),
    def("cmi.interactions.n.student_response", WO, Kind::Text(255)),
    def("cmi.interactions.n.result", WO, Kind::Text(255)),
    def("cmi.interactions.n.latency", WO, Kind::Timespan12),
];

const COMPLETION_2004: &[&str] = &["completed", "incomplete", "not attempted", "unknown"];
const SUCCESS_2004: &[&str] = &["passed", "failed", "unknown"];
const EXIT_2004: &[&str] = &["time-out", "suspend", "logout", "normal", ""];
const INTERACTION_TYPE_2004: &[&str] = &[
    "true-false",
    "choice",
    "fill-in",
    "long-fill-in",
    "matching",
    "performance",
    "sequencing",
    "likert",
    "numeric",
    "other",
];
const SCALED: Kind = real(Some(-1.0), Some(1.0));
const UNIT: Kind = real(Some(0.0), Some(1.0));
const ANY_REAL: Kind = real(None, None);

static SCHEMA_2004: &[ElementDef] = &[
    def("cmi._version", K, Kind::Version),
    def(
        "cmi.comments_from_learner._children",
        K,
        Kind::Children("comment,location,timestamp"),
    ),
    def("cmi.comments_from_learner._count", K, Kind::Count),
    def("cmi.comments_from_learner.n.comment", RW, Kind::Text(4000)),
    def("cmi.comments_from_learner.n.location", RW, Kind::Text(250)),
    def("cmi.comments_from_learner.n.timestamp", RW, Kind::Timestamp2004),
    def(
        "cmi.comments_from_lms._children",
        K,
        Kind::Children("comment,location,timestamp"),
    ),
    def("cmi.comments_from_lms._count", K, Kind::Count),
    def("cmi.comments_from_lms.n.comment", RO, Kind::Text(4000)),
    def("cmi.comments_from_lms.n.location", RO, Kind::Text(250)),
    def("cmi.comments_from_lms.n.timestamp", RO, Kind::Timestamp2004),
    def("cmi.completion_status", RW, Kind::Vocab(COMPLETION_2004)),
    def("cmi.completion_threshold", RO, UNIT),
    def("cmi.credit", RO, Kind::Vocab(CREDIT)),
    def("cmi.entry", RO, Kind::Vocab(ENTRY)),
    def("cmi.exit", WO, Kind::Vocab(EXIT_2004)),
    def(
        "cmi.interactions._children",
        K,
        Kind::Children("id,type,objectives,timestamp,correct_responses,weighting,learner_response,result,latency,description"),
    ),
    def("cmi.interactions._count", K, Kind::Count),
    def("cmi.interactions.n.id", RW, Kind::Text(4000)),
    def("cmi.interactions.n.type", RW, Kind::Vocab(INTERACTION_TYPE_2004)),
    def("cmi.interactions.n.objectives._count", K, Kind::Count),
    def("cmi.interactions.n.objectives.n.id", RW, Kind::Text(4000)),
    def("cmi.interactions.n.timestamp", RW, Kind::Timestamp2004),
    def("cmi.interactions.n.correct_responses._count", K, Kind::Count),
    def("cmi.interactions.n.correct_responses.n.pattern", RW, Kind::Text(4000)),
    def("cmi.interactions.n.weighting", RW, ANY_REAL),
    def("cmi.interactions.n.learner_response", RW, Kind::Text(4000)),
    def("cmi.interactions.n.result", RW, Kind::Text(255)),
    def("cmi.interactions.n.latency", RW, Kind::Interval2004),
    def("cmi.interactions.n.description", RW, Kind::Text(250)),
    def("cmi.launch_data", RO, Kind::Text(4000)),
    def("cmi.learner_id", RO, Kind::Text(4000)),
    def("cmi.learner_name", RO, Kind::Text(250)),
    def(
        "cmi.learner_preference._children",
        K,
        Kind::Children("audio_level,language,delivery_speed,audio_captioning"),
    ),
    def("cmi.learner_preference.audio_level", RW, real(Some(0.0), None)),
    def("cmi.learner_preference.language", RW, Kind::Text(250)),
    def("cmi.learner_preference.delivery_speed", RW, real(Some(0.0), None)),
    def("cmi.learner_preference.audio_captioning", RW, Kind::Vocab(&["-1", "0", "1"])),
    def("cmi.location", RW, Kind::Text(1000)),
    def("cmi.max_time_allowed", RO, Kind::Interval2004),
    def("cmi.mode", RO, Kind::Vocab(MODE)),
    def(
        "cmi.objectives._children",
        K,
        Kind::Children("id,score,success_status,completion_status,progress_measure,description"),
    ),
    def("cmi.objectives._count", K, Kind::Count),
    def("cmi.objectives.n.id", RW, Kind::Text(4000)),
    def("cmi.objectives.n.score._children", K, Kind::Children("scaled,raw,min,max")),
    def("cmi.objectives.n.score.scaled", RW, SCALED),
    def("cmi.objectives.n.score.raw", RW, ANY_REAL),
    def("cmi.objectives.n.score.min", RW, ANY_REAL),
    def("cmi.objectives.n.score.max", RW, ANY_REAL),
    def("cmi.objectives.n.success_status", RW, Kind::Vocab(SUCCESS_2004)),
    def("cmi.objectives.n.completion_status", RW, Kind::Vocab(COMPLETION_2004)),
    def("cmi.objectives.n.progress_measure", RW, UNIT),
    def("cmi.objectives.n.description", RW, Kind::Text(250)),
    def("cmi.progress_measure", RW, UNIT),
    def("cmi.scaled_passing_score", RO, SCALED),
    def("cmi.score._children", K, Kind::Children("scaled,raw,min,max")),
    def("cmi.score.scaled", RW, SCALED),
    def("cmi.score.raw", RW, ANY_REAL),
    def("cmi.score.min", RW, ANY_REAL),
    def("cmi.score.max", RW, ANY_REAL),
    def("cmi.session_time", WO, Kind::Interval2004),
    def("cmi.success_status", RW, Kind::Vocab(SUCCESS_2004)),
    def("cmi.suspend_data", RW, Kind::Text(64000)),
    def("cmi.time_limit_action", RO, Kind::Vocab(TIME_LIMIT_ACTION)),
    def("cmi.total_time", RO, Kind::Interval2004),
];
