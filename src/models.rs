use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use uuid::Uuid;

use crate::cmi::{
    groups::{Comment, Interaction, Objective},
    ScormVersion,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl PackageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageStatus::Pending => "pending",
            PackageStatus::Processing => "processing",
            PackageStatus::Ready => "ready",
            PackageStatus::Failed => "failed",
        }
    }
}

impl FromStr for PackageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PackageStatus::Pending),
            "processing" => Ok(PackageStatus::Processing),
            "ready" => Ok(PackageStatus::Ready),
            "failed" => Ok(PackageStatus::Failed),
            other => Err(format!("unknown package status {other:?}")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Package {
    pub id: Uuid,
    pub unit_id: Uuid,
    pub title: String,
    pub scorm_version: Option<ScormVersion>,
    pub entry_point_href: Option<String>,
    /// Heuristic tag, diagnostics only.
    pub authoring_tool: Option<String>,
    pub manifest_data: serde_json::Value,
    pub resource_list: Vec<String>,
    pub processing_status: PackageStatus,
    pub processing_error: Option<String>,
    pub base_path: String, // relative to DATA_DIR, e.g. "packages/<uuid>"
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EnrollmentStatus::NotStarted => "not_started",
            EnrollmentStatus::InProgress => "in_progress",
            EnrollmentStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(EnrollmentStatus::NotStarted),
            "in_progress" => Ok(EnrollmentStatus::InProgress),
            "completed" => Ok(EnrollmentStatus::Completed),
            other => Err(format!("unknown enrollment status {other:?}")),
        }
    }
}

/// A learner's standing on one learning unit across all attempts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub id: Uuid,
    pub learner_id: String,
    pub unit_id: Uuid,
    pub total_attempts: i32,
    pub best_score: Option<f64>,
    pub enrollment_status: EnrollmentStatus,
    pub cumulative_time_seconds: i64,
    pub first_accessed_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// What one applied commit contributes to its Enrollment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnrollmentDelta {
    pub new_attempt: bool,
    pub score: Option<f64>,
    pub completed: bool,
    pub time_delta_seconds: i64,
    pub at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(learner_id: &str, unit_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            learner_id: learner_id.to_string(),
            unit_id,
            total_attempts: 0,
            best_score: None,
            enrollment_status: EnrollmentStatus::NotStarted,
            cumulative_time_seconds: 0,
            first_accessed_at: Some(now),
            last_accessed_at: Some(now),
            created_at: now,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.first_accessed_at.get_or_insert(now);
        self.last_accessed_at = Some(now);
    }

    /// Status only moves forward; best_score only grows.
    pub fn absorb(&mut self, delta: &EnrollmentDelta) {
        if delta.new_attempt {
            self.total_attempts += 1;
        }
        if let Some(score) = delta.score {
            self.best_score = Some(self.best_score.map_or(score, |b| b.max(score)));
        }
        if delta.completed {
            self.enrollment_status = EnrollmentStatus::Completed;
        } else if self.enrollment_status == EnrollmentStatus::NotStarted {
            self.enrollment_status = EnrollmentStatus::InProgress;
        }
        self.cumulative_time_seconds = self
            .cumulative_time_seconds
            .saturating_add(delta.time_delta_seconds)
            .max(0);
        self.touch(delta.at);
    }

    /// An explicitly started fresh attempt re-opens a completed enrollment.
    pub fn reopen(&mut self) {
        if self.enrollment_status == EnrollmentStatus::Completed {
            self.enrollment_status = EnrollmentStatus::InProgress;
        }
    }

    /// Administrative reset; attempt history and best score are kept.
    pub fn reset(&mut self) {
        self.enrollment_status = EnrollmentStatus::NotStarted;
    }
}

/// One launch session and the full CMI tree content asserted during it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Attempt {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub session_id: Uuid,
    pub scorm_version: ScormVersion,
    pub last_sequence_number: i64,
    pub cmi_data: BTreeMap<String, String>,
    pub score_raw: Option<f64>,
    pub score_min: Option<f64>,
    pub score_max: Option<f64>,
    pub score_scaled: Option<f64>,
    pub completion_status: Option<String>,
    pub success_status: Option<String>,
    pub lesson_location: Option<String>,
    pub suspend_data: Option<String>,
    pub entry_mode: Option<String>,
    pub exit_mode: Option<String>,
    pub total_time_seconds: i64,
    pub session_time_seconds: i64,
    pub interactions: Vec<Interaction>,
    pub objectives: Vec<Objective>,
    pub comments: Vec<Comment>,
    pub completed: bool,
    pub terminated: bool,
    pub commit_count: i32,
    pub started_at: DateTime<Utc>,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn new(enrollment_id: Uuid, session_id: Uuid, scorm_version: ScormVersion, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id,
            session_id,
            scorm_version,
            last_sequence_number: 0,
            cmi_data: BTreeMap::new(),
            score_raw: None,
            score_min: None,
            score_max: None,
            score_scaled: None,
            completion_status: None,
            success_status: None,
            lesson_location: None,
            suspend_data: None,
            entry_mode: None,
            exit_mode: None,
            total_time_seconds: 0,
            session_time_seconds: 0,
            interactions: Vec::new(),
            objectives: Vec::new(),
            comments: Vec::new(),
            completed: false,
            terminated: false,
            commit_count: 0,
            started_at: now,
            last_commit_at: None,
            completed_at: None,
        }
    }

    pub fn summary(&self) -> AttemptSummary {
        AttemptSummary {
            session_id: self.session_id,
            scorm_version: self.scorm_version,
            last_sequence_number: self.last_sequence_number,
            commit_count: self.commit_count,
            completion_status: self.completion_status.clone(),
            success_status: self.success_status.clone(),
            score_raw: self.score_raw,
            total_time_seconds: self.total_time_seconds,
            completed: self.completed,
            terminated: self.terminated,
            started_at: self.started_at,
            last_commit_at: self.last_commit_at,
            completed_at: self.completed_at,
        }
    }

    /// Progress handed to the next launch so the runtime can resume.
    pub fn prior_progress(&self) -> PriorProgress {
        let resume = self.exit_mode.as_deref() == Some("suspend")
            || self.lesson_location.as_deref().is_some_and(|s| !s.is_empty())
            || self.suspend_data.as_deref().is_some_and(|s| !s.is_empty());
        PriorProgress {
            score_raw: self.score_raw,
            score_min: self.score_min,
            score_max: self.score_max,
            score_scaled: self.score_scaled,
            completion_status: self.completion_status.clone(),
            success_status: self.success_status.clone(),
            total_time_seconds: self.total_time_seconds,
            lesson_location: self.lesson_location.clone(),
            suspend_data: self.suspend_data.clone(),
            entry: resume.then(|| "resume".to_string()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AttemptSummary {
    pub session_id: Uuid,
    pub scorm_version: ScormVersion,
    pub last_sequence_number: i64,
    pub commit_count: i32,
    pub completion_status: Option<String>,
    pub success_status: Option<String>,
    pub score_raw: Option<f64>,
    pub total_time_seconds: i64,
    pub completed: bool,
    pub terminated: bool,
    pub started_at: DateTime<Utc>,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Saved state embedded in the host page and consumed once at Initialize.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PriorProgress {
    pub score_raw: Option<f64>,
    pub score_min: Option<f64>,
    pub score_max: Option<f64>,
    pub score_scaled: Option<f64>,
    pub completion_status: Option<String>,
    pub success_status: Option<String>,
    #[serde(default)]
    pub total_time_seconds: i64,
    pub lesson_location: Option<String>,
    pub suspend_data: Option<String>,
    /// `"resume"` when the previous session left something to resume.
    pub entry: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Bookmark {
    pub lesson_location: Option<String>,
    pub suspend_data: Option<String>,
}

/// Version-neutral read model for course display, gradebook and reports.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LegacyProgress {
    pub learner_id: String,
    pub unit_id: Uuid,
    pub best_score: Option<f64>,
    pub completed: bool,
    pub bookmark: Bookmark,
    pub total_time_seconds: i64,
    pub updated_at: DateTime<Utc>,
}

impl LegacyProgress {
    pub fn project(enrollment: &Enrollment, latest: Option<&Attempt>, now: DateTime<Utc>) -> Self {
        Self {
            learner_id: enrollment.learner_id.clone(),
            unit_id: enrollment.unit_id,
            best_score: enrollment.best_score,
            completed: enrollment.enrollment_status == EnrollmentStatus::Completed,
            bookmark: Bookmark {
                lesson_location: latest.and_then(|a| a.lesson_location.clone()),
                suspend_data: latest.and_then(|a| a.suspend_data.clone()),
            },
            total_time_seconds: enrollment.cumulative_time_seconds,
            updated_at: now,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommitRequest {
    pub session_id: Uuid,
    pub sequence_number: i64,
    pub scorm_version: ScormVersion,
    pub raw: BTreeMap<String, String>,
    /// Set by the runtime on the commit issued from Terminate.
    #[serde(default)]
    pub terminated: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProgressSummary {
    pub completed: bool,
    pub score: Option<f64>,
}

impl ProgressSummary {
    pub fn of(enrollment: &Enrollment) -> Self {
        Self {
            completed: enrollment.enrollment_status == EnrollmentStatus::Completed,
            score: enrollment.best_score,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SyncResponse {
    pub ok: bool,
    /// False when the commit was a replay or arrived out of order.
    pub applied: bool,
    pub enrollment: Enrollment,
    pub attempt: AttemptSummary,
    pub progress: ProgressSummary,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EnrollmentDetail {
    pub enrollment: Enrollment,
    pub attempts: Vec<AttemptSummary>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LaunchQuery {
    #[serde(default)]
    pub fresh: bool,
}
