//! Ordered, idempotent merge of runtime commits into an Attempt.
//!
//! Both store backends lock/load the rows, call [`merge_commit`], and write the
//! result back, so the merge semantics live in exactly one place.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::{
    cmi::{groups, schema, ScormVersion},
    completion::{CompletionPolicy, CompletionSignals},
    error::SyncError,
    models::{Attempt, CommitRequest, EnrollmentDelta},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeOutcome {
    pub applied: bool,
    pub newly_completed: bool,
    pub delta: EnrollmentDelta,
}

/// Rejects payloads that must not touch storage at all.
pub fn validate(req: &CommitRequest) -> Result<(), SyncError> {
    if req.sequence_number < 1 {
        return Err(SyncError::Validation(format!(
            "sequence_number must be positive, got {}",
            req.sequence_number
        )));
    }
    for (element, value) in &req.raw {
        let def = schema::lookup(req.scorm_version, element)
            .filter(|d| !d.is_keyword())
            .ok_or_else(|| {
                SyncError::Validation(format!(
                    "unknown SCORM {} element {element:?}",
                    req.scorm_version
                ))
            })?;
        def.check_value(value)
            .map_err(|e| SyncError::Validation(format!("{element}: {e:?} for value {value:?}")))?;
    }
    Ok(())
}

/// Checks a request against the attempt it targets.
pub fn check_session(attempt: &Attempt, req: &CommitRequest) -> Result<(), SyncError> {
    if attempt.scorm_version != req.scorm_version {
        return Err(SyncError::Validation(format!(
            "session {} is SCORM {}, commit says {}",
            attempt.session_id, attempt.scorm_version, req.scorm_version
        )));
    }
    Ok(())
}

/// Applies `req` to `attempt` when its sequence number is new.
///
/// `created` is true when the attempt row was created for this request.
pub fn merge_commit(
    attempt: &mut Attempt,
    req: &CommitRequest,
    policy: &CompletionPolicy,
    created: bool,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut outcome = MergeOutcome {
        applied: false,
        newly_completed: false,
        delta: EnrollmentDelta {
            new_attempt: created,
            score: None,
            completed: false,
            time_delta_seconds: 0,
            at: now,
        },
    };
    if attempt.terminated || req.sequence_number <= attempt.last_sequence_number {
        tracing::debug!(
            session_id = %req.session_id,
            sequence = req.sequence_number,
            last = attempt.last_sequence_number,
            "commit already applied, acknowledging"
        );
        return outcome;
    }

    let previous_session_time = attempt.session_time_seconds;
    attempt
        .cmi_data
        .extend(req.raw.iter().map(|(k, v)| (k.clone(), v.clone())));
    derive_fields(attempt);

    attempt.last_sequence_number = req.sequence_number;
    attempt.commit_count += 1;
    attempt.last_commit_at = Some(now);
    attempt.terminated |= req.terminated;

    let signals = CompletionSignals {
        completion_status: attempt.completion_status.as_deref(),
        success_status: attempt.success_status.as_deref(),
        score_raw: attempt.score_raw,
        score_max: attempt.score_max,
        score_scaled: attempt.score_scaled,
    };
    if policy.is_complete(attempt.scorm_version, &signals) && !attempt.completed {
        attempt.completed = true;
        attempt.completed_at = Some(now);
        outcome.newly_completed = true;
    }

    outcome.applied = true;
    outcome.delta.score = attempt.score_raw;
    outcome.delta.completed = attempt.completed;
    outcome.delta.time_delta_seconds = attempt.session_time_seconds.saturating_sub(previous_session_time);
    outcome
}

fn non_empty<'a>(cmi: &'a BTreeMap<String, String>, key: &str) -> Option<&'a String> {
    cmi.get(key).filter(|v| !v.trim().is_empty())
}

fn decimal(cmi: &BTreeMap<String, String>, key: &str) -> Option<f64> {
    non_empty(cmi, key)
        .and_then(|v| v.trim().parse().ok())
        .filter(|v: &f64| v.is_finite())
}

/// Recomputes the typed columns from the merged CMI tree.
pub fn derive_fields(attempt: &mut Attempt) {
    let version: ScormVersion = attempt.scorm_version;
    let el = version.elements();
    let cmi = &attempt.cmi_data;

    attempt.score_raw = decimal(cmi, el.score_raw);
    attempt.score_min = decimal(cmi, el.score_min);
    attempt.score_max = decimal(cmi, el.score_max);
    attempt.score_scaled = el.score_scaled.and_then(|k| decimal(cmi, k));
    attempt.completion_status = non_empty(cmi, el.completion_status).cloned();
    attempt.success_status = el.success_status.and_then(|k| non_empty(cmi, k)).cloned();
    attempt.lesson_location = cmi.get(el.location).cloned();
    attempt.suspend_data = cmi.get(el.suspend_data).cloned();
    attempt.entry_mode = non_empty(cmi, el.entry).cloned();
    attempt.exit_mode = non_empty(cmi, el.exit).cloned();

    let session = non_empty(cmi, el.session_time)
        .and_then(|v| version.parse_duration(v))
        .unwrap_or(0);
    // Some authoring tools never report a cumulative total; the session time is
    // the best available approximation then.
    let total = non_empty(cmi, el.total_time)
        .and_then(|v| version.parse_duration(v))
        .filter(|t| *t > 0)
        .unwrap_or(session);
    attempt.session_time_seconds = session;
    attempt.total_time_seconds = total;

    attempt.interactions = groups::interactions(version, cmi);
    attempt.objectives = groups::objectives(version, cmi);
    attempt.comments = groups::comments(version, cmi);
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn request(seq: i64, pairs: &[(&str, &str)]) -> CommitRequest {
        CommitRequest {
            session_id: Uuid::nil(),
            sequence_number: seq,
            scorm_version: ScormVersion::Scorm2004,
            raw: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            terminated: false,
        }
    }

    fn attempt() -> Attempt {
        Attempt::new(Uuid::new_v4(), Uuid::nil(), ScormVersion::Scorm2004, Utc::now())
    }

    #[test]
    fn ordered_commits_union_last_write_wins() {
        let mut a = attempt();
        let policy = CompletionPolicy::default();
        let deltas = [
            request(1, &[("cmi.location", "p1"), ("cmi.suspend_data", "a")]),
            request(2, &[("cmi.location", "p2")]),
            request(3, &[("cmi.suspend_data", "b"), ("cmi.score.raw", "40")]),
        ];
        for (i, r) in deltas.iter().enumerate() {
            assert!(merge_commit(&mut a, r, &policy, i == 0, Utc::now()).applied);
        }
        let expected: BTreeMap<String, String> = [
            ("cmi.location", "p2"),
            ("cmi.suspend_data", "b"),
            ("cmi.score.raw", "40"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(a.cmi_data, expected);
        assert_eq!(a.lesson_location.as_deref(), Some("p2"));
        assert_eq!(a.commit_count, 3);
    }

    #[test]
    fn replay_is_a_no_op() {
        let mut a = attempt();
        let policy = CompletionPolicy::default();
        let r = request(1, &[("cmi.location", "p1")]);
        merge_commit(&mut a, &r, &policy, true, Utc::now());
        let before = a.clone();
        let again = merge_commit(&mut a, &r, &policy, false, Utc::now());
        assert!(!again.applied);
        assert_eq!(a, before);

        let stale = request(1, &[("cmi.location", "p0")]);
        assert!(!merge_commit(&mut a, &stale, &policy, false, Utc::now()).applied);
        assert_eq!(a.lesson_location.as_deref(), Some("p1"));
    }

    #[test]
    fn completion_without_score() {
        let mut a = attempt();
        let out = merge_commit(
            &mut a,
            &request(1, &[("cmi.completion_status", "completed")]),
            &CompletionPolicy::default(),
            true,
            Utc::now(),
        );
        assert!(out.newly_completed);
        assert!(out.delta.completed);
        assert_eq!(out.delta.score, None);
        assert!(a.completed_at.is_some());
    }

    #[test]
    fn total_time_falls_back_to_session_time() {
        let mut a = attempt();
        let policy = CompletionPolicy::default();
        let out = merge_commit(&mut a, &request(1, &[("cmi.session_time", "PT90S")]), &policy, true, Utc::now());
        assert_eq!(a.total_time_seconds, 90);
        assert_eq!(out.delta.time_delta_seconds, 90);

        let out = merge_commit(
            &mut a,
            &request(2, &[("cmi.session_time", "PT2M"), ("cmi.total_time", "PT10M")]),
            &policy,
            false,
            Utc::now(),
        );
        assert_eq!(a.total_time_seconds, 600);
        assert_eq!(out.delta.time_delta_seconds, 30);
    }

    #[test]
    fn terminated_attempt_ignores_later_commits() {
        let mut a = attempt();
        let policy = CompletionPolicy::default();
        let mut last = request(1, &[("cmi.exit", "suspend")]);
        last.terminated = true;
        merge_commit(&mut a, &last, &policy, true, Utc::now());
        assert!(a.terminated);
        assert!(!merge_commit(&mut a, &request(2, &[("cmi.location", "x")]), &policy, false, Utc::now()).applied);
    }

    #[test]
    fn validation_rejects_unknown_and_malformed() {
        assert!(validate(&request(1, &[("cmi.location", "p1")])).is_ok());
        assert!(validate(&request(0, &[])).is_err());
        assert!(validate(&request(1, &[("cmi.core.lesson_status", "passed")])).is_err());
        assert!(validate(&request(1, &[("cmi.score.scaled", "7")])).is_err());
        assert!(validate(&request(1, &[("cmi.interactions._count", "1")])).is_err());
    }

    #[test]
    fn groups_are_extracted_on_merge() {
        let mut a = attempt();
        merge_commit(
            &mut a,
            &request(
                1,
                &[
                    ("cmi.interactions.0.id", "q1"),
                    ("cmi.interactions.0.result", "correct"),
                    ("cmi.objectives.0.id", "o1"),
                    ("cmi.comments_from_learner.0.comment", "hi"),
                ],
            ),
            &CompletionPolicy::default(),
            true,
            Utc::now(),
        );
        assert_eq!(a.interactions.len(), 1);
        assert_eq!(a.objectives[0].id.as_deref(), Some("o1"));
        assert_eq!(a.comments[0].comment, "hi");
    }
}
