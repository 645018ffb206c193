//! Persistence seam for enrollments, attempts, the legacy projection and packages.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    completion::CompletionPolicy,
    error::{StoreError, SyncError},
    models::{
        Attempt, CommitRequest, Enrollment, EnrollmentDetail, LegacyProgress, Package, PriorProgress,
        ProgressSummary, SyncResponse,
    },
    sync,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Get-or-create the enrollment for a launch and hand back resumable progress.
    async fn launch(
        &self,
        learner_id: &str,
        unit_id: Uuid,
        fresh: bool,
    ) -> Result<(Enrollment, Option<PriorProgress>), StoreError>;

    /// Applies one runtime commit atomically.
    async fn sync(
        &self,
        learner_id: &str,
        unit_id: Uuid,
        req: &CommitRequest,
        policy: &CompletionPolicy,
    ) -> Result<SyncResponse, SyncError>;

    async fn legacy_progress(&self, learner_id: &str, unit_id: Uuid) -> Result<Option<LegacyProgress>, StoreError>;

    async fn enrollment(&self, learner_id: &str, unit_id: Uuid) -> Result<Option<EnrollmentDetail>, StoreError>;

    async fn reset_enrollment(&self, learner_id: &str, unit_id: Uuid) -> Result<Enrollment, StoreError>;

    async fn insert_package(&self, package: &Package) -> Result<(), StoreError>;

    async fn save_package(&self, package: &Package) -> Result<(), StoreError>;

    async fn package(&self, id: Uuid) -> Result<Option<Package>, StoreError>;

    /// Most recently updated ready package for a unit.
    async fn ready_package(&self, unit_id: Uuid) -> Result<Option<Package>, StoreError>;
}

type EnrollmentKey = (String, Uuid);

#[derive(Default)]
struct MemoryState {
    enrollments: HashMap<EnrollmentKey, Enrollment>,
    attempts: HashMap<Uuid, Attempt>,
    legacy: HashMap<EnrollmentKey, LegacyProgress>,
    packages: HashMap<Uuid, Package>,
}

impl MemoryState {
    fn latest_attempt(&self, enrollment_id: Uuid) -> Option<&Attempt> {
        self.attempts
            .values()
            .filter(|a| a.enrollment_id == enrollment_id)
            .max_by_key(|a| a.last_commit_at.unwrap_or(a.started_at))
    }
}

/// Process-local store; a single lock serialises every operation.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn launch(
        &self,
        learner_id: &str,
        unit_id: Uuid,
        fresh: bool,
    ) -> Result<(Enrollment, Option<PriorProgress>), StoreError> {
        let now = Utc::now();
        let mut st = self.state.lock();
        let enrollment = st
            .enrollments
            .entry((learner_id.to_string(), unit_id))
            .or_insert_with(|| Enrollment::new(learner_id, unit_id, now));
        enrollment.touch(now);
        if fresh {
            enrollment.reopen();
        }
        let enrollment = enrollment.clone();
        let prior = if fresh {
            None
        } else {
            st.latest_attempt(enrollment.id).map(Attempt::prior_progress)
        };
        Ok((enrollment, prior))
    }

    async fn sync(
        &self,
        learner_id: &str,
        unit_id: Uuid,
        req: &CommitRequest,
        policy: &CompletionPolicy,
    ) -> Result<SyncResponse, SyncError> {
        sync::validate(req)?;
        let now = Utc::now();
        let key = (learner_id.to_string(), unit_id);
        let mut st = self.state.lock();

        // Work on copies; nothing is written back unless every step succeeds.
        let mut enrollment = st
            .enrollments
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Enrollment::new(learner_id, unit_id, now));
        let (mut attempt, created) = match st.attempts.get(&req.session_id) {
            Some(a) => (a.clone(), false),
            None => (
                Attempt::new(enrollment.id, req.session_id, req.scorm_version, now),
                true,
            ),
        };
        if attempt.enrollment_id != enrollment.id {
            return Err(SyncError::SessionConflict(req.session_id));
        }
        sync::check_session(&attempt, req)?;

        let outcome = sync::merge_commit(&mut attempt, req, policy, created, now);
        let response = SyncResponse {
            ok: true,
            applied: outcome.applied,
            attempt: attempt.summary(),
            progress: ProgressSummary::of(&enrollment),
            enrollment: enrollment.clone(),
        };
        if !outcome.applied {
            return Ok(response);
        }

        enrollment.absorb(&outcome.delta);
        let legacy = LegacyProgress::project(&enrollment, Some(&attempt), now);
        let response = SyncResponse {
            progress: ProgressSummary::of(&enrollment),
            enrollment: enrollment.clone(),
            ..response
        };
        st.enrollments.insert(key.clone(), enrollment);
        st.attempts.insert(req.session_id, attempt);
        st.legacy.insert(key, legacy);
        Ok(response)
    }

    async fn legacy_progress(&self, learner_id: &str, unit_id: Uuid) -> Result<Option<LegacyProgress>, StoreError> {
        Ok(self
            .state
            .lock()
            .legacy
            .get(&(learner_id.to_string(), unit_id))
            .cloned())
    }

    async fn enrollment(&self, learner_id: &str, unit_id: Uuid) -> Result<Option<EnrollmentDetail>, StoreError> {
        let st = self.state.lock();
        let Some(enrollment) = st.enrollments.get(&(learner_id.to_string(), unit_id)) else {
            return Ok(None);
        };
        let mut attempts: Vec<&Attempt> = st
            .attempts
            .values()
            .filter(|a| a.enrollment_id == enrollment.id)
            .collect();
        attempts.sort_by_key(|a| a.started_at);
        Ok(Some(EnrollmentDetail {
            enrollment: enrollment.clone(),
            attempts: attempts.into_iter().map(Attempt::summary).collect(),
        }))
    }

    async fn reset_enrollment(&self, learner_id: &str, unit_id: Uuid) -> Result<Enrollment, StoreError> {
        let now = Utc::now();
        let key = (learner_id.to_string(), unit_id);
        let mut st = self.state.lock();
        let enrollment = st
            .enrollments
            .get_mut(&key)
            .ok_or(StoreError::NotFound("enrollment"))?;
        enrollment.reset();
        let enrollment = enrollment.clone();
        let legacy = LegacyProgress::project(&enrollment, st.latest_attempt(enrollment.id), now);
        st.legacy.insert(key, legacy);
        Ok(enrollment)
    }

    async fn insert_package(&self, package: &Package) -> Result<(), StoreError> {
        self.state.lock().packages.insert(package.id, package.clone());
        Ok(())
    }

    async fn save_package(&self, package: &Package) -> Result<(), StoreError> {
        let mut st = self.state.lock();
        let slot = st
            .packages
            .get_mut(&package.id)
            .ok_or(StoreError::NotFound("package"))?;
        *slot = package.clone();
        Ok(())
    }

    async fn package(&self, id: Uuid) -> Result<Option<Package>, StoreError> {
        Ok(self.state.lock().packages.get(&id).cloned())
    }

    async fn ready_package(&self, unit_id: Uuid) -> Result<Option<Package>, StoreError> {
        Ok(self
            .state
            .lock()
            .packages
            .values()
            .filter(|p| p.unit_id == unit_id && p.processing_status == crate::models::PackageStatus::Ready)
            .max_by_key(|p| p.updated_at)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmi::ScormVersion;
    use std::sync::Arc;
    use crate::models::EnrollmentStatus;

    fn commit(session_id: Uuid, seq: i64, pairs: &[(&str, &str)]) -> CommitRequest {
        CommitRequest {
            session_id,
            sequence_number: seq,
            scorm_version: ScormVersion::Scorm12,
            raw: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            terminated: false,
        }
    }

    #[tokio::test]
    async fn attempts_are_counted_per_session() {
        let store = MemoryStore::new();
        let unit = Uuid::new_v4();
        let policy = CompletionPolicy::default();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        store.sync("l1", unit, &commit(s1, 1, &[]), &policy).await.unwrap();
        store.sync("l1", unit, &commit(s1, 2, &[]), &policy).await.unwrap();
        let r = store.sync("l1", unit, &commit(s2, 1, &[]), &policy).await.unwrap();
        assert_eq!(r.enrollment.total_attempts, 2);
    }

    #[tokio::test]
    async fn best_score_and_monotonic_status_across_attempts() {
        let store = MemoryStore::new();
        let unit = Uuid::new_v4();
        let policy = CompletionPolicy::default();
        let runs: [(&str, &str); 3] = [("40", "failed"), ("85", "passed"), ("60", "incomplete")];
        let mut last = None;
        for (score, status) in runs {
            let r = store
                .sync(
                    "l1",
                    unit,
                    &commit(
                        Uuid::new_v4(),
                        1,
                        &[("cmi.core.score.raw", score), ("cmi.core.lesson_status", status)],
                    ),
                    &policy,
                )
                .await
                .unwrap();
            last = Some(r);
        }
        let last = last.unwrap();
        assert_eq!(last.enrollment.best_score, Some(85.0));
        assert_eq!(last.enrollment.enrollment_status, EnrollmentStatus::Completed);
        assert!(last.progress.completed);
        assert!(!last.attempt.completed);
    }

    #[tokio::test]
    async fn invalid_commit_writes_nothing() {
        let store = MemoryStore::new();
        let unit = Uuid::new_v4();
        let session = Uuid::new_v4();
        let err = store
            .sync(
                "l1",
                unit,
                &commit(session, 1, &[("cmi.core.lesson_location", "p1"), ("cmi.nope", "x")]),
                &CompletionPolicy::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(store.enrollment("l1", unit).await.unwrap().is_none());

        // the session was never created, so a clean first commit opens it
        let r = store
            .sync("l1", unit, &commit(session, 1, &[]), &CompletionPolicy::default())
            .await
            .unwrap();
        assert!(r.applied);
        assert_eq!(r.enrollment.total_attempts, 1);
    }

    #[tokio::test]
    async fn replay_from_older_session_keeps_projection() {
        let store = MemoryStore::new();
        let unit = Uuid::new_v4();
        let policy = CompletionPolicy::default();
        let old = commit(Uuid::new_v4(), 1, &[("cmi.core.lesson_location", "old-A")]);
        store.sync("l1", unit, &old, &policy).await.unwrap();
        store
            .sync(
                "l1",
                unit,
                &commit(Uuid::new_v4(), 1, &[("cmi.core.lesson_location", "new-B")]),
                &policy,
            )
            .await
            .unwrap();
        let before = store.legacy_progress("l1", unit).await.unwrap().unwrap();

        let r = store.sync("l1", unit, &old, &policy).await.unwrap();
        assert!(!r.applied);
        assert_eq!(r.enrollment.total_attempts, 2);
        let after = store.legacy_progress("l1", unit).await.unwrap().unwrap();
        assert_eq!(after.bookmark.lesson_location.as_deref(), Some("new-B"));
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn oversized_session_time_is_rejected() {
        let store = MemoryStore::new();
        let unit = Uuid::new_v4();
        let policy = CompletionPolicy::default();
        let huge = CommitRequest {
            scorm_version: ScormVersion::Scorm2004,
            ..commit(Uuid::new_v4(), 1, &[("cmi.session_time", "PT5000000000000000000S")])
        };
        let err = store.sync("l1", unit, &huge, &policy).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let ok = CommitRequest {
            scorm_version: ScormVersion::Scorm2004,
            ..commit(Uuid::new_v4(), 1, &[("cmi.session_time", "PT9999H")])
        };
        let r = store.sync("l1", unit, &ok, &policy).await.unwrap();
        assert_eq!(r.enrollment.cumulative_time_seconds, 9999 * 3600);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_for_one_session_serialize() {
        let store = Arc::new(MemoryStore::new());
        let unit = Uuid::new_v4();
        let session = Uuid::new_v4();
        let policy = CompletionPolicy::default();

        let tasks: Vec<_> = (1..=20)
            .rev()
            .map(|seq| {
                let store = store.clone();
                let location = format!("page-{seq}");
                tokio::spawn(async move {
                    let req = commit(session, seq, &[("cmi.core.lesson_location", location.as_str())]);
                    store.sync("l1", unit, &req, &policy).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let detail = store.enrollment("l1", unit).await.unwrap().unwrap();
        assert_eq!(detail.enrollment.total_attempts, 1);
        assert_eq!(detail.attempts.len(), 1);
        assert_eq!(detail.attempts[0].last_sequence_number, 20);
        let legacy = store.legacy_progress("l1", unit).await.unwrap().unwrap();
        assert_eq!(legacy.bookmark.lesson_location.as_deref(), Some("page-20"));
    }

    #[tokio::test]
    async fn interleaved_sessions_both_count() {
        let store = MemoryStore::new();
        let unit = Uuid::new_v4();
        let policy = CompletionPolicy::default();
        let a = commit(Uuid::new_v4(), 1, &[("cmi.core.score.raw", "70")]);
        let b = commit(Uuid::new_v4(), 1, &[("cmi.core.score.raw", "90")]);
        let (ra, rb) = tokio::join!(
            store.sync("l1", unit, &a, &policy),
            store.sync("l1", unit, &b, &policy)
        );
        assert!(ra.unwrap().applied && rb.unwrap().applied);
        let detail = store.enrollment("l1", unit).await.unwrap().unwrap();
        assert_eq!(detail.enrollment.total_attempts, 2);
        assert_eq!(detail.enrollment.best_score, Some(90.0));
    }

    #[tokio::test]
    async fn session_cannot_move_between_learners() {
        let store = MemoryStore::new();
        let unit = Uuid::new_v4();
        let session = Uuid::new_v4();
        let policy = CompletionPolicy::default();
        store.sync("l1", unit, &commit(session, 1, &[]), &policy).await.unwrap();
        let err = store
            .sync("l2", unit, &commit(session, 2, &[]), &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionConflict(_)));
    }

    #[tokio::test]
    async fn launch_hands_back_latest_bookmark() {
        let store = MemoryStore::new();
        let unit = Uuid::new_v4();
        let (e, prior) = store.launch("l1", unit, false).await.unwrap();
        assert_eq!(e.enrollment_status, EnrollmentStatus::NotStarted);
        assert!(prior.is_none());

        store
            .sync(
                "l1",
                unit,
                &commit(
                    Uuid::new_v4(),
                    1,
                    &[("cmi.core.lesson_location", "slide-5"), ("cmi.suspend_data", "{...}")],
                ),
                &CompletionPolicy::default(),
            )
            .await
            .unwrap();
        let (_, prior) = store.launch("l1", unit, false).await.unwrap();
        let prior = prior.unwrap();
        assert_eq!(prior.lesson_location.as_deref(), Some("slide-5"));
        assert_eq!(prior.entry.as_deref(), Some("resume"));

        let (_, fresh) = store.launch("l1", unit, true).await.unwrap();
        assert!(fresh.is_none());
    }

    #[tokio::test]
    async fn reset_reopens_enrollment() {
        let store = MemoryStore::new();
        let unit = Uuid::new_v4();
        store
            .sync(
                "l1",
                unit,
                &commit(Uuid::new_v4(), 1, &[("cmi.core.lesson_status", "completed")]),
                &CompletionPolicy::default(),
            )
            .await
            .unwrap();
        let e = store.reset_enrollment("l1", unit).await.unwrap();
        assert_eq!(e.enrollment_status, EnrollmentStatus::NotStarted);
        let legacy = store.legacy_progress("l1", unit).await.unwrap().unwrap();
        assert!(!legacy.completed);
        assert!(store.reset_enrollment("nobody", unit).await.is_err());
    }
}
