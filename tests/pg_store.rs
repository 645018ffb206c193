//! PgStore against a live Postgres. Skipped unless `DATABASE_URL` is set.

use std::sync::Arc;
use uuid::Uuid;

use scorm_tracker::{
    cmi::ScormVersion,
    completion::CompletionPolicy,
    db::{self, PgStore},
    models::{CommitRequest, EnrollmentStatus},
    store::Store,
};

async fn store() -> Option<PgStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let pool = db::connect(&url).await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    Some(PgStore::new(pool))
}

fn commit(session_id: Uuid, seq: i64, pairs: &[(&str, &str)]) -> CommitRequest {
    CommitRequest {
        session_id,
        sequence_number: seq,
        scorm_version: ScormVersion::Scorm12,
        raw: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        terminated: false,
    }
}

fn learner() -> String {
    format!("learner-{}", Uuid::new_v4())
}

#[tokio::test]
async fn replay_leaves_enrollment_and_projection_alone() {
    let Some(store) = store().await else { return };
    let (learner, unit, policy) = (learner(), Uuid::new_v4(), CompletionPolicy::default());
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();

    store
        .sync(&learner, unit, &commit(a, 1, &[("cmi.core.lesson_location", "old-A")]), &policy)
        .await
        .unwrap();
    store
        .sync(&learner, unit, &commit(b, 1, &[("cmi.core.lesson_location", "new-B")]), &policy)
        .await
        .unwrap();
    let before = store.legacy_progress(&learner, unit).await.unwrap().unwrap();

    let replay = store
        .sync(&learner, unit, &commit(a, 1, &[("cmi.core.lesson_location", "old-A")]), &policy)
        .await
        .unwrap();
    assert!(!replay.applied);
    assert_eq!(replay.enrollment.total_attempts, 2);

    let after = store.legacy_progress(&learner, unit).await.unwrap().unwrap();
    assert_eq!(after.bookmark.lesson_location.as_deref(), Some("new-B"));
    assert_eq!(after, before);
}

#[tokio::test]
async fn best_score_is_kept_across_attempts() {
    let Some(store) = store().await else { return };
    let (learner, unit, policy) = (learner(), Uuid::new_v4(), CompletionPolicy::default());

    let mut last = None;
    for (score, status) in [("40", "failed"), ("85", "passed"), ("60", "incomplete")] {
        let pairs = [("cmi.core.score.raw", score), ("cmi.core.lesson_status", status)];
        last = Some(
            store
                .sync(&learner, unit, &commit(Uuid::new_v4(), 1, &pairs), &policy)
                .await
                .unwrap(),
        );
    }
    let last = last.unwrap();
    assert_eq!(last.enrollment.best_score, Some(85.0));
    assert_eq!(last.enrollment.total_attempts, 3);
    assert_eq!(last.enrollment.enrollment_status, EnrollmentStatus::Completed);

    let legacy = store.legacy_progress(&learner, unit).await.unwrap().unwrap();
    assert_eq!(legacy.best_score, Some(85.0));
    assert!(legacy.completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commits_for_one_session_serialize() {
    let Some(store) = store().await else { return };
    let store = Arc::new(store);
    let (learner, unit) = (learner(), Uuid::new_v4());
    let session = Uuid::new_v4();

    let mut tasks = Vec::new();
    for seq in (1..=10).rev() {
        let (store, learner) = (store.clone(), learner.clone());
        tasks.push(tokio::spawn(async move {
            let page = format!("page-{seq}");
            let req = commit(session, seq, &[("cmi.core.lesson_location", page.as_str())]);
            store
                .sync(&learner, unit, &req, &CompletionPolicy::default())
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let detail = store.enrollment(&learner, unit).await.unwrap().unwrap();
    assert_eq!(detail.enrollment.total_attempts, 1);
    assert_eq!(detail.attempts.len(), 1);
    assert_eq!(detail.attempts[0].last_sequence_number, 10);
    let legacy = store.legacy_progress(&learner, unit).await.unwrap().unwrap();
    assert_eq!(legacy.bookmark.lesson_location.as_deref(), Some("page-10"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interleaved_sessions_both_count() {
    let Some(store) = store().await else { return };
    let (learner, unit, policy) = (learner(), Uuid::new_v4(), CompletionPolicy::default());

    let first = commit(Uuid::new_v4(), 1, &[("cmi.core.score.raw", "70")]);
    let second = commit(Uuid::new_v4(), 1, &[("cmi.core.score.raw", "90")]);
    let (a, b) = tokio::join!(
        store.sync(&learner, unit, &first, &policy),
        store.sync(&learner, unit, &second, &policy),
    );
    a.unwrap();
    b.unwrap();

    let detail = store.enrollment(&learner, unit).await.unwrap().unwrap();
    assert_eq!(detail.enrollment.total_attempts, 2);
    assert_eq!(detail.enrollment.best_score, Some(90.0));
}
