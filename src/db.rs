use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, FromRow, Pool, Postgres, Transaction};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{
    cmi::groups::{Comment, Interaction, Objective},
    completion::CompletionPolicy,
    error::{StoreError, SyncError},
    models::{
        Attempt, Bookmark, CommitRequest, Enrollment, EnrollmentDelta, EnrollmentDetail, LegacyProgress, Package,
        PriorProgress, ProgressSummary, SyncResponse,
    },
    store::Store,
    sync,
};

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str) -> Result<Db> {
    Ok(PgPoolOptions::new().max_connections(16).connect(url).await?)
}

#[derive(FromRow)]
struct EnrollmentRow {
    id: Uuid,
    learner_id: String,
    unit_id: Uuid,
    total_attempts: i32,
    best_score: Option<f64>,
    enrollment_status: String,
    cumulative_time_seconds: i64,
    first_accessed_at: Option<DateTime<Utc>>,
    last_accessed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StoreError;

    fn try_from(r: EnrollmentRow) -> Result<Self, StoreError> {
        Ok(Enrollment {
            id: r.id,
            learner_id: r.learner_id,
            unit_id: r.unit_id,
            total_attempts: r.total_attempts,
            best_score: r.best_score,
            enrollment_status: r.enrollment_status.parse().map_err(StoreError::Corrupt)?,
            cumulative_time_seconds: r.cumulative_time_seconds,
            first_accessed_at: r.first_accessed_at,
            last_accessed_at: r.last_accessed_at,
            created_at: r.created_at,
        })
    }
}

#[derive(FromRow)]
struct AttemptRow {
    id: Uuid,
    enrollment_id: Uuid,
    session_id: Uuid,
    scorm_version: String,
    last_sequence_number: i64,
    cmi_data: Json<BTreeMap<String, String>>,
    score_raw: Option<f64>,
    score_min: Option<f64>,
    score_max: Option<f64>,
    score_scaled: Option<f64>,
    completion_status: Option<String>,
    success_status: Option<String>,
    lesson_location: Option<String>,
    suspend_data: Option<String>,
    entry_mode: Option<String>,
    exit_mode: Option<String>,
    total_time_seconds: i64,
    session_time_seconds: i64,
    interactions: Json<Vec<Interaction>>,
    objectives: Json<Vec<Objective>>,
    comments: Json<Vec<Comment>>,
    completed: bool,
    terminated: bool,
    commit_count: i32,
    started_at: DateTime<Utc>,
    last_commit_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<AttemptRow> for Attempt {
    type Error = StoreError;

    fn try_from(r: AttemptRow) -> Result<Self, StoreError> {
        Ok(Attempt {
            id: r.id,
            enrollment_id: r.enrollment_id,
            session_id: r.session_id,
            scorm_version: r.scorm_version.parse().map_err(StoreError::Corrupt)?,
            last_sequence_number: r.last_sequence_number,
            cmi_data: r.cmi_data.0,
            score_raw: r.score_raw,
            score_min: r.score_min,
            score_max: r.score_max,
            score_scaled: r.score_scaled,
            completion_status: r.completion_status,
            success_status: r.success_status,
            lesson_location: r.lesson_location,
            suspend_data: r.suspend_data,
            entry_mode: r.entry_mode,
            exit_mode: r.exit_mode,
            total_time_seconds: r.total_time_seconds,
            session_time_seconds: r.session_time_seconds,
            interactions: r.interactions.0,
            objectives: r.objectives.0,
            comments: r.comments.0,
            completed: r.completed,
            terminated: r.terminated,
            commit_count: r.commit_count,
            started_at: r.started_at,
            last_commit_at: r.last_commit_at,
            completed_at: r.completed_at,
        })
    }
}

#[derive(FromRow)]
struct LegacyRow {
    learner_id: String,
    unit_id: Uuid,
    best_score: Option<f64>,
    completed: bool,
    lesson_location: Option<String>,
    suspend_data: Option<String>,
    total_time_seconds: i64,
    updated_at: DateTime<Utc>,
}

impl From<LegacyRow> for LegacyProgress {
    fn from(r: LegacyRow) -> Self {
        LegacyProgress {
            learner_id: r.learner_id,
            unit_id: r.unit_id,
            best_score: r.best_score,
            completed: r.completed,
            bookmark: Bookmark {
                lesson_location: r.lesson_location,
                suspend_data: r.suspend_data,
            },
            total_time_seconds: r.total_time_seconds,
            updated_at: r.updated_at,
        }
    }
}

#[derive(FromRow)]
struct PackageRow {
    id: Uuid,
    unit_id: Uuid,
    title: String,
    scorm_version: Option<String>,
    entry_point_href: Option<String>,
    authoring_tool: Option<String>,
    manifest_data: serde_json::Value,
    resource_list: Json<Vec<String>>,
    processing_status: String,
    processing_error: Option<String>,
    base_path: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PackageRow> for Package {
    type Error = StoreError;

    fn try_from(r: PackageRow) -> Result<Self, StoreError> {
        Ok(Package {
            id: r.id,
            unit_id: r.unit_id,
            title: r.title,
            scorm_version: r
                .scorm_version
                .map(|v| v.parse())
                .transpose()
                .map_err(StoreError::Corrupt)?,
            entry_point_href: r.entry_point_href,
            authoring_tool: r.authoring_tool,
            manifest_data: r.manifest_data,
            resource_list: r.resource_list.0,
            processing_status: r.processing_status.parse().map_err(StoreError::Corrupt)?,
            processing_error: r.processing_error,
            base_path: r.base_path,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

/// Postgres-backed store. Every sync runs in one transaction holding a row lock
/// on the Attempt; Enrollment aggregation uses in-place SQL arithmetic so
/// commits from different sessions never overwrite each other's results.
#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

type Tx<'a> = Transaction<'a, Postgres>;

async fn get_or_create_enrollment(
    tx: &mut Tx<'_>,
    learner_id: &str,
    unit_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Enrollment, StoreError> {
    let row = sqlx::query_as::<_, EnrollmentRow>(
        r#"
        INSERT INTO enrollments (id, learner_id, unit_id, first_accessed_at, last_accessed_at)
        VALUES ($1, $2, $3, $4, $4)
        ON CONFLICT (learner_id, unit_id)
        DO UPDATE SET last_accessed_at = EXCLUDED.last_accessed_at,
                      first_accessed_at = COALESCE(enrollments.first_accessed_at, EXCLUDED.first_accessed_at)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(learner_id)
    .bind(unit_id)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?;
    row.try_into()
}

async fn latest_attempt(tx: &mut Tx<'_>, enrollment_id: Uuid) -> Result<Option<Attempt>, StoreError> {
    sqlx::query_as::<_, AttemptRow>(
        r#"
        SELECT * FROM attempts WHERE enrollment_id = $1
        ORDER BY COALESCE(last_commit_at, started_at) DESC
        LIMIT 1
        "#,
    )
    .bind(enrollment_id)
    .fetch_optional(&mut **tx)
    .await?
    .map(Attempt::try_from)
    .transpose()
}

async fn apply_enrollment_delta(
    tx: &mut Tx<'_>,
    enrollment_id: Uuid,
    delta: &EnrollmentDelta,
) -> Result<Enrollment, StoreError> {
    // GREATEST ignores NULLs, so a first score simply lands.
    let row = sqlx::query_as::<_, EnrollmentRow>(
        r#"
        UPDATE enrollments SET
            total_attempts = total_attempts + $2,
            best_score = GREATEST(best_score, $3::float8),
            enrollment_status = CASE
                WHEN $4::bool THEN 'completed'
                WHEN enrollment_status = 'not_started' THEN 'in_progress'
                ELSE enrollment_status
            END,
            cumulative_time_seconds = GREATEST(LEAST(cumulative_time_seconds::numeric + $5, 9223372036854775807)::int8, 0),
            first_accessed_at = COALESCE(first_accessed_at, $6),
            last_accessed_at = $6
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(enrollment_id)
    .bind(i32::from(delta.new_attempt))
    .bind(delta.score)
    .bind(delta.completed)
    .bind(delta.time_delta_seconds)
    .bind(delta.at)
    .fetch_one(&mut **tx)
    .await?;
    row.try_into()
}

async fn write_attempt(tx: &mut Tx<'_>, a: &Attempt) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE attempts SET
            last_sequence_number = $2, cmi_data = $3,
            score_raw = $4, score_min = $5, score_max = $6, score_scaled = $7,
            completion_status = $8, success_status = $9,
            lesson_location = $10, suspend_data = $11, entry_mode = $12, exit_mode = $13,
            total_time_seconds = $14, session_time_seconds = $15,
            interactions = $16, objectives = $17, comments = $18,
            completed = $19, terminated = $20, commit_count = $21,
            last_commit_at = $22, completed_at = $23
        WHERE id = $1
        "#,
    )
    .bind(a.id)
    .bind(a.last_sequence_number)
    .bind(Json(&a.cmi_data))
    .bind(a.score_raw)
    .bind(a.score_min)
    .bind(a.score_max)
    .bind(a.score_scaled)
    .bind(&a.completion_status)
    .bind(&a.success_status)
    .bind(&a.lesson_location)
    .bind(&a.suspend_data)
    .bind(&a.entry_mode)
    .bind(&a.exit_mode)
    .bind(a.total_time_seconds)
    .bind(a.session_time_seconds)
    .bind(Json(&a.interactions))
    .bind(Json(&a.objectives))
    .bind(Json(&a.comments))
    .bind(a.completed)
    .bind(a.terminated)
    .bind(a.commit_count)
    .bind(a.last_commit_at)
    .bind(a.completed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_legacy(tx: &mut Tx<'_>, p: &LegacyProgress) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO legacy_progress
            (learner_id, unit_id, best_score, completed, lesson_location, suspend_data, total_time_seconds, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (learner_id, unit_id) DO UPDATE SET
            best_score = EXCLUDED.best_score,
            completed = EXCLUDED.completed,
            lesson_location = EXCLUDED.lesson_location,
            suspend_data = EXCLUDED.suspend_data,
            total_time_seconds = EXCLUDED.total_time_seconds,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&p.learner_id)
    .bind(p.unit_id)
    .bind(p.best_score)
    .bind(p.completed)
    .bind(&p.bookmark.lesson_location)
    .bind(&p.bookmark.suspend_data)
    .bind(p.total_time_seconds)
    .bind(p.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn bind_package<'q>(
    q: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    p: &'q Package,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    q.bind(p.id)
        .bind(p.unit_id)
        .bind(&p.title)
        .bind(p.scorm_version.map(|v| v.as_str()))
        .bind(&p.entry_point_href)
        .bind(&p.authoring_tool)
        .bind(&p.manifest_data)
        .bind(Json(&p.resource_list))
        .bind(p.processing_status.as_str())
        .bind(&p.processing_error)
        .bind(&p.base_path)
        .bind(p.created_at)
        .bind(p.updated_at)
}

#[async_trait]
impl Store for PgStore {
    async fn launch(
        &self,
        learner_id: &str,
        unit_id: Uuid,
        fresh: bool,
    ) -> Result<(Enrollment, Option<PriorProgress>), StoreError> {
        let mut tx = self.db.begin().await?;
        let mut enrollment = get_or_create_enrollment(&mut tx, learner_id, unit_id, Utc::now()).await?;
        let prior = if fresh {
            if let Some(row) = sqlx::query_as::<_, EnrollmentRow>(
                r#"
                UPDATE enrollments SET enrollment_status = 'in_progress'
                WHERE id = $1 AND enrollment_status = 'completed'
                RETURNING *
                "#,
            )
            .bind(enrollment.id)
            .fetch_optional(&mut *tx)
            .await?
            {
                enrollment = row.try_into()?;
            }
            None
        } else {
            latest_attempt(&mut tx, enrollment.id)
                .await?
                .map(|a| a.prior_progress())
        };
        tx.commit().await?;
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
        let mut tx = self.db.begin().await.map_err(StoreError::from)?;

        let enrollment = get_or_create_enrollment(&mut tx, learner_id, unit_id, now).await?;

        let created = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO attempts (id, enrollment_id, session_id, scorm_version, started_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (session_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(enrollment.id)
        .bind(req.session_id)
        .bind(req.scorm_version.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?
        .is_some();

        // Serialises concurrent commits for the same session.
        let mut attempt: Attempt = sqlx::query_as::<_, AttemptRow>(
            "SELECT * FROM attempts WHERE session_id = $1 FOR UPDATE",
        )
        .bind(req.session_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from)?
        .try_into()?;

        if attempt.enrollment_id != enrollment.id {
            return Err(SyncError::SessionConflict(req.session_id));
        }
        sync::check_session(&attempt, req)?;

        let outcome = sync::merge_commit(&mut attempt, req, policy, created, now);
        // Replays leave the enrollment and the projection as they are.
        let enrollment = if outcome.applied {
            write_attempt(&mut tx, &attempt).await?;
            let enrollment = apply_enrollment_delta(&mut tx, enrollment.id, &outcome.delta).await?;
            upsert_legacy(&mut tx, &LegacyProgress::project(&enrollment, Some(&attempt), now)).await?;
            enrollment
        } else {
            enrollment
        };
        tx.commit().await.map_err(StoreError::from)?;

        if outcome.newly_completed {
            tracing::info!(session_id = %req.session_id, learner_id, %unit_id, "attempt completed");
        }
        Ok(SyncResponse {
            ok: true,
            applied: outcome.applied,
            attempt: attempt.summary(),
            progress: ProgressSummary::of(&enrollment),
            enrollment,
        })
    }

    async fn legacy_progress(&self, learner_id: &str, unit_id: Uuid) -> Result<Option<LegacyProgress>, StoreError> {
        let row = sqlx::query_as::<_, LegacyRow>(
            "SELECT * FROM legacy_progress WHERE learner_id = $1 AND unit_id = $2",
        )
        .bind(learner_id)
        .bind(unit_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn enrollment(&self, learner_id: &str, unit_id: Uuid) -> Result<Option<EnrollmentDetail>, StoreError> {
        let Some(row) = sqlx::query_as::<_, EnrollmentRow>(
            "SELECT * FROM enrollments WHERE learner_id = $1 AND unit_id = $2",
        )
        .bind(learner_id)
        .bind(unit_id)
        .fetch_optional(&self.db)
        .await?
        else {
            return Ok(None);
        };
        let enrollment: Enrollment = row.try_into()?;
        let attempts = sqlx::query_as::<_, AttemptRow>(
            "SELECT * FROM attempts WHERE enrollment_id = $1 ORDER BY started_at",
        )
        .bind(enrollment.id)
        .fetch_all(&self.db)
        .await?
        .into_iter()
        .map(|r| Attempt::try_from(r).map(|a| a.summary()))
        .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(EnrollmentDetail { enrollment, attempts }))
    }

    async fn reset_enrollment(&self, learner_id: &str, unit_id: Uuid) -> Result<Enrollment, StoreError> {
        let mut tx = self.db.begin().await?;
        let enrollment: Enrollment = sqlx::query_as::<_, EnrollmentRow>(
            r#"
            UPDATE enrollments SET enrollment_status = 'not_started'
            WHERE learner_id = $1 AND unit_id = $2
            RETURNING *
            "#,
        )
        .bind(learner_id)
        .bind(unit_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound("enrollment"))?
        .try_into()?;
        let latest = latest_attempt(&mut tx, enrollment.id).await?;
        upsert_legacy(&mut tx, &LegacyProgress::project(&enrollment, latest.as_ref(), Utc::now())).await?;
        tx.commit().await?;
        tracing::info!(learner_id, %unit_id, "enrollment reset");
        Ok(enrollment)
    }

    async fn insert_package(&self, package: &Package) -> Result<(), StoreError> {
        bind_package(
            sqlx::query(
                r#"
                INSERT INTO packages (id, unit_id, title, scorm_version, entry_point_href, authoring_tool,
                    manifest_data, resource_list, processing_status, processing_error, base_path,
                    created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            ),
            package,
        )
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn save_package(&self, package: &Package) -> Result<(), StoreError> {
        let res = bind_package(
            sqlx::query(
                r#"
                UPDATE packages SET unit_id = $2, title = $3, scorm_version = $4, entry_point_href = $5,
                    authoring_tool = $6, manifest_data = $7, resource_list = $8, processing_status = $9,
                    processing_error = $10, base_path = $11, created_at = $12, updated_at = $13
                WHERE id = $1
                "#,
            ),
            package,
        )
        .execute(&self.db)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound("package"));
        }
        Ok(())
    }

    async fn package(&self, id: Uuid) -> Result<Option<Package>, StoreError> {
        sqlx::query_as::<_, PackageRow>("SELECT * FROM packages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .map(Package::try_from)
            .transpose()
    }

    async fn ready_package(&self, unit_id: Uuid) -> Result<Option<Package>, StoreError> {
        sqlx::query_as::<_, PackageRow>(
            r#"
            SELECT * FROM packages
            WHERE unit_id = $1 AND processing_status = 'ready'
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(unit_id)
        .fetch_optional(&self.db)
        .await?
        .map(Package::try_from)
        .transpose()
    }
}
