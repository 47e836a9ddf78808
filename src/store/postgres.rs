use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{ReviewStore, ScheduleClose};
use crate::curve::ForgettingCurveProfile;
use crate::error::{EngineError, EngineResult};
use crate::types::{ItemBaseline, Level, ReviewSchedule, ReviewStatus};

const SCHEDULE_COLUMNS: &str = r#""id", "userId", "itemId", "currentLevel", "status",
    "scheduledAt", "nextScheduledAt", "isSuccess", "responseTimeMs", "confidenceLevel",
    "difficultyScoreAtReview", "supersedes", "createdAt", "updatedAt""#;

/// Postgres system of record.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(store_err)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> EngineResult<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS "review_schedules" (
                "id" TEXT PRIMARY KEY,
                "userId" TEXT NOT NULL,
                "itemId" TEXT NOT NULL,
                "currentLevel" INT NOT NULL,
                "status" TEXT NOT NULL,
                "scheduledAt" TIMESTAMPTZ NOT NULL,
                "nextScheduledAt" TIMESTAMPTZ,
                "isSuccess" BOOLEAN,
                "responseTimeMs" BIGINT,
                "confidenceLevel" INT,
                "difficultyScoreAtReview" DOUBLE PRECISION,
                "supersedes" TEXT,
                "createdAt" TIMESTAMPTZ NOT NULL,
                "updatedAt" TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS "review_schedules_pair_idx"
                ON "review_schedules" ("userId", "itemId")"#,
            r#"CREATE INDEX IF NOT EXISTS "review_schedules_due_idx"
                ON "review_schedules" ("status", "scheduledAt")"#,
            r#"CREATE TABLE IF NOT EXISTS "forgetting_profiles" (
                "userId" TEXT PRIMARY KEY,
                "retentionFactor" DOUBLE PRECISION NOT NULL,
                "difficultyAdjustments" JSONB NOT NULL DEFAULT '{}',
                "totalReviews" BIGINT NOT NULL DEFAULT 0,
                "totalSuccesses" BIGINT NOT NULL DEFAULT 0,
                "totalFailures" BIGINT NOT NULL DEFAULT 0,
                "consecutiveFailures" INT NOT NULL DEFAULT 0,
                "updatedAt" TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS "item_baselines" (
                "itemId" TEXT PRIMARY KEY,
                "subject" TEXT,
                "baseDifficulty" DOUBLE PRECISION NOT NULL,
                "successRate" DOUBLE PRECISION NOT NULL,
                "totalReviews" BIGINT NOT NULL DEFAULT 0,
                "updatedAt" TIMESTAMPTZ NOT NULL
            )"#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReviewStore for PgStore {
    async fn get_schedule(&self, id: &str) -> EngineResult<Option<ReviewSchedule>> {
        let query = format!(
            r#"SELECT {SCHEDULE_COLUMNS} FROM "review_schedules" WHERE "id" = $1"#
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        row.as_ref().map(parse_schedule_row).transpose()
    }

    async fn active_schedule(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> EngineResult<Option<ReviewSchedule>> {
        let query = format!(
            r#"SELECT {SCHEDULE_COLUMNS} FROM "review_schedules"
               WHERE "userId" = $1 AND "itemId" = $2 AND "status" IN ('SCHEDULED', 'OVERDUE')
               ORDER BY "createdAt" DESC LIMIT 1"#
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        row.as_ref().map(parse_schedule_row).transpose()
    }

    async fn latest_schedule(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> EngineResult<Option<ReviewSchedule>> {
        let query = format!(
            r#"SELECT {SCHEDULE_COLUMNS} FROM "review_schedules"
               WHERE "userId" = $1 AND "itemId" = $2
               ORDER BY "updatedAt" DESC LIMIT 1"#
        );
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        row.as_ref().map(parse_schedule_row).transpose()
    }

    async fn insert_schedule(
        &self,
        schedule: &ReviewSchedule,
        tolerating: Option<&str>,
    ) -> EngineResult<()> {
        // Conditional create: the INSERT lands only if no other active row
        // exists for the pair. A partial unique index cannot express the
        // tolerated predecessor, so the guard lives in the statement.
        let result = sqlx::query(
            r#"INSERT INTO "review_schedules"
               ("id", "userId", "itemId", "currentLevel", "status", "scheduledAt",
                "nextScheduledAt", "isSuccess", "responseTimeMs", "confidenceLevel",
                "difficultyScoreAtReview", "supersedes", "createdAt", "updatedAt")
               SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
               WHERE NOT EXISTS (
                   SELECT 1 FROM "review_schedules"
                   WHERE "userId" = $2 AND "itemId" = $3
                     AND "status" IN ('SCHEDULED', 'OVERDUE')
                     AND "id" <> $15
               )"#,
        )
        .bind(&schedule.id)
        .bind(&schedule.user_id)
        .bind(&schedule.item_id)
        .bind(schedule.current_level.get() as i32)
        .bind(schedule.status.as_str())
        .bind(schedule.scheduled_at)
        .bind(schedule.next_scheduled_at)
        .bind(schedule.is_success)
        .bind(schedule.response_time_ms)
        .bind(schedule.confidence_level)
        .bind(schedule.difficulty_score_at_review)
        .bind(&schedule.supersedes)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .bind(tolerating.unwrap_or(""))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!(
                "active schedule already exists for ({}, {})",
                schedule.user_id, schedule.item_id
            )));
        }
        Ok(())
    }

    async fn close_schedule(&self, id: &str, close: ScheduleClose) -> EngineResult<ReviewSchedule> {
        let query = format!(
            r#"UPDATE "review_schedules"
               SET "status" = $2, "isSuccess" = $3, "responseTimeMs" = $4,
                   "confidenceLevel" = $5, "difficultyScoreAtReview" = $6,
                   "nextScheduledAt" = $7, "updatedAt" = $8
               WHERE "id" = $1 AND "status" IN ('SCHEDULED', 'OVERDUE')
               RETURNING {SCHEDULE_COLUMNS}"#
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(close.status.as_str())
            .bind(close.is_success)
            .bind(close.response_time_ms)
            .bind(close.confidence_level)
            .bind(close.difficulty_score_at_review)
            .bind(close.next_scheduled_at)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        match row {
            Some(row) => parse_schedule_row(&row),
            None => {
                // Distinguish a closed row from a missing one.
                let exists: Option<i32> =
                    sqlx::query_scalar(r#"SELECT 1 FROM "review_schedules" WHERE "id" = $1"#)
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(store_err)?;
                if exists.is_some() {
                    Err(EngineError::Conflict(format!(
                        "schedule {id} is already closed"
                    )))
                } else {
                    Err(EngineError::NotFound(format!("schedule {id}")))
                }
            }
        }
    }

    async fn mark_overdue(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let result = sqlx::query(
            r#"UPDATE "review_schedules"
               SET "status" = 'OVERDUE', "updatedAt" = $2
               WHERE "status" = 'SCHEDULED' AND "scheduledAt" < $1"#,
        )
        .bind(cutoff)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(result.rows_affected())
    }

    async fn get_profile(&self, user_id: &str) -> EngineResult<Option<ForgettingCurveProfile>> {
        let row = sqlx::query(
            r#"SELECT "userId", "retentionFactor", "difficultyAdjustments", "totalReviews",
                      "totalSuccesses", "totalFailures", "consecutiveFailures", "updatedAt"
               FROM "forgetting_profiles" WHERE "userId" = $1"#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        let Some(row) = row else { return Ok(None) };
        let adjustments: serde_json::Value =
            row.try_get("difficultyAdjustments").map_err(store_err)?;

        Ok(Some(ForgettingCurveProfile {
            user_id: row.try_get("userId").map_err(store_err)?,
            retention_factor: row.try_get("retentionFactor").map_err(store_err)?,
            difficulty_adjustments: serde_json::from_value(adjustments).unwrap_or_default(),
            total_reviews: row.try_get("totalReviews").map_err(store_err)?,
            total_successes: row.try_get("totalSuccesses").map_err(store_err)?,
            total_failures: row.try_get("totalFailures").map_err(store_err)?,
            consecutive_failures: row.try_get("consecutiveFailures").map_err(store_err)?,
            updated_at: row.try_get("updatedAt").map_err(store_err)?,
        }))
    }

    async fn upsert_profile(&self, profile: &ForgettingCurveProfile) -> EngineResult<()> {
        let adjustments =
            serde_json::to_value(&profile.difficulty_adjustments).unwrap_or_default();

        sqlx::query(
            r#"INSERT INTO "forgetting_profiles"
               ("userId", "retentionFactor", "difficultyAdjustments", "totalReviews",
                "totalSuccesses", "totalFailures", "consecutiveFailures", "updatedAt")
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT ("userId") DO UPDATE SET
               "retentionFactor" = $2,
               "difficultyAdjustments" = $3,
               "totalReviews" = $4,
               "totalSuccesses" = $5,
               "totalFailures" = $6,
               "consecutiveFailures" = $7,
               "updatedAt" = $8"#,
        )
        .bind(&profile.user_id)
        .bind(profile.retention_factor)
        .bind(adjustments)
        .bind(profile.total_reviews)
        .bind(profile.total_successes)
        .bind(profile.total_failures)
        .bind(profile.consecutive_failures)
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn get_item_baseline(&self, item_id: &str) -> EngineResult<Option<ItemBaseline>> {
        let row = sqlx::query(
            r#"SELECT "itemId", "subject", "baseDifficulty", "successRate", "totalReviews", "updatedAt"
               FROM "item_baselines" WHERE "itemId" = $1"#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(ItemBaseline {
            item_id: row.try_get("itemId").map_err(store_err)?,
            subject: row.try_get("subject").map_err(store_err)?,
            base_difficulty: row.try_get("baseDifficulty").map_err(store_err)?,
            success_rate: row.try_get("successRate").map_err(store_err)?,
            total_reviews: row.try_get("totalReviews").map_err(store_err)?,
            updated_at: row.try_get("updatedAt").map_err(store_err)?,
        }))
    }

    async fn upsert_item_baseline(&self, baseline: &ItemBaseline) -> EngineResult<()> {
        sqlx::query(
            r#"INSERT INTO "item_baselines"
               ("itemId", "subject", "baseDifficulty", "successRate", "totalReviews", "updatedAt")
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT ("itemId") DO UPDATE SET
               "subject" = $2,
               "baseDifficulty" = $3,
               "successRate" = $4,
               "totalReviews" = $5,
               "updatedAt" = $6"#,
        )
        .bind(&baseline.item_id)
        .bind(&baseline.subject)
        .bind(baseline.base_difficulty)
        .bind(baseline.success_rate)
        .bind(baseline.total_reviews)
        .bind(baseline.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn recently_active_users(
        &self,
        item_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<String>> {
        let rows = sqlx::query(
            r#"SELECT "userId", MAX("updatedAt") AS "lastCompleted"
               FROM "review_schedules"
               WHERE "itemId" = $1 AND "status" = 'COMPLETED'
               GROUP BY "userId"
               ORDER BY "lastCompleted" DESC
               LIMIT $2"#,
        )
        .bind(item_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|row| row.try_get("userId").map_err(store_err))
            .collect()
    }
}

fn parse_schedule_row(row: &sqlx::postgres::PgRow) -> EngineResult<ReviewSchedule> {
    let level: i32 = row.try_get("currentLevel").map_err(store_err)?;
    let status_raw: String = row.try_get("status").map_err(store_err)?;
    let status = ReviewStatus::parse(&status_raw)
        .ok_or_else(|| EngineError::Store(format!("unknown schedule status: {status_raw}")))?;

    Ok(ReviewSchedule {
        id: row.try_get("id").map_err(store_err)?,
        user_id: row.try_get("userId").map_err(store_err)?,
        item_id: row.try_get("itemId").map_err(store_err)?,
        current_level: Level::new(level.clamp(0, u8::MAX as i32) as u8)?,
        status,
        scheduled_at: row.try_get("scheduledAt").map_err(store_err)?,
        next_scheduled_at: row.try_get("nextScheduledAt").map_err(store_err)?,
        is_success: row.try_get("isSuccess").map_err(store_err)?,
        response_time_ms: row.try_get("responseTimeMs").map_err(store_err)?,
        confidence_level: row.try_get("confidenceLevel").map_err(store_err)?,
        difficulty_score_at_review: row.try_get("difficultyScoreAtReview").map_err(store_err)?,
        supersedes: row.try_get("supersedes").map_err(store_err)?,
        created_at: row.try_get("createdAt").map_err(store_err)?,
        updated_at: row.try_get("updatedAt").map_err(store_err)?,
    })
}

fn store_err(err: impl std::fmt::Display) -> EngineError {
    EngineError::Store(err.to_string())
}
