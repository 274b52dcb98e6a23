//! Repository for the `jobs` table.
//!
//! Lookups by name return the first match in id order. Every mutation is a
//! single statement or runs inside one transaction.

use chrono::Utc;
use labrun_core::types::DbId;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqliteConnection;

use crate::models::job::{ImportSummary, Job, JobLookup, UpdateJob, UpsertJob};
use crate::DbPool;

/// Column list shared across queries to avoid repetition.
const COLUMNS: &str = "id, name, config, result, created_at, updated_at";

/// Provides CRUD operations for job records.
pub struct JobRepo;

impl JobRepo {
    /// List every job in id order.
    pub async fn list(pool: &DbPool) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs ORDER BY id");
        sqlx::query_as::<_, Job>(&query).fetch_all(pool).await
    }

    /// Find a job by id.
    pub async fn find_by_id(pool: &DbPool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Find the first job (lowest id) with the given name.
    pub async fn find_by_name(pool: &DbPool, name: &str) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE name = ?1 ORDER BY id LIMIT 1");
        sqlx::query_as::<_, Job>(&query)
            .bind(name)
            .fetch_optional(pool)
            .await
    }

    /// Find a job by id or by name.
    pub async fn find(pool: &DbPool, lookup: &JobLookup) -> Result<Option<Job>, sqlx::Error> {
        match lookup {
            JobLookup::Id(id) => Self::find_by_id(pool, *id).await,
            JobLookup::Name(name) => Self::find_by_name(pool, name).await,
        }
    }

    /// Insert a new job. The store assigns the id when `input.id` is `None`.
    ///
    /// A caller-supplied id that already exists fails with a unique
    /// violation (see [`crate::is_unique_violation`]).
    pub async fn create(pool: &DbPool, input: &UpsertJob) -> Result<Job, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        insert(&mut conn, input).await
    }

    /// Merge `input` into the job with `input.id` if it exists, otherwise
    /// create it.
    pub async fn upsert(pool: &DbPool, input: &UpsertJob) -> Result<Job, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let job = upsert_in(&mut tx, input).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Upsert every item in one transaction; either all apply or none do.
    pub async fn upsert_many(pool: &DbPool, inputs: &[UpsertJob]) -> Result<Vec<Job>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut jobs = Vec::with_capacity(inputs.len());
        for input in inputs {
            jobs.push(upsert_in(&mut tx, input).await?);
        }
        tx.commit().await?;
        Ok(jobs)
    }

    /// Apply a partial update to the job selected by `lookup`.
    ///
    /// Returns `None` if no job matches.
    pub async fn update(
        pool: &DbPool,
        lookup: &JobLookup,
        input: &UpdateJob,
    ) -> Result<Option<Job>, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let Some(id) = resolve_id(&mut tx, lookup).await? else {
            return Ok(None);
        };
        let job = update_by_id(&mut tx, id, input).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Overwrite only the `result` of a job. Returns `true` if a row changed.
    pub async fn set_result(pool: &DbPool, id: DbId, result: &str) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query("UPDATE jobs SET result = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(result)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Delete the job selected by `lookup`. Returns `true` if a row was removed.
    pub async fn delete(pool: &DbPool, lookup: &JobLookup) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let Some(id) = resolve_id(&mut tx, lookup).await? else {
            return Ok(false);
        };
        let outcome = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Store each `(name, config)` pair as a job: replace the config of the
    /// first job with that name, or create a new job. Runs in one
    /// transaction.
    pub async fn import_sections(
        pool: &DbPool,
        sections: &[(String, Value)],
    ) -> Result<ImportSummary, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut summary = ImportSummary::default();

        for (name, config) in sections {
            let existing = resolve_id(&mut tx, &JobLookup::Name(name.clone())).await?;
            match existing {
                Some(id) => {
                    sqlx::query("UPDATE jobs SET config = ?2, updated_at = ?3 WHERE id = ?1")
                        .bind(id)
                        .bind(Json(config))
                        .bind(Utc::now())
                        .execute(&mut *tx)
                        .await?;
                    summary.updated += 1;
                }
                None => {
                    let input = UpsertJob {
                        id: None,
                        fields: UpdateJob {
                            name: Some(name.clone()),
                            config: Some(config.clone()),
                            result: None,
                        },
                    };
                    insert(&mut tx, &input).await?;
                    summary.created += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (shared by pool and transaction callers)
// ---------------------------------------------------------------------------

async fn insert(conn: &mut SqliteConnection, input: &UpsertJob) -> Result<Job, sqlx::Error> {
    let query = format!(
        "INSERT INTO jobs (id, name, config, result, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
         RETURNING {COLUMNS}"
    );
    let config = input
        .fields
        .config_value()
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));

    sqlx::query_as::<_, Job>(&query)
        .bind(input.id)
        .bind(input.fields.name_value().unwrap_or_default())
        .bind(Json(config))
        .bind(input.fields.result_value().unwrap_or_default())
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
}

async fn upsert_in(conn: &mut SqliteConnection, input: &UpsertJob) -> Result<Job, sqlx::Error> {
    if let Some(id) = input.id {
        if let Some(job) = update_by_id(conn, id, &input.fields).await? {
            return Ok(job);
        }
    }
    insert(conn, input).await
}

async fn update_by_id(
    conn: &mut SqliteConnection,
    id: DbId,
    input: &UpdateJob,
) -> Result<Option<Job>, sqlx::Error> {
    let query = format!(
        "UPDATE jobs SET \
            name = COALESCE(?2, name), \
            config = COALESCE(?3, config), \
            result = COALESCE(?4, result), \
            updated_at = ?5 \
         WHERE id = ?1 \
         RETURNING {COLUMNS}"
    );
    sqlx::query_as::<_, Job>(&query)
        .bind(id)
        .bind(input.name_value())
        .bind(input.config_value().map(Json))
        .bind(input.result_value())
        .bind(Utc::now())
        .fetch_optional(&mut *conn)
        .await
}

async fn resolve_id(
    conn: &mut SqliteConnection,
    lookup: &JobLookup,
) -> Result<Option<DbId>, sqlx::Error> {
    let row: Option<(DbId,)> = match lookup {
        JobLookup::Id(id) => {
            sqlx::query_as("SELECT id FROM jobs WHERE id = ?1")
                .bind(*id)
                .fetch_optional(&mut *conn)
                .await?
        }
        JobLookup::Name(name) => {
            sqlx::query_as("SELECT id FROM jobs WHERE name = ?1 ORDER BY id LIMIT 1")
                .bind(name.as_str())
                .fetch_optional(&mut *conn)
                .await?
        }
    };
    Ok(row.map(|(id,)| id))
}
