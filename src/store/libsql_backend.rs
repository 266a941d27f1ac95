//! libSQL backend: implements every store trait over one connection.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::opportunities::{Budget, Counterpart, Opportunity, ProcessingMetadata, ProcessingStatus};
use crate::store::migrations;
use crate::store::traits::{
    BacklogQuery, OpportunityStore, OutcomeStatus, QuotaStore, RunLog, RunOutcome, RunRecord,
    SubmissionRecord, SubmissionStore,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so timestamps sort lexically.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn fmt_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn row_err(context: &str, e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Query(format!("{context} row parse: {e}"))
}

const OPPORTUNITY_COLUMNS: &str = "id, tenant_id, title, description, budget_amount, budget_currency, skills, counterpart, base_quality_score, status, processing, dispatch_attempts, ingested_at";

/// Map a libsql Row to an Opportunity. Column order matches OPPORTUNITY_COLUMNS.
fn row_to_opportunity(row: &libsql::Row) -> Result<Opportunity, DatabaseError> {
    let ctx = "opportunity";
    let budget_amount: Option<String> = row.get(4).ok();
    let budget_currency: Option<String> = row.get(5).ok();
    let skills_json: String = row.get(6).map_err(|e| row_err(ctx, e))?;
    let counterpart_json: String = row.get(7).map_err(|e| row_err(ctx, e))?;
    let status_str: String = row.get(9).map_err(|e| row_err(ctx, e))?;
    let processing_json: Option<String> = row.get(10).ok();
    let attempts: i64 = row.get(11).map_err(|e| row_err(ctx, e))?;
    let ingested_str: String = row.get(12).map_err(|e| row_err(ctx, e))?;

    let budget = match budget_amount {
        Some(amount) => Some(Budget::new(
            Decimal::from_str(&amount)
                .map_err(|e| DatabaseError::Serialization(format!("budget_amount: {e}")))?,
            budget_currency.unwrap_or_else(|| "USD".to_string()),
        )),
        None => None,
    };

    let processing = match processing_json {
        Some(json) => Some(
            serde_json::from_str::<ProcessingMetadata>(&json)
                .map_err(|e| DatabaseError::Serialization(format!("processing: {e}")))?,
        ),
        None => None,
    };

    Ok(Opportunity {
        id: row.get(0).map_err(|e| row_err(ctx, e))?,
        tenant_id: row.get(1).map_err(|e| row_err(ctx, e))?,
        title: row.get(2).map_err(|e| row_err(ctx, e))?,
        description: row.get(3).map_err(|e| row_err(ctx, e))?,
        budget,
        skills: serde_json::from_str(&skills_json)
            .map_err(|e| DatabaseError::Serialization(format!("skills: {e}")))?,
        counterpart: serde_json::from_str::<Counterpart>(&counterpart_json)
            .map_err(|e| DatabaseError::Serialization(format!("counterpart: {e}")))?,
        base_quality_score: row.get(8).map_err(|e| row_err(ctx, e))?,
        status: ProcessingStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?,
        processing,
        dispatch_attempts: u32::try_from(attempts).unwrap_or(0),
        ingested_at: parse_datetime(&ingested_str),
    })
}

const SUBMISSION_COLUMNS: &str =
    "id, tenant_id, user_id, opportunity_id, content, status, metadata, created_at";

fn row_to_submission(row: &libsql::Row) -> Result<SubmissionRecord, DatabaseError> {
    let ctx = "submission";
    let status_str: String = row.get(5).map_err(|e| row_err(ctx, e))?;
    let metadata: Option<String> = row.get(6).ok();
    let created_str: String = row.get(7).map_err(|e| row_err(ctx, e))?;

    Ok(SubmissionRecord {
        id: row.get(0).map_err(|e| row_err(ctx, e))?,
        tenant_id: row.get(1).map_err(|e| row_err(ctx, e))?,
        user_id: row.get(2).map_err(|e| row_err(ctx, e))?,
        opportunity_id: row.get(3).map_err(|e| row_err(ctx, e))?,
        text: row.get(4).map_err(|e| row_err(ctx, e))?,
        status: OutcomeStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_run(row: &libsql::Row) -> Result<RunRecord, DatabaseError> {
    let ctx = "run";
    let id_str: String = row.get(0).map_err(|e| row_err(ctx, e))?;
    let started: String = row.get(3).map_err(|e| row_err(ctx, e))?;
    let finished: String = row.get(4).map_err(|e| row_err(ctx, e))?;
    let outcome: String = row.get(5).map_err(|e| row_err(ctx, e))?;
    let summary: String = row.get(6).map_err(|e| row_err(ctx, e))?;

    Ok(RunRecord {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        tenant_id: row.get(1).map_err(|e| row_err(ctx, e))?,
        user_id: row.get(2).map_err(|e| row_err(ctx, e))?,
        started_at: parse_datetime(&started),
        finished_at: parse_datetime(&finished),
        outcome: RunOutcome::from_str(&outcome).map_err(DatabaseError::Serialization)?,
        summary: serde_json::from_str(&summary)
            .map_err(|e| DatabaseError::Serialization(format!("run summary: {e}")))?,
    })
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl OpportunityStore for LibSqlBackend {
    async fn fetch_unprocessed(
        &self,
        tenant_id: &str,
        query: BacklogQuery,
    ) -> Result<Vec<Opportunity>, DatabaseError> {
        let (include_failed, attempt_cap) = match query.retry_below_attempts {
            Some(cap) => (1i64, cap as i64),
            None => (0i64, 0i64),
        };
        let (include_abandoned, claim_cutoff) = match &query.reclaim_before {
            Some(cutoff) => (1i64, fmt_datetime(cutoff)),
            None => (0i64, String::new()),
        };
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities \
                     WHERE tenant_id = ?1 \
                       AND (status = 'unprocessed' \
                            OR (?2 = 1 AND status = 'dispatch_failed' AND dispatch_attempts < ?3) \
                            OR (?5 = 1 AND status = 'in_progress' AND claimed_at < ?6)) \
                     ORDER BY ingested_at DESC, rowid ASC \
                     LIMIT ?4"
                ),
                params![
                    tenant_id,
                    include_failed,
                    attempt_cap,
                    query.limit as i64,
                    include_abandoned,
                    claim_cutoff
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_unprocessed: {e}")))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_unprocessed: {e}")))?
        {
            items.push(row_to_opportunity(&row)?);
        }
        debug!(tenant_id, count = items.len(), "Fetched backlog");
        Ok(items)
    }

    async fn fetch_by_id(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<Opportunity>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE tenant_id = ?1 AND id = ?2"
                ),
                params![tenant_id, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_by_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_opportunity(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("fetch_by_id: {e}"))),
        }
    }

    async fn claim(
        &self,
        tenant_id: &str,
        id: &str,
        reclaim_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        // One conditional UPDATE: of two runs racing for the same row,
        // exactly one sees a changed row.
        let changed = self
            .conn()
            .execute(
                "UPDATE opportunities \
                 SET status = 'in_progress', claimed_at = ?3, updated_at = ?3 \
                 WHERE tenant_id = ?1 AND id = ?2 \
                   AND (status IN ('unprocessed', 'dispatch_failed') \
                        OR (status = 'in_progress' \
                            AND (claimed_at IS NULL OR claimed_at < ?4)))",
                params![
                    tenant_id,
                    id,
                    fmt_datetime(&Utc::now()),
                    fmt_datetime(&reclaim_before)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim: {e}")))?;
        Ok(changed > 0)
    }

    async fn release_claim(&self, id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE opportunities \
                 SET status = CASE WHEN dispatch_attempts > 0 \
                                   THEN 'dispatch_failed' ELSE 'unprocessed' END, \
                     claimed_at = NULL, updated_at = ?2 \
                 WHERE id = ?1 AND status = 'in_progress'",
                params![id, fmt_datetime(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_claim: {e}")))?;
        Ok(())
    }

    async fn mark_processed(
        &self,
        id: &str,
        metadata: &ProcessingMetadata,
    ) -> Result<bool, DatabaseError> {
        let status = metadata.status();
        let attempt_increment: i64 = if metadata.dispatch.is_failed() { 1 } else { 0 };
        let changed = self
            .conn()
            .execute(
                "UPDATE opportunities \
                 SET status = ?1, processing = ?2, claimed_at = NULL, \
                     dispatch_attempts = dispatch_attempts + ?3, updated_at = ?4 \
                 WHERE id = ?5 AND status != 'processed'",
                params![
                    status.to_string(),
                    to_json(metadata)?,
                    attempt_increment,
                    fmt_datetime(&Utc::now()),
                    id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_processed: {e}")))?;
        Ok(changed > 0)
    }

    async fn upsert_opportunity(&self, opportunity: &Opportunity) -> Result<(), DatabaseError> {
        let (amount, currency) = match &opportunity.budget {
            Some(b) => (Some(b.amount.to_string()), Some(b.currency.clone())),
            None => (None, None),
        };
        let processing = match &opportunity.processing {
            Some(p) => Some(to_json(p)?),
            None => None,
        };
        self.conn()
            .execute(
                "INSERT INTO opportunities (id, tenant_id, title, description, budget_amount, budget_currency, skills, counterpart, base_quality_score, status, processing, dispatch_attempts, ingested_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                 ON CONFLICT(id) DO UPDATE SET \
                     title = excluded.title, \
                     description = excluded.description, \
                     budget_amount = excluded.budget_amount, \
                     budget_currency = excluded.budget_currency, \
                     skills = excluded.skills, \
                     counterpart = excluded.counterpart, \
                     base_quality_score = excluded.base_quality_score, \
                     updated_at = excluded.updated_at",
                params![
                    opportunity.id.as_str(),
                    opportunity.tenant_id.as_str(),
                    opportunity.title.as_str(),
                    opportunity.description.as_str(),
                    opt_text_owned(amount),
                    opt_text_owned(currency),
                    to_json(&opportunity.skills)?,
                    to_json(&opportunity.counterpart)?,
                    opportunity.base_quality_score,
                    opportunity.status.to_string(),
                    opt_text_owned(processing),
                    opportunity.dispatch_attempts as i64,
                    fmt_datetime(&opportunity.ingested_at),
                    fmt_datetime(&Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_opportunity: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for LibSqlBackend {
    async fn fetch_terminal_won(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<SubmissionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBMISSION_COLUMNS} FROM submissions \
                     WHERE user_id = ?1 AND status = 'won' \
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_terminal_won: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_terminal_won: {e}")))?
        {
            records.push(row_to_submission(&row)?);
        }
        Ok(records)
    }

    async fn insert_draft(
        &self,
        tenant_id: &str,
        user_id: &str,
        opportunity_id: &str,
        text: &str,
        metadata: &serde_json::Value,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = fmt_datetime(&Utc::now());
        self.conn()
            .execute(
                "INSERT INTO submissions (id, tenant_id, user_id, opportunity_id, content, status, metadata, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id.as_str(),
                    tenant_id,
                    user_id,
                    opportunity_id,
                    text,
                    OutcomeStatus::Draft.as_str(),
                    metadata.to_string(),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_draft: {e}")))?;
        debug!(draft_id = %id, opportunity_id, "Draft stored");
        Ok(id)
    }

    async fn fetch_for_opportunity(
        &self,
        opportunity_id: &str,
    ) -> Result<Vec<SubmissionRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUBMISSION_COLUMNS} FROM submissions \
                     WHERE opportunity_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![opportunity_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_for_opportunity: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_for_opportunity: {e}")))?
        {
            records.push(row_to_submission(&row)?);
        }
        Ok(records)
    }

    async fn update_outcome(&self, id: &str, status: OutcomeStatus) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE submissions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), fmt_datetime(&Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_outcome: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "submission".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for LibSqlBackend {
    async fn count_today(
        &self,
        tenant_id: &str,
        user_id: &str,
        day: NaiveDate,
    ) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT count FROM quota_counters WHERE tenant_id = ?1 AND user_id = ?2 AND day = ?3",
                params![tenant_id, user_id, fmt_day(day)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_today: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(|e| row_err("quota", e))?;
                Ok(u32::try_from(count).unwrap_or(u32::MAX))
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_today: {e}"))),
        }
    }

    async fn try_consume(
        &self,
        tenant_id: &str,
        user_id: &str,
        day: NaiveDate,
        cap: u32,
    ) -> Result<bool, DatabaseError> {
        if cap == 0 {
            return Ok(false);
        }
        // Single conditional upsert: the increment and the cap check happen
        // in one statement, so concurrent consumers cannot overshoot.
        let changed = self
            .conn()
            .execute(
                "INSERT INTO quota_counters (tenant_id, user_id, day, count, updated_at) \
                 VALUES (?1, ?2, ?3, 1, ?4) \
                 ON CONFLICT(tenant_id, user_id, day) DO UPDATE \
                 SET count = count + 1, updated_at = excluded.updated_at \
                 WHERE quota_counters.count < ?5",
                params![
                    tenant_id,
                    user_id,
                    fmt_day(day),
                    fmt_datetime(&Utc::now()),
                    cap as i64
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_consume: {e}")))?;
        Ok(changed > 0)
    }

    async fn release(
        &self,
        tenant_id: &str,
        user_id: &str,
        day: NaiveDate,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE quota_counters SET count = count - 1, updated_at = ?4 \
                 WHERE tenant_id = ?1 AND user_id = ?2 AND day = ?3 AND count > 0",
                params![tenant_id, user_id, fmt_day(day), fmt_datetime(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl RunLog for LibSqlBackend {
    async fn record_run(&self, run: &RunRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO runs (id, tenant_id, user_id, started_at, finished_at, outcome, summary) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.id.to_string(),
                    run.tenant_id.as_str(),
                    run.user_id.as_str(),
                    fmt_datetime(&run.started_at),
                    fmt_datetime(&run.finished_at),
                    run.outcome.as_str(),
                    run.summary.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_run: {e}")))?;
        Ok(())
    }

    async fn recent_runs(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> Result<Vec<RunRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, tenant_id, user_id, started_at, finished_at, outcome, summary \
                 FROM runs WHERE tenant_id = ?1 ORDER BY started_at DESC LIMIT ?2",
                params![tenant_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_runs: {e}")))?
        {
            runs.push(row_to_run(&row)?);
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Action;
    use crate::opportunities::DispatchState;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_opportunity(id: &str, minutes_ago: i64) -> Opportunity {
        Opportunity::new(id, "t1", format!("Job {id}"), "Build a thing")
            .with_budget(Budget::usd(dec!(1500.50)))
            .with_skills(["rust", "tokio"])
            .with_counterpart(Counterpart {
                rating: 4.5,
                total_spent: dec!(12000),
                verified: true,
                competing_bids: 4,
            })
            .with_quality_score(72.0)
            .with_ingested_at(Utc::now() - Duration::minutes(minutes_ago))
    }

    fn metadata(dispatch: DispatchState) -> ProcessingMetadata {
        ProcessingMetadata {
            action: Action::AutoSubmit,
            confidence: 88.0,
            score: 91.0,
            reasoning: vec!["weighted score 91.0".into()],
            processed_at: Utc::now(),
            dispatch,
        }
    }

    // ── Opportunities ───────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_and_fetch_by_id() {
        let db = test_db().await;
        let opp = make_opportunity("o-1", 0);
        db.upsert_opportunity(&opp).await.unwrap();

        let fetched = db.fetch_by_id("t1", "o-1").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Job o-1");
        assert_eq!(fetched.budget, Some(Budget::usd(dec!(1500.50))));
        assert_eq!(fetched.skills, opp.skills);
        assert_eq!(fetched.counterpart, opp.counterpart);
        assert_eq!(fetched.status, ProcessingStatus::Unprocessed);
        assert!(fetched.processing.is_none());
    }

    #[tokio::test]
    async fn fetch_by_id_is_tenant_scoped() {
        let db = test_db().await;
        db.upsert_opportunity(&make_opportunity("o-1", 0)).await.unwrap();
        assert!(db.fetch_by_id("other", "o-1").await.unwrap().is_none());
        assert!(db.fetch_by_id("t1", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backlog_is_newest_first_and_limited() {
        let db = test_db().await;
        for (id, age) in [("old", 30), ("new", 1), ("mid", 10)] {
            db.upsert_opportunity(&make_opportunity(id, age)).await.unwrap();
        }

        let query = BacklogQuery {
            limit: 2,
            retry_below_attempts: None,
            reclaim_before: None,
        };
        let batch = db.fetch_unprocessed("t1", query).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["new", "mid"]);
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let db = test_db().await;
        db.upsert_opportunity(&make_opportunity("o-1", 0)).await.unwrap();

        let meta = metadata(DispatchState::NotRequired);
        assert!(db.mark_processed("o-1", &meta).await.unwrap());
        assert!(!db.mark_processed("o-1", &meta).await.unwrap());
        assert!(!db.mark_processed("missing", &meta).await.unwrap());

        let fetched = db.fetch_by_id("t1", "o-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, ProcessingStatus::Processed);
        assert_eq!(fetched.processing.unwrap().action, Action::AutoSubmit);

        let backlog = db
            .fetch_unprocessed(
                "t1",
                BacklogQuery {
                    limit: 10,
                    retry_below_attempts: Some(3),
                    reclaim_before: None,
                },
            )
            .await
            .unwrap();
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn failed_dispatch_retries_until_cap() {
        let db = test_db().await;
        db.upsert_opportunity(&make_opportunity("o-1", 0)).await.unwrap();
        let failed = metadata(DispatchState::Failed {
            error: "timeout".into(),
        });
        let retrying = BacklogQuery {
            limit: 10,
            retry_below_attempts: Some(2),
            reclaim_before: None,
        };
        let fresh_only = BacklogQuery {
            limit: 10,
            retry_below_attempts: None,
            reclaim_before: None,
        };

        assert!(db.mark_processed("o-1", &failed).await.unwrap());
        assert_eq!(db.fetch_unprocessed("t1", retrying).await.unwrap().len(), 1);
        assert!(db.fetch_unprocessed("t1", fresh_only).await.unwrap().is_empty());

        assert!(db.mark_processed("o-1", &failed).await.unwrap());
        let opp = db.fetch_by_id("t1", "o-1").await.unwrap().unwrap();
        assert_eq!(opp.dispatch_attempts, 2);
        assert_eq!(opp.status, ProcessingStatus::DispatchFailed);
        assert!(db.fetch_unprocessed("t1", retrying).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_keeps_processing_state() {
        let db = test_db().await;
        db.upsert_opportunity(&make_opportunity("o-1", 0)).await.unwrap();
        db.mark_processed("o-1", &metadata(DispatchState::NotRequired))
            .await
            .unwrap();

        let mut updated = make_opportunity("o-1", 0);
        updated.title = "Renamed".into();
        db.upsert_opportunity(&updated).await.unwrap();

        let fetched = db.fetch_by_id("t1", "o-1").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Renamed");
        assert_eq!(fetched.status, ProcessingStatus::Processed);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let db = test_db().await;
        db.upsert_opportunity(&make_opportunity("o-1", 0)).await.unwrap();
        let cutoff = Utc::now() - Duration::minutes(15);

        assert!(db.claim("t1", "o-1", cutoff).await.unwrap());
        assert!(!db.claim("t1", "o-1", cutoff).await.unwrap());
        assert!(!db.claim("other", "o-1", cutoff).await.unwrap());
        assert!(!db.claim("t1", "missing", cutoff).await.unwrap());

        let fetched = db.fetch_by_id("t1", "o-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, ProcessingStatus::InProgress);
        assert!(fetched.is_pending());

        let backlog = BacklogQuery {
            limit: 10,
            retry_below_attempts: Some(3),
            reclaim_before: Some(cutoff),
        };
        assert!(db.fetch_unprocessed("t1", backlog).await.unwrap().is_empty());

        assert!(db.mark_processed("o-1", &metadata(DispatchState::NotRequired)).await.unwrap());
        assert!(!db.claim("t1", "o-1", Utc::now() + Duration::minutes(1)).await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_claim_can_be_taken_over() {
        let db = test_db().await;
        db.upsert_opportunity(&make_opportunity("o-1", 0)).await.unwrap();
        assert!(db.claim("t1", "o-1", Utc::now()).await.unwrap());

        // A cutoff in the future makes the existing claim count as stale.
        let later = Utc::now() + Duration::minutes(1);
        let backlog = BacklogQuery {
            limit: 10,
            retry_below_attempts: None,
            reclaim_before: Some(later),
        };
        assert_eq!(db.fetch_unprocessed("t1", backlog).await.unwrap().len(), 1);
        assert!(db.claim("t1", "o-1", later).await.unwrap());
    }

    #[tokio::test]
    async fn release_claim_restores_previous_status() {
        let db = test_db().await;
        db.upsert_opportunity(&make_opportunity("fresh", 0)).await.unwrap();
        db.upsert_opportunity(&make_opportunity("retry", 1)).await.unwrap();
        db.mark_processed(
            "retry",
            &metadata(DispatchState::Failed {
                error: "boom".into(),
            }),
        )
        .await
        .unwrap();

        let cutoff = Utc::now() - Duration::minutes(15);
        for id in ["fresh", "retry"] {
            assert!(db.claim("t1", id, cutoff).await.unwrap());
            db.release_claim(id).await.unwrap();
        }

        let fresh = db.fetch_by_id("t1", "fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, ProcessingStatus::Unprocessed);
        let retry = db.fetch_by_id("t1", "retry").await.unwrap().unwrap();
        assert_eq!(retry.status, ProcessingStatus::DispatchFailed);
        assert_eq!(retry.dispatch_attempts, 1);
    }

    // ── Submissions ─────────────────────────────────────────────────

    #[tokio::test]
    async fn only_won_submissions_are_returned() {
        let db = test_db().await;
        let meta = serde_json::json!({"confidence": 80});
        let won = db.insert_draft("t1", "u1", "o-1", "won text", &meta).await.unwrap();
        let _draft = db.insert_draft("t1", "u1", "o-2", "draft text", &meta).await.unwrap();
        let other_user = db.insert_draft("t1", "u2", "o-3", "theirs", &meta).await.unwrap();
        db.update_outcome(&won, OutcomeStatus::Won).await.unwrap();
        db.update_outcome(&other_user, OutcomeStatus::Won).await.unwrap();

        let history = db.fetch_terminal_won("u1", 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "won text");
        assert_eq!(history[0].status, OutcomeStatus::Won);
        assert_eq!(history[0].metadata.as_ref().unwrap()["confidence"], 80);
    }

    #[tokio::test]
    async fn submissions_listed_per_opportunity() {
        let db = test_db().await;
        let meta = serde_json::json!({});
        let first = db.insert_draft("t1", "u1", "o-1", "first", &meta).await.unwrap();
        let second = db.insert_draft("t1", "u1", "o-1", "second", &meta).await.unwrap();
        db.insert_draft("t1", "u1", "o-2", "elsewhere", &meta).await.unwrap();

        let records = db.fetch_for_opportunity("o-1").await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, [first.as_str(), second.as_str()]);
        assert!(db.fetch_for_opportunity("o-9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_outcome_missing_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_outcome("nope", OutcomeStatus::Won)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    // ── Quota ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn quota_consumes_up_to_cap() {
        let db = test_db().await;
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        assert_eq!(db.count_today("t1", "u1", day).await.unwrap(), 0);
        assert!(db.try_consume("t1", "u1", day, 2).await.unwrap());
        assert!(db.try_consume("t1", "u1", day, 2).await.unwrap());
        assert!(!db.try_consume("t1", "u1", day, 2).await.unwrap());
        assert_eq!(db.count_today("t1", "u1", day).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn released_quota_can_be_consumed_again() {
        let db = test_db().await;
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        assert!(db.try_consume("t1", "u1", day, 1).await.unwrap());
        db.release("t1", "u1", day).await.unwrap();
        assert_eq!(db.count_today("t1", "u1", day).await.unwrap(), 0);
        db.release("t1", "u1", day).await.unwrap();
        assert_eq!(db.count_today("t1", "u1", day).await.unwrap(), 0);
        assert!(db.try_consume("t1", "u1", day, 1).await.unwrap());
    }

    #[tokio::test]
    async fn quota_resets_per_day_and_user() {
        let db = test_db().await;
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let next = day.succ_opt().unwrap();

        assert!(db.try_consume("t1", "u1", day, 1).await.unwrap());
        assert!(!db.try_consume("t1", "u1", day, 1).await.unwrap());
        assert!(db.try_consume("t1", "u1", next, 1).await.unwrap());
        assert!(db.try_consume("t1", "u2", day, 1).await.unwrap());
        assert!(!db.try_consume("t1", "u3", day, 0).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_consumers_never_exceed_cap() {
        let db = Arc::new(test_db().await);
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.try_consume("t1", "u1", day, 5).await.unwrap()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
        assert_eq!(db.count_today("t1", "u1", day).await.unwrap(), 5);
    }

    // ── Runs ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn run_log_round_trip() {
        let db = test_db().await;
        let now = Utc::now();
        let run = RunRecord {
            id: Uuid::new_v4(),
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            started_at: now - Duration::seconds(5),
            finished_at: now,
            outcome: RunOutcome::Completed,
            summary: serde_json::json!({"items_processed": 3}),
        };
        db.record_run(&run).await.unwrap();

        let runs = db.recent_runs("t1", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run.id);
        assert_eq!(runs[0].outcome, RunOutcome::Completed);
        assert_eq!(runs[0].summary["items_processed"], 3);
    }

    // ── On-disk ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pilot.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_opportunity(&make_opportunity("o-1", 0)).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.fetch_by_id("t1", "o-1").await.unwrap().is_some());
    }
}
