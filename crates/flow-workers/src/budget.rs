//! Daily API-spend ledger. Grounded on `orchestrator/budget.py`.

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::Row;

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("daily budget exceeded: {0}")]
    LimitExceeded(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetSnapshot {
    pub date: String,
    pub api_calls: i64,
    pub cost_usd: f64,
}

/// Tracks today's aggregate API usage across all workers against two
/// optional daily caps. Both caps default to zero, which disables tracking
/// entirely (`enabled() == false`).
#[derive(Debug)]
pub struct BudgetTracker {
    pool: sqlx::SqlitePool,
    max_daily_api_calls: i64,
    max_daily_cost_usd: f64,
}

impl BudgetTracker {
    pub async fn new(db_path: &Path, max_daily_api_calls: i64, max_daily_cost_usd: f64) -> Result<Self, BudgetError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BudgetError::Db(sqlx::Error::Io(e)))?;
        }

        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS budget_log (
                date TEXT NOT NULL,
                worker TEXT NOT NULL,
                api_calls INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (date, worker)
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            max_daily_api_calls: max_daily_api_calls.max(0),
            max_daily_cost_usd: max_daily_cost_usd.max(0.0),
        })
    }

    pub fn enabled(&self) -> bool {
        self.max_daily_api_calls > 0 || self.max_daily_cost_usd > 0.0
    }

    fn utc_date() -> String {
        Utc::now().date_naive().to_string()
    }

    async fn today_snapshot(&self) -> Result<BudgetSnapshot, BudgetError> {
        let date = Self::utc_date();
        let row: SqliteRow = sqlx::query(
            "SELECT COALESCE(SUM(api_calls), 0), COALESCE(SUM(cost_usd), 0) FROM budget_log WHERE date = ?",
        )
        .bind(&date)
        .fetch_one(&self.pool)
        .await?;

        Ok(BudgetSnapshot { date, api_calls: row.try_get(0)?, cost_usd: row.try_get(1)? })
    }

    /// No-op when tracking is disabled. Otherwise returns today's snapshot,
    /// or an error naming every cap already met or exceeded (`>=`, not `>`).
    pub async fn check_budget(&self) -> Result<BudgetSnapshot, BudgetError> {
        let snapshot = self.today_snapshot().await?;
        if !self.enabled() {
            return Ok(snapshot);
        }

        let mut violations = Vec::new();
        if self.max_daily_api_calls > 0 && snapshot.api_calls >= self.max_daily_api_calls {
            violations.push(format!(
                "MAX_DAILY_API_CALLS reached: used={}, limit={}",
                snapshot.api_calls, self.max_daily_api_calls
            ));
        }
        if self.max_daily_cost_usd > 0.0 && snapshot.cost_usd >= self.max_daily_cost_usd {
            violations.push(format!(
                "MAX_DAILY_COST_USD reached: used={:.6}, limit={:.6}",
                snapshot.cost_usd, self.max_daily_cost_usd
            ));
        }

        if violations.is_empty() {
            Ok(snapshot)
        } else {
            Err(BudgetError::LimitExceeded(violations.join("; ")))
        }
    }

    pub async fn log_budget(&self, worker: &str, api_calls: i64, cost_usd: f64) -> Result<(), BudgetError> {
        let api_calls = api_calls.max(0);
        let cost_usd = cost_usd.max(0.0);
        let date = Self::utc_date();
        let worker = {
            let trimmed = worker.trim();
            if trimmed.is_empty() { "unknown" } else { trimmed }
        };

        sqlx::query(
            "INSERT INTO budget_log (date, worker, api_calls, cost_usd)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(date, worker) DO UPDATE SET
                api_calls = api_calls + excluded.api_calls,
                cost_usd = cost_usd + excluded.cost_usd",
        )
        .bind(&date)
        .bind(worker)
        .bind(api_calls)
        .bind(cost_usd)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
