use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    BusinessId, KpiId, NewTask, RecurrenceMeta, TaskId, TaskRecord, TaskStatus,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredKpi {
    pub kpi_id: KpiId,
    pub business_id: BusinessId,
    pub name: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub target: Option<f64>,
    pub current_value: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewKpi {
    pub business_id: BusinessId,
    pub name: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub target: Option<f64>,
    pub current_value: Option<f64>,
}

/// Partial KPI update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct KpiPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub target: Option<f64>,
    pub current_value: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct StoredTask {
    pub task_id: TaskId,
    pub business_id: BusinessId,
    pub title: String,
    pub notes: Option<String>,
    pub status: TaskStatus,
    pub due_date: Option<NaiveDate>,
    pub scheduled_date: Option<NaiveDate>,
    pub recurrence: Option<RecurrenceMeta>,
    pub created_at: DateTime<Utc>,
}

impl StoredTask {
    pub fn record(&self) -> TaskRecord {
        TaskRecord {
            task_id: self.task_id,
            business_id: self.business_id,
            title: self.title.clone(),
            notes: self.notes.clone(),
            status: self.status,
            due_date: self.due_date,
            scheduled_date: self.scheduled_date,
            recurrence: self.recurrence.clone(),
        }
    }
}

/// Credential set for a business' accounting-provider link, one row per
/// business.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConnection {
    pub business_id: BusinessId,
    pub tenant_id: String,
    pub tenant_name: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub status: String,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_kpi(&self, new: &NewKpi) -> Result<StoredKpi> {
        let row = sqlx::query(
            "INSERT INTO kpis (business_id, name, description, unit, target, current_value)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id, business_id, name, description, unit, target, current_value, created_at, updated_at",
        )
        .bind(new.business_id.0)
        .bind(&new.name)
        .bind(new.description.as_deref())
        .bind(new.unit.as_deref())
        .bind(new.target)
        .bind(new.current_value)
        .fetch_one(&self.pool)
        .await?;
        Ok(kpi_from_row(&row))
    }

    pub async fn list_kpis(&self, business_id: BusinessId) -> Result<Vec<StoredKpi>> {
        let rows = sqlx::query(
            "SELECT id, business_id, name, description, unit, target, current_value, created_at, updated_at
             FROM kpis
             WHERE business_id = ?
             ORDER BY id ASC",
        )
        .bind(business_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(kpi_from_row).collect())
    }

    pub async fn update_kpi(
        &self,
        kpi_id: KpiId,
        business_id: BusinessId,
        patch: &KpiPatch,
    ) -> Result<Option<StoredKpi>> {
        let row = sqlx::query(
            "UPDATE kpis SET
                name          = COALESCE(?, name),
                description   = COALESCE(?, description),
                unit          = COALESCE(?, unit),
                target        = COALESCE(?, target),
                current_value = COALESCE(?, current_value),
                updated_at    = CURRENT_TIMESTAMP
             WHERE id = ? AND business_id = ?
             RETURNING id, business_id, name, description, unit, target, current_value, created_at, updated_at",
        )
        .bind(patch.name.as_deref())
        .bind(patch.description.as_deref())
        .bind(patch.unit.as_deref())
        .bind(patch.target)
        .bind(patch.current_value)
        .bind(kpi_id.0)
        .bind(business_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(kpi_from_row))
    }

    pub async fn delete_kpi(&self, kpi_id: KpiId, business_id: BusinessId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kpis WHERE id = ? AND business_id = ?")
            .bind(kpi_id.0)
            .bind(business_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_task(&self, new: &NewTask) -> Result<StoredTask> {
        let row = sqlx::query(
            "INSERT INTO tasks (business_id, title, notes, status, due_date, scheduled_date, recurrence_pattern, source_task_id, last_completed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id, business_id, title, notes, status, due_date, scheduled_date, recurrence_pattern, source_task_id, last_completed, created_at",
        )
        .bind(new.business_id.0)
        .bind(&new.title)
        .bind(new.notes.as_deref())
        .bind(new.status.as_str())
        .bind(new.due_date)
        .bind(new.scheduled_date)
        .bind(new.recurrence.as_ref().map(|r| r.pattern.as_str()))
        .bind(new.recurrence.as_ref().and_then(|r| r.source_task_id).map(|id| id.0))
        .bind(new.recurrence.as_ref().and_then(|r| r.last_completed))
        .fetch_one(&self.pool)
        .await?;
        task_from_row(&row)
    }

    pub async fn get_task(
        &self,
        task_id: TaskId,
        business_id: BusinessId,
    ) -> Result<Option<StoredTask>> {
        let row = sqlx::query(
            "SELECT id, business_id, title, notes, status, due_date, scheduled_date, recurrence_pattern, source_task_id, last_completed, created_at
             FROM tasks
             WHERE id = ? AND business_id = ?",
        )
        .bind(task_id.0)
        .bind(business_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(|r| task_from_row(r)).transpose()
    }

    pub async fn list_tasks(
        &self,
        business_id: BusinessId,
        status: Option<TaskStatus>,
    ) -> Result<Vec<StoredTask>> {
        let rows = if let Some(status) = status {
            sqlx::query(
                "SELECT id, business_id, title, notes, status, due_date, scheduled_date, recurrence_pattern, source_task_id, last_completed, created_at
                 FROM tasks
                 WHERE business_id = ? AND status = ?
                 ORDER BY id ASC",
            )
            .bind(business_id.0)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, business_id, title, notes, status, due_date, scheduled_date, recurrence_pattern, source_task_id, last_completed, created_at
                 FROM tasks
                 WHERE business_id = ?
                 ORDER BY id ASC",
            )
            .bind(business_id.0)
            .fetch_all(&self.pool)
            .await?
        };
        rows.iter().map(task_from_row).collect()
    }

    /// Flips a pending task to completed. Returns `None` when the task does
    /// not exist for the business or was already completed.
    pub async fn mark_task_completed(
        &self,
        task_id: TaskId,
        business_id: BusinessId,
        completed_on: NaiveDate,
    ) -> Result<Option<StoredTask>> {
        let row = sqlx::query(
            "UPDATE tasks
             SET status = 'completed', last_completed = ?
             WHERE id = ? AND business_id = ? AND status = 'pending'
             RETURNING id, business_id, title, notes, status, due_date, scheduled_date, recurrence_pattern, source_task_id, last_completed, created_at",
        )
        .bind(completed_on)
        .bind(task_id.0)
        .bind(business_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(|r| task_from_row(r)).transpose()
    }

    /// Replaces the stored provider credential for a business atomically.
    /// Keyed on business id so a crash can never leave the business without
    /// a credential row.
    pub async fn upsert_connection(&self, conn: &StoredConnection) -> Result<()> {
        sqlx::query(
            "INSERT INTO xero_connections (business_id, tenant_id, tenant_name, access_token, refresh_token, expires_at, status, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(business_id) DO UPDATE SET
                tenant_id     = excluded.tenant_id,
                tenant_name   = excluded.tenant_name,
                access_token  = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at    = excluded.expires_at,
                status        = excluded.status,
                updated_at    = CURRENT_TIMESTAMP",
        )
        .bind(conn.business_id.0)
        .bind(&conn.tenant_id)
        .bind(&conn.tenant_name)
        .bind(&conn.access_token)
        .bind(&conn.refresh_token)
        .bind(conn.expires_at)
        .bind(&conn.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn connection_for_business(
        &self,
        business_id: BusinessId,
    ) -> Result<Option<StoredConnection>> {
        let row = sqlx::query(
            "SELECT business_id, tenant_id, tenant_name, access_token, refresh_token, expires_at, status
             FROM xero_connections
             WHERE business_id = ?",
        )
        .bind(business_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredConnection {
            business_id: BusinessId(r.get::<i64, _>(0)),
            tenant_id: r.get::<String, _>(1),
            tenant_name: r.get::<String, _>(2),
            access_token: r.get::<String, _>(3),
            refresh_token: r.get::<String, _>(4),
            expires_at: r.get::<DateTime<Utc>, _>(5),
            status: r.get::<String, _>(6),
        }))
    }
}

fn kpi_from_row(row: &SqliteRow) -> StoredKpi {
    StoredKpi {
        kpi_id: KpiId(row.get::<i64, _>(0)),
        business_id: BusinessId(row.get::<i64, _>(1)),
        name: row.get::<String, _>(2),
        description: row.get::<Option<String>, _>(3),
        unit: row.get::<Option<String>, _>(4),
        target: row.get::<Option<f64>, _>(5),
        current_value: row.get::<Option<f64>, _>(6),
        created_at: row.get::<DateTime<Utc>, _>(7),
        updated_at: row.get::<DateTime<Utc>, _>(8),
    }
}

fn task_from_row(row: &SqliteRow) -> Result<StoredTask> {
    let status_raw = row.get::<String, _>(4);
    let status = TaskStatus::parse(&status_raw)
        .with_context(|| format!("unknown task status '{status_raw}' in tasks table"))?;

    let recurrence = row
        .get::<Option<String>, _>(7)
        .map(|pattern| RecurrenceMeta {
            pattern,
            source_task_id: row.get::<Option<i64>, _>(8).map(TaskId),
            last_completed: row.get::<Option<NaiveDate>, _>(9),
        });

    Ok(StoredTask {
        task_id: TaskId(row.get::<i64, _>(0)),
        business_id: BusinessId(row.get::<i64, _>(1)),
        title: row.get::<String, _>(2),
        notes: row.get::<Option<String>, _>(3),
        status,
        due_date: row.get::<Option<NaiveDate>, _>(5),
        scheduled_date: row.get::<Option<NaiveDate>, _>(6),
        recurrence,
        created_at: row.get::<DateTime<Utc>, _>(10),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
