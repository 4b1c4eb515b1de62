use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use core_types::{AppendReceipt, Column, RangeSpec, Row, TabularStore, quote_sheet_name};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row as _, SqlitePool};
use tracing::{debug, info};

pub const CURRENT_DB_SCHEMA_VERSION: u32 = 1;

/// Append-only sheets kept in SQLite. Sheet row `n` is the `n`-th row
/// appended to that sheet, header included.
#[derive(Debug, Clone)]
pub struct SqliteSheetStore {
    pool: SqlitePool,
}

impl SqliteSheetStore {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().to_string_lossy()
        ))?
        .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sheet_rows (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                sheet TEXT NOT NULL,
                cells_json TEXT NOT NULL,
                appended_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS sheet_rows_by_sheet ON sheet_rows(sheet, seq)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO metadata(key, value)
            VALUES ('schema_version', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(CURRENT_DB_SCHEMA_VERSION.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = 'schema_version'")
            .fetch_one(&self.pool)
            .await?;
        let version = row.get::<String, _>("value").parse::<u32>()?;
        Ok(version)
    }

    pub async fn row_count(&self, sheet: &str) -> Result<u32> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sheet_rows WHERE sheet = ?1")
            .bind(sheet)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as u32)
    }

    /// Writes `header` as row 1 of a sheet that has no rows yet.
    pub async fn ensure_header(&self, sheet: &str, header: Row) -> Result<bool> {
        if self.row_count(sheet).await? > 0 {
            return Ok(false);
        }
        self.append_rows(sheet, &RangeSpec::columns(Column::new(0), Column::new(0)), vec![header])
            .await?;
        info!(sheet, "wrote header row");
        Ok(true)
    }
}

#[async_trait]
impl TabularStore for SqliteSheetStore {
    async fn read_range(&self, sheet: &str, range: &RangeSpec) -> Result<Vec<Row>> {
        let first = range.first_row.unwrap_or(1).max(1);
        let limit = match range.last_row {
            Some(last) if last < first => return Ok(Vec::new()),
            Some(last) => i64::from(last - first + 1),
            None => -1,
        };

        let records = sqlx::query(
            r#"
            SELECT cells_json
            FROM sheet_rows
            WHERE sheet = ?1
            ORDER BY seq ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(sheet)
        .bind(limit)
        .bind(i64::from(first - 1))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to read {}", range.to_a1(sheet)))?;

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let cells: Row = serde_json::from_str(&record.get::<String, _>("cells_json"))
                .context("invalid row in local sheet store")?;
            rows.push(window(cells, range));
        }
        while rows.last().is_some_and(Vec::is_empty) {
            rows.pop();
        }
        debug!(sheet, rows = rows.len(), "read local range");
        Ok(rows)
    }

    async fn append_rows(
        &self,
        sheet: &str,
        range: &RangeSpec,
        rows: Vec<Row>,
    ) -> Result<AppendReceipt> {
        let mut tx = self.pool.begin().await?;
        let before = sqlx::query("SELECT COUNT(*) AS n FROM sheet_rows WHERE sheet = ?1")
            .bind(sheet)
            .fetch_one(&mut *tx)
            .await?
            .get::<i64, _>("n") as u32;

        let now = Utc::now().to_rfc3339();
        let mut widest = 0usize;
        for row in &rows {
            let mut cells = vec![String::new(); range.start.index()];
            cells.extend(row.iter().cloned());
            widest = widest.max(cells.len());
            sqlx::query(
                r#"INSERT INTO sheet_rows(sheet, cells_json, appended_at) VALUES (?1, ?2, ?3)"#,
            )
            .bind(sheet)
            .bind(serde_json::to_string(&cells)?)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let appended = rows.len() as u32;
        let updated_range = (appended > 0).then(|| {
            let end = Column::new(widest.max(range.start.index() + 1) - 1);
            RangeSpec::rows(range.start, end, before + 1, before + appended).to_a1(sheet)
        });
        info!(sheet = %quote_sheet_name(sheet), rows = appended, "appended local rows");
        Ok(AppendReceipt {
            updated_range,
            updated_rows: appended,
        })
    }
}

/// Cuts a stored row down to the range's columns, dropping trailing blanks
/// the way the remote API omits them.
fn window(cells: Row, range: &RangeSpec) -> Row {
    let mut out: Row = cells
        .into_iter()
        .skip(range.start.index())
        .take(range.width())
        .collect();
    while out.last().is_some_and(String::is_empty) {
        out.pop();
    }
    out
}
