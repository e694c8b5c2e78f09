//! Ticket and sync-run persistence: the storage port plus SQLite and in-memory engines.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hubsync_core::{
    CategorySet, CreationWindow, FilterOptions, NormalizedRecord, SyncCounts, SyncLogFilter,
    SyncLogPage, SyncLogTotals, SyncRun, SyncStage, TicketFilter, TicketSort,
};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hubsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("creating database directory {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("corrupt row {key}: {reason}")]
    CorruptRow { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage port for normalized tickets. Upserts are keyed by external ID and never delete.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Whether `upsert_batch` is all-or-nothing on this engine.
    fn supports_atomic_batch(&self) -> bool;

    async fn find_by_external_id(&self, external_id: &str)
        -> StoreResult<Option<NormalizedRecord>>;

    async fn upsert(&self, record: &NormalizedRecord) -> StoreResult<()>;

    async fn upsert_batch(&self, records: &[NormalizedRecord]) -> StoreResult<u64>;

    async fn count(&self, filter: &TicketFilter) -> StoreResult<u64>;

    async fn list_page(
        &self,
        filter: &TicketFilter,
        sort: TicketSort,
        limit: u32,
        offset: u64,
    ) -> StoreResult<Vec<NormalizedRecord>>;

    async fn list_external_ids(&self) -> StoreResult<Vec<String>>;

    async fn filter_options(&self) -> StoreResult<FilterOptions>;
}

#[async_trait]
pub trait SyncLogStore: Send + Sync {
    async fn record_run(&self, run: &SyncRun) -> StoreResult<()>;

    async fn list_runs(
        &self,
        filter: &SyncLogFilter,
        limit: u32,
        offset: u64,
    ) -> StoreResult<SyncLogPage>;
}

const CREATE_TICKETS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tickets (
    external_id TEXT PRIMARY KEY NOT NULL,
    ticket_number TEXT NOT NULL DEFAULT '',
    owner_id TEXT NOT NULL DEFAULT '',
    owner_name TEXT NOT NULL DEFAULT '',
    category_json TEXT NOT NULL DEFAULT '{"count":0,"ids":[],"labels":[]}',
    pipeline_stage TEXT NOT NULL DEFAULT '',
    pipeline_stage_label TEXT NOT NULL DEFAULT '',
    subject TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    company_name TEXT NOT NULL DEFAULT '',
    source_type TEXT NOT NULL DEFAULT '',
    support_object TEXT NOT NULL DEFAULT '',
    create_date TEXT NOT NULL DEFAULT '',
    created_at TEXT,
    synced_at TEXT NOT NULL,
    search_text TEXT NOT NULL DEFAULT ''
)
"#;

const CREATE_SYNC_LOGS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sync_logs (
    id TEXT PRIMARY KEY NOT NULL,
    trigger_name TEXT NOT NULL,
    range_label TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    fetched INTEGER NOT NULL DEFAULT 0,
    processed INTEGER NOT NULL DEFAULT 0,
    saved INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    message TEXT NOT NULL DEFAULT '',
    error TEXT,
    log_json TEXT NOT NULL DEFAULT '[]',
    window_from TEXT,
    window_to TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
)
"#;

const INDEX_SQL: [&str; 5] = [
    "CREATE INDEX IF NOT EXISTS idx_tickets_created_at ON tickets(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tickets_owner_name ON tickets(owner_name)",
    "CREATE INDEX IF NOT EXISTS idx_tickets_company_name ON tickets(company_name)",
    "CREATE INDEX IF NOT EXISTS idx_sync_logs_started_at ON sync_logs(started_at)",
    "CREATE INDEX IF NOT EXISTS idx_sync_logs_status ON sync_logs(status)",
];

const UPSERT_TICKET_SQL: &str = r#"
INSERT INTO tickets (
    external_id, ticket_number, owner_id, owner_name, category_json,
    pipeline_stage, pipeline_stage_label, subject, content, company_name,
    source_type, support_object, create_date, created_at, synced_at, search_text
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(external_id) DO UPDATE SET
    ticket_number = excluded.ticket_number,
    owner_id = excluded.owner_id,
    owner_name = excluded.owner_name,
    category_json = excluded.category_json,
    pipeline_stage = excluded.pipeline_stage,
    pipeline_stage_label = excluded.pipeline_stage_label,
    subject = excluded.subject,
    content = excluded.content,
    company_name = excluded.company_name,
    source_type = excluded.source_type,
    support_object = excluded.support_object,
    create_date = excluded.create_date,
    created_at = excluded.created_at,
    synced_at = excluded.synced_at,
    search_text = excluded.search_text
"#;

const TICKET_COLUMNS: &str = "external_id, ticket_number, owner_id, owner_name, category_json, \
    pipeline_stage, pipeline_stage_label, subject, content, company_name, source_type, \
    support_object, create_date, created_at, synced_at";

const UPSERT_RUN_SQL: &str = r#"
INSERT INTO sync_logs (
    id, trigger_name, range_label, status, fetched, processed, saved, failed,
    message, error, log_json, window_from, window_to, started_at, finished_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    status = excluded.status,
    fetched = excluded.fetched,
    processed = excluded.processed,
    saved = excluded.saved,
    failed = excluded.failed,
    message = excluded.message,
    error = excluded.error,
    log_json = excluded.log_json,
    finished_at = excluded.finished_at
"#;

/// Fixed-width UTC text so lexical order matches chronological order.
fn sortable(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_sortable(key: &str, raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.filter(|s| !s.is_empty())
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|err| StoreError::CorruptRow {
                    key: key.to_string(),
                    reason: format!("timestamp `{s}`: {err}"),
                })
        })
        .transpose()
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

/// File path behind a SQLite URL, or `None` for in-memory databases.
pub fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" || database_url.contains("mode=memory") {
        return None;
    }
    Some(PathBuf::from(path))
}

fn bind_ticket<'q>(
    record: &'q NormalizedRecord,
    category_json: String,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    sqlx::query(UPSERT_TICKET_SQL)
        .bind(record.external_id.as_str())
        .bind(record.ticket_number.as_str())
        .bind(record.owner_id.as_str())
        .bind(record.owner_name.as_str())
        .bind(category_json)
        .bind(record.pipeline_stage.as_str())
        .bind(record.pipeline_stage_label.as_str())
        .bind(record.subject.as_str())
        .bind(record.content.as_str())
        .bind(record.company_name.as_str())
        .bind(record.source_type.as_str())
        .bind(record.support_object.as_str())
        .bind(record.create_date.as_str())
        .bind(record.created_at.map(sortable))
        .bind(record.synced_at.as_str())
        .bind(record.search_text())
}

fn row_to_record(row: &SqliteRow) -> StoreResult<NormalizedRecord> {
    let external_id: String = row.try_get("external_id")?;
    let category_json: String = row.try_get("category_json")?;
    let category: CategorySet =
        serde_json::from_str(&category_json).map_err(|err| StoreError::CorruptRow {
            key: external_id.clone(),
            reason: format!("category: {err}"),
        })?;
    let created_at = parse_sortable(&external_id, row.try_get("created_at")?)?;

    Ok(NormalizedRecord {
        ticket_number: row.try_get("ticket_number")?,
        owner_id: row.try_get("owner_id")?,
        owner_name: row.try_get("owner_name")?,
        category,
        pipeline_stage: row.try_get("pipeline_stage")?,
        pipeline_stage_label: row.try_get("pipeline_stage_label")?,
        subject: row.try_get("subject")?,
        content: row.try_get("content")?,
        company_name: row.try_get("company_name")?,
        source_type: row.try_get("source_type")?,
        support_object: row.try_get("support_object")?,
        create_date: row.try_get("create_date")?,
        created_at,
        synced_at: row.try_get("synced_at")?,
        external_id,
    })
}

fn row_to_run(row: &SqliteRow) -> StoreResult<SyncRun> {
    let id: String = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::CorruptRow {
        key: id.clone(),
        reason,
    };
    let parsed_id = Uuid::parse_str(&id).map_err(|err| corrupt(format!("id: {err}")))?;
    let status: String = row.try_get("status")?;
    let stage = match status.as_str() {
        SyncRun::STATUS_SUCCESS => SyncStage::Done,
        SyncRun::STATUS_FAILED => SyncStage::Failed,
        other => return Err(corrupt(format!("unknown status `{other}`"))),
    };
    let log_json: String = row.try_get("log_json")?;
    let log: Vec<String> =
        serde_json::from_str(&log_json).map_err(|err| corrupt(format!("log: {err}")))?;
    let started_at = parse_sortable(&id, Some(row.try_get("started_at")?))?
        .ok_or_else(|| corrupt("missing started_at".to_string()))?;
    let count = |column: &str| -> StoreResult<usize> {
        let value: i64 = row.try_get(column)?;
        Ok(usize::try_from(value).unwrap_or_default())
    };

    Ok(SyncRun {
        id: parsed_id,
        trigger: row.try_get("trigger_name")?,
        range_label: row.try_get("range_label")?,
        window: CreationWindow {
            from: parse_sortable(&id, row.try_get("window_from")?)?,
            to: parse_sortable(&id, row.try_get("window_to")?)?,
        },
        stage,
        counts: SyncCounts {
            fetched: count("fetched")?,
            processed: count("processed")?,
            saved: count("saved")?,
            failed: count("failed")?,
        },
        log,
        message: row.try_get("message")?,
        error: row.try_get("error")?,
        started_at,
        finished_at: parse_sortable(&id, row.try_get("finished_at")?)?,
    })
}

fn push_ticket_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &TicketFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(from) = filter.created_from {
        builder.push(" AND created_at >= ").push_bind(sortable(from));
    }
    if let Some(to) = filter.created_to {
        builder.push(" AND created_at <= ").push_bind(sortable(to));
    }
    if let Some(category) = &filter.category {
        builder
            .push(" AND EXISTS (SELECT 1 FROM json_each(tickets.category_json, '$.labels') WHERE json_each.value = ")
            .push_bind(category.clone())
            .push(")");
    }
    if let Some(owner) = &filter.owner {
        builder.push(" AND owner_name = ").push_bind(owner.clone());
    }
    if let Some(term) = filter.search_term() {
        // SQLite LIKE only folds ASCII case, so match against the pre-lowercased column.
        builder
            .push(" AND search_text LIKE ")
            .push_bind(like_pattern(&term.to_lowercase()))
            .push(" ESCAPE '\\'");
    }
}

fn push_run_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &SyncLogFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(trigger) = &filter.trigger {
        builder.push(" AND trigger_name = ").push_bind(trigger.clone());
    }
    if let Some(status) = &filter.status {
        builder.push(" AND status = ").push_bind(status.clone());
    }
}

fn order_clause(sort: TicketSort) -> &'static str {
    match sort {
        TicketSort::CreatedDesc => " ORDER BY created_at IS NULL, created_at DESC, external_id",
        TicketSort::CreatedAsc => " ORDER BY created_at IS NULL, created_at ASC, external_id",
        TicketSort::SyncedDesc => " ORDER BY synced_at DESC, external_id",
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// SQLite engine over an sqlx pool. Batch upserts run inside one transaction.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect (creating the database file and its directory when needed) and migrate.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        if let Some(parent) = sqlite_file_path(database_url)
            .as_deref()
            .and_then(|path| path.parent())
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.display().to_string(),
                    source,
                })?;
        }

        // Every pooled connection to `:memory:` would open its own private database.
        let max_connections = if sqlite_file_path(database_url).is_none() {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(database_url, "sqlite store ready");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(CREATE_TICKETS_SQL).execute(&self.pool).await?;
        self.add_search_text_column().await?;
        sqlx::query(CREATE_SYNC_LOGS_SQL).execute(&self.pool).await?;
        for statement in INDEX_SQL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Upgrade tickets tables created before `search_text` existed and backfill the column.
    async fn add_search_text_column(&self) -> StoreResult<()> {
        let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('tickets')")
            .fetch_all(&self.pool)
            .await?;
        if columns.iter().any(|name| name == "search_text") {
            return Ok(());
        }

        sqlx::query("ALTER TABLE tickets ADD COLUMN search_text TEXT NOT NULL DEFAULT ''")
            .execute(&self.pool)
            .await?;
        let rows = sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM tickets"))
            .fetch_all(&self.pool)
            .await?;
        let mut tx = self.pool.begin().await?;
        for row in &rows {
            let record = row_to_record(row)?;
            sqlx::query("UPDATE tickets SET search_text = ? WHERE external_id = ?")
                .bind(record.search_text())
                .bind(record.external_id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(rows = rows.len(), "added search_text column to tickets");
        Ok(())
    }

    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TicketStore for SqliteStore {
    fn supports_atomic_batch(&self) -> bool {
        true
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<NormalizedRecord>> {
        let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE external_id = ?");
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn upsert(&self, record: &NormalizedRecord) -> StoreResult<()> {
        let category_json = serde_json::to_string(&record.category)?;
        bind_ticket(record, category_json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_batch(&self, records: &[NormalizedRecord]) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for record in records {
            let category_json = serde_json::to_string(&record.category)?;
            bind_ticket(record, category_json).execute(&mut *tx).await?;
            written += 1;
        }
        tx.commit().await?;
        debug!(written, "ticket batch committed");
        Ok(written)
    }

    async fn count(&self, filter: &TicketFilter) -> StoreResult<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM tickets");
        push_ticket_filter(&mut builder, filter);
        let row = builder.build().fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("total")?;
        Ok(u64::try_from(total).unwrap_or_default())
    }

    async fn list_page(
        &self,
        filter: &TicketFilter,
        sort: TicketSort,
        limit: u32,
        offset: u64,
    ) -> StoreResult<Vec<NormalizedRecord>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {TICKET_COLUMNS} FROM tickets"));
        push_ticket_filter(&mut builder, filter);
        builder.push(order_clause(sort));
        builder
            .push(" LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(to_i64(offset));
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn list_external_ids(&self) -> StoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT external_id FROM tickets ORDER BY external_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("external_id").map_err(StoreError::from))
            .collect()
    }

    async fn filter_options(&self) -> StoreResult<FilterOptions> {
        let owner_rows = sqlx::query(
            "SELECT DISTINCT owner_name FROM tickets WHERE owner_name <> '' ORDER BY owner_name",
        )
        .fetch_all(&self.pool)
        .await?;
        let category_rows = sqlx::query(
            r#"SELECT DISTINCT json_each.value AS label
               FROM tickets, json_each(tickets.category_json, '$.labels')
               ORDER BY label"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut owners = Vec::with_capacity(owner_rows.len());
        for row in &owner_rows {
            owners.push(row.try_get::<String, _>("owner_name")?);
        }
        let mut categories = BTreeSet::new();
        for row in &category_rows {
            let label: String = row.try_get("label")?;
            let label = label.trim();
            if !label.is_empty() {
                categories.insert(label.to_string());
            }
        }

        Ok(FilterOptions {
            categories: categories.into_iter().collect(),
            owners,
        })
    }
}

#[async_trait]
impl SyncLogStore for SqliteStore {
    async fn record_run(&self, run: &SyncRun) -> StoreResult<()> {
        let log_json = serde_json::to_string(&run.log)?;
        let count = |value: usize| i64::try_from(value).unwrap_or(i64::MAX);
        sqlx::query(UPSERT_RUN_SQL)
            .bind(run.id.to_string())
            .bind(run.trigger.as_str())
            .bind(run.range_label.as_str())
            .bind(run.status())
            .bind(count(run.counts.fetched))
            .bind(count(run.counts.processed))
            .bind(count(run.counts.saved))
            .bind(count(run.counts.failed))
            .bind(run.message.as_str())
            .bind(run.error.as_deref())
            .bind(log_json)
            .bind(run.window.from.map(sortable))
            .bind(run.window.to.map(sortable))
            .bind(sortable(run.started_at))
            .bind(run.finished_at.map(sortable))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_runs(
        &self,
        filter: &SyncLogFilter,
        limit: u32,
        offset: u64,
    ) -> StoreResult<SyncLogPage> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM sync_logs");
        push_run_filter(&mut builder, filter);
        builder
            .push(" ORDER BY started_at DESC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(to_i64(offset));
        let rows = builder.build().fetch_all(&self.pool).await?;
        let runs = rows.iter().map(row_to_run).collect::<StoreResult<Vec<_>>>()?;

        let mut totals_builder = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) AS runs, COALESCE(SUM(fetched), 0) AS fetched, COALESCE(SUM(saved), 0) AS saved FROM sync_logs",
        );
        push_run_filter(&mut totals_builder, filter);
        let row = totals_builder.build().fetch_one(&self.pool).await?;
        let read = |column: &str| -> StoreResult<u64> {
            let value: i64 = row.try_get(column)?;
            Ok(u64::try_from(value).unwrap_or_default())
        };
        let totals = SyncLogTotals {
            runs: read("runs")?,
            fetched: read("fetched")?,
            saved: read("saved")?,
        };

        Ok(SyncLogPage {
            runs,
            total: totals.runs,
            totals,
        })
    }
}

/// In-process engine. Batches are applied record by record, so they are not atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tickets: RwLock<BTreeMap<String, NormalizedRecord>>,
    runs: RwLock<Vec<SyncRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tickets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tickets.read().await.is_empty()
    }
}

fn sort_records(records: &mut [NormalizedRecord], sort: TicketSort) {
    match sort {
        TicketSort::CreatedDesc => records.sort_by(|a, b| {
            (a.created_at.is_none(), std::cmp::Reverse(a.created_at), &a.external_id).cmp(&(
                b.created_at.is_none(),
                std::cmp::Reverse(b.created_at),
                &b.external_id,
            ))
        }),
        TicketSort::CreatedAsc => records.sort_by(|a, b| {
            (a.created_at.is_none(), a.created_at, &a.external_id).cmp(&(
                b.created_at.is_none(),
                b.created_at,
                &b.external_id,
            ))
        }),
        TicketSort::SyncedDesc => records.sort_by(|a, b| {
            b.synced_at
                .cmp(&a.synced_at)
                .then_with(|| a.external_id.cmp(&b.external_id))
        }),
    }
}

fn page_bounds(offset: u64, limit: u32) -> (usize, usize) {
    (
        usize::try_from(offset).unwrap_or(usize::MAX),
        usize::try_from(limit).unwrap_or(usize::MAX),
    )
}

#[async_trait]
impl TicketStore for MemoryStore {
    fn supports_atomic_batch(&self) -> bool {
        false
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<NormalizedRecord>> {
        Ok(self.tickets.read().await.get(external_id).cloned())
    }

    async fn upsert(&self, record: &NormalizedRecord) -> StoreResult<()> {
        self.tickets
            .write()
            .await
            .insert(record.external_id.clone(), record.clone());
        Ok(())
    }

    async fn upsert_batch(&self, records: &[NormalizedRecord]) -> StoreResult<u64> {
        let mut written = 0u64;
        for record in records {
            self.upsert(record).await?;
            written += 1;
        }
        Ok(written)
    }

    async fn count(&self, filter: &TicketFilter) -> StoreResult<u64> {
        let tickets = self.tickets.read().await;
        Ok(tickets.values().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn list_page(
        &self,
        filter: &TicketFilter,
        sort: TicketSort,
        limit: u32,
        offset: u64,
    ) -> StoreResult<Vec<NormalizedRecord>> {
        let mut matching: Vec<NormalizedRecord> = self
            .tickets
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_records(&mut matching, sort);
        let (skip, take) = page_bounds(offset, limit);
        Ok(matching.into_iter().skip(skip).take(take).collect())
    }

    async fn list_external_ids(&self) -> StoreResult<Vec<String>> {
        Ok(self.tickets.read().await.keys().cloned().collect())
    }

    async fn filter_options(&self) -> StoreResult<FilterOptions> {
        let tickets = self.tickets.read().await;
        let mut categories = BTreeSet::new();
        let mut owners = BTreeSet::new();
        for record in tickets.values() {
            categories.extend(
                record
                    .category
                    .labels()
                    .iter()
                    .map(|l| l.trim())
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            );
            if !record.owner_name.is_empty() {
                owners.insert(record.owner_name.clone());
            }
        }
        Ok(FilterOptions {
            categories: categories.into_iter().collect(),
            owners: owners.into_iter().collect(),
        })
    }
}

#[async_trait]
impl SyncLogStore for MemoryStore {
    async fn record_run(&self, run: &SyncRun) -> StoreResult<()> {
        let mut runs = self.runs.write().await;
        match runs.iter_mut().find(|existing| existing.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        filter: &SyncLogFilter,
        limit: u32,
        offset: u64,
    ) -> StoreResult<SyncLogPage> {
        let runs = self.runs.read().await;
        let mut matching: Vec<&SyncRun> = runs.iter().filter(|r| filter.matches(r)).collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let totals = SyncLogTotals {
            runs: matching.len() as u64,
            fetched: matching.iter().map(|r| r.counts.fetched as u64).sum(),
            saved: matching.iter().map(|r| r.counts.saved as u64).sum(),
        };
        let (skip, take) = page_bounds(offset, limit);
        Ok(SyncLogPage {
            runs: matching.into_iter().skip(skip).take(take).cloned().collect(),
            total: totals.runs,
            totals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use hubsync_core::{parse_create_date, sync_timestamp};
    use tempfile::tempdir;

    fn record(id: &str, created: &str, owner: &str, categories: &[(&str, &str)]) -> NormalizedRecord {
        NormalizedRecord {
            external_id: id.to_string(),
            ticket_number: format!("T-{id}"),
            owner_id: "1".to_string(),
            owner_name: owner.to_string(),
            category: CategorySet::from_pairs(categories.iter().copied()),
            pipeline_stage: "1".to_string(),
            pipeline_stage_label: "New".to_string(),
            subject: format!("Subject {id}"),
            content: format!("Body of ticket {id}"),
            company_name: "Acme".to_string(),
            source_type: "EMAIL".to_string(),
            support_object: String::new(),
            create_date: created.to_string(),
            created_at: parse_create_date(created),
            synced_at: "2024-06-01T00:00:00.000Z".to_string(),
        }
    }

    async fn memory_sqlite() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite")
    }

    #[tokio::test]
    async fn sqlite_upsert_is_idempotent_and_replaces_mutable_fields() {
        let store = memory_sqlite().await;
        let original = record("100", "1704067200000", "Ada", &[("BILL", "Billing")]);

        store.upsert(&original).await.expect("first upsert");
        store.upsert(&original).await.expect("second upsert");
        assert_eq!(store.count(&TicketFilter::default()).await.expect("count"), 1);
        assert_eq!(
            store.find_by_external_id("100").await.expect("find"),
            Some(original.clone())
        );

        let mut changed = original.clone();
        changed.subject = "Updated".to_string();
        changed.owner_name = "Grace".to_string();
        store.upsert(&changed).await.expect("replace");

        let stored = store
            .find_by_external_id("100")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(stored.subject, "Updated");
        assert_eq!(stored.owner_name, "Grace");
        assert_eq!(stored.create_date, "1704067200000");
        assert_eq!(store.count(&TicketFilter::default()).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn sqlite_batch_is_all_or_nothing() {
        let store = memory_sqlite().await;
        let batch = vec![
            record("1", "2024-01-01T00:00:00Z", "Ada", &[]),
            record("2", "2024-01-02T00:00:00Z", "Ada", &[]),
        ];
        assert_eq!(store.upsert_batch(&batch).await.expect("batch"), 2);
        assert_eq!(store.list_external_ids().await.expect("ids"), ["1", "2"]);

        // Drop the table underneath the next batch so the transaction cannot commit.
        sqlx::query("DROP TABLE tickets")
            .execute(store.pool())
            .await
            .expect("drop");
        assert!(store.upsert_batch(&batch).await.is_err());
    }

    #[tokio::test]
    async fn sqlite_listing_filters_sorts_and_pages() {
        let store = memory_sqlite().await;
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().expect("ts");
        for day in 0..5i64 {
            let created = sync_timestamp(base + Duration::days(day));
            let owner = if day % 2 == 0 { "Ada" } else { "Grace" };
            let cats: &[(&str, &str)] = if day == 3 {
                &[("BILL", "Billing"), ("SHIP", "Shipping")]
            } else {
                &[("BILL", "Billing")]
            };
            store
                .upsert(&record(&format!("t{day}"), &created, owner, cats))
                .await
                .expect("upsert");
        }

        let newest = store
            .list_page(&TicketFilter::default(), TicketSort::CreatedDesc, 2, 0)
            .await
            .expect("page");
        let ids: Vec<_> = newest.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, ["t4", "t3"]);

        let second = store
            .list_page(&TicketFilter::default(), TicketSort::CreatedAsc, 2, 2)
            .await
            .expect("page");
        let ids: Vec<_> = second.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, ["t2", "t3"]);

        let shipping = TicketFilter {
            category: Some("Shipping".to_string()),
            ..TicketFilter::default()
        };
        assert_eq!(store.count(&shipping).await.expect("count"), 1);

        let grace = TicketFilter {
            owner: Some("Grace".to_string()),
            ..TicketFilter::default()
        };
        assert_eq!(store.count(&grace).await.expect("count"), 2);

        let window = TicketFilter {
            created_from: Some(base + Duration::days(1)),
            created_to: Some(base + Duration::days(2)),
            ..TicketFilter::default()
        };
        assert_eq!(store.count(&window).await.expect("count"), 2);

        let search = TicketFilter {
            search: Some("TICKET T4".to_string()),
            ..TicketFilter::default()
        };
        assert_eq!(store.count(&search).await.expect("count"), 1);

        let wildcard = TicketFilter {
            search: Some("%".to_string()),
            ..TicketFilter::default()
        };
        assert_eq!(store.count(&wildcard).await.expect("count"), 0);

        let options = store.filter_options().await.expect("options");
        assert_eq!(options.categories, ["Billing", "Shipping"]);
        assert_eq!(options.owners, ["Ada", "Grace"]);
    }

    #[tokio::test]
    async fn sqlite_file_database_is_created_under_missing_directory() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("tickets.sqlite");
        let url = format!("sqlite://{}?mode=rwc", path.display());

        let store = SqliteStore::connect(&url).await.expect("connect");
        store.ping().await.expect("ping");
        store
            .upsert(&record("9", "2024-01-01", "Ada", &[]))
            .await
            .expect("upsert");
        assert!(path.exists());
    }

    #[test]
    fn sqlite_urls_resolve_to_file_paths() {
        assert_eq!(
            sqlite_file_path("sqlite://data/database.sqlite?mode=rwc"),
            Some(PathBuf::from("data/database.sqlite"))
        );
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://localhost/db"), None);
    }

    fn finished_run(trigger: &str, fetched: usize, saved: usize, ok: bool, minutes: i64) -> SyncRun {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().expect("ts")
            + Duration::minutes(minutes);
        let mut run = SyncRun::start(trigger, start);
        run.counts = SyncCounts {
            fetched,
            processed: saved,
            saved,
            failed: fetched - saved,
        };
        run.push_log("started");
        if ok {
            run.finish("done", start + Duration::seconds(5));
        } else {
            run.fail("boom", start + Duration::seconds(5));
        }
        run
    }

    #[tokio::test]
    async fn sync_logs_round_trip_newest_first_with_totals() {
        let sqlite = memory_sqlite().await;
        let memory = MemoryStore::new();
        let runs = [
            finished_run("sync_1_day", 10, 9, true, 0),
            finished_run("sync_7_days", 5, 0, false, 10),
            finished_run("sync_1_day", 3, 3, true, 20),
        ];

        for engine in [&sqlite as &dyn SyncLogStore, &memory as &dyn SyncLogStore] {
            for run in &runs {
                engine.record_run(run).await.expect("record");
            }

            let page = engine
                .list_runs(&SyncLogFilter::default(), 2, 0)
                .await
                .expect("list");
            assert_eq!(page.total, 3);
            assert_eq!(page.runs.len(), 2);
            assert_eq!(page.runs[0].id, runs[2].id);
            assert_eq!(page.runs[0].log, vec!["started".to_string()]);
            assert_eq!(page.totals.fetched, 18);
            assert_eq!(page.totals.saved, 12);

            let failed = engine
                .list_runs(
                    &SyncLogFilter {
                        status: Some(SyncRun::STATUS_FAILED.to_string()),
                        ..SyncLogFilter::default()
                    },
                    10,
                    0,
                )
                .await
                .expect("list");
            assert_eq!(failed.total, 1);
            assert_eq!(failed.runs[0].error.as_deref(), Some("boom"));
        }
    }

    #[tokio::test]
    async fn memory_store_mirrors_listing_semantics() {
        let store = MemoryStore::new();
        assert!(!store.supports_atomic_batch());
        let batch = vec![
            record("b", "2024-01-02T00:00:00Z", "Ada", &[("BILL", "Billing")]),
            record("a", "2024-01-01T00:00:00Z", "Grace", &[]),
            record("c", "", "", &[]),
        ];
        store.upsert_batch(&batch).await.expect("batch");
        store.upsert_batch(&batch).await.expect("batch again");
        assert_eq!(store.len().await, 3);

        let page = store
            .list_page(&TicketFilter::default(), TicketSort::CreatedDesc, 10, 0)
            .await
            .expect("page");
        let ids: Vec<_> = page.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, ["b", "a", "c"]);

        let options = store.filter_options().await.expect("options");
        assert_eq!(options.categories, ["Billing"]);
        assert_eq!(options.owners, ["Ada", "Grace"]);
    }

    #[tokio::test]
    async fn search_folds_non_ascii_case_on_both_engines() {
        let mut ticket = record("vn", "2024-01-01T00:00:00Z", "Ada", &[]);
        ticket.subject = "Lỗi Đăng nhập".to_string();
        ticket.company_name = "ÉCOLE Nationale".to_string();

        let sqlite = memory_sqlite().await;
        sqlite.upsert(&ticket).await.expect("upsert");
        let memory = MemoryStore::new();
        memory.upsert(&ticket).await.expect("upsert");

        for term in ["đăng", "LỖI", "école", "nationale"] {
            let filter = TicketFilter {
                search: Some(term.to_string()),
                ..TicketFilter::default()
            };
            assert_eq!(sqlite.count(&filter).await.expect("count"), 1, "{term}");
            assert_eq!(memory.count(&filter).await.expect("count"), 1, "{term}");
        }

        let across_fields = TicketFilter {
            search: Some("nhập body".to_string()),
            ..TicketFilter::default()
        };
        assert_eq!(sqlite.count(&across_fields).await.expect("count"), 0);
        assert_eq!(memory.count(&across_fields).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn migrate_backfills_search_text_on_older_tables() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        let legacy_schema = CREATE_TICKETS_SQL.replace(",\n    search_text TEXT NOT NULL DEFAULT ''", "");
        assert!(!legacy_schema.contains("search_text"));
        sqlx::query(&legacy_schema).execute(&pool).await.expect("legacy table");
        sqlx::query(
            "INSERT INTO tickets (external_id, subject, synced_at) VALUES ('old', 'Đơn Hàng', '2024-06-01T00:00:00.000Z')",
        )
        .execute(&pool)
        .await
        .expect("legacy row");

        let store = SqliteStore::from_pool(pool);
        store.migrate().await.expect("migrate");
        store.migrate().await.expect("migrate is repeatable");

        let filter = TicketFilter {
            search: Some("đơn hàng".to_string()),
            ..TicketFilter::default()
        };
        assert_eq!(store.count(&filter).await.expect("count"), 1);
    }
}
