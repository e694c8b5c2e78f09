//! Ticket sync pipeline: normalization, upserts, run orchestration, refreshes and scheduling.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use hubsync_adapters::{
    ApiError, FetchConfig, FixtureTicketApi, HubSpotClient, HubSpotClientConfig, PageProgress,
    PaginatedFetcher, RateLimiter, ReferenceDataResolver, StageCache, TicketApi,
    DEFAULT_BASE_URL,
};
use hubsync_core::{
    parse_create_date, props, sync_timestamp, truncate_chars, CategorySet, NormalizedRecord,
    ReferenceData, RemoteRecord, RunProgress, SyncRequest, SyncResult, SyncRun, SyncStage,
    SyncTrigger, TriggerError, CONTENT_MAX_CHARS, UNKNOWN_OWNER,
};
use hubsync_storage::{SqliteStore, StoreError, SyncLogStore, TicketStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "hubsync-sync";

const FETCH_SHARE: u8 = 30;
const PROCESS_SHARE: u8 = 40;
const SAVE_SHARE: u8 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub access_token: Option<String>,
    pub base_url: String,
    pub database_url: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub page_delay_ms: u64,
    pub rate_limit_calls: usize,
    pub rate_limit_window_ms: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
    /// Serve the remote API from a JSON fixture instead of HubSpot.
    pub fixture_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            database_url: "sqlite://data/database.sqlite?mode=rwc".to_string(),
            page_size: 100,
            max_pages: 50,
            page_delay_ms: 200,
            rate_limit_calls: 100,
            rate_limit_window_ms: 10_000,
            http_timeout_secs: 20,
            user_agent: "hubsync/0.1".to_string(),
            scheduler_enabled: false,
            sync_cron: "0 0 * * * *".to_string(),
            web_port: 8000,
            fixture_path: None,
        }
    }
}

/// Optional YAML layer under the environment; keys mirror [`SyncConfig`] fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub access_token: Option<String>,
    pub base_url: Option<String>,
    pub database_url: Option<String>,
    pub page_size: Option<u32>,
    pub max_pages: Option<u32>,
    pub page_delay_ms: Option<u64>,
    pub rate_limit_calls: Option<usize>,
    pub rate_limit_window_ms: Option<u64>,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub scheduler_enabled: Option<bool>,
    pub sync_cron: Option<String>,
    pub web_port: Option<u16>,
    pub fixture_path: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    /// Defaults, then the YAML file named by `HUBSYNC_CONFIG` (if any), then env vars.
    pub fn from_env() -> anyhow::Result<Self> {
        let file = match std::env::var("HUBSYNC_CONFIG") {
            Ok(path) if !path.trim().is_empty() => FileConfig::load(Path::new(path.trim()))?,
            _ => FileConfig::default(),
        };
        Ok(Self::from_sources(file, |key| std::env::var(key).ok()))
    }

    pub fn from_sources(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        config.apply_file(file);
        config.apply_env(env);
        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        if file.access_token.is_some() {
            self.access_token = file.access_token;
        }
        if let Some(v) = file.base_url {
            self.base_url = v;
        }
        if let Some(v) = file.database_url {
            self.database_url = v;
        }
        if let Some(v) = file.page_size {
            self.page_size = v;
        }
        if let Some(v) = file.max_pages {
            self.max_pages = v;
        }
        if let Some(v) = file.page_delay_ms {
            self.page_delay_ms = v;
        }
        if let Some(v) = file.rate_limit_calls {
            self.rate_limit_calls = v;
        }
        if let Some(v) = file.rate_limit_window_ms {
            self.rate_limit_window_ms = v;
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.scheduler_enabled {
            self.scheduler_enabled = v;
        }
        if let Some(v) = file.sync_cron {
            self.sync_cron = v;
        }
        if let Some(v) = file.web_port {
            self.web_port = v;
        }
        if file.fixture_path.is_some() {
            self.fixture_path = file.fixture_path;
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| {
            env(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = var("HUBSPOT_ACCESS_TOKEN") {
            self.access_token = Some(v);
        }
        if let Some(v) = var("HUBSPOT_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = var("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = number("HUBSYNC_PAGE_SIZE").and_then(|v| u32::try_from(v).ok()) {
            self.page_size = v;
        }
        if let Some(v) = number("HUBSYNC_MAX_PAGES").and_then(|v| u32::try_from(v).ok()) {
            self.max_pages = v;
        }
        if let Some(v) = number("HUBSYNC_PAGE_DELAY_MS") {
            self.page_delay_ms = v;
        }
        if let Some(v) = number("HUBSYNC_RATE_LIMIT_CALLS").and_then(|v| usize::try_from(v).ok()) {
            self.rate_limit_calls = v;
        }
        if let Some(v) = number("HUBSYNC_RATE_LIMIT_WINDOW_MS") {
            self.rate_limit_window_ms = v;
        }
        if let Some(v) = number("HUBSYNC_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v;
        }
        if let Some(v) = var("HUBSYNC_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = var("HUBSYNC_SCHEDULER_ENABLED") {
            self.scheduler_enabled = parse_flag(&v);
        }
        if let Some(v) = var("HUBSYNC_SYNC_CRON") {
            self.sync_cron = v;
        }
        if let Some(v) = number("HUBSYNC_WEB_PORT").and_then(|v| u16::try_from(v).ok()) {
            self.web_port = v;
        }
        if let Some(v) = var("HUBSYNC_FIXTURE") {
            self.fixture_path = Some(PathBuf::from(v));
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            page_size: self.page_size.clamp(1, 100),
            max_pages: self.max_pages.max(1),
            page_delay: Duration::from_millis(self.page_delay_ms),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.rate_limit_calls,
            Duration::from_millis(self.rate_limit_window_ms),
        )
    }

    pub fn client_config(&self) -> HubSpotClientConfig {
        HubSpotClientConfig {
            base_url: self.base_url.clone(),
            access_token: self.access_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Batch sizes and pauses for the processing, saving and refresh loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTuning {
    pub process_batch_size: usize,
    pub process_batch_delay: Duration,
    pub save_batch_size: usize,
    pub save_batch_delay: Duration,
    pub refresh_delay: Duration,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            process_batch_size: 20,
            process_batch_delay: Duration::from_millis(100),
            save_batch_size: 10,
            save_batch_delay: Duration::from_millis(200),
            refresh_delay: Duration::from_millis(200),
        }
    }
}

impl PipelineTuning {
    /// Default batch sizes with every pause removed.
    pub fn immediate() -> Self {
        Self {
            process_batch_delay: Duration::ZERO,
            save_batch_delay: Duration::ZERO,
            refresh_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("ticket has no external id")]
    MissingExternalId,
    #[error("ticket {external_id} rejected: {reason}")]
    Rejected { external_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid trigger: {0}")]
    InvalidTrigger(#[from] TriggerError),
    #[error("fetching tickets failed: {0}")]
    Fetch(#[from] ApiError),
    #[error("all {attempted} fetched tickets failed to process")]
    AllRecordsFailed { attempted: usize },
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error("storage failed: {0}")]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait RecordTransformer: Send + Sync {
    async fn transform(
        &self,
        raw: &RemoteRecord,
        refs: &ReferenceData,
    ) -> Result<NormalizedRecord, TransformError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TicketTransformer;

#[async_trait]
impl RecordTransformer for TicketTransformer {
    async fn transform(
        &self,
        raw: &RemoteRecord,
        refs: &ReferenceData,
    ) -> Result<NormalizedRecord, TransformError> {
        normalize_ticket(raw, refs, Utc::now())
    }
}

/// Map a raw ticket onto its storage shape. Only a missing external ID is an error;
/// unresolved references fall back to "Unknown" (owners) or the raw code.
pub fn normalize_ticket(
    raw: &RemoteRecord,
    refs: &ReferenceData,
    synced_at: DateTime<Utc>,
) -> Result<NormalizedRecord, TransformError> {
    let external_id = raw.id.trim();
    if external_id.is_empty() {
        return Err(TransformError::MissingExternalId);
    }

    let owner_id = raw.property(props::OWNER_ID).trim();
    let owner_name = if owner_id.is_empty() {
        UNKNOWN_OWNER
    } else {
        refs.owners.resolve_or(owner_id, UNKNOWN_OWNER)
    };
    let stage = raw.property(props::PIPELINE_STAGE).trim();
    let ticket_number = match raw.property(props::TICKET_ID).trim() {
        "" => external_id,
        number => number,
    };
    let create_date = raw.create_date();

    Ok(NormalizedRecord {
        external_id: external_id.to_string(),
        ticket_number: ticket_number.to_string(),
        owner_id: owner_id.to_string(),
        owner_name: owner_name.to_string(),
        category: CategorySet::parse(raw.property(props::CATEGORY), &refs.categories),
        pipeline_stage: stage.to_string(),
        pipeline_stage_label: refs.stages.resolve_or(stage, stage).to_string(),
        subject: raw.property(props::SUBJECT).to_string(),
        content: truncate_chars(raw.property(props::CONTENT), CONTENT_MAX_CHARS),
        company_name: raw.property(props::COMPANY_NAME).to_string(),
        source_type: raw.property(props::SOURCE_TYPE).to_string(),
        support_object: raw.property(props::SUPPORT_OBJECT).to_string(),
        create_date: create_date.to_string(),
        created_at: parse_create_date(create_date),
        synced_at: sync_timestamp(synced_at),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub saved: usize,
    pub failed: usize,
    /// `(external_id, error)` for every record that was not written.
    pub failures: Vec<(String, String)>,
}

/// Write side of the pipeline over any [`TicketStore`].
#[derive(Clone)]
pub struct UpsertSink {
    store: Arc<dyn TicketStore>,
}

impl UpsertSink {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, record: &NormalizedRecord) -> Result<(), StoreError> {
        self.store.upsert(record).await
    }

    /// One atomic write when the engine supports it, otherwise record by record.
    pub async fn upsert_many(&self, records: &[NormalizedRecord]) -> BatchOutcome {
        if records.is_empty() {
            return BatchOutcome::default();
        }

        if self.store.supports_atomic_batch() {
            return match self.store.upsert_batch(records).await {
                Ok(_) => BatchOutcome {
                    saved: records.len(),
                    ..BatchOutcome::default()
                },
                Err(err) => {
                    warn!(records = records.len(), error = %err, "ticket batch rolled back");
                    let reason = err.to_string();
                    BatchOutcome {
                        saved: 0,
                        failed: records.len(),
                        failures: records
                            .iter()
                            .map(|r| (r.external_id.clone(), reason.clone()))
                            .collect(),
                    }
                }
            };
        }

        let mut outcome = BatchOutcome::default();
        for record in records {
            match self.store.upsert(record).await {
                Ok(()) => outcome.saved += 1,
                Err(err) => {
                    warn!(external_id = %record.external_id, error = %err, "ticket upsert failed");
                    outcome.failed += 1;
                    outcome
                        .failures
                        .push((record.external_id.clone(), err.to_string()));
                }
            }
        }
        outcome
    }
}

pub type ProgressCallback<'a> = dyn Fn(RunProgress) + Send + Sync + 'a;

fn emit(on_progress: Option<&ProgressCallback<'_>>, percent: u8, message: &str) {
    if let Some(callback) = on_progress {
        callback(RunProgress {
            percent: percent.min(100),
            message: message.to_string(),
        });
    }
}

/// Log a milestone on the run and relay it as progress.
fn step(run: &mut SyncRun, on_progress: Option<&ProgressCallback<'_>>, percent: u8, message: String) {
    emit(on_progress, percent, &message);
    run.push_log(message);
}

fn scaled(base: u8, span: u8, fraction: f64) -> u8 {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        1.0
    };
    base.saturating_add((f64::from(span) * fraction).round() as u8)
}

fn ratio(done: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Drives one run through fetching, processing and saving. Consumed by [`SyncOrchestrator::run`].
pub struct SyncOrchestrator {
    api: Arc<dyn TicketApi>,
    sink: UpsertSink,
    run_log: Option<Arc<dyn SyncLogStore>>,
    transformer: Arc<dyn RecordTransformer>,
    limiter: Arc<RateLimiter>,
    stage_cache: Arc<StageCache>,
    fetch: FetchConfig,
    tuning: PipelineTuning,
}

impl SyncOrchestrator {
    pub fn new(api: Arc<dyn TicketApi>, store: Arc<dyn TicketStore>) -> Self {
        Self {
            api,
            sink: UpsertSink::new(store),
            run_log: None,
            transformer: Arc::new(TicketTransformer),
            limiter: Arc::new(RateLimiter::default()),
            stage_cache: Arc::new(StageCache::new()),
            fetch: FetchConfig::default(),
            tuning: PipelineTuning::default(),
        }
    }

    pub fn with_run_log(mut self, run_log: Arc<dyn SyncLogStore>) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn RecordTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_stage_cache(mut self, stage_cache: Arc<StageCache>) -> Self {
        self.stage_cache = stage_cache;
        self
    }

    pub fn with_fetch_config(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_tuning(mut self, tuning: PipelineTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Execute the run to a terminal stage. Never returns an error: failures are carried
    /// in the result, and the finished run is persisted when a run log is attached.
    pub async fn run(
        self,
        request: &SyncRequest,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> SyncResult {
        let mut run = SyncRun::start(request.trigger.trim(), Utc::now());
        let span = info_span!("sync_run", run_id = %run.id, trigger = %run.trigger);

        async {
            match self.drive(request, &mut run, on_progress).await {
                Ok(message) => {
                    run.finish(message, Utc::now());
                    info!(
                        fetched = run.counts.fetched,
                        processed = run.counts.processed,
                        saved = run.counts.saved,
                        failed = run.counts.failed,
                        "sync run finished"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "sync run failed");
                    run.push_log(format!("Sync failed: {err}"));
                    run.fail(err.to_string(), Utc::now());
                }
            }

            if let Some(run_log) = &self.run_log {
                if let Err(err) = run_log.record_run(&run).await {
                    warn!(error = %err, "could not persist sync run");
                }
            }
            run.to_result()
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        request: &SyncRequest,
        run: &mut SyncRun,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<String, SyncError> {
        let trigger = SyncTrigger::from_request(request)?;
        run.range_label = trigger.to_string();
        run.window = trigger.creation_window(Utc::now());
        run.advance(SyncStage::Fetching);
        let starting = format!("Starting sync of {}", run.range_label);
        step(run, on_progress, 0, starting);

        let fetcher = PaginatedFetcher::new(
            Arc::clone(&self.api),
            Arc::clone(&self.limiter),
            self.fetch.clone(),
        );
        let resolver =
            ReferenceDataResolver::new(Arc::clone(&self.api), Arc::clone(&self.stage_cache));
        let page_log = Mutex::new(Vec::new());
        let on_page = |page: PageProgress| {
            let message = format!(
                "Fetched page {} ({} of ~{} tickets)",
                page.page, page.fetched_so_far, page.total_estimate
            );
            emit(on_progress, scaled(0, FETCH_SHARE, page.fraction()), &message);
            page_log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message);
        };

        let window = run.window;
        let (fetched, references) = tokio::join!(
            fetcher.fetch_all(&window, Some(&on_page)),
            resolver.resolve_all()
        );
        run.log
            .extend(page_log.into_inner().unwrap_or_else(PoisonError::into_inner));
        let fetched = fetched?;
        for warning in references.warnings {
            run.push_log(warning);
        }

        let records = fetched.records;
        run.counts.fetched = records.len();
        if fetched.truncated {
            run.push_log(format!(
                "Stopped after {} pages (page limit), {} tickets collected",
                fetched.pages,
                records.len()
            ));
        }
        if records.is_empty() {
            step(run, on_progress, 100, "No tickets found, nothing to sync".to_string());
            return Ok(format!("Nothing to sync for {}", run.range_label));
        }
        step(
            run,
            on_progress,
            FETCH_SHARE,
            format!("Fetched {} tickets in {} pages", records.len(), fetched.pages),
        );

        run.advance(SyncStage::Processing);
        let normalized = self
            .process(&records, &references.data, run, on_progress)
            .await;
        run.counts.processed = normalized.len();
        run.counts.failed = records.len() - normalized.len();
        if normalized.is_empty() {
            return Err(SyncError::AllRecordsFailed {
                attempted: records.len(),
            });
        }
        step(
            run,
            on_progress,
            FETCH_SHARE + PROCESS_SHARE,
            format!("Processed {} of {} tickets", normalized.len(), records.len()),
        );

        run.advance(SyncStage::Saving);
        self.save(&normalized, run, on_progress).await;

        let message = format!(
            "Synced {} of {} fetched tickets ({})",
            run.counts.saved, run.counts.fetched, run.range_label
        );
        step(run, on_progress, 100, message.clone());
        Ok(message)
    }

    async fn process(
        &self,
        records: &[RemoteRecord],
        refs: &ReferenceData,
        run: &mut SyncRun,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Vec<NormalizedRecord> {
        let total = records.len();
        let mut normalized = Vec::with_capacity(total);
        let mut attempted = 0usize;

        for (index, batch) in records
            .chunks(self.tuning.process_batch_size.max(1))
            .enumerate()
        {
            if index > 0 {
                pause(self.tuning.process_batch_delay).await;
            }
            let results = join_all(
                batch
                    .iter()
                    .map(|raw| self.transformer.transform(raw, refs)),
            )
            .await;

            for (raw, result) in batch.iter().zip(results) {
                attempted += 1;
                match result {
                    Ok(record) => normalized.push(record),
                    Err(err) => {
                        let id = match raw.id.trim() {
                            "" => "<missing id>",
                            id => id,
                        };
                        warn!(external_id = id, error = %err, "ticket transform failed");
                        run.push_log(format!("Failed to process ticket {id}: {err}"));
                    }
                }
            }
            emit(
                on_progress,
                scaled(FETCH_SHARE, PROCESS_SHARE, ratio(attempted, total)),
                &format!("Processed {attempted}/{total} tickets"),
            );
        }
        normalized
    }

    async fn save(
        &self,
        records: &[NormalizedRecord],
        run: &mut SyncRun,
        on_progress: Option<&ProgressCallback<'_>>,
    ) {
        let total = records.len();

        for (index, batch) in records
            .chunks(self.tuning.save_batch_size.max(1))
            .enumerate()
        {
            if index > 0 {
                pause(self.tuning.save_batch_delay).await;
            }
            let outcome = self.sink.upsert_many(batch).await;
            run.counts.saved += outcome.saved;
            run.counts.failed += outcome.failed;
            for (external_id, reason) in &outcome.failures {
                run.push_log(format!("Failed to save ticket {external_id}: {reason}"));
            }
            emit(
                on_progress,
                scaled(FETCH_SHARE + PROCESS_SHARE, SAVE_SHARE, ratio(run.counts.saved, total)),
                &format!("Saved {}/{total} tickets", run.counts.saved),
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed(Box<NormalizedRecord>),
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub total: usize,
    pub refreshed: usize,
    pub not_found: usize,
    pub failed: usize,
    pub log: Vec<String>,
}

/// Re-fetches stored tickets by ID and upserts the fresh copy.
pub struct TicketRefresher {
    api: Arc<dyn TicketApi>,
    store: Arc<dyn TicketStore>,
    sink: UpsertSink,
    transformer: Arc<dyn RecordTransformer>,
    stage_cache: Arc<StageCache>,
    delay: Duration,
}

impl TicketRefresher {
    pub fn new(api: Arc<dyn TicketApi>, store: Arc<dyn TicketStore>) -> Self {
        Self {
            api,
            sink: UpsertSink::new(Arc::clone(&store)),
            store,
            transformer: Arc::new(TicketTransformer),
            stage_cache: Arc::new(StageCache::new()),
            delay: PipelineTuning::default().refresh_delay,
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn RecordTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_stage_cache(mut self, stage_cache: Arc<StageCache>) -> Self {
        self.stage_cache = stage_cache;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn resolver(&self) -> ReferenceDataResolver {
        ReferenceDataResolver::new(Arc::clone(&self.api), Arc::clone(&self.stage_cache))
    }

    pub async fn refresh_ticket(&self, external_id: &str) -> Result<RefreshOutcome, SyncError> {
        let references = self.resolver().resolve_all().await;
        self.refresh_with(external_id, &references.data).await
    }

    async fn refresh_with(
        &self,
        external_id: &str,
        refs: &ReferenceData,
    ) -> Result<RefreshOutcome, SyncError> {
        let Some(raw) = self.api.get_ticket(external_id).await? else {
            return Ok(RefreshOutcome::NotFound);
        };
        let record = self.transformer.transform(&raw, refs).await?;
        self.sink.upsert(&record).await?;
        info!(external_id, "ticket refreshed");
        Ok(RefreshOutcome::Refreshed(Box::new(record)))
    }

    /// Refresh every stored ticket in ID order, pausing between tickets.
    pub async fn refresh_all(&self) -> Result<RefreshSummary, SyncError> {
        let ids = self.store.list_external_ids().await?;
        let references = self.resolver().resolve_all().await;
        let mut summary = RefreshSummary {
            total: ids.len(),
            log: references.warnings.clone(),
            ..RefreshSummary::default()
        };
        summary
            .log
            .push(format!("Refreshing {} stored tickets", ids.len()));

        for (index, id) in ids.iter().enumerate() {
            if index > 0 {
                pause(self.delay).await;
            }
            match self.refresh_with(id, &references.data).await {
                Ok(RefreshOutcome::Refreshed(_)) => summary.refreshed += 1,
                Ok(RefreshOutcome::NotFound) => {
                    summary.not_found += 1;
                    summary
                        .log
                        .push(format!("Ticket {id} no longer exists remotely"));
                }
                Err(err) => {
                    warn!(external_id = %id, error = %err, "ticket refresh failed");
                    summary.failed += 1;
                    summary.log.push(format!("Failed to refresh ticket {id}: {err}"));
                }
            }
        }

        summary.log.push(format!(
            "Refreshed {} of {} tickets ({} missing, {} failed)",
            summary.refreshed, summary.total, summary.not_found, summary.failed
        ));
        Ok(summary)
    }
}

/// Configured collaborators, shared by the CLI, the web API and the scheduler.
#[derive(Clone)]
pub struct SyncService {
    config: SyncConfig,
    api: Arc<dyn TicketApi>,
    store: Arc<dyn TicketStore>,
    runs: Arc<dyn SyncLogStore>,
    stage_cache: Arc<StageCache>,
    tuning: PipelineTuning,
}

impl SyncService {
    pub fn new(
        config: SyncConfig,
        api: Arc<dyn TicketApi>,
        store: Arc<dyn TicketStore>,
        runs: Arc<dyn SyncLogStore>,
    ) -> Self {
        Self {
            config,
            api,
            store,
            runs,
            stage_cache: Arc::new(StageCache::new()),
            tuning: PipelineTuning::default(),
        }
    }

    /// Open the SQLite store and pick the remote API (fixture file or HubSpot).
    pub async fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        let store = Arc::new(
            SqliteStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening database {}", config.database_url))?,
        );
        let api: Arc<dyn TicketApi> = match &config.fixture_path {
            Some(path) => {
                info!(fixture = %path.display(), "serving tickets from fixture");
                Arc::new(FixtureTicketApi::from_path(path)?)
            }
            None => {
                if config.access_token.is_none() {
                    warn!("HUBSPOT_ACCESS_TOKEN is not set, remote calls will fail");
                }
                Arc::new(HubSpotClient::new(config.client_config())?)
            }
        };
        Ok(Self::new(config, api, store.clone(), store))
    }

    pub fn with_tuning(mut self, tuning: PipelineTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TicketStore> {
        Arc::clone(&self.store)
    }

    pub fn runs(&self) -> Arc<dyn SyncLogStore> {
        Arc::clone(&self.runs)
    }

    pub fn stage_cache(&self) -> Arc<StageCache> {
        Arc::clone(&self.stage_cache)
    }

    /// Fresh single-use orchestrator with its own rate limiter.
    pub fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(Arc::clone(&self.api), Arc::clone(&self.store))
            .with_run_log(Arc::clone(&self.runs))
            .with_rate_limiter(Arc::new(self.config.rate_limiter()))
            .with_stage_cache(Arc::clone(&self.stage_cache))
            .with_fetch_config(self.config.fetch_config())
            .with_tuning(self.tuning)
    }

    pub fn refresher(&self) -> TicketRefresher {
        TicketRefresher::new(Arc::clone(&self.api), Arc::clone(&self.store))
            .with_stage_cache(Arc::clone(&self.stage_cache))
            .with_delay(self.tuning.refresh_delay)
    }

    pub async fn run(
        &self,
        request: &SyncRequest,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> SyncResult {
        self.orchestrator().run(request, on_progress).await
    }

    /// Cron job running a last-day sync, when the scheduler is enabled.
    pub async fn maybe_build_scheduler(&self) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let service = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                let request = SyncRequest::trigger(SyncTrigger::LAST_1_DAY);
                let result = service.run(&request, None).await;
                if result.success {
                    info!(saved = result.counts.saved, "scheduled sync finished");
                } else {
                    warn!(message = %result.message, "scheduled sync failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    /// Start the scheduler and block until Ctrl-C.
    pub async fn run_scheduler(&self) -> anyhow::Result<()> {
        let Some(mut sched) = self.maybe_build_scheduler().await? else {
            anyhow::bail!("scheduler is disabled; set HUBSYNC_SCHEDULER_ENABLED=true");
        };
        sched.start().await.context("starting scheduler")?;
        info!(cron = %self.config.sync_cron, "scheduler running");
        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}

pub async fn run_sync_once_from_env(request: &SyncRequest) -> anyhow::Result<SyncResult> {
    let service = SyncService::from_config(SyncConfig::from_env()?).await?;
    Ok(service.run(request, None).await)
}
