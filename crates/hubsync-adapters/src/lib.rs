//! Remote ticket API contract, the HubSpot HTTP client, and the rate-limited fetch path.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hubsync_core::{
    parse_create_date, props, CreationWindow, ReferenceData, ReferenceMap, RemoteRecord,
    UNKNOWN_OWNER,
};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "hubsync-adapters";

pub const DEFAULT_BASE_URL: &str = "https://api.hubapi.com";
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_MAX_PAGES: u32 = 50;
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_RATE_LIMIT_CALLS: usize = 100;
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_millis(10_000);

const OWNERS_PAGE_LIMIT: u32 = 100;
const OWNERS_MAX_PAGES: u32 = 50;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no HubSpot access token configured")]
    MissingToken,
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilter {
    pub property_name: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub filters: Vec<SearchFilter>,
}

/// Body of `POST /crm/v3/objects/tickets/search`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(default)]
    pub filter_groups: Vec<FilterGroup>,
    pub properties: Vec<String>,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl SearchRequest {
    /// Creation-date bounds become `createdate` GTE/LTE filters in epoch milliseconds.
    pub fn new(window: &CreationWindow, limit: u32, after: Option<String>) -> Self {
        let mut filters = Vec::new();
        if let Some(from) = window.from {
            filters.push(SearchFilter {
                property_name: props::CREATE_DATE.to_string(),
                operator: "GTE".to_string(),
                value: from.timestamp_millis().to_string(),
            });
        }
        if let Some(to) = window.to {
            filters.push(SearchFilter {
                property_name: props::CREATE_DATE.to_string(),
                operator: "LTE".to_string(),
                value: to.timestamp_millis().to_string(),
            });
        }
        let filter_groups = if filters.is_empty() {
            Vec::new()
        } else {
            vec![FilterGroup { filters }]
        };

        Self {
            filter_groups,
            properties: props::ALL.iter().map(|p| p.to_string()).collect(),
            limit,
            after,
        }
    }

    /// Recover the creation window encoded in the filters.
    pub fn window(&self) -> CreationWindow {
        let mut window = CreationWindow::unbounded();
        for filter in self.filter_groups.iter().flat_map(|g| &g.filters) {
            if filter.property_name != props::CREATE_DATE {
                continue;
            }
            let Some(ts) = filter
                .value
                .parse::<i64>()
                .ok()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            else {
                continue;
            };
            match filter.operator.as_str() {
                "GTE" => window.from = Some(ts),
                "LTE" => window.to = Some(ts),
                _ => {}
            }
        }
        window
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextPage {
    pub after: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub next: Option<NextPage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub results: Vec<RemoteRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paging: Option<Paging>,
}

impl SearchPage {
    pub fn new(results: Vec<RemoteRecord>, total: Option<u64>, next_cursor: Option<String>) -> Self {
        Self {
            results,
            total,
            paging: next_cursor.map(|after| Paging {
                next: Some(NextPage { after }),
            }),
        }
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.paging
            .as_ref()
            .and_then(|p| p.next.as_ref())
            .map(|n| n.after.as_str())
            .filter(|after| !after.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Owner {
    /// "first last", else email, else the unknown-owner label.
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !name.is_empty() {
            return name;
        }
        match self.email.as_deref().map(str::trim) {
            Some(email) if !email.is_empty() => email.to_string(),
            _ => UNKNOWN_OWNER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub stages: Vec<PipelineStage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyOption {
    pub value: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PropertyDefinition {
    #[serde(default)]
    options: Vec<PropertyOption>,
}

/// Remote ticket API. Every call returns an explicit `Result`; nothing retries.
#[async_trait]
pub trait TicketApi: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, ApiError>;

    async fn get_owners(&self) -> Result<Vec<Owner>, ApiError>;

    async fn get_pipelines(&self) -> Result<Vec<Pipeline>, ApiError>;

    async fn get_property_options(&self, property: &str) -> Result<Vec<PropertyOption>, ApiError>;

    /// `Ok(None)` when the remote side has no ticket with this ID.
    async fn get_ticket(&self, external_id: &str) -> Result<Option<RemoteRecord>, ApiError>;
}

#[derive(Debug, Clone)]
pub struct HubSpotClientConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HubSpotClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token: None,
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("hubsync/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Bearer-token HubSpot CRM v3 client.
#[derive(Debug, Clone)]
pub struct HubSpotClient {
    client: reqwest::Client,
    base_url: Url,
    access_token: Option<String>,
}

impl HubSpotClient {
    pub fn new(config: HubSpotClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let base_url = Url::parse(config.base_url.trim())
            .with_context(|| format!("parsing HubSpot base url {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("HubSpot base url {base_url} cannot carry a path");
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url,
            access_token: config.access_token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn has_token(&self) -> bool {
        self.access_token.is_some()
    }

    /// Appends each segment to the base url, percent-encoding as needed.
    fn endpoint<'s>(&self, segments: impl IntoIterator<Item = &'s str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn url(&self, path: &str) -> Url {
        self.endpoint(path.split('/').filter(|segment| !segment.is_empty()))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let token = self.access_token.as_deref().ok_or(ApiError::MissingToken)?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let url = response.url().to_string();
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| ApiError::Decode { url, source })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let span = info_span!("hubspot_request", method = "GET", path = url.path());
        async {
            let response = self.execute(self.client.get(url.clone()).query(query)).await?;
            Self::decode(response).await
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl TicketApi for HubSpotClient {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, ApiError> {
        let url = self.url("/crm/v3/objects/tickets/search");
        let span = info_span!(
            "hubspot_request",
            method = "POST",
            path = "/crm/v3/objects/tickets/search",
            after = request.after.as_deref().unwrap_or("")
        );
        async {
            let response = self.execute(self.client.post(url.clone()).json(request)).await?;
            Self::decode(response).await
        }
        .instrument(span)
        .await
    }

    async fn get_owners(&self) -> Result<Vec<Owner>, ApiError> {
        let mut owners = Vec::new();
        let mut after: Option<String> = None;
        let limit = OWNERS_PAGE_LIMIT.to_string();
        for _ in 0..OWNERS_MAX_PAGES {
            let mut query = vec![("limit", limit.as_str())];
            if let Some(cursor) = &after {
                query.push(("after", cursor.as_str()));
            }
            let page: ListResponse<Owner> = self.get_json(self.url("/crm/v3/owners"), &query).await?;
            owners.extend(page.results);
            after = page
                .paging
                .and_then(|p| p.next)
                .map(|n| n.after)
                .filter(|a| !a.is_empty());
            if after.is_none() {
                break;
            }
        }
        Ok(owners)
    }

    async fn get_pipelines(&self) -> Result<Vec<Pipeline>, ApiError> {
        let response: ListResponse<Pipeline> = self
            .get_json(self.url("/crm/v3/pipelines/tickets"), &[])
            .await?;
        Ok(response.results)
    }

    async fn get_property_options(&self, property: &str) -> Result<Vec<PropertyOption>, ApiError> {
        let definition: PropertyDefinition = self
            .get_json(
                self.endpoint(["crm", "v3", "properties", "tickets", property]),
                &[],
            )
            .await?;
        Ok(definition.options)
    }

    async fn get_ticket(&self, external_id: &str) -> Result<Option<RemoteRecord>, ApiError> {
        let url = self.endpoint(["crm", "v3", "objects", "tickets", external_id.trim()]);
        let properties = props::ALL.join(",");
        match self.get_json(url, &[("properties", properties.as_str())]).await {
            Ok(record) => Ok(Some(record)),
            Err(ApiError::HttpStatus { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Sliding-window limiter: at most `max_calls` calls in any trailing `window`.
///
/// Callers queue on a fair mutex, so waits are served in invocation order.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            calls: Mutex::new(VecDeque::with_capacity(max_calls.max(1))),
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn evict(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while calls
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) >= self.window)
        {
            calls.pop_front();
        }
    }

    /// Block until a call slot is free, record the call, and return how long we waited.
    pub async fn wait_if_needed(&self) -> Duration {
        let mut calls = self.calls.lock().await;
        self.evict(&mut calls, Instant::now());

        let mut waited = Duration::ZERO;
        if calls.len() >= self.max_calls {
            if let Some(oldest) = calls.front().copied() {
                let wait = (oldest + self.window).saturating_duration_since(Instant::now());
                if !wait.is_zero() {
                    debug!(
                        wait_ms = wait.as_millis() as u64,
                        in_window = calls.len(),
                        "rate limit reached, waiting"
                    );
                    tokio::time::sleep(wait).await;
                    waited = wait;
                }
            }
            self.evict(&mut calls, Instant::now());
        }

        calls.push_back(Instant::now());
        waited
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_CALLS, DEFAULT_RATE_LIMIT_WINDOW)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub page_size: u32,
    /// Hard ceiling; reaching it ends the fetch early without an error.
    pub max_pages: u32,
    pub page_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProgress {
    pub page: u32,
    pub page_records: usize,
    pub fetched_so_far: usize,
    pub total_estimate: usize,
}

impl PageProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_estimate == 0 {
            return 1.0;
        }
        (self.fetched_so_far as f64 / self.total_estimate as f64).min(1.0)
    }
}

pub type PageCallback<'a> = dyn Fn(PageProgress) + Send + Sync + 'a;

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<RemoteRecord>,
    pub pages: u32,
    pub reported_total: Option<u64>,
    /// True when the page ceiling cut pagination short.
    pub truncated: bool,
}

/// Follows search cursors until exhausted or until the page ceiling.
pub struct PaginatedFetcher {
    api: Arc<dyn TicketApi>,
    limiter: Arc<RateLimiter>,
    config: FetchConfig,
}

impl PaginatedFetcher {
    pub fn new(api: Arc<dyn TicketApi>, limiter: Arc<RateLimiter>, config: FetchConfig) -> Self {
        Self {
            api,
            limiter,
            config,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub async fn fetch_all(
        &self,
        window: &CreationWindow,
        on_page: Option<&PageCallback<'_>>,
    ) -> Result<FetchOutcome, ApiError> {
        let mut outcome = FetchOutcome::default();
        let mut after: Option<String> = None;

        loop {
            self.limiter.wait_if_needed().await;
            let request = SearchRequest::new(window, self.config.page_size, after.take());
            let page = self.api.search(&request).await?;
            outcome.pages += 1;
            if outcome.pages == 1 {
                outcome.reported_total = page.total;
            }

            let next = page.next_cursor().map(str::to_string);
            let page_records = page.results.len();
            outcome.records.extend(page.results);

            let fetched_so_far = outcome.records.len();
            let total_estimate = outcome
                .reported_total
                .map(|t| usize::try_from(t).unwrap_or(usize::MAX).max(fetched_so_far))
                .unwrap_or(fetched_so_far);
            info!(
                page = outcome.pages,
                page_records, fetched_so_far, total_estimate, "fetched ticket page"
            );
            if let Some(callback) = on_page {
                callback(PageProgress {
                    page: outcome.pages,
                    page_records,
                    fetched_so_far,
                    total_estimate,
                });
            }

            let Some(cursor) = next else {
                break;
            };
            if outcome.pages >= self.config.max_pages {
                warn!(
                    max_pages = self.config.max_pages,
                    fetched_so_far, "page ceiling reached, stopping pagination early"
                );
                outcome.truncated = true;
                break;
            }
            after = Some(cursor);
            if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        Ok(outcome)
    }
}

/// Pipeline-stage labels shared across runs. Filled on the first successful non-empty
/// lookup and kept until [`StageCache::clear`].
#[derive(Debug, Default)]
pub struct StageCache {
    stages: RwLock<Option<Arc<ReferenceMap>>>,
}

impl StageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<ReferenceMap>> {
        self.stages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self, stages: Arc<ReferenceMap>) {
        *self.stages.write().unwrap_or_else(PoisonError::into_inner) = Some(stages);
    }

    pub fn clear(&self) {
        *self.stages.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedReferences {
    pub data: ReferenceData,
    /// One line per lookup that failed and fell back to an empty map.
    pub warnings: Vec<String>,
}

pub struct ReferenceDataResolver {
    api: Arc<dyn TicketApi>,
    stage_cache: Arc<StageCache>,
    category_property: String,
}

impl ReferenceDataResolver {
    pub fn new(api: Arc<dyn TicketApi>, stage_cache: Arc<StageCache>) -> Self {
        Self {
            api,
            stage_cache,
            category_property: props::CATEGORY.to_string(),
        }
    }

    pub fn with_category_property(mut self, property: impl Into<String>) -> Self {
        self.category_property = property.into();
        self
    }

    pub async fn owners(&self) -> Result<ReferenceMap, ApiError> {
        let owners = self.api.get_owners().await?;
        Ok(owners
            .iter()
            .filter(|owner| !owner.id.is_empty())
            .map(|owner| (owner.id.clone(), owner.display_name()))
            .collect())
    }

    pub async fn pipeline_stages(&self) -> Result<Arc<ReferenceMap>, ApiError> {
        if let Some(cached) = self.stage_cache.get() {
            debug!(stages = cached.len(), "pipeline stages served from cache");
            return Ok(cached);
        }
        let pipelines = self.api.get_pipelines().await?;
        let stages: Arc<ReferenceMap> = Arc::new(
            pipelines
                .iter()
                .flat_map(|pipeline| &pipeline.stages)
                .map(|stage| (stage.id.clone(), stage.label.clone()))
                .collect(),
        );
        if !stages.is_empty() {
            self.stage_cache.store(Arc::clone(&stages));
        }
        Ok(stages)
    }

    pub async fn categories(&self) -> Result<ReferenceMap, ApiError> {
        let options = self.api.get_property_options(&self.category_property).await?;
        Ok(options
            .into_iter()
            .map(|option| (option.value, option.label))
            .collect())
    }

    /// Run the three lookups concurrently; a failed lookup degrades to an empty map.
    pub async fn resolve_all(&self) -> ResolvedReferences {
        let (owners, stages, categories) =
            tokio::join!(self.owners(), self.pipeline_stages(), self.categories());
        let mut warnings = Vec::new();
        let owners = degrade("owners", owners, &mut warnings);
        let stages = degrade("pipeline stages", stages, &mut warnings);
        let categories = degrade("category options", categories, &mut warnings);

        ResolvedReferences {
            data: ReferenceData {
                owners: Arc::new(owners),
                stages,
                categories: Arc::new(categories),
            },
            warnings,
        }
    }
}

fn degrade<T: Default>(lookup: &str, result: Result<T, ApiError>, warnings: &mut Vec<String>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            warn!(lookup, error = %err, "reference lookup failed, using raw codes");
            warnings.push(format!("Could not load {lookup} ({err}); raw codes will be shown"));
            T::default()
        }
    }
}

/// Offline snapshot of the remote API: reference data plus raw tickets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketFixture {
    #[serde(default)]
    pub owners: Vec<Owner>,
    #[serde(default)]
    pub pipelines: Vec<Pipeline>,
    #[serde(default)]
    pub category_options: Vec<PropertyOption>,
    #[serde(default)]
    pub tickets: Vec<RemoteRecord>,
}

pub fn load_ticket_fixture(path: impl AsRef<Path>) -> anyhow::Result<TicketFixture> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// [`TicketApi`] served from a [`TicketFixture`]. Cursors are stringified offsets.
#[derive(Debug, Default)]
pub struct FixtureTicketApi {
    fixture: TicketFixture,
    calls: AtomicUsize,
}

impl FixtureTicketApi {
    pub fn new(fixture: TicketFixture) -> Self {
        Self {
            fixture,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(load_ticket_fixture(path)?))
    }

    pub fn fixture(&self) -> &TicketFixture {
        &self.fixture
    }

    /// Total calls made against any endpoint.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TicketApi for FixtureTicketApi {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage, ApiError> {
        self.record_call();
        let window = request.window();
        let matching: Vec<&RemoteRecord> = self
            .fixture
            .tickets
            .iter()
            .filter(|ticket| window.contains(parse_create_date(ticket.create_date())))
            .collect();

        let offset = match request.after.as_deref() {
            None => 0,
            Some(cursor) => cursor.parse::<usize>().map_err(|_| ApiError::HttpStatus {
                status: StatusCode::BAD_REQUEST.as_u16(),
                url: format!("fixture://search?after={cursor}"),
            })?,
        };
        let limit = usize::try_from(request.limit.max(1)).unwrap_or(usize::MAX);
        let end = offset.saturating_add(limit).min(matching.len());
        let results = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|ticket| (*ticket).clone())
            .collect();
        let next = (end < matching.len()).then(|| end.to_string());

        Ok(SearchPage::new(results, Some(matching.len() as u64), next))
    }

    async fn get_owners(&self) -> Result<Vec<Owner>, ApiError> {
        self.record_call();
        Ok(self.fixture.owners.clone())
    }

    async fn get_pipelines(&self) -> Result<Vec<Pipeline>, ApiError> {
        self.record_call();
        Ok(self.fixture.pipelines.clone())
    }

    async fn get_property_options(&self, _property: &str) -> Result<Vec<PropertyOption>, ApiError> {
        self.record_call();
        Ok(self.fixture.category_options.clone())
    }

    async fn get_ticket(&self, external_id: &str) -> Result<Option<RemoteRecord>, ApiError> {
        self.record_call();
        Ok(self
            .fixture
            .tickets
            .iter()
            .find(|ticket| ticket.id == external_id)
            .cloned())
    }
}
