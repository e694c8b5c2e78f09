//! Axum JSON API over the sync service: trigger runs, browse stored tickets and sync logs.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hubsync_core::{
    clamp_limit, parse_date_bound, NormalizedRecord, SyncLogFilter, SyncRequest, SyncTrigger,
    TicketFilter, TicketSort,
};
use hubsync_sync::{RefreshOutcome, SyncConfig, SyncService};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "hubsync-web";

const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Clone)]
pub struct AppState {
    pub service: SyncService,
}

impl AppState {
    pub fn new(service: SyncService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TicketsQuery {
    page: Option<u32>,
    limit: Option<u32>,
    start_date: Option<String>,
    end_date: Option<String>,
    category: Option<String>,
    owner: Option<String>,
    search: Option<String>,
    sort: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncLogsQuery {
    page: Option<u32>,
    limit: Option<u32>,
    trigger: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl Pagination {
    fn new(page: Option<u32>, limit: Option<u32>, total: u64) -> Self {
        let limit = clamp_limit(limit.unwrap_or(DEFAULT_PAGE_SIZE));
        Self {
            page: page.unwrap_or(1).max(1),
            limit,
            total,
            total_pages: total.div_ceil(u64::from(limit)),
        }
    }

    fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

#[derive(Debug, Serialize)]
struct TicketsPage {
    tickets: Vec<NormalizedRecord>,
    pagination: Pagination,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/sync-logs", get(sync_logs_handler))
        .route("/api/tickets", get(tickets_handler))
        .route("/api/tickets/filters", get(ticket_filters_handler))
        .route("/api/tickets/refresh-all", post(refresh_all_handler))
        .route("/api/tickets/{id}", get(ticket_detail_handler))
        .route("/api/tickets/{id}/refresh", post(refresh_ticket_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let port = config.web_port;
    let service = SyncService::from_config(config).await?;

    let scheduler = service.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %service.config().sync_cron, "scheduled sync enabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.store().count(&TicketFilter::default()).await {
        Ok(tickets) => Json(json!({ "status": "ok", "tickets": tickets })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Response {
    let invalid = SyncTrigger::from_request(&request).is_err();
    let result = state.service.run(&request, None).await;
    let status = if result.success {
        StatusCode::OK
    } else if invalid {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(result)).into_response()
}

async fn tickets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TicketsQuery>,
) -> Response {
    let filter = match ticket_filter(&query) {
        Ok(filter) => filter,
        Err(message) => return bad_request(message),
    };
    let sort = match query.sort.as_deref() {
        None | Some("") => TicketSort::default(),
        Some(raw) => match TicketSort::parse(raw) {
            Some(sort) => sort,
            None => return bad_request(format!("unknown sort `{raw}`")),
        },
    };

    let store = state.service.store();
    let total = match store.count(&filter).await {
        Ok(total) => total,
        Err(err) => return server_error(err.into()),
    };
    let pagination = Pagination::new(query.page, query.limit, total);
    match store
        .list_page(&filter, sort, pagination.limit, pagination.offset())
        .await
    {
        Ok(tickets) => Json(TicketsPage {
            tickets,
            pagination,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn ticket_filter(query: &TicketsQuery) -> Result<TicketFilter, String> {
    let bound = |raw: &Option<String>, end_of_day: bool| -> Result<_, String> {
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => parse_date_bound(value, end_of_day)
                .map(Some)
                .ok_or_else(|| format!("invalid date `{value}`")),
        }
    };
    // The dashboard sends "all" for an unselected dropdown.
    let choice = |raw: &Option<String>| {
        raw.as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("all"))
            .map(str::to_string)
    };

    Ok(TicketFilter {
        created_from: bound(&query.start_date, false)?,
        created_to: bound(&query.end_date, true)?,
        category: choice(&query.category),
        owner: choice(&query.owner),
        search: query.search.clone(),
    })
}

async fn ticket_filters_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.store().filter_options().await {
        Ok(options) => Json(options).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn ticket_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.service.store().find_by_external_id(&id).await {
        Ok(Some(ticket)) => Json(ticket).into_response(),
        Ok(None) => not_found(format!("ticket {id} not found")),
        Err(err) => server_error(err.into()),
    }
}

async fn refresh_ticket_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.service.refresher().refresh_ticket(&id).await {
        Ok(RefreshOutcome::Refreshed(ticket)) => Json(ticket).into_response(),
        Ok(RefreshOutcome::NotFound) => not_found(format!("ticket {id} not found in HubSpot")),
        Err(err) => server_error(err.into()),
    }
}

async fn refresh_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.refresher().refresh_all().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn sync_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncLogsQuery>,
) -> Response {
    let filter = SyncLogFilter {
        trigger: query.trigger.filter(|v| !v.is_empty()),
        status: query.status.filter(|v| !v.is_empty()),
    };
    let limit = clamp_limit(query.limit.unwrap_or(DEFAULT_PAGE_SIZE));
    let page = query.page.unwrap_or(1).max(1);
    let offset = u64::from(page - 1) * u64::from(limit);

    match state.service.runs().list_runs(&filter, limit, offset).await {
        Ok(logs) => {
            let pagination = Pagination::new(Some(page), Some(limit), logs.total);
            Json(json!({
                "logs": logs.runs,
                "totals": logs.totals,
                "pagination": pagination,
            }))
            .into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("Server error: {err}") })),
    )
        .into_response()
}
