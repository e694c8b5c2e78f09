//! Core domain model for hubsync: remote tickets, reference maps, normalized records and run bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hubsync-core";

/// Fallback label for absent or unmapped owners.
pub const UNKNOWN_OWNER: &str = "Unknown";
pub const CATEGORY_DELIMITER: char = ';';
pub const CONTENT_MAX_CHARS: usize = 1000;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Ticket property names requested from the remote API.
pub mod props {
    pub const TICKET_ID: &str = "hs_ticket_id";
    pub const CATEGORY: &str = "hs_ticket_category";
    pub const OWNER_ID: &str = "hubspot_owner_id";
    pub const COMPANY_NAME: &str = "hs_primary_company_name";
    pub const SUBJECT: &str = "subject";
    pub const SOURCE_TYPE: &str = "source_type";
    pub const CONTENT: &str = "content";
    pub const PIPELINE_STAGE: &str = "hs_pipeline_stage";
    pub const SUPPORT_OBJECT: &str = "support_object";
    pub const CREATE_DATE: &str = "createdate";

    pub const ALL: [&str; 10] = [
        TICKET_ID,
        CATEGORY,
        OWNER_ID,
        COMPANY_NAME,
        SUBJECT,
        SOURCE_TYPE,
        CONTENT,
        PIPELINE_STAGE,
        SUPPORT_OBJECT,
        CREATE_DATE,
    ];
}

/// A property exactly as the API sent it: a bare scalar or a `{"value": ..}` wrapper.
///
/// Both shapes collapse to a plain string through [`PropertyValue::as_str`]; nothing past the
/// ingestion boundary needs to know which one arrived. JSON `null` and missing wrapped values
/// become the empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bare(String),
    Wrapped(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Bare(value) | Self::Wrapped(value) => value,
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Self::Bare(value) | Self::Wrapped(value) => value,
        }
    }
}

fn scalar_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(match raw {
            serde_json::Value::Object(mut map) => Self::Wrapped(
                map.remove("value")
                    .map(scalar_to_string)
                    .unwrap_or_default(),
            ),
            other => Self::Bare(scalar_to_string(other)),
        })
    }
}

impl Serialize for PropertyValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Bare(value) => serializer.serialize_str(value),
            Self::Wrapped(value) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("value", value)?;
                map.end()
            }
        }
    }
}

/// Raw ticket as returned by the remote search / get endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    #[serde(default, rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl RemoteRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<String>) -> Self {
        self.properties
            .insert(name.to_string(), PropertyValue::Bare(value.into()));
        self
    }

    /// Normalized property value; missing properties read as the empty string.
    pub fn property(&self, name: &str) -> &str {
        self.properties
            .get(name)
            .map(PropertyValue::as_str)
            .unwrap_or("")
    }

    /// Creation date string, preferring the `createdate` property over the envelope field.
    pub fn create_date(&self) -> &str {
        let from_props = self.property(props::CREATE_DATE);
        if !from_props.trim().is_empty() {
            return from_props;
        }
        self.created_at.as_deref().unwrap_or("")
    }
}

/// Immutable id → display label lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceMap {
    entries: HashMap<String, String>,
}

impl ReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    pub fn resolve_or<'a>(&'a self, id: &str, fallback: &'a str) -> &'a str {
        self.get(id).unwrap_or(fallback)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for ReferenceMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// The three lookups a transform needs. Maps are shared read-only across a batch.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub owners: std::sync::Arc<ReferenceMap>,
    pub stages: std::sync::Arc<ReferenceMap>,
    pub categories: std::sync::Arc<ReferenceMap>,
}

/// Multi-valued category: parallel code and label lists plus their shared length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCategorySet")]
pub struct CategorySet {
    count: usize,
    ids: Vec<String>,
    labels: Vec<String>,
}

#[derive(Deserialize)]
struct RawCategorySet {
    count: usize,
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    labels: Vec<String>,
}

impl TryFrom<RawCategorySet> for CategorySet {
    type Error = String;

    fn try_from(raw: RawCategorySet) -> Result<Self, Self::Error> {
        if raw.count != raw.ids.len() || raw.count != raw.labels.len() {
            return Err(format!(
                "category count {} does not match ids ({}) / labels ({})",
                raw.count,
                raw.ids.len(),
                raw.labels.len()
            ));
        }
        Ok(Self {
            count: raw.count,
            ids: raw.ids,
            labels: raw.labels,
        })
    }
}

impl CategorySet {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let (ids, labels): (Vec<String>, Vec<String>) = pairs
            .into_iter()
            .map(|(id, label)| (id.into(), label.into()))
            .unzip();
        Self {
            count: ids.len(),
            ids,
            labels,
        }
    }

    /// Split a delimited code list and label each surviving code, falling back to the code.
    pub fn parse(raw: &str, categories: &ReferenceMap) -> Self {
        Self::from_pairs(
            raw.split(CATEGORY_DELIMITER)
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(|code| (code, categories.resolve_or(code, code))),
        )
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Storage-ready ticket keyed by `external_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub external_id: String,
    pub ticket_number: String,
    pub owner_id: String,
    pub owner_name: String,
    pub category: CategorySet,
    pub pipeline_stage: String,
    pub pipeline_stage_label: String,
    pub subject: String,
    pub content: String,
    pub company_name: String,
    pub source_type: String,
    pub support_object: String,
    /// Creation date exactly as received.
    pub create_date: String,
    pub created_at: Option<DateTime<Utc>>,
    pub synced_at: String,
}

impl NormalizedRecord {
    /// Unicode-lowercased subject, content and company, unit-separated so a term never spans fields.
    pub fn search_text(&self) -> String {
        [&self.subject, &self.content, &self.company_name]
            .iter()
            .map(|field| field.to_lowercase())
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }
}

/// Parse a remote creation date: epoch milliseconds, RFC 3339, or a bare `YYYY-MM-DD`.
pub fn parse_create_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        let millis: i64 = raw.parse().ok()?;
        return Utc.timestamp_millis_opt(millis).single();
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parse a listing/query date bound. Bare dates expand to the start or end of that day.
pub fn parse_date_bound(raw: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let naive = if end_of_day {
        day.and_hms_milli_opt(23, 59, 59, 999)?
    } else {
        day.and_hms_opt(0, 0, 0)?
    };
    Some(naive.and_utc())
}

/// Fixed sync timestamp format: RFC 3339, UTC, millisecond precision, `Z` suffix.
pub fn sync_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

/// Caller-facing run request as it arrives over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub trigger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

impl SyncRequest {
    pub fn trigger(name: impl Into<String>) -> Self {
        Self {
            trigger: name.into(),
            ..Self::default()
        }
    }

    pub fn range(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            trigger: SyncTrigger::RANGE.to_string(),
            start_date: Some(start.into()),
            end_date: Some(end.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("unknown sync trigger `{0}`")]
    Unknown(String),
    #[error("range sync requires both start and end dates")]
    MissingRange,
    #[error("invalid date `{0}`")]
    InvalidDate(String),
    #[error("range start {start} is not before end {end}")]
    EmptyRange { start: String, end: String },
}

/// Look-back windows offered by the relative triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookback {
    Day,
    Week,
    Month,
}

impl Lookback {
    pub fn days(self) -> u32 {
        match self {
            Self::Day => 1,
            Self::Week => 7,
            Self::Month => 30,
        }
    }
}

/// Validated time-range trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    All,
    LastDays(Lookback),
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl SyncTrigger {
    pub const ALL: &'static str = "sync_all";
    pub const LAST_30_DAYS: &'static str = "sync_30_days";
    pub const LAST_7_DAYS: &'static str = "sync_7_days";
    pub const LAST_1_DAY: &'static str = "sync_1_day";
    pub const RANGE: &'static str = "sync_range";

    pub const ALLOWED: [&'static str; 5] = [
        Self::ALL,
        Self::LAST_30_DAYS,
        Self::LAST_7_DAYS,
        Self::LAST_1_DAY,
        Self::RANGE,
    ];

    pub fn from_request(request: &SyncRequest) -> Result<Self, TriggerError> {
        match request.trigger.trim() {
            Self::ALL => Ok(Self::All),
            Self::LAST_30_DAYS => Ok(Self::LastDays(Lookback::Month)),
            Self::LAST_7_DAYS => Ok(Self::LastDays(Lookback::Week)),
            Self::LAST_1_DAY => Ok(Self::LastDays(Lookback::Day)),
            Self::RANGE => {
                let (Some(start_raw), Some(end_raw)) = (&request.start_date, &request.end_date)
                else {
                    return Err(TriggerError::MissingRange);
                };
                let start = parse_date_bound(start_raw, false)
                    .ok_or_else(|| TriggerError::InvalidDate(start_raw.clone()))?;
                let end = parse_date_bound(end_raw, true)
                    .ok_or_else(|| TriggerError::InvalidDate(end_raw.clone()))?;
                if start >= end {
                    return Err(TriggerError::EmptyRange {
                        start: start_raw.clone(),
                        end: end_raw.clone(),
                    });
                }
                Ok(Self::Range { start, end })
            }
            other => Err(TriggerError::Unknown(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => Self::ALL,
            Self::LastDays(Lookback::Month) => Self::LAST_30_DAYS,
            Self::LastDays(Lookback::Week) => Self::LAST_7_DAYS,
            Self::LastDays(Lookback::Day) => Self::LAST_1_DAY,
            Self::Range { .. } => Self::RANGE,
        }
    }

    pub fn days_back(&self) -> Option<u32> {
        match self {
            Self::LastDays(lookback) => Some(lookback.days()),
            _ => None,
        }
    }

    pub fn creation_window(&self, now: DateTime<Utc>) -> CreationWindow {
        match self {
            Self::All => CreationWindow::unbounded(),
            Self::LastDays(lookback) => CreationWindow {
                from: Some(now - Duration::days(i64::from(lookback.days()))),
                to: None,
            },
            Self::Range { start, end } => CreationWindow {
                from: Some(*start),
                to: Some(*end),
            },
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all tickets"),
            Self::LastDays(Lookback::Day) => write!(f, "tickets from the last day"),
            Self::LastDays(lookback) => write!(f, "tickets from the last {} days", lookback.days()),
            Self::Range { start, end } => write!(
                f,
                "tickets created between {} and {}",
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d")
            ),
        }
    }
}

/// Creation-date bounds applied to the remote search (both inclusive).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl CreationWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, ts: Option<DateTime<Utc>>) -> bool {
        match ts {
            Some(ts) => {
                self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts <= to)
            }
            None => self.from.is_none() && self.to.is_none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Idle,
    Fetching,
    Processing,
    Saving,
    Done,
    Failed,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Processing => "processing",
            Self::Saving => "saving",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Fetching => 1,
            Self::Processing => 2,
            Self::Saving => 3,
            Self::Done | Self::Failed => 4,
        }
    }

    /// Stages only move forward; terminal stages accept nothing.
    pub fn can_advance_to(&self, next: SyncStage) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub fetched: usize,
    pub processed: usize,
    pub saved: usize,
    pub failed: usize,
}

/// One `(percent, message)` progress tick relayed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub percent: u8,
    pub message: String,
}

/// Bookkeeping for a single run, from start to its terminal stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub trigger: String,
    pub range_label: String,
    pub window: CreationWindow,
    pub stage: SyncStage,
    pub counts: SyncCounts,
    pub log: Vec<String>,
    pub message: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncRun {
    pub const STATUS_SUCCESS: &'static str = "success";
    pub const STATUS_FAILED: &'static str = "failed";
    pub const STATUS_RUNNING: &'static str = "running";

    pub fn start(trigger: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger: trigger.into(),
            range_label: String::new(),
            window: CreationWindow::unbounded(),
            stage: SyncStage::Idle,
            counts: SyncCounts::default(),
            log: Vec::new(),
            message: String::new(),
            error: None,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    /// Move to `next`; returns false (and leaves the run untouched) for backward or re-entry moves.
    pub fn advance(&mut self, next: SyncStage) -> bool {
        if self.stage.can_advance_to(next) {
            self.stage = next;
            true
        } else {
            false
        }
    }

    pub fn finish(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        if self.advance(SyncStage::Done) {
            self.message = message.into();
            self.finished_at = Some(now);
        }
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        if self.advance(SyncStage::Failed) {
            let error = error.into();
            self.message = format!("Sync failed: {error}");
            self.error = Some(error);
            self.finished_at = Some(now);
        }
    }

    pub fn is_success(&self) -> bool {
        self.stage == SyncStage::Done
    }

    pub fn status(&self) -> &'static str {
        match self.stage {
            SyncStage::Done => Self::STATUS_SUCCESS,
            SyncStage::Failed => Self::STATUS_FAILED,
            _ => Self::STATUS_RUNNING,
        }
    }

    pub fn to_result(&self) -> SyncResult {
        SyncResult {
            run_id: self.id,
            success: self.is_success(),
            message: self.message.clone(),
            counts: self.counts,
            log: self.log.clone(),
            error: self.error.clone(),
        }
    }
}

/// Caller-facing outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub run_id: Uuid,
    pub success: bool,
    pub message: String,
    pub counts: SyncCounts,
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketFilter {
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub owner: Option<String>,
    pub search: Option<String>,
}

impl TicketFilter {
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn matches(&self, record: &NormalizedRecord) -> bool {
        let window = CreationWindow {
            from: self.created_from,
            to: self.created_to,
        };
        if !window.contains(record.created_at) {
            return false;
        }
        if let Some(category) = &self.category {
            if !record.category.has_label(category) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if &record.owner_name != owner {
                return false;
            }
        }
        if let Some(term) = self.search_term() {
            if !record.search_text().contains(&term.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketSort {
    #[default]
    CreatedDesc,
    CreatedAsc,
    SyncedDesc,
}

impl TicketSort {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "created_desc" | "newest" => Some(Self::CreatedDesc),
            "created_asc" | "oldest" => Some(Self::CreatedAsc),
            "synced_desc" => Some(Self::SyncedDesc),
            _ => None,
        }
    }
}

pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_PAGE_LIMIT)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub categories: Vec<String>,
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogFilter {
    pub trigger: Option<String>,
    pub status: Option<String>,
}

impl SyncLogFilter {
    pub fn matches(&self, run: &SyncRun) -> bool {
        self.trigger.as_deref().map_or(true, |t| run.trigger == t)
            && self.status.as_deref().map_or(true, |s| run.status() == s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLogTotals {
    pub runs: u64,
    pub fetched: u64,
    pub saved: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncLogPage {
    pub runs: Vec<SyncRun>,
    pub total: u64,
    pub totals: SyncLogTotals,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_shapes_normalize_to_plain_strings() {
        let raw = r#"{
            "id": "42",
            "properties": {
                "subject": "Printer on fire",
                "content": {"value": "Please help"},
                "hubspot_owner_id": null,
                "hs_ticket_id": {"value": 1234},
                "hs_pipeline_stage": {}
            }
        }"#;
        let record: RemoteRecord = serde_json::from_str(raw).expect("record");

        assert_eq!(record.property(props::SUBJECT), "Printer on fire");
        assert_eq!(record.property(props::CONTENT), "Please help");
        assert_eq!(record.property(props::OWNER_ID), "");
        assert_eq!(record.property(props::TICKET_ID), "1234");
        assert_eq!(record.property(props::PIPELINE_STAGE), "");
        assert_eq!(record.property(props::COMPANY_NAME), "");
        assert!(matches!(
            record.properties.get(props::CONTENT),
            Some(PropertyValue::Wrapped(_))
        ));
    }

    #[test]
    fn category_multi_value_keeps_duplicates_in_order() {
        let map: ReferenceMap = [("A", "Alpha"), ("B", "Beta")].into_iter().collect();
        let set = CategorySet::parse("A;B;B", &map);

        assert_eq!(set.count(), 3);
        assert_eq!(set.ids(), ["A", "B", "B"]);
        assert_eq!(set.labels(), ["Alpha", "Beta", "Beta"]);
    }

    #[test]
    fn category_parsing_trims_drops_empties_and_falls_back_to_code() {
        let map: ReferenceMap = [("A", "Alpha")].into_iter().collect();

        let single = CategorySet::parse("A", &map);
        assert_eq!(single.count(), 1);
        assert_eq!(single.labels(), ["Alpha"]);

        let messy = CategorySet::parse(" A ;; ZED ;", &map);
        assert_eq!(messy.ids(), ["A", "ZED"]);
        assert_eq!(messy.labels(), ["Alpha", "ZED"]);

        assert!(CategorySet::parse("", &map).is_empty());
    }

    #[test]
    fn category_json_rejects_mismatched_count() {
        let ok: CategorySet =
            serde_json::from_str(r#"{"count":1,"ids":["A"],"labels":["Alpha"]}"#).expect("ok");
        assert_eq!(ok.count(), 1);

        let bad = serde_json::from_str::<CategorySet>(r#"{"count":2,"ids":["A"],"labels":["Alpha"]}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn create_date_parses_millis_rfc3339_and_plain_dates() {
        let millis = parse_create_date("1700000000000").expect("millis");
        assert_eq!(millis.timestamp(), 1_700_000_000);

        let iso = parse_create_date("2024-03-01T10:15:00.000Z").expect("iso");
        assert_eq!(iso.format("%Y-%m-%d %H:%M").to_string(), "2024-03-01 10:15");

        let day = parse_create_date("2024-03-01").expect("day");
        assert_eq!(day.format("%H:%M:%S").to_string(), "00:00:00");

        assert!(parse_create_date("").is_none());
        assert!(parse_create_date("yesterday").is_none());
    }

    #[test]
    fn sync_timestamp_is_millisecond_utc() {
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).single().expect("ts");
        assert_eq!(sync_timestamp(now), "2024-05-06T07:08:09.000Z");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
        let long = "x".repeat(CONTENT_MAX_CHARS + 5);
        assert_eq!(truncate_chars(&long, CONTENT_MAX_CHARS).len(), CONTENT_MAX_CHARS);
    }

    #[test]
    fn triggers_validate_against_allow_list() {
        assert_eq!(
            SyncTrigger::from_request(&SyncRequest::trigger("sync_7_days")),
            Ok(SyncTrigger::LastDays(Lookback::Week))
        );
        assert_eq!(
            SyncTrigger::from_request(&SyncRequest::trigger("sync_all")),
            Ok(SyncTrigger::All)
        );
        assert!(matches!(
            SyncTrigger::from_request(&SyncRequest::trigger("sync_2_days")),
            Err(TriggerError::Unknown(_))
        ));
        assert_eq!(
            SyncTrigger::from_request(&SyncRequest::trigger("sync_range")),
            Err(TriggerError::MissingRange)
        );
        assert!(matches!(
            SyncTrigger::from_request(&SyncRequest::range("2024-02-01", "2024-01-01")),
            Err(TriggerError::EmptyRange { .. })
        ));

        let range = SyncTrigger::from_request(&SyncRequest::range("2024-01-01", "2024-01-31"))
            .expect("range");
        assert_eq!(range.as_str(), SyncTrigger::RANGE);
        let window = range.creation_window(Utc::now());
        assert_eq!(
            window.to.map(|t| t.format("%H:%M:%S").to_string()).as_deref(),
            Some("23:59:59")
        );
    }

    #[test]
    fn relative_trigger_names_round_trip() {
        for (name, days) in [
            (SyncTrigger::LAST_1_DAY, 1),
            (SyncTrigger::LAST_7_DAYS, 7),
            (SyncTrigger::LAST_30_DAYS, 30),
        ] {
            let trigger = SyncTrigger::from_request(&SyncRequest::trigger(name)).expect("trigger");
            assert_eq!(trigger.as_str(), name);
            assert_eq!(trigger.days_back(), Some(days));
        }
        assert_eq!(
            SyncTrigger::LastDays(Lookback::Month).to_string(),
            "tickets from the last 30 days"
        );
        assert_eq!(
            SyncTrigger::LastDays(Lookback::Day).to_string(),
            "tickets from the last day"
        );
        assert_eq!(SyncTrigger::All.days_back(), None);
    }

    #[test]
    fn days_back_window_has_only_lower_bound() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).single().expect("ts");
        let window = SyncTrigger::LastDays(Lookback::Week).creation_window(now);
        assert_eq!(window.from, Some(now - Duration::days(7)));
        assert_eq!(window.to, None);
        assert_eq!(SyncTrigger::All.creation_window(now), CreationWindow::unbounded());
    }

    #[test]
    fn run_stages_only_move_forward() {
        let mut run = SyncRun::start("sync_1_day", Utc::now());
        assert!(run.advance(SyncStage::Fetching));
        assert!(!run.advance(SyncStage::Fetching));
        assert!(run.advance(SyncStage::Saving));
        assert!(!run.advance(SyncStage::Processing));

        run.finish("ok", Utc::now());
        assert!(run.is_success());
        assert_eq!(run.status(), SyncRun::STATUS_SUCCESS);

        run.fail("late", Utc::now());
        assert_eq!(run.stage, SyncStage::Done);
        assert!(run.error.is_none());
    }

    #[test]
    fn ticket_filter_matches_search_category_owner_and_dates() {
        let record = NormalizedRecord {
            external_id: "1".into(),
            ticket_number: "1".into(),
            owner_id: "7".into(),
            owner_name: "Ada Lovelace".into(),
            category: CategorySet::from_pairs([("BILL", "Billing")]),
            pipeline_stage: "1".into(),
            pipeline_stage_label: "New".into(),
            subject: "Invoice missing".into(),
            content: "Where is my invoice".into(),
            company_name: "Acme".into(),
            source_type: "EMAIL".into(),
            support_object: String::new(),
            create_date: "2024-03-01T00:00:00Z".into(),
            created_at: parse_create_date("2024-03-01T00:00:00Z"),
            synced_at: "2024-03-02T00:00:00.000Z".into(),
        };

        assert!(TicketFilter::default().matches(&record));
        assert!(TicketFilter {
            search: Some("ACME".into()),
            category: Some("Billing".into()),
            owner: Some("Ada Lovelace".into()),
            created_from: parse_date_bound("2024-03-01", false),
            created_to: parse_date_bound("2024-03-01", true),
        }
        .matches(&record));
        assert!(!TicketFilter {
            category: Some("Shipping".into()),
            ..TicketFilter::default()
        }
        .matches(&record));
        assert!(!TicketFilter {
            created_from: parse_date_bound("2024-03-02", false),
            ..TicketFilter::default()
        }
        .matches(&record));
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(50), 50);
        assert_eq!(clamp_limit(5000), MAX_PAGE_LIMIT);
    }
}
