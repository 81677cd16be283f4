//! Core domain model for parlsync: query intent, pages, parliamentary items and store-ready records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "parlsync-core";

/// Timestamp layout accepted by the structured API for `aktualisiert` filters.
pub const UPDATED_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parent entity a child fetch is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParentLink {
    Drucksache(i64),
    Vorgang(i64),
    Plenarprotokoll(i64),
}

/// One independent, resumable unit of query intent.
///
/// `document_type` is the single-valued filter dimension the remote source can only OR within
/// one request; expressing several values takes one parameter per value
/// (see [`FetchParameter::expand_type_variants`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchParameter {
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub updated_since: Option<NaiveDateTime>,
    pub updated_until: Option<NaiveDateTime>,
    pub document_type: Option<String>,
    pub process_types: Vec<String>,
    pub ids: Vec<i64>,
    pub electoral_terms: Vec<u32>,
    pub assignment: Option<String>,
    pub parent: Option<ParentLink>,
}

impl FetchParameter {
    pub fn window(date_start: NaiveDate, date_end: NaiveDate) -> Self {
        Self {
            date_start: Some(date_start),
            date_end: Some(date_end),
            ..Default::default()
        }
    }

    pub fn updated_since(since: NaiveDateTime) -> Self {
        Self {
            updated_since: Some(since),
            ..Default::default()
        }
    }

    pub fn linked_to(parent: ParentLink) -> Self {
        Self {
            parent: Some(parent),
            ..Default::default()
        }
    }

    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = Some(document_type.into());
        self
    }

    pub fn with_process_types(mut self, process_types: &[String]) -> Self {
        self.process_types = process_types.to_vec();
        self
    }

    pub fn with_assignment(mut self, assignment: impl Into<String>) -> Self {
        self.assignment = Some(assignment.into());
        self
    }

    /// One parameter per document type, or the parameter itself when no types are given.
    pub fn expand_type_variants(&self, document_types: &[String]) -> Vec<FetchParameter> {
        if document_types.is_empty() {
            return vec![self.clone()];
        }
        document_types
            .iter()
            .map(|document_type| self.clone().with_document_type(document_type.clone()))
            .collect()
    }

    pub fn has_date_window(&self) -> bool {
        self.date_start.is_some() || self.date_end.is_some()
    }

    /// Whether the parameter's date window overlaps `[start, end]`.
    pub fn touches_period(&self, start: NaiveDate, end: NaiveDate) -> bool {
        let after_start = self.date_end.map_or(true, |d| d >= start);
        let before_end = self.date_start.map_or(true, |d| d <= end);
        after_start && before_end
    }
}

impl fmt::Display for FetchParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(d) = self.date_start {
            parts.push(format!("date_start={d}"));
        }
        if let Some(d) = self.date_end {
            parts.push(format!("date_end={d}"));
        }
        if let Some(ts) = self.updated_since {
            parts.push(format!("updated_since={}", ts.format(UPDATED_AT_FORMAT)));
        }
        if let Some(ts) = self.updated_until {
            parts.push(format!("updated_until={}", ts.format(UPDATED_AT_FORMAT)));
        }
        if let Some(t) = &self.document_type {
            parts.push(format!("document_type={t}"));
        }
        if !self.process_types.is_empty() {
            parts.push(format!("process_types=[{}]", self.process_types.join("|")));
        }
        if !self.ids.is_empty() {
            parts.push(format!("ids={:?}", self.ids));
        }
        if let Some(parent) = self.parent {
            parts.push(format!("parent={parent:?}"));
        }
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Operator filter set; `document_types` are expanded into one request each.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default)]
    pub document_types: Vec<String>,
    #[serde(default)]
    pub process_types: Vec<String>,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self.document_types.is_empty() && self.process_types.is_empty()
    }
}

/// Pointer into a paginated result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cursor {
    /// Opaque server-issued token.
    Token(String),
    /// Offset derived from page metadata; more pages exist while `next_offset < total_hits`.
    Offset { next_offset: u64, total_hits: u64 },
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Token(token) => write!(f, "cursor={token}"),
            Cursor::Offset {
                next_offset,
                total_hits,
            } => write!(f, "offset={next_offset}/{total_hits}"),
        }
    }
}

/// One page of a paginated response. `cursor == None` marks the terminal page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub cursor: Option<Cursor>,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    pub fn terminal(items: Vec<T>) -> Self {
        Self {
            cursor: None,
            items,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.cursor.is_none()
    }
}

/// Item as it arrived from the structured API, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRawItem {
    pub document: JsonValue,
}

/// Item pointer extracted from the scraped listing markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedRawItem {
    pub href: String,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawItem {
    Structured(StructuredRawItem),
    Scraped(ScrapedRawItem),
}

impl RawItem {
    /// Source-assigned id when the payload carries one.
    pub fn source_id(&self) -> Option<i64> {
        match self {
            RawItem::Structured(item) => item.document.get("id").and_then(json_id),
            RawItem::Scraped(item) => Some(item.id),
        }
    }
}

fn json_id(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The structured API serializes ids as strings; older payloads use numbers.
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    json_id(&value).ok_or_else(|| serde::de::Error::custom(format!("invalid id: {value}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drucksache {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: i64,
    pub drucksachetyp: String,
    pub dokumentnummer: String,
    pub datum: NaiveDate,
    pub aktualisiert: DateTime<FixedOffset>,
    pub titel: String,
    #[serde(default)]
    pub wahlperiode: Option<u32>,
    #[serde(default)]
    pub herausgeber: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vorgang {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: i64,
    pub vorgangstyp: String,
    pub titel: String,
    pub aktualisiert: DateTime<FixedOffset>,
    #[serde(default)]
    pub datum: Option<NaiveDate>,
    #[serde(default)]
    pub beratungsstand: Option<String>,
    #[serde(default)]
    pub wahlperiode: Option<u32>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vorgangsposition {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: i64,
    #[serde(deserialize_with = "deserialize_id")]
    pub vorgang_id: i64,
    pub vorgangsposition: String,
    pub datum: NaiveDate,
    pub aktualisiert: DateTime<FixedOffset>,
    pub titel: String,
    #[serde(default)]
    pub dokumentart: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plenarprotokoll {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: i64,
    pub dokumentnummer: String,
    pub datum: NaiveDate,
    pub aktualisiert: DateTime<FixedOffset>,
    pub titel: String,
    #[serde(default)]
    pub wahlperiode: Option<u32>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

/// Listing entry pointing at one vote detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbstimmungPointer {
    pub id: i64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedDrucksache {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redner {
    pub name: String,
    pub function: String,
    pub video_id: String,
    pub video_url: String,
    pub image_url: Option<String>,
}

/// Parsed vote detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abstimmung {
    pub id: i64,
    pub title: String,
    pub date: NaiveDate,
    pub dachzeile: Option<String>,
    pub abstract_text: String,
    pub ja: u32,
    pub nein: u32,
    pub enthalten: u32,
    pub nicht_abgegeben: u32,
    pub drucksachen: Vec<RelatedDrucksache>,
    pub redner: Vec<Redner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Drucksache,
    Vorgang,
    Vorgangsposition,
    Plenarprotokoll,
    Abstimmung,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Drucksache => "drucksache",
            RecordKind::Vorgang => "vorgang",
            RecordKind::Vorgangsposition => "vorgangsposition",
            RecordKind::Plenarprotokoll => "plenarprotokoll",
            RecordKind::Abstimmung => "abstimmung",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-ready record. `(kind, id)` is the upsert key and is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedRecord {
    pub kind: RecordKind,
    pub id: i64,
    /// Date the record is counted under for per-period reconciliation.
    pub period_date: Option<NaiveDate>,
    /// Value of the single-valued filter dimension (e.g. the document type).
    pub type_tag: Option<String>,
    /// Values of multi-valued filter dimensions inherited from children.
    pub tags: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub payload: JsonValue,
    pub children: Vec<MappedRecord>,
}

impl MappedRecord {
    pub fn new(kind: RecordKind, id: i64, payload: JsonValue) -> Self {
        Self {
            kind,
            id,
            period_date: None,
            type_tag: None,
            tags: Vec::new(),
            updated_at: None,
            payload,
            children: Vec::new(),
        }
    }

    pub fn key(&self) -> (RecordKind, i64) {
        (self.kind, self.id)
    }

    /// Number of records including all nested children.
    pub fn total_len(&self) -> usize {
        1 + self.children.iter().map(MappedRecord::total_len).sum::<usize>()
    }

    /// Depth-first walk yielding `(parent_key, record)` for the record and every descendant.
    pub fn walk(&self) -> Vec<(Option<(RecordKind, i64)>, &MappedRecord)> {
        let mut out = vec![(None, self)];
        let mut idx = 0;
        while idx < out.len() {
            let (_, record) = out[idx];
            for child in &record.children {
                out.push((Some(record.key()), child));
            }
            idx += 1;
        }
        out
    }
}

/// Calendar week clipped to a reconciliation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Week {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Week {
    pub fn iso_week(&self) -> (i32, u32) {
        let iso = self.start.iso_week();
        (iso.year(), iso.week())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Monday-aligned weeks covering `[start, end]`, the first and last clipped to the window.
pub fn weeks_in_window(start: NaiveDate, end: NaiveDate) -> Vec<Week> {
    let mut weeks = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let monday = cursor - Duration::days(i64::from(cursor.weekday().num_days_from_monday()));
        let sunday = monday + Duration::days(6);
        let week_end = sunday.min(end);
        weeks.push(Week {
            start: cursor,
            end: week_end,
        });
        cursor = week_end + Duration::days(1);
    }
    weeks
}

/// Per-period count, produced alike by the local store and the remote count probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyCount {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub count: u64,
}

impl WeeklyCount {
    pub fn new(week: Week, count: u64) -> Self {
        Self {
            period_start: week.start,
            period_end: week.end,
            count,
        }
    }

    pub fn week(&self) -> Week {
        Week {
            start: self.period_start,
            end: self.period_end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    Full,
    Incremental,
    GapFill,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "new",
            SyncMode::GapFill => "missing",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown sync mode `{0}` (expected full, new or missing)")]
pub struct UnknownSyncMode(String);

impl FromStr for SyncMode {
    type Err = UnknownSyncMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "new" | "incremental" => Ok(SyncMode::Incremental),
            "missing" | "gap-fill" => Ok(SyncMode::GapFill),
            other => Err(UnknownSyncMode(other.to_string())),
        }
    }
}
