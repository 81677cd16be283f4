//! Structured DIP API: cursor-token pagination over `/api/v1/*` list endpoints.

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parlsync_core::{
    Cursor, Drucksache, FetchParameter, MappedRecord, Page, ParentLink, Plenarprotokoll, RawItem,
    RecordKind, StructuredRawItem, Vorgang, Vorgangsposition, UPDATED_AT_FORMAT,
};
use parlsync_transport::{RequestSpec, TransportClient, TransportResponse};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    AdapterError, CountProbe, FetchOptions, PageProtocol, PaginateError, ParamPatch, RecordMapper,
    SourceAdapter,
};

/// A DIP list endpoint and the document type it returns.
pub trait DipDocument: DeserializeOwned + Serialize + Send + Sync + 'static {
    const ENDPOINT: &'static str;
    const KIND: RecordKind;
}

impl DipDocument for Drucksache {
    const ENDPOINT: &'static str = "/api/v1/drucksache";
    const KIND: RecordKind = RecordKind::Drucksache;
}

impl DipDocument for Vorgang {
    const ENDPOINT: &'static str = "/api/v1/vorgang";
    const KIND: RecordKind = RecordKind::Vorgang;
}

impl DipDocument for Vorgangsposition {
    const ENDPOINT: &'static str = "/api/v1/vorgangsposition";
    const KIND: RecordKind = RecordKind::Vorgangsposition;
}

impl DipDocument for Plenarprotokoll {
    const ENDPOINT: &'static str = "/api/v1/plenarprotokoll";
    const KIND: RecordKind = RecordKind::Plenarprotokoll;
}

#[derive(Debug, Deserialize)]
struct DipListResponse {
    #[serde(rename = "numFound", default)]
    num_found: u64,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    documents: Vec<JsonValue>,
}

/// `f.*` query pairs for a parameter. Multi-valued dimensions repeat the key (OR semantics).
pub fn dip_query(params: &FetchParameter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    let mut push = |key: &str, value: String| query.push((key.to_string(), value));

    if let Some(date) = params.date_start {
        push("f.datum.start", date.format("%Y-%m-%d").to_string());
    }
    if let Some(date) = params.date_end {
        push("f.datum.end", date.format("%Y-%m-%d").to_string());
    }
    if let Some(ts) = params.updated_since {
        push("f.aktualisiert.start", ts.format(UPDATED_AT_FORMAT).to_string());
    }
    if let Some(ts) = params.updated_until {
        push("f.aktualisiert.end", ts.format(UPDATED_AT_FORMAT).to_string());
    }
    if let Some(document_type) = &params.document_type {
        push("f.drucksachetyp", document_type.clone());
    }
    for process_type in &params.process_types {
        push("f.vorgangstyp", process_type.clone());
    }
    for id in &params.ids {
        push("f.id", id.to_string());
    }
    for term in &params.electoral_terms {
        push("f.wahlperiode", term.to_string());
    }
    if let Some(assignment) = &params.assignment {
        push("f.zuordnung", assignment.clone());
    }
    match params.parent {
        Some(ParentLink::Drucksache(id)) => push("f.drucksache", id.to_string()),
        Some(ParentLink::Vorgang(id)) => push("f.vorgang", id.to_string()),
        Some(ParentLink::Plenarprotokoll(id)) => push("f.plenarprotokoll", id.to_string()),
        None => {}
    }
    query
}

fn dip_request(endpoint: &str, params: &FetchParameter) -> RequestSpec {
    let mut request = RequestSpec::get(endpoint).content_type("application/json");
    request.query = dip_query(params);
    request
}

/// The server repeats its last cursor once the result set is exhausted; that page is a duplicate
/// of the previous one and is dropped.
#[derive(Debug, Default)]
pub struct DipProtocol {
    previous_cursor: Option<String>,
}

impl PageProtocol for DipProtocol {
    fn unpack_page(&mut self, response: &TransportResponse) -> Result<Page<RawItem>, PaginateError> {
        let body: DipListResponse = response
            .json()
            .map_err(|e| PaginateError::Unpack(format!("decoding DIP list response: {e}")))?;

        let items: Vec<RawItem> = body
            .documents
            .into_iter()
            .map(|document| RawItem::Structured(StructuredRawItem { document }))
            .collect();

        match body.cursor {
            Some(cursor) if self.previous_cursor.as_deref() == Some(cursor.as_str()) => {
                Ok(Page::terminal(Vec::new()))
            }
            Some(cursor) if !items.is_empty() => {
                self.previous_cursor = Some(cursor.clone());
                Ok(Page {
                    cursor: Some(Cursor::Token(cursor)),
                    items,
                })
            }
            _ => Ok(Page::terminal(items)),
        }
    }

    fn next_cursor(&self, cursor: &Cursor) -> Option<ParamPatch> {
        match cursor {
            Cursor::Token(token) => Some(ParamPatch::new("cursor", token.clone())),
            Cursor::Offset { .. } => None,
        }
    }
}

/// One DIP list endpoint, typed by the document it returns.
pub struct DipAdapter<T> {
    transport: Arc<TransportClient>,
    _document: PhantomData<fn() -> T>,
}

impl<T> Clone for DipAdapter<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            _document: PhantomData,
        }
    }
}

impl<T: DipDocument> DipAdapter<T> {
    pub fn new(transport: Arc<TransportClient>) -> Self {
        Self {
            transport,
            _document: PhantomData,
        }
    }
}

impl<T: DipDocument> SourceAdapter for DipAdapter<T> {
    type Protocol = DipProtocol;
    type Item = T;

    fn name(&self) -> &'static str {
        T::ENDPOINT
    }

    fn transport(&self) -> &TransportClient {
        &self.transport
    }

    fn start(&self, params: &FetchParameter) -> (RequestSpec, DipProtocol) {
        (dip_request(T::ENDPOINT, params), DipProtocol::default())
    }

    fn validate(&self, raw: RawItem) -> Result<T, String> {
        match raw {
            RawItem::Structured(item) => serde_json::from_value(item.document).map_err(|e| e.to_string()),
            RawItem::Scraped(item) => Err(format!("scraped item {} on a DIP endpoint", item.href)),
        }
    }
}

#[async_trait]
impl<T: DipDocument> CountProbe for DipAdapter<T> {
    async fn fetch_count(&self, params: &FetchParameter) -> Result<u64, AdapterError> {
        let request = dip_request(T::ENDPOINT, params).without_retry();
        let response = self.transport.execute(&request, None).await?.error_for_status()?;
        let body: DipListResponse = response
            .json()
            .map_err(|e| AdapterError::Parse(format!("decoding DIP count response: {e}")))?;
        debug!(endpoint = T::ENDPOINT, %params, count = body.num_found, "remote count");
        Ok(body.num_found)
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<JsonValue, AdapterError> {
    serde_json::to_value(value).map_err(|e| AdapterError::Parse(format!("serializing payload: {e}")))
}

fn map_vorgangsposition(position: &Vorgangsposition) -> Result<MappedRecord, AdapterError> {
    let mut record = MappedRecord::new(RecordKind::Vorgangsposition, position.id, to_payload(position)?);
    record.period_date = Some(position.datum);
    record.type_tag = position.dokumentart.clone();
    record.updated_at = Some(position.aktualisiert.with_timezone(&Utc));
    Ok(record)
}

/// Maps a Vorgang and eagerly fetches its Vorgangspositionen.
#[derive(Clone)]
pub struct VorgangMapper {
    positionen: DipAdapter<Vorgangsposition>,
    request_delay: Duration,
}

impl VorgangMapper {
    pub fn new(transport: Arc<TransportClient>, request_delay: Duration) -> Self {
        Self {
            positionen: DipAdapter::new(transport),
            request_delay,
        }
    }
}

#[async_trait]
impl RecordMapper<Vorgang> for VorgangMapper {
    async fn map(&self, vorgang: Vorgang, options: &FetchOptions<'_>) -> Result<MappedRecord, AdapterError> {
        tokio::time::sleep(self.request_delay).await;
        let positionen = self
            .positionen
            .stream(&FetchParameter::linked_to(ParentLink::Vorgang(vorgang.id)), options)
            .collect()
            .await?;

        let mut record = MappedRecord::new(RecordKind::Vorgang, vorgang.id, to_payload(&vorgang)?);
        record.period_date = vorgang.datum;
        record.type_tag = Some(vorgang.vorgangstyp.clone());
        record.updated_at = Some(vorgang.aktualisiert.with_timezone(&Utc));
        record.children = positionen
            .iter()
            .map(map_vorgangsposition)
            .collect::<Result<_, _>>()?;
        Ok(record)
    }
}

/// Maps a Drucksache with its Vorgänge (and their positions). The Vorgang types become the
/// record's tags so per-period counts can filter on them.
pub struct DrucksacheMapper {
    vorgaenge: DipAdapter<Vorgang>,
    vorgang_mapper: VorgangMapper,
    request_delay: Duration,
}

impl DrucksacheMapper {
    pub fn new(transport: Arc<TransportClient>, request_delay: Duration) -> Self {
        Self {
            vorgaenge: DipAdapter::new(Arc::clone(&transport)),
            vorgang_mapper: VorgangMapper::new(transport, request_delay),
            request_delay,
        }
    }
}

#[async_trait]
impl RecordMapper<Drucksache> for DrucksacheMapper {
    async fn map(&self, drucksache: Drucksache, options: &FetchOptions<'_>) -> Result<MappedRecord, AdapterError> {
        tokio::time::sleep(self.request_delay).await;
        let vorgaenge = self
            .vorgaenge
            .stream(&FetchParameter::linked_to(ParentLink::Drucksache(drucksache.id)), options)
            .collect()
            .await?;

        let mut record = MappedRecord::new(RecordKind::Drucksache, drucksache.id, to_payload(&drucksache)?);
        record.period_date = Some(drucksache.datum);
        record.type_tag = Some(drucksache.drucksachetyp.clone());
        record.updated_at = Some(drucksache.aktualisiert.with_timezone(&Utc));
        record.tags = vorgaenge
            .iter()
            .map(|v| v.vorgangstyp.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for vorgang in vorgaenge {
            record.children.push(self.vorgang_mapper.map(vorgang, options).await?);
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlenarprotokollMapper;

#[async_trait]
impl RecordMapper<Plenarprotokoll> for PlenarprotokollMapper {
    async fn map(&self, protokoll: Plenarprotokoll, _options: &FetchOptions<'_>) -> Result<MappedRecord, AdapterError> {
        let mut record = MappedRecord::new(RecordKind::Plenarprotokoll, protokoll.id, to_payload(&protokoll)?);
        record.period_date = Some(protokoll.datum);
        record.updated_at = Some(protokoll.aktualisiert.with_timezone(&Utc));
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn response(body: JsonValue) -> TransportResponse {
        TransportResponse {
            status: 200,
            url: "http://dip.test/api/v1/drucksache".into(),
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    #[test]
    fn query_uses_dip_filter_keys() {
        let params = FetchParameter {
            date_start: NaiveDate::from_ymd_opt(2023, 1, 1),
            date_end: NaiveDate::from_ymd_opt(2023, 1, 14),
            document_type: Some("Antrag".into()),
            process_types: vec!["Gesetzgebung".into(), "Antrag".into()],
            parent: Some(ParentLink::Vorgang(12)),
            ..Default::default()
        };
        let query = dip_query(&params);
        assert!(query.contains(&("f.datum.start".into(), "2023-01-01".into())));
        assert!(query.contains(&("f.datum.end".into(), "2023-01-14".into())));
        assert!(query.contains(&("f.drucksachetyp".into(), "Antrag".into())));
        assert_eq!(query.iter().filter(|(k, _)| k == "f.vorgangstyp").count(), 2);
        assert!(query.contains(&("f.vorgang".into(), "12".into())));
    }

    #[test]
    fn incremental_query_formats_timestamp() {
        let since = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(7, 30, 0)
            .unwrap();
        let query = dip_query(&FetchParameter::updated_since(since));
        assert_eq!(query, vec![("f.aktualisiert.start".to_string(), "2024-03-05T07:30:00".to_string())]);
    }

    #[test]
    fn repeated_cursor_ends_pagination_and_drops_duplicate_page() {
        let mut protocol = DipProtocol::default();
        let first = protocol
            .unpack_page(&response(json!({"numFound": 2, "cursor": "AoE", "documents": [{"id": "1"}, {"id": "2"}]})))
            .unwrap();
        assert_eq!(first.cursor, Some(Cursor::Token("AoE".into())));
        assert_eq!(first.items.len(), 2);

        let last = protocol
            .unpack_page(&response(json!({"numFound": 2, "cursor": "AoE", "documents": [{"id": "1"}, {"id": "2"}]})))
            .unwrap();
        assert!(last.is_terminal());
        assert!(last.items.is_empty());
    }

    #[test]
    fn empty_documents_page_is_terminal() {
        let mut protocol = DipProtocol::default();
        let page = protocol
            .unpack_page(&response(json!({"numFound": 0, "cursor": "AoE", "documents": []})))
            .unwrap();
        assert!(page.is_terminal());
        assert_eq!(
            protocol.next_cursor(&Cursor::Token("x".into())),
            Some(ParamPatch::new("cursor", "x"))
        );
    }

    #[test]
    fn malformed_body_is_an_unpack_error() {
        let mut protocol = DipProtocol::default();
        let bad = TransportResponse {
            status: 200,
            url: "http://dip.test".into(),
            body: b"<html>".to_vec(),
        };
        assert!(matches!(protocol.unpack_page(&bad), Err(PaginateError::Unpack(_))));
    }
}
