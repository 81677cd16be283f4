//! Scraped vote listing: offset pagination driven by the `meta-slider` marker, plus detail pages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parlsync_core::{
    Abstimmung, AbstimmungPointer, Cursor, FetchParameter, MappedRecord, Page, RawItem,
    RecordKind, Redner, RelatedDrucksache, ScrapedRawItem,
};
use parlsync_transport::{RequestSpec, TransportClient, TransportResponse};
use scraper::{ElementRef, Html};
use tracing::{debug, info, warn};

use crate::{
    first_integer, parse_selector, select_first_attr, select_first_text, AdapterError, CountProbe,
    FetchOptions, PageProtocol, PaginateError, ParamPatch, RecordMapper, SourceAdapter,
};

pub const LISTING_PATH: &str = "/ajax/filterlist/de/parlament/plenum/abstimmung/484422-484422";
pub const DETAIL_PATH: &str = "/parlament/plenum/abstimmung/abstimmung";
/// Page size assumed when the marker carries no `data-limit`.
pub const DEFAULT_PAGE_SIZE: u64 = 30;

const VOTE_HREF_PREFIX: &str = "/parlament/plenum/abstimmung/abstimmung?id=";

const GERMAN_MONTHS: [(&str, &str); 13] = [
    ("Januar", "January"),
    ("Februar", "February"),
    ("März", "March"),
    ("Maerz", "March"),
    ("April", "April"),
    ("Mai", "May"),
    ("Juni", "June"),
    ("Juli", "July"),
    ("August", "August"),
    ("September", "September"),
    ("Oktober", "October"),
    ("November", "November"),
    ("Dezember", "December"),
];

/// The listing filters on epoch milliseconds of the day's start.
fn listing_timestamp(date: NaiveDate) -> String {
    let millis = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default();
    millis.to_string()
}

pub fn votes_query(params: &FetchParameter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(date) = params.date_start {
        query.push(("startdate".to_string(), listing_timestamp(date)));
    }
    if let Some(date) = params.date_end {
        query.push(("enddate".to_string(), listing_timestamp(date)));
    }
    if params.has_date_window() {
        query.push(("startfield".to_string(), "date".to_string()));
    }
    query
}

fn listing_request(params: &FetchParameter) -> RequestSpec {
    let mut request = RequestSpec::get(LISTING_PATH);
    request.query = votes_query(params);
    request
}

/// Numeric id of a vote detail link, if `href` is one.
fn vote_id_from_href(href: &str) -> Option<i64> {
    let rest = href.strip_prefix(VOTE_HREF_PREFIX)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

struct ListingMeta {
    total_hits: u64,
    limit: u64,
    next_offset: Option<u64>,
}

fn parse_meta_attr(element: ElementRef<'_>, attr: &str) -> Result<Option<u64>, String> {
    element
        .value()
        .attr(attr)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| format!("meta-slider {attr}={raw:?}: {e}"))
        })
        .transpose()
}

fn listing_meta(document: &Html) -> Result<ListingMeta, String> {
    let selector = parse_selector(".meta-slider")?;
    let meta = document
        .select(&selector)
        .next()
        .ok_or_else(|| "listing has no meta-slider marker".to_string())?;

    let total_hits = parse_meta_attr(meta, "data-hits")?
        .ok_or_else(|| "meta-slider has no data-hits".to_string())?;
    let limit = match parse_meta_attr(meta, "data-limit")? {
        Some(limit) => limit,
        None => {
            warn!("meta-slider has no data-limit, assuming {DEFAULT_PAGE_SIZE}");
            DEFAULT_PAGE_SIZE
        }
    };
    let next_offset = parse_meta_attr(meta, "data-nextoffset")?;
    if next_offset.is_none() {
        warn!("meta-slider has no data-nextoffset");
    }

    Ok(ListingMeta {
        total_hits,
        limit,
        next_offset,
    })
}

fn vote_pointers(document: &Html) -> Result<Vec<RawItem>, String> {
    let selector = parse_selector(r#"a[tabindex="0"][href]"#)?;
    let mut items = Vec::new();
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        match vote_id_from_href(href) {
            Some(id) => items.push(RawItem::Scraped(ScrapedRawItem {
                href: href.to_string(),
                id,
            })),
            None => warn!(href, "listing link is not a vote link, skipping"),
        }
    }
    Ok(items)
}

/// Offset state for one listing run.
#[derive(Debug, Default)]
pub struct ListingProtocol {
    offset: u64,
}

impl PageProtocol for ListingProtocol {
    fn unpack_page(&mut self, response: &TransportResponse) -> Result<Page<RawItem>, PaginateError> {
        let document = Html::parse_document(&response.text());
        let meta = listing_meta(&document).map_err(PaginateError::Unpack)?;
        let items = vote_pointers(&document).map_err(PaginateError::Unpack)?;

        let next_offset = meta.next_offset.unwrap_or(self.offset + meta.limit);
        if next_offset < meta.total_hits {
            self.offset = next_offset;
            debug!(offset = next_offset, total_hits = meta.total_hits, "listing has more pages");
            Ok(Page {
                cursor: Some(Cursor::Offset {
                    next_offset,
                    total_hits: meta.total_hits,
                }),
                items,
            })
        } else {
            Ok(Page::terminal(items))
        }
    }

    fn next_cursor(&self, cursor: &Cursor) -> Option<ParamPatch> {
        match cursor {
            Cursor::Offset { next_offset, .. } => Some(ParamPatch::new("offset", next_offset.to_string())),
            Cursor::Token(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct VoteListingAdapter {
    transport: Arc<TransportClient>,
}

impl VoteListingAdapter {
    pub fn new(transport: Arc<TransportClient>) -> Self {
        Self { transport }
    }
}

impl SourceAdapter for VoteListingAdapter {
    type Protocol = ListingProtocol;
    type Item = AbstimmungPointer;

    fn name(&self) -> &'static str {
        "abstimmungen"
    }

    fn transport(&self) -> &TransportClient {
        &self.transport
    }

    fn start(&self, params: &FetchParameter) -> (RequestSpec, ListingProtocol) {
        (listing_request(params), ListingProtocol::default())
    }

    fn validate(&self, raw: RawItem) -> Result<AbstimmungPointer, String> {
        match raw {
            RawItem::Scraped(item) => Ok(AbstimmungPointer {
                id: item.id,
                url: item.href,
            }),
            RawItem::Structured(_) => Err("structured item on the vote listing".to_string()),
        }
    }
}

#[async_trait]
impl CountProbe for VoteListingAdapter {
    async fn fetch_count(&self, params: &FetchParameter) -> Result<u64, AdapterError> {
        let request = listing_request(params).without_retry();
        let response = self.transport.execute(&request, None).await?.error_for_status()?;
        let document = Html::parse_document(&response.text());
        let meta = listing_meta(&document).map_err(AdapterError::Parse)?;
        Ok(meta.total_hits)
    }
}

pub fn parse_german_date(text: &str) -> Result<NaiveDate, AdapterError> {
    let english = GERMAN_MONTHS
        .iter()
        .find(|(german, _)| text.contains(german))
        .map(|(german, english)| text.replace(german, english))
        .ok_or_else(|| AdapterError::Parse(format!("no German month in date {text:?}")))?;
    NaiveDate::parse_from_str(english.trim(), "%d. %B %Y")
        .map_err(|e| AdapterError::Parse(format!("date {text:?} (as {english:?}): {e}")))
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, AdapterError> {
    value.ok_or_else(|| AdapterError::Parse(format!("vote page has no {what}")))
}

fn vote_count(legend: ElementRef<'_>, class: &str) -> Result<u32, AdapterError> {
    let text = required(select_first_text(legend, &format!("li.{class}"))?, class)?;
    first_integer(&text).ok_or_else(|| AdapterError::Parse(format!("no count in {class}: {text:?}")))
}

fn redner(document: ElementRef<'_>, base_url: &str) -> Result<Vec<Redner>, AdapterError> {
    let selector = parse_selector("a.bt-fl-teaser[href]").map_err(AdapterError::Parse)?;
    let mut out = Vec::new();
    for teaser in document.select(&selector) {
        let video_id = required(teaser.value().attr("data-videoid"), "data-videoid on speaker link")?;
        let href = teaser.value().attr("href").unwrap_or_default();
        let name = required(select_first_text(teaser, "h3.bt-fl-teaser__text--name")?, "speaker name")?;
        let function = required(
            select_first_text(teaser, "p.bt-fl-teaser__text--function")?,
            "speaker function",
        )?;
        let image = select_first_attr(teaser, "img[data-img-md-normal]", "data-img-md-normal")?;
        out.push(Redner {
            name,
            function,
            video_id: video_id.to_string(),
            video_url: format!("{base_url}{href}"),
            image_url: image.map(|path| format!("{base_url}{path}")),
        });
    }
    Ok(out)
}

/// Parse a vote detail page. `base_url` prefixes the relative video and image links.
pub fn parse_abstimmung(id: i64, html: &str, base_url: &str) -> Result<Abstimmung, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let base_url = base_url.trim_end_matches('/');

    let article_sel = parse_selector("article.bt-artikel").map_err(AdapterError::Parse)?;
    let article = required(document.select(&article_sel).next(), "bt-artikel article")?;

    let date = parse_german_date(&required(select_first_text(article, "span.bt-date")?, "date")?)?;
    let title = required(select_first_text(article, "h3.bt-artikel__title")?, "title")?;
    let abstract_text = required(select_first_text(article, "p")?, "abstract")?;

    let dip_sel = parse_selector("a.dipLink[href]").map_err(AdapterError::Parse)?;
    let drucksachen = article
        .select(&dip_sel)
        .map(|link| RelatedDrucksache {
            name: link.text().collect::<String>().trim().to_string(),
            url: link.value().attr("href").unwrap_or_default().to_string(),
        })
        .collect();

    let legend_sel = parse_selector("ul.bt-chart-legend").map_err(AdapterError::Parse)?;
    let legend = required(document.select(&legend_sel).next(), "voting results")?;

    let debate_sel = parse_selector(r##"a[href="#debatte"][role="tab"]"##).map_err(AdapterError::Parse)?;
    let (dachzeile, redner) = if document.select(&debate_sel).next().is_some() {
        let dachzeile = required(select_first_text(root, "span.bt-dachzeile")?, "dachzeile")?;
        (Some(dachzeile), redner(root, base_url)?)
    } else {
        info!(vote_id = id, "vote page has no debate section");
        (None, Vec::new())
    };

    Ok(Abstimmung {
        id,
        title,
        date,
        dachzeile,
        abstract_text,
        ja: vote_count(legend, "bt-legend-ja")?,
        nein: vote_count(legend, "bt-legend-nein")?,
        enthalten: vote_count(legend, "bt-legend-enthalten")?,
        nicht_abgegeben: vote_count(legend, "bt-legend-na")?,
        drucksachen,
        redner,
    })
}

/// Fetches and parses the detail page behind a listing pointer.
pub struct VoteMapper {
    transport: Arc<TransportClient>,
    request_delay: Duration,
}

impl VoteMapper {
    pub fn new(transport: Arc<TransportClient>, request_delay: Duration) -> Self {
        Self {
            transport,
            request_delay,
        }
    }
}

#[async_trait]
impl RecordMapper<AbstimmungPointer> for VoteMapper {
    async fn map(&self, pointer: AbstimmungPointer, _options: &FetchOptions<'_>) -> Result<MappedRecord, AdapterError> {
        tokio::time::sleep(self.request_delay).await;
        let request = RequestSpec::get(DETAIL_PATH).query("id", pointer.id.to_string());
        let response = self.transport.execute(&request, None).await?.error_for_status()?;
        let abstimmung = parse_abstimmung(pointer.id, &response.text(), self.transport.base_url())?;

        let payload = serde_json::to_value(&abstimmung)
            .map_err(|e| AdapterError::Parse(format!("serializing vote {}: {e}", pointer.id)))?;
        let mut record = MappedRecord::new(RecordKind::Abstimmung, abstimmung.id, payload);
        record.period_date = Some(abstimmung.date);
        Ok(record)
    }
}
