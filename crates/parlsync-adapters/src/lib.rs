//! Pagination contract + source adapters for the structured DIP API and the scraped vote listing.

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use parlsync_core::{Cursor, FetchParameter, MappedRecord, Page, RawItem};
use parlsync_transport::{
    ProxyPool, ProxyPoolError, RequestSpec, TransportClient, TransportError, TransportResponse,
};
use scraper::{ElementRef, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod dip;
pub mod votes;

pub use dip::{
    dip_query, DipAdapter, DipDocument, DipProtocol, DrucksacheMapper, PlenarprotokollMapper,
    VorgangMapper,
};
pub use votes::{
    parse_abstimmung, parse_german_date, votes_query, ListingProtocol, VoteListingAdapter,
    VoteMapper,
};

pub const CRATE_NAME: &str = "parlsync-adapters";

#[derive(Debug, Error)]
pub enum PaginateError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    ProxyPool(#[from] ProxyPoolError),
    #[error("unpacking page: {0}")]
    Unpack(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Paginate(#[from] PaginateError),
    #[error("item failed validation at {cursor}: {message}")]
    Validation { cursor: String, message: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Query parameter rewrite that moves a request to the next page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamPatch {
    pub name: String,
    pub value: String,
}

impl ParamPatch {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ParamPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Source-specific half of pagination: how a response becomes a page and a page's cursor becomes
/// the next request. Implementations may keep per-run state and are created fresh per run.
pub trait PageProtocol: Send {
    fn unpack_page(&mut self, response: &TransportResponse) -> Result<Page<RawItem>, PaginateError>;

    fn next_cursor(&self, cursor: &Cursor) -> Option<ParamPatch>;
}

/// Lazily turns page responses into a flat item sequence, one page request at a time.
pub struct Paginator<'a, P> {
    transport: &'a TransportClient,
    proxies: Option<&'a ProxyPool>,
    protocol: P,
    request: RequestSpec,
    buffer: VecDeque<RawItem>,
    reached_end: bool,
    response_limit: Option<u32>,
    request_patch: Option<ParamPatch>,
    page_patch: Option<ParamPatch>,
    pages: usize,
}

impl<'a, P: PageProtocol> Paginator<'a, P> {
    pub fn new(transport: &'a TransportClient, protocol: P, request: RequestSpec) -> Self {
        Self {
            transport,
            proxies: None,
            protocol,
            request,
            buffer: VecDeque::new(),
            reached_end: false,
            response_limit: None,
            request_patch: None,
            page_patch: None,
            pages: 0,
        }
    }

    /// Bound the run to `limit` pages.
    pub fn with_response_limit(mut self, limit: Option<u32>) -> Self {
        self.response_limit = limit;
        self
    }

    pub fn with_proxies(mut self, proxies: Option<&'a ProxyPool>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Cursor of the page currently being drained.
    pub fn position(&self) -> String {
        match &self.page_patch {
            Some(patch) => patch.to_string(),
            None => "first page".to_string(),
        }
    }

    fn can_fetch(&self) -> bool {
        !self.reached_end && self.response_limit.map_or(true, |limit| limit > 0)
    }

    pub async fn next_item(&mut self) -> Result<Option<RawItem>, PaginateError> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if !self.can_fetch() {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn fetch_page(&mut self) -> Result<(), PaginateError> {
        let response = loop {
            let proxy = match self.proxies {
                Some(pool) => Some(pool.get_proxy(false).await?),
                None => None,
            };
            let result = self
                .transport
                .execute(&self.request, proxy.as_ref())
                .await
                .and_then(TransportResponse::error_for_status);
            match (result, self.proxies) {
                (Ok(response), _) => break response,
                (Err(err), Some(pool)) if err.is_network() => {
                    warn!(error = %err, position = %self.position(), "page fetch failed, retrying with new proxy");
                    pool.rotate(true, true).await?;
                }
                (Err(err), _) => return Err(err.into()),
            }
        };

        let page = self.protocol.unpack_page(&response)?;
        self.pages += 1;
        self.page_patch = self.request_patch.clone();
        self.buffer.extend(page.items);

        match page.cursor.as_ref().and_then(|c| self.protocol.next_cursor(c)) {
            Some(patch) => {
                debug!(cursor = %patch, "next cursor");
                self.request.set_query(&patch.name, patch.value.clone());
                self.request_patch = Some(patch);
            }
            None => {
                info!(pages = self.pages, "reached end of pages");
                self.reached_end = true;
            }
        }

        if let Some(limit) = self.response_limit.as_mut() {
            *limit = limit.saturating_sub(1);
        }
        Ok(())
    }
}

/// Per-run knobs shared by adapters and mappers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions<'a> {
    pub response_limit: Option<u32>,
    pub proxies: Option<&'a ProxyPool>,
    pub raise_on_error: bool,
}

/// A remote source adapted to the paginator contract and to its typed domain item.
pub trait SourceAdapter: Send + Sync {
    type Protocol: PageProtocol;
    type Item: Send;

    fn name(&self) -> &'static str;

    fn transport(&self) -> &TransportClient;

    /// First-page request for `params` together with fresh protocol state.
    fn start(&self, params: &FetchParameter) -> (RequestSpec, Self::Protocol);

    fn validate(&self, raw: RawItem) -> Result<Self::Item, String>;

    fn stream<'a>(&'a self, params: &FetchParameter, options: &FetchOptions<'a>) -> ItemStream<'a, Self>
    where
        Self: Sized,
    {
        let (request, protocol) = self.start(params);
        let paginator = Paginator::new(self.transport(), protocol, request)
            .with_response_limit(options.response_limit)
            .with_proxies(options.proxies);
        ItemStream {
            adapter: self,
            paginator,
            raise_on_error: options.raise_on_error,
            skipped: 0,
        }
    }
}

/// Validated items of one adapter run. `next` yields `Ok(None)` at end of stream.
pub struct ItemStream<'a, A: SourceAdapter> {
    adapter: &'a A,
    paginator: Paginator<'a, A::Protocol>,
    raise_on_error: bool,
    skipped: usize,
}

impl<'a, A: SourceAdapter> ItemStream<'a, A> {
    pub async fn next(&mut self) -> Result<Option<A::Item>, AdapterError> {
        loop {
            let Some(raw) = self.paginator.next_item().await? else {
                return Ok(None);
            };
            let item_id = raw.source_id();
            match self.adapter.validate(raw) {
                Ok(item) => return Ok(Some(item)),
                Err(message) => {
                    let cursor = self.paginator.position();
                    warn!(
                        adapter = self.adapter.name(),
                        item_id = ?item_id,
                        cursor = %cursor,
                        error = %message,
                        "item failed validation"
                    );
                    if self.raise_on_error {
                        return Err(AdapterError::Validation { cursor, message });
                    }
                    self.skipped += 1;
                }
            }
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn pages_fetched(&self) -> usize {
        self.paginator.pages_fetched()
    }

    /// Drain the stream; test and small-batch helper.
    pub async fn collect(mut self) -> Result<Vec<A::Item>, AdapterError> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await? {
            out.push(item);
        }
        Ok(out)
    }
}

/// Lightweight remote count for a parameter, no full fetch.
#[async_trait]
pub trait CountProbe: Send + Sync {
    async fn fetch_count(&self, params: &FetchParameter) -> Result<u64, AdapterError>;
}

/// Turns a validated item (plus eagerly fetched children) into a store-ready record.
#[async_trait]
pub trait RecordMapper<T: Send + 'static>: Send + Sync {
    async fn map(&self, item: T, options: &FetchOptions<'_>) -> Result<MappedRecord, AdapterError>;
}

fn parse_selector(selector: &str) -> Result<Selector, String> {
    Selector::parse(selector).map_err(|e| format!("invalid selector `{selector}`: {e}"))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(scope: ElementRef<'_>, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector).map_err(AdapterError::Parse)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    scope: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector).map_err(AdapterError::Parse)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn first_integer(text: &str) -> Option<u32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
