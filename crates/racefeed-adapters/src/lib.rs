//! Site plugin contract plus the selector-driven adapters for each registered source.

use std::path::Path;

use async_trait::async_trait;
use racefeed_core::{RawEvent, RawEventRecord};
use racefeed_storage::{sanitize_cache_key, CachedDocument, FetchError, Fetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

pub const CRATE_NAME: &str = "racefeed-adapters";

pub const BUILTIN_SOURCES: [&str; 4] = ["tionline", "activesports", "tourdopeixe", "peloto"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid base url `{0}`")]
    BaseUrl(String),
    #[error("no adapter registered for source `{0}`")]
    UnknownSource(String),
}

/// Pulls the four listing fields out of one item node (or a whole detail page).
/// Missing values come back as empty strings; validation happens downstream.
pub trait Extractor: Send + Sync {
    fn title(&self, node: ElementRef<'_>) -> String;
    fn date(&self, node: ElementRef<'_>) -> String;
    fn local(&self, node: ElementRef<'_>) -> String;
    fn url(&self, node: ElementRef<'_>) -> String;
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn crawl(&self) -> Result<CrawlOutput, AdapterError>;
}

#[derive(Debug, Default)]
pub struct CrawlOutput {
    pub events: Vec<RawEvent>,
    pub skipped: usize,
    pub documents: usize,
}

impl CrawlOutput {
    fn absorb(&mut self, other: CrawlOutput) {
        self.events.extend(other.events);
        self.skipped += other.skipped;
        self.documents += other.documents;
    }
}

/// The `nth` match of `css` under a node, read as text or as `attr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    pub css: String,
    pub nth: usize,
    pub attr: Option<String>,
}

impl FieldSelector {
    pub fn text(css: &str) -> Self {
        Self::nth_text(css, 0)
    }

    pub fn nth_text(css: &str, nth: usize) -> Self {
        Self {
            css: css.to_string(),
            nth,
            attr: None,
        }
    }

    pub fn attr(css: &str, attr: &str) -> Self {
        Self {
            css: css.to_string(),
            nth: 0,
            attr: Some(attr.to_string()),
        }
    }

    pub fn nth_attr(css: &str, nth: usize, attr: &str) -> Self {
        Self {
            nth,
            ..Self::attr(css, attr)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelectors {
    pub title: FieldSelector,
    pub date: FieldSelector,
    pub local: FieldSelector,
    pub url: FieldSelector,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlMode {
    /// Each item node on the listing page carries all four fields.
    Listing { item: String, skip_leading: usize },
    /// Item nodes only carry a link; fields come from the linked detail page.
    FollowLinks { item: String, link: FieldSelector },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDefinition {
    pub source_id: String,
    pub base_url: String,
    pub listing_path: String,
    pub cache_key: String,
    pub encoding: Option<String>,
    pub mode: CrawlMode,
    pub fields: FieldSelectors,
    /// Resolve relative event urls against `base_url`.
    pub resolve_urls: bool,
}

impl SourceDefinition {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn base(&self) -> Result<Url, AdapterError> {
        Url::parse(&self.base_url).map_err(|_| AdapterError::BaseUrl(self.base_url.clone()))
    }

    pub fn listing_url(&self) -> Result<String, AdapterError> {
        let url = self
            .base()?
            .join(&self.listing_path)
            .map_err(|_| AdapterError::BaseUrl(self.base_url.clone()))?;
        Ok(url.to_string())
    }

    /// Absolute hrefs pass through; relative ones are joined onto `base_url`.
    pub fn resolve(&self, href: &str) -> String {
        resolve_href(&self.base_url, href)
    }
}

fn resolve_href(base_url: &str, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() || Url::parse(href).is_ok() {
        return href.to_string();
    }
    match Url::parse(base_url).ok().and_then(|base| base.join(href).ok()) {
        Some(url) => url.to_string(),
        None => href.to_string(),
    }
}

#[derive(Debug)]
struct CompiledField {
    selector: Selector,
    nth: usize,
    attr: Option<String>,
}

fn compile(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl CompiledField {
    fn new(field: &FieldSelector) -> Result<Self, AdapterError> {
        Ok(Self {
            selector: compile(&field.css)?,
            nth: field.nth,
            attr: field.attr.clone(),
        })
    }

    fn read(&self, node: ElementRef<'_>) -> String {
        let Some(found) = node.select(&self.selector).nth(self.nth) else {
            return String::new();
        };
        match &self.attr {
            Some(attr) => found.value().attr(attr).unwrap_or_default().trim().to_string(),
            None => collapse_whitespace(&found.text().collect::<String>()),
        }
    }
}

/// CSS-selector backed [`Extractor`].
#[derive(Debug)]
pub struct SelectorExtractor {
    title: CompiledField,
    date: CompiledField,
    local: CompiledField,
    url: CompiledField,
}

impl SelectorExtractor {
    pub fn new(fields: &FieldSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            title: CompiledField::new(&fields.title)?,
            date: CompiledField::new(&fields.date)?,
            local: CompiledField::new(&fields.local)?,
            url: CompiledField::new(&fields.url)?,
        })
    }
}

impl Extractor for SelectorExtractor {
    fn title(&self, node: ElementRef<'_>) -> String {
        self.title.read(node)
    }

    fn date(&self, node: ElementRef<'_>) -> String {
        self.date.read(node)
    }

    fn local(&self, node: ElementRef<'_>) -> String {
        self.local.read(node)
    }

    fn url(&self, node: ElementRef<'_>) -> String {
        self.url.read(node)
    }
}

/// Generic crawler: owns a [`Fetcher`] and an injected [`Extractor`].
///
/// Parsing happens in plain functions over `&str` so no `Html` value is held
/// across an await point.
pub struct ListingCrawler {
    definition: SourceDefinition,
    fetcher: Fetcher,
    item: Selector,
    link: Option<CompiledField>,
    extractor: Box<dyn Extractor>,
}

impl ListingCrawler {
    pub fn new(definition: SourceDefinition, fetcher: Fetcher) -> Result<Self, AdapterError> {
        let extractor = SelectorExtractor::new(&definition.fields)?;
        Self::with_extractor(definition, fetcher, Box::new(extractor))
    }

    pub fn with_extractor(
        definition: SourceDefinition,
        fetcher: Fetcher,
        extractor: Box<dyn Extractor>,
    ) -> Result<Self, AdapterError> {
        let (item, link) = match &definition.mode {
            CrawlMode::Listing { item, .. } => (compile(item)?, None),
            CrawlMode::FollowLinks { item, link } => (compile(item)?, Some(CompiledField::new(link)?)),
        };
        Ok(Self {
            definition,
            fetcher,
            item,
            link,
            extractor,
        })
    }

    pub fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    /// Events from a listing page whose items carry every field.
    pub fn parse_listing(&self, html: &str, doc: &CachedDocument) -> CrawlOutput {
        let skip_leading = match &self.definition.mode {
            CrawlMode::Listing { skip_leading, .. } => *skip_leading,
            CrawlMode::FollowLinks { .. } => 0,
        };
        let document = Html::parse_document(html);
        let mut out = CrawlOutput {
            documents: 1,
            ..Default::default()
        };
        for (position, node) in document.select(&self.item).enumerate().skip(skip_leading) {
            self.push_event(node, doc, position, &mut out);
        }
        out
    }

    /// Distinct detail links found on a listing page, resolved against the base url.
    pub fn listing_links(&self, html: &str) -> Vec<String> {
        let Some(link) = &self.link else {
            return Vec::new();
        };
        let document = Html::parse_document(html);
        let mut links: Vec<String> = Vec::new();
        for node in document.select(&self.item) {
            let href = link.read(node);
            if href.is_empty() || links.contains(&href) {
                continue;
            }
            links.push(href);
        }
        links
    }

    /// One event from a detail page.
    pub fn parse_detail(&self, html: &str, doc: &CachedDocument) -> CrawlOutput {
        let document = Html::parse_document(html);
        let mut out = CrawlOutput {
            documents: 1,
            ..Default::default()
        };
        self.push_event(document.root_element(), doc, 0, &mut out);
        out
    }

    fn push_event(
        &self,
        node: ElementRef<'_>,
        doc: &CachedDocument,
        position: usize,
        out: &mut CrawlOutput,
    ) {
        let href = self.extractor.url(node);
        let url = if self.definition.resolve_urls {
            self.definition.resolve(&href)
        } else {
            href
        };
        let record = RawEventRecord {
            title: self.extractor.title(node),
            local: self.extractor.local(node),
            date: self.extractor.date(node),
            url,
            source: self.definition.source_id.clone(),
            crawled_at: doc.fetched_at,
            raw_file: raw_file_name(&doc.path),
        };
        match RawEvent::new(record) {
            Ok(event) => out.events.push(event),
            Err(err) => {
                out.skipped += 1;
                warn!(
                    source = %self.definition.source_id,
                    file = %doc.path.display(),
                    item = position,
                    reason = %err,
                    "skipping listing item"
                );
            }
        }
    }
}

fn raw_file_name(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[async_trait]
impl SourceAdapter for ListingCrawler {
    fn source_id(&self) -> &str {
        &self.definition.source_id
    }

    async fn crawl(&self) -> Result<CrawlOutput, AdapterError> {
        let encoding = self.definition.encoding.as_deref();
        let listing_url = self.definition.listing_url()?;
        let (doc, html) = self
            .fetcher
            .fetch_text(&listing_url, &self.definition.cache_key, encoding)
            .await?;

        let out = match &self.definition.mode {
            CrawlMode::Listing { .. } => self.parse_listing(&html, &doc),
            CrawlMode::FollowLinks { .. } => {
                let mut out = CrawlOutput {
                    documents: 1,
                    ..Default::default()
                };
                for href in self.listing_links(&html) {
                    let detail_url = self.definition.resolve(&href);
                    let (detail_doc, detail_html) = self
                        .fetcher
                        .fetch_text(&detail_url, &sanitize_cache_key(&href), encoding)
                        .await?;
                    out.absorb(self.parse_detail(&detail_html, &detail_doc));
                }
                out
            }
        };

        info!(
            source = %self.definition.source_id,
            events = out.events.len(),
            skipped = out.skipped,
            documents = out.documents,
            "crawl finished"
        );
        Ok(out)
    }
}

/// JSON pointers (RFC 6901) into one listing item.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JsonFields {
    pub title: String,
    pub date: String,
    pub local: String,
    pub url: String,
}

/// A listing served as JSON. With a `payload` the listing is POSTed,
/// otherwise fetched with GET.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JsonSourceDefinition {
    pub base_url: String,
    pub listing_path: String,
    pub cache_key: String,
    /// Pointer to the item array; empty means the document root.
    #[serde(default)]
    pub items: String,
    #[serde(default)]
    pub payload: Option<Value>,
    pub fields: JsonFields,
}

impl JsonSourceDefinition {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn listing_url(&self) -> Result<String, AdapterError> {
        let url = Url::parse(&self.base_url)
            .and_then(|base| base.join(&self.listing_path))
            .map_err(|_| AdapterError::BaseUrl(self.base_url.clone()))?;
        Ok(url.to_string())
    }
}

/// Scalars are stringified; anything else (or a missing pointer) reads as empty.
fn json_field(item: &Value, pointer: &str) -> String {
    match item.pointer(pointer) {
        Some(Value::String(s)) => collapse_whitespace(s),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
        _ => String::new(),
    }
}

pub struct JsonListingCrawler {
    source_id: String,
    definition: JsonSourceDefinition,
    fetcher: Fetcher,
}

impl JsonListingCrawler {
    pub fn new(source_id: &str, definition: JsonSourceDefinition, fetcher: Fetcher) -> Self {
        Self {
            source_id: source_id.to_string(),
            definition,
            fetcher,
        }
    }

    pub fn parse_items(&self, value: &Value, doc: &CachedDocument) -> CrawlOutput {
        let mut out = CrawlOutput {
            documents: 1,
            ..Default::default()
        };
        let Some(items) = value.pointer(&self.definition.items).and_then(Value::as_array) else {
            warn!(
                source = %self.source_id,
                file = %doc.path.display(),
                pointer = %self.definition.items,
                "listing has no item array"
            );
            return out;
        };
        let fields = &self.definition.fields;
        for (position, item) in items.iter().enumerate() {
            let record = RawEventRecord {
                title: json_field(item, &fields.title),
                local: json_field(item, &fields.local),
                date: json_field(item, &fields.date),
                url: resolve_href(&self.definition.base_url, &json_field(item, &fields.url)),
                source: self.source_id.clone(),
                crawled_at: doc.fetched_at,
                raw_file: raw_file_name(&doc.path),
            };
            match RawEvent::new(record) {
                Ok(event) => out.events.push(event),
                Err(err) => {
                    out.skipped += 1;
                    warn!(
                        source = %self.source_id,
                        file = %doc.path.display(),
                        item = position,
                        reason = %err,
                        "skipping listing item"
                    );
                }
            }
        }
        out
    }
}

#[async_trait]
impl SourceAdapter for JsonListingCrawler {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn crawl(&self) -> Result<CrawlOutput, AdapterError> {
        let listing_url = self.definition.listing_url()?;
        let (doc, value) = self
            .fetcher
            .fetch_json(
                &listing_url,
                &self.definition.cache_key,
                self.definition.payload.clone(),
            )
            .await?;
        let out = self.parse_items(&value, &doc);
        info!(
            source = %self.source_id,
            events = out.events.len(),
            skipped = out.skipped,
            documents = out.documents,
            "crawl finished"
        );
        Ok(out)
    }
}

/// Selector definitions for the sources this crate knows how to crawl.
pub fn builtin_definition(source_id: &str) -> Option<SourceDefinition> {
    let definition = match source_id {
        "tionline" => SourceDefinition {
            source_id: source_id.to_string(),
            base_url: "https://tionline.net.br".to_string(),
            listing_path: "/".to_string(),
            cache_key: "home.html".to_string(),
            encoding: None,
            mode: CrawlMode::Listing {
                item: "div.slider__footer".to_string(),
                skip_leading: 0,
            },
            fields: FieldSelectors {
                title: FieldSelector::text("div.title"),
                date: FieldSelector::text("div.hours"),
                local: FieldSelector::text("div.local"),
                url: FieldSelector::attr("a", "href"),
            },
            resolve_urls: false,
        },
        "activesports" => SourceDefinition {
            source_id: source_id.to_string(),
            base_url: "https://www.activesports.com.br".to_string(),
            listing_path: "/proximos-eventos".to_string(),
            cache_key: "proximos-eventos.html".to_string(),
            encoding: None,
            mode: CrawlMode::Listing {
                item: "div.content-course".to_string(),
                skip_leading: 0,
            },
            fields: FieldSelectors {
                title: FieldSelector::nth_text("a", 0),
                date: FieldSelector::nth_text("a", 2),
                local: FieldSelector::nth_text("a", 1),
                url: FieldSelector::nth_attr("a", 0, "href"),
            },
            resolve_urls: true,
        },
        "tourdopeixe" => SourceDefinition {
            source_id: source_id.to_string(),
            base_url: "https://tourdopeixe.com.br".to_string(),
            listing_path: "/calendario/".to_string(),
            cache_key: "calendario.html".to_string(),
            encoding: None,
            mode: CrawlMode::Listing {
                item: "table tr".to_string(),
                skip_leading: 1,
            },
            fields: FieldSelectors {
                title: FieldSelector::nth_text("td", 1),
                date: FieldSelector::nth_text("td", 0),
                local: FieldSelector::nth_text("td", 3),
                url: FieldSelector::attr("a", "href"),
            },
            resolve_urls: false,
        },
        "peloto" => SourceDefinition {
            source_id: source_id.to_string(),
            base_url: "https://peloto.com.br".to_string(),
            listing_path: "/".to_string(),
            cache_key: "home.html".to_string(),
            encoding: None,
            mode: CrawlMode::FollowLinks {
                item: "div.prox-eventos".to_string(),
                link: FieldSelector::attr("a", "href"),
            },
            fields: FieldSelectors {
                title: FieldSelector::text("div.row.red.darken-4.white-text.center h4"),
                date: FieldSelector::nth_text("div.row.red.darken-4.white-text.center h5", 1),
                local: FieldSelector::text("div.col.s12.m8.l8.white-text div.card h5"),
                url: FieldSelector::attr("a.btn-large", "href"),
            },
            resolve_urls: true,
        },
        _ => return None,
    };
    Some(definition)
}

pub fn adapter_for_definition(
    definition: SourceDefinition,
    fetcher: Fetcher,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    Ok(Box::new(ListingCrawler::new(definition, fetcher)?))
}

pub fn adapter_for_source(
    source_id: &str,
    fetcher: Fetcher,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    let definition = builtin_definition(source_id)
        .ok_or_else(|| AdapterError::UnknownSource(source_id.to_string()))?;
    adapter_for_definition(definition, fetcher)
}
