//! Listing source contracts and the flatfy.ua API client.

use std::collections::HashSet;

use async_trait::async_trait;
use flatwatch_core::{parse_upstream_timestamp, ListingId, RawListing, Selection, SelectionQuery};
use flatwatch_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "flatwatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
    #[error("invalid endpoint url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// GET-a-JSON-document seam between the adapter and the network.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError>;
}

#[async_trait]
impl JsonTransport for HttpFetcher {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        self.fetch_json(url).await
    }
}

/// Produces the complete current set of upstream listings for a selection.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_selection(&self, selection: &Selection) -> Result<Vec<RawListing>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct FlatfyConfig {
    pub base_url: String,
    pub currency: String,
    pub price_min: u64,
    pub section_id: u32,
    pub lang: String,
}

impl Default for FlatfyConfig {
    fn default() -> Self {
        Self {
            base_url: "https://flatfy.ua/api".to_string(),
            currency: "USD".to_string(),
            price_min: 20_000,
            section_id: 1,
            lang: "uk".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FlatfyRealty {
    id: ListingId,
    #[serde(default)]
    area_total: Option<f64>,
    price: f64,
    currency: String,
    #[serde(default)]
    floor: Option<i64>,
    #[serde(default)]
    insert_time: Option<String>,
}

/// Decodes the `data` array of a listings or batch response.
pub fn parse_listing_page(
    body: &JsonValue,
    url: &str,
    renovation: Option<bool>,
) -> Result<Vec<RawListing>, AdapterError> {
    let items = body
        .get("data")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Malformed {
            url: url.to_string(),
            reason: "missing `data` array".to_string(),
        })?;

    items
        .iter()
        .map(|item| {
            let realty = FlatfyRealty::deserialize(item).map_err(|e| AdapterError::Malformed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            Ok(RawListing {
                listing_id: realty.id,
                area: realty.area_total,
                price: realty.price,
                currency: realty.currency,
                floor: realty.floor,
                inserted_at: realty.insert_time.as_deref().and_then(parse_upstream_timestamp),
                renovation,
            })
        })
        .collect()
}

#[derive(Debug)]
pub struct FlatfyAdapter<T = HttpFetcher> {
    transport: T,
    config: FlatfyConfig,
}

impl<T: JsonTransport> FlatfyAdapter<T> {
    pub fn new(transport: T, config: FlatfyConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn endpoint(&self, path: &str) -> Result<Url, AdapterError> {
        let raw = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        Url::parse(&raw).map_err(|e| AdapterError::InvalidUrl {
            url: raw,
            reason: e.to_string(),
        })
    }

    /// One page of a query selection, restricted to renovated or non-renovated units.
    pub fn listing_url(&self, filter: &str, page: u32, renovation: bool) -> Result<String, AdapterError> {
        let mut url = self.endpoint("realties")?;
        let filter = filter.trim().trim_start_matches('?');
        if !filter.is_empty() {
            url.set_query(Some(filter));
        }
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("currency", &self.config.currency)
            .append_pair("price_min", &self.config.price_min.to_string())
            .append_pair("section_id", &self.config.section_id.to_string())
            .append_pair("lang", &self.config.lang)
            .append_pair("with_renovation", if renovation { "yes" } else { "no" });
        Ok(url.into())
    }

    pub fn batch_url(&self, listing_ids: &[ListingId]) -> Result<String, AdapterError> {
        let mut url = self.endpoint("realties/batch")?;
        {
            let mut pairs = url.query_pairs_mut();
            for id in listing_ids {
                pairs.append_pair("id", &id.to_string());
            }
        }
        Ok(url.into())
    }

    async fn fetch_page(
        &self,
        url: &str,
        renovation: Option<bool>,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let body = self.transport.get_json(url).await?;
        parse_listing_page(&body, url, renovation)
    }

    /// Walks pages until a round over both renovation sub-fetches adds no new
    /// listing. A listing seen twice keeps its first occurrence.
    async fn fetch_query(&self, filter: &str) -> Result<Vec<RawListing>, AdapterError> {
        let mut seen: HashSet<ListingId> = HashSet::new();
        let mut listings = Vec::new();
        let mut page = 1;

        loop {
            let before = listings.len();
            for renovation in [true, false] {
                let url = self.listing_url(filter, page, renovation)?;
                for listing in self.fetch_page(&url, Some(renovation)).await? {
                    if seen.insert(listing.listing_id) {
                        listings.push(listing);
                    }
                }
            }
            debug!(page, added = listings.len() - before, "page round complete");
            if listings.len() == before {
                break;
            }
            page += 1;
        }

        Ok(listings)
    }

    async fn fetch_favorites(&self, listing_ids: &[ListingId]) -> Result<Vec<RawListing>, AdapterError> {
        if listing_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.batch_url(listing_ids)?;
        self.fetch_page(&url, None).await
    }
}

impl FlatfyAdapter<HttpFetcher> {
    pub fn from_http(http: HttpFetcher, config: FlatfyConfig) -> Self {
        Self::new(http, config)
    }
}

#[async_trait]
impl<T: JsonTransport> ListingSource for FlatfyAdapter<T> {
    fn source_id(&self) -> &'static str {
        "flatfy"
    }

    async fn fetch_selection(&self, selection: &Selection) -> Result<Vec<RawListing>, AdapterError> {
        match &selection.query {
            SelectionQuery::Query { filter } => self.fetch_query(filter).await,
            SelectionQuery::Favorites { listing_ids } => self.fetch_favorites(listing_ids).await,
        }
    }
}
