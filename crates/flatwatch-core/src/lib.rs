//! Core domain model for flatwatch: selections, listing snapshots, currency
//! normalization and size buckets.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "flatwatch-core";

/// Upstream listing identifier, stable across scans.
pub type ListingId = i64;
pub type SelectionId = i64;

/// Lower price bound (exclusive) used by the statistics reports.
pub const STATS_PRICE_FLOOR: f64 = 12_000.0;
/// Upper price bound (exclusive) used by the statistics reports.
pub const STATS_PRICE_CEILING: f64 = 10_000_000.0;

/// What a selection asks the upstream API for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionQuery {
    /// Raw, already URL-encoded filter string appended to the listings endpoint.
    Query { filter: String },
    /// Explicit listing ids fetched through the batch endpoint.
    Favorites { listing_ids: Vec<ListingId> },
}

impl SelectionQuery {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::Favorites { .. } => "favorites",
        }
    }

    /// Text stored in the `selection.query` column.
    pub fn to_query_text(&self) -> String {
        match self {
            Self::Query { filter } => filter.clone(),
            Self::Favorites { listing_ids } => {
                serde_json::to_string(listing_ids).unwrap_or_else(|_| "[]".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub id: SelectionId,
    pub title: String,
    #[serde(flatten)]
    pub query: SelectionQuery,
}

#[derive(Debug, Error)]
pub enum SelectionParseError {
    #[error("selection {id}: unknown kind `{kind}`")]
    UnknownKind { id: SelectionId, kind: String },
    #[error("selection {id}: favorites list is not valid JSON")]
    Favorites {
        id: SelectionId,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FavoriteEntry {
    Id(ListingId),
    Object { realty_id: ListingId },
}

impl Selection {
    /// Rebuilds a selection from its persisted columns.
    pub fn from_columns(
        id: SelectionId,
        title: String,
        kind: &str,
        query: Option<&str>,
    ) -> Result<Self, SelectionParseError> {
        let query = match kind {
            "query" => SelectionQuery::Query {
                filter: query.unwrap_or_default().trim().to_string(),
            },
            "favorites" => {
                let text = query.map(str::trim).filter(|q| !q.is_empty()).unwrap_or("[]");
                let entries: Vec<FavoriteEntry> = serde_json::from_str(text)
                    .map_err(|source| SelectionParseError::Favorites { id, source })?;
                SelectionQuery::Favorites {
                    listing_ids: entries
                        .into_iter()
                        .map(|entry| match entry {
                            FavoriteEntry::Id(id) => id,
                            FavoriteEntry::Object { realty_id } => realty_id,
                        })
                        .collect(),
                }
            }
            other => {
                return Err(SelectionParseError::UnknownKind {
                    id,
                    kind: other.to_string(),
                })
            }
        };
        Ok(Self { id, title, query })
    }
}

/// A listing as returned by the upstream API, before currency normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub listing_id: ListingId,
    pub area: Option<f64>,
    pub price: f64,
    pub currency: String,
    pub floor: Option<i64>,
    pub inserted_at: Option<NaiveDateTime>,
    /// `None` for favorites, which are fetched without a renovation split.
    pub renovation: Option<bool>,
}

/// One persisted observation of a listing at a scan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub flat_id: ListingId,
    pub selection_id: Option<SelectionId>,
    pub area: Option<f64>,
    /// Price in the reference currency (USD).
    pub price: f64,
    pub floor: Option<i64>,
    pub scan_date: NaiveDateTime,
    pub insert_date: Option<NaiveDateTime>,
    pub renovation: Option<bool>,
}

impl Offer {
    pub fn from_listing(
        listing: &RawListing,
        selection_id: SelectionId,
        scan_date: NaiveDateTime,
        rates: &RateTable,
    ) -> Result<Self, UnknownCurrency> {
        Ok(Self {
            flat_id: listing.listing_id,
            selection_id: Some(selection_id),
            area: listing.area,
            price: rates.normalize(listing.price, &listing.currency)?,
            floor: listing.floor,
            scan_date,
            insert_date: listing.inserted_at,
            renovation: listing.renovation,
        })
    }

    pub fn price_per_sqm(&self) -> Option<f64> {
        self.area.filter(|a| *a > 0.0).map(|a| self.price / a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown currency code `{0}`")]
pub struct UnknownCurrency(pub String);

/// Static per-unit conversion rates into the reference currency.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    rates: BTreeMap<String, f64>,
}

impl Default for RateTable {
    fn default() -> Self {
        Self::from_pairs([("UAH", 39.1), ("USD", 1.0), ("EUR", 39.8)])
    }
}

impl RateTable {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        Self {
            rates: pairs
                .into_iter()
                .map(|(code, rate)| (code.to_string(), rate))
                .collect(),
        }
    }

    pub fn rate(&self, code: &str) -> Option<f64> {
        self.rates.get(code).copied()
    }

    pub fn normalize(&self, price: f64, code: &str) -> Result<f64, UnknownCurrency> {
        self.rate(code)
            .map(|rate| price / rate)
            .ok_or_else(|| UnknownCurrency(code.to_string()))
    }
}

/// Floor-area classification used by every statistics report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SizeBucket {
    S,
    M,
    L,
    XL,
}

impl SizeBucket {
    /// Listings without an area land in `XL`.
    pub fn from_area(area: Option<f64>) -> Self {
        match area {
            Some(a) if a < 45.0 => Self::S,
            Some(a) if a < 65.0 => Self::M,
            Some(a) if a < 85.0 => Self::L,
            _ => Self::XL,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::S => "S",
            Self::M => "M",
            Self::L => "L",
            Self::XL => "XL",
        }
    }
}

impl fmt::Display for SizeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicates accepted by the recent statistics report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentStatsFilter {
    pub renovation: Option<bool>,
    pub last_days: Option<NonZeroU32>,
}

pub fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Half-open `[start, end)` range covering one calendar day.
pub fn day_bounds(date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = day_start(date);
    let end = date
        .succ_opt()
        .map(day_start)
        .unwrap_or(NaiveDateTime::MAX);
    (start, end)
}

/// Parses the upstream `insert_time` field. Offsets are dropped, keeping the
/// wall-clock time as sent.
pub fn parse_upstream_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .map(day_start)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn uah_price_normalizes_to_usd() {
        let rates = RateTable::default();
        assert_eq!(rates.normalize(3910.0, "UAH").unwrap(), 100.0);
        assert_eq!(rates.normalize(55_000.0, "USD").unwrap(), 55_000.0);
    }

    #[test]
    fn unknown_currency_is_an_error() {
        let rates = RateTable::default();
        assert_eq!(
            rates.normalize(100.0, "XYZ"),
            Err(UnknownCurrency("XYZ".to_string()))
        );
    }

    #[test]
    fn offer_from_listing_with_unknown_currency_fails() {
        let listing = RawListing {
            listing_id: 7,
            area: Some(50.0),
            price: 1000.0,
            currency: "XYZ".into(),
            floor: Some(3),
            inserted_at: None,
            renovation: Some(true),
        };
        let err = Offer::from_listing(&listing, 1, ts("2026-10-18 09:00:00"), &RateTable::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown currency code `XYZ`");
    }

    #[test]
    fn favorites_accept_plain_and_legacy_entries() {
        let plain = Selection::from_columns(5, "fav".into(), "favorites", Some("[1, 2]")).unwrap();
        assert_eq!(
            plain.query,
            SelectionQuery::Favorites { listing_ids: vec![1, 2] }
        );

        let legacy = Selection::from_columns(
            0,
            "fav".into(),
            "favorites",
            Some(r#"[{"realty_id": 11}, {"realty_id": 12}]"#),
        )
        .unwrap();
        assert_eq!(
            legacy.query,
            SelectionQuery::Favorites { listing_ids: vec![11, 12] }
        );
        assert_eq!(legacy.query.to_query_text(), "[11,12]");
    }

    #[test]
    fn broken_favorites_json_keeps_serde_error_as_source() {
        use std::error::Error as _;

        let err = Selection::from_columns(2, "bad".into(), "favorites", Some("not json")).unwrap_err();
        assert_eq!(err.to_string(), "selection 2: favorites list is not valid JSON");
        assert!(err.source().is_some());
    }

    #[test]
    fn unknown_selection_kind_is_rejected() {
        let err = Selection::from_columns(3, "x".into(), "search", Some("a=b")).unwrap_err();
        assert!(matches!(err, SelectionParseError::UnknownKind { id: 3, .. }));
    }

    #[test]
    fn size_buckets_follow_area_thresholds() {
        assert_eq!(SizeBucket::from_area(Some(44.9)), SizeBucket::S);
        assert_eq!(SizeBucket::from_area(Some(45.0)), SizeBucket::M);
        assert_eq!(SizeBucket::from_area(Some(65.0)), SizeBucket::L);
        assert_eq!(SizeBucket::from_area(Some(85.0)), SizeBucket::XL);
        assert_eq!(SizeBucket::from_area(None), SizeBucket::XL);
    }

    #[test]
    fn upstream_timestamps_in_several_shapes() {
        assert_eq!(
            parse_upstream_timestamp("2026-10-17T08:30:00"),
            Some(ts("2026-10-17 08:30:00"))
        );
        assert_eq!(
            parse_upstream_timestamp("2026-10-17 08:30:00"),
            Some(ts("2026-10-17 08:30:00"))
        );
        assert_eq!(
            parse_upstream_timestamp("2026-10-17T08:30:00+03:00"),
            Some(ts("2026-10-17 08:30:00"))
        );
        assert_eq!(parse_upstream_timestamp(""), None);
        assert_eq!(parse_upstream_timestamp("yesterday"), None);
    }

    #[test]
    fn day_bounds_are_half_open() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let (start, end) = day_bounds(date);
        assert_eq!(start, ts("2026-10-18 00:00:00"));
        assert_eq!(end, ts("2026-10-19 00:00:00"));
    }
}
