//! Read-only aggregates consumed by the dashboard API.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate, NaiveDateTime};
use flatwatch_core::{
    day_bounds, day_start, ListingId, RecentStatsFilter, SelectionId, SizeBucket,
    STATS_PRICE_CEILING, STATS_PRICE_FLOOR,
};
use serde::Serialize;
use sqlx::{FromRow, QueryBuilder, Sqlite};

use crate::store::{OfferStore, StoreError};

/// Listing whose price moved between the previous day and `day`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChange {
    pub flat_id: ListingId,
    pub selection_id: Option<SelectionId>,
    pub title: Option<String>,
    pub prev: f64,
    pub now: f64,
    pub diff: f64,
    pub diff_pct: i64,
    pub sqm: Option<f64>,
    pub renovation: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewOffer {
    pub flat_id: ListingId,
    pub selection_id: Option<SelectionId>,
    pub title: Option<String>,
    pub price: f64,
    pub sqm: Option<f64>,
    pub scan_date: NaiveDateTime,
    pub insert_date: Option<NaiveDateTime>,
    pub renovation: Option<bool>,
}

/// Price quantiles for one calendar day and size bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStat {
    pub day: NaiveDate,
    pub bucket: SizeBucket,
    pub q20: f64,
    pub q50: f64,
    pub q80: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentStat {
    pub title: Option<String>,
    pub bucket: SizeBucket,
    /// Rounded average price per square meter.
    pub m2: Option<f64>,
    pub flats: usize,
}

/// Listing seen on the previous scan day but missing from `day`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelistedOffer {
    pub flat_id: ListingId,
    pub selection_id: Option<SelectionId>,
    pub title: Option<String>,
    pub last_price: f64,
    pub last_seen: NaiveDateTime,
    pub renovation: Option<bool>,
}

#[derive(Debug, Clone, FromRow)]
struct ReportRow {
    flat_id: i64,
    selection_id: Option<i64>,
    area: Option<f64>,
    price: f64,
    scan_date: NaiveDateTime,
    insert_date: Option<NaiveDateTime>,
    renovation: Option<bool>,
    title: Option<String>,
}

impl ReportRow {
    fn sqm(&self) -> Option<f64> {
        self.area
            .filter(|a| *a > 0.0)
            .map(|a| (self.price / a).round())
    }
}

const REPORT_COLUMNS: &str = r#"
    SELECT o.flat_id, o.selection_id, o.area, o.price, o.scan_date,
           o.insert_date, o.renovation, s.title
      FROM offer o
      LEFT JOIN selection s ON s.id = o.selection_id
"#;

/// Linear interpolation between closest ranks, as pandas computes it.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

fn previous_day(day: NaiveDate) -> NaiveDate {
    day.checked_sub_days(Days::new(1)).unwrap_or(day)
}

impl OfferStore {
    async fn rows_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<ReportRow>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(REPORT_COLUMNS);
        qb.push(" WHERE o.scan_date >= ")
            .push_bind(start)
            .push(" AND o.scan_date < ")
            .push_bind(end)
            .push(" ORDER BY o.flat_id, o.scan_date, o.record_id");
        Ok(qb.build_query_as::<ReportRow>().fetch_all(self.pool()).await?)
    }

    async fn latest_scan(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        Ok(
            sqlx::query_scalar::<_, Option<NaiveDateTime>>("SELECT MAX(scan_date) FROM offer")
                .fetch_one(self.pool())
                .await?,
        )
    }

    async fn latest_scan_before(
        &self,
        before: NaiveDateTime,
    ) -> Result<Option<NaiveDateTime>, StoreError> {
        Ok(
            sqlx::query_scalar::<_, Option<NaiveDateTime>>(
                "SELECT MAX(scan_date) FROM offer WHERE scan_date < ?",
            )
            .bind(before)
            .fetch_one(self.pool())
            .await?,
        )
    }

    /// Day-over-day price changes: today's earliest row against yesterday's
    /// latest row, one entry per listing whose price differs.
    pub async fn discounts(&self, day: NaiveDate) -> Result<Vec<PriceChange>, StoreError> {
        let (_, end) = day_bounds(day);
        let today_start = day_start(day);
        let rows = self.rows_between(day_start(previous_day(day)), end).await?;

        let mut yesterday: BTreeMap<ListingId, ReportRow> = BTreeMap::new();
        let mut today: BTreeMap<ListingId, ReportRow> = BTreeMap::new();
        for row in rows {
            if row.scan_date < today_start {
                // ordered by scan_date, so the last write is the latest row
                yesterday.insert(row.flat_id, row);
            } else {
                today.entry(row.flat_id).or_insert(row);
            }
        }

        Ok(today
            .into_values()
            .filter_map(|now| {
                let prev = yesterday.get(&now.flat_id)?;
                if prev.price == now.price || prev.price <= 0.0 {
                    return None;
                }
                Some(PriceChange {
                    flat_id: now.flat_id,
                    selection_id: now.selection_id,
                    title: now.title.clone(),
                    prev: prev.price,
                    now: now.price,
                    diff: now.price - prev.price,
                    diff_pct: ((now.price / prev.price - 1.0) * 100.0).round() as i64,
                    sqm: now.sqm(),
                    renovation: now.renovation,
                })
            })
            .collect())
    }

    /// Listings first published upstream since the day before `day`, newest
    /// first, one entry per listing taken from its latest scan.
    pub async fn new_offers(&self, day: NaiveDate) -> Result<Vec<NewOffer>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(REPORT_COLUMNS);
        qb.push(" WHERE o.insert_date IS NOT NULL AND o.insert_date >= ")
            .push_bind(day_start(previous_day(day)))
            .push(" ORDER BY o.flat_id, o.scan_date, o.record_id");
        let rows = qb.build_query_as::<ReportRow>().fetch_all(self.pool()).await?;

        let mut latest: BTreeMap<ListingId, ReportRow> = BTreeMap::new();
        for row in rows {
            latest.insert(row.flat_id, row);
        }

        let mut offers: Vec<NewOffer> = latest
            .into_values()
            .map(|row| NewOffer {
                sqm: row.sqm(),
                flat_id: row.flat_id,
                selection_id: row.selection_id,
                title: row.title,
                price: row.price.round(),
                scan_date: row.scan_date,
                insert_date: row.insert_date,
                renovation: row.renovation,
            })
            .collect();
        offers.sort_by(|a, b| b.insert_date.cmp(&a.insert_date).then(a.flat_id.cmp(&b.flat_id)));
        Ok(offers)
    }

    /// 20/50/80 % price quantiles per calendar day and size bucket.
    pub async fn daily_stats(&self) -> Result<Vec<DailyStat>, StoreError> {
        let rows = sqlx::query_as::<_, (NaiveDateTime, Option<f64>, f64)>(
            "SELECT scan_date, area, price FROM offer WHERE price > ? AND price < ?",
        )
        .bind(STATS_PRICE_FLOOR)
        .bind(STATS_PRICE_CEILING)
        .fetch_all(self.pool())
        .await?;

        let mut groups: BTreeMap<(NaiveDate, SizeBucket), Vec<f64>> = BTreeMap::new();
        for (scan_date, area, price) in rows {
            groups
                .entry((scan_date.date(), SizeBucket::from_area(area)))
                .or_default()
                .push(price);
        }

        Ok(groups
            .into_iter()
            .filter_map(|((day, bucket), mut prices)| {
                prices.sort_by(f64::total_cmp);
                Some(DailyStat {
                    day,
                    bucket,
                    q20: quantile(&prices, 0.2)?,
                    q50: quantile(&prices, 0.5)?,
                    q80: quantile(&prices, 0.8)?,
                    count: prices.len(),
                })
            })
            .collect())
    }

    /// Average price per m² by selection and size bucket over the latest scan day.
    pub async fn recent_stats(
        &self,
        filter: RecentStatsFilter,
    ) -> Result<Vec<RecentStat>, StoreError> {
        let Some(latest) = self.latest_scan().await? else {
            return Ok(Vec::new());
        };
        let latest_day = latest.date();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(REPORT_COLUMNS);
        qb.push(" WHERE o.scan_date >= ")
            .push_bind(day_start(latest_day))
            .push(" AND o.price > ")
            .push_bind(STATS_PRICE_FLOOR)
            .push(" AND o.price < ")
            .push_bind(STATS_PRICE_CEILING);
        if let Some(renovation) = filter.renovation {
            qb.push(" AND o.renovation = ").push_bind(renovation);
        }
        if let Some(days) = filter.last_days {
            let since = latest_day
                .checked_sub_days(Days::new(u64::from(days.get())))
                .unwrap_or(NaiveDate::MIN);
            qb.push(" AND o.insert_date >= ").push_bind(day_start(since));
        }
        let rows = qb.build_query_as::<ReportRow>().fetch_all(self.pool()).await?;

        // (sum of price per m², rows with area, all rows)
        let mut groups: BTreeMap<(Option<String>, SizeBucket), (f64, usize, usize)> =
            BTreeMap::new();
        for row in rows {
            let per_m2 = row.area.filter(|a| *a > 0.0).map(|a| row.price / a);
            let acc = groups
                .entry((row.title, SizeBucket::from_area(row.area)))
                .or_default();
            if let Some(v) = per_m2 {
                acc.0 += v;
                acc.1 += 1;
            }
            acc.2 += 1;
        }

        Ok(groups
            .into_iter()
            .map(|((title, bucket), (sum, with_area, flats))| RecentStat {
                title,
                bucket,
                m2: (with_area > 0).then(|| (sum / with_area as f64).round()),
                flats,
            })
            .collect())
    }

    /// Listings present on the last scan day before `day` that no scan on
    /// `day` returned, limited to selections that were scanned on `day`.
    pub async fn delisted(&self, day: NaiveDate) -> Result<Vec<DelistedOffer>, StoreError> {
        let (start, end) = day_bounds(day);
        let Some(previous) = self.latest_scan_before(start).await? else {
            return Ok(Vec::new());
        };
        let (prev_start, prev_end) = day_bounds(previous.date());

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(REPORT_COLUMNS);
        qb.push(" WHERE o.scan_date >= ")
            .push_bind(prev_start)
            .push(" AND o.scan_date < ")
            .push_bind(prev_end)
            .push(" AND o.selection_id IN (SELECT selection_id FROM offer WHERE scan_date >= ")
            .push_bind(start)
            .push(" AND scan_date < ")
            .push_bind(end)
            .push(") AND o.flat_id NOT IN (SELECT flat_id FROM offer WHERE scan_date >= ")
            .push_bind(start)
            .push(" AND scan_date < ")
            .push_bind(end)
            .push(") ORDER BY o.flat_id, o.scan_date, o.record_id");
        let rows = qb.build_query_as::<ReportRow>().fetch_all(self.pool()).await?;

        let mut last: BTreeMap<ListingId, DelistedOffer> = BTreeMap::new();
        for row in rows {
            let entry = DelistedOffer {
                flat_id: row.flat_id,
                selection_id: row.selection_id,
                title: row.title,
                last_price: row.price,
                last_seen: row.scan_date,
                renovation: row.renovation,
            };
            last.insert(row.flat_id, entry);
        }
        Ok(last.into_values().collect())
    }
}
