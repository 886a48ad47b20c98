use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::NaiveDateTime;
use flatwatch_core::{day_start, ListingId, Offer, Selection, SelectionId, SelectionParseError};
use serde::Serialize;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};
use thiserror::Error;
use tracing::debug;

static MIGRATOR: Migrator = sqlx::migrate!();

// 8 bound columns per row keeps each statement under SQLite's 999 parameter limit.
const INSERT_CHUNK: usize = 100;
const DELETE_CHUNK: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] MigrateError),
    #[error("creating database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Selection(#[from] SelectionParseError),
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct StoredOffer {
    pub record_id: i64,
    pub flat_id: ListingId,
    pub selection_id: Option<SelectionId>,
    pub area: Option<f64>,
    pub price: f64,
    pub floor: Option<i64>,
    pub scan_date: NaiveDateTime,
    pub insert_date: Option<NaiveDateTime>,
    pub renovation: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub inserted: u64,
    pub deleted: u64,
}

/// A stored selection row that could not be decoded.
#[derive(Debug)]
pub struct InvalidSelection {
    pub id: SelectionId,
    pub title: String,
    pub error: SelectionParseError,
}

#[derive(FromRow)]
struct SelectionRow {
    id: i64,
    title: String,
    kind: String,
    query: Option<String>,
}

/// Handle over the SQLite database holding selections and offer snapshots.
#[derive(Debug, Clone)]
pub struct OfferStore {
    pool: SqlitePool,
}

impl OfferStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database, migrated and ready to use.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // every connection to :memory: is its own database, so pin exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Loads every stored selection; the first row that does not decode fails
    /// the whole load.
    pub async fn load_selections(&self) -> Result<Vec<Selection>, StoreError> {
        self.load_selections_each()
            .await?
            .into_iter()
            .map(|entry| entry.map_err(|invalid| StoreError::Selection(invalid.error)))
            .collect()
    }

    /// Decodes each stored selection on its own, so one broken row does not
    /// hide the others.
    pub async fn load_selections_each(
        &self,
    ) -> Result<Vec<Result<Selection, InvalidSelection>>, StoreError> {
        let rows = sqlx::query_as::<_, SelectionRow>(
            "SELECT id, title, kind, query FROM selection ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let SelectionRow { id, title, kind, query } = row;
                Selection::from_columns(id, title.clone(), &kind, query.as_deref())
                    .map_err(|error| InvalidSelection { id, title, error })
            })
            .collect())
    }

    pub async fn upsert_selection(&self, selection: &Selection) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO selection (id, title, kind, query)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE
               SET title = excluded.title,
                   kind = excluded.kind,
                   query = excluded.query
            "#,
        )
        .bind(selection.id)
        .bind(&selection.title)
        .bind(selection.query.kind())
        .bind(selection.query.to_query_text())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts the run's offers and removes same-day rows superseded by them,
    /// all inside one transaction.
    ///
    /// A row is removed when its listing is among `offers`, it was scanned on
    /// the calendar day of `scan_at`, and strictly before `scan_at`. Rows of
    /// other days are never touched. On error nothing is committed.
    pub async fn reconcile(
        &self,
        offers: &[Offer],
        scan_at: NaiveDateTime,
    ) -> Result<ReconcileOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = insert_offers(&mut tx, offers).await?;

        let touched: BTreeSet<ListingId> = offers.iter().map(|o| o.flat_id).collect();
        let touched: Vec<ListingId> = touched.into_iter().collect();
        let deleted = delete_stale_same_day(&mut tx, &touched, scan_at).await?;

        tx.commit().await?;
        debug!(inserted, deleted, %scan_at, "reconciled offers");
        Ok(ReconcileOutcome { inserted, deleted })
    }

    pub async fn offers_for_listing(
        &self,
        flat_id: ListingId,
    ) -> Result<Vec<StoredOffer>, StoreError> {
        Ok(sqlx::query_as::<_, StoredOffer>(
            r#"
            SELECT record_id, flat_id, selection_id, area, price, floor,
                   scan_date, insert_date, renovation
              FROM offer
             WHERE flat_id = ?
             ORDER BY scan_date, record_id
            "#,
        )
        .bind(flat_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn count_offers(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM offer")
            .fetch_one(&self.pool)
            .await?)
    }
}

async fn insert_offers(
    tx: &mut Transaction<'_, Sqlite>,
    offers: &[Offer],
) -> Result<u64, StoreError> {
    let mut inserted = 0;
    for chunk in offers.chunks(INSERT_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO offer (flat_id, selection_id, area, price, floor, scan_date, insert_date, renovation) ",
        );
        qb.push_values(chunk, |mut row, offer| {
            row.push_bind(offer.flat_id)
                .push_bind(offer.selection_id)
                .push_bind(offer.area)
                .push_bind(offer.price)
                .push_bind(offer.floor)
                .push_bind(offer.scan_date)
                .push_bind(offer.insert_date)
                .push_bind(offer.renovation);
        });
        inserted += qb.build().execute(&mut **tx).await?.rows_affected();
    }
    Ok(inserted)
}

async fn delete_stale_same_day(
    tx: &mut Transaction<'_, Sqlite>,
    flat_ids: &[ListingId],
    scan_at: NaiveDateTime,
) -> Result<u64, StoreError> {
    let day_start = day_start(scan_at.date());
    let mut deleted = 0;
    for chunk in flat_ids.chunks(DELETE_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM offer WHERE scan_date >= ");
        qb.push_bind(day_start)
            .push(" AND scan_date < ")
            .push_bind(scan_at)
            .push(" AND flat_id IN (");
        let mut ids = qb.separated(", ");
        for id in chunk {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
        deleted += qb.build().execute(&mut **tx).await?.rows_affected();
    }
    Ok(deleted)
}
