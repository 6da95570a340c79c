//! Forecast store: one row per (sign, day), uniqueness owned by the database.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use horoscopo_core::{DailyForecast, ForecastContent, ZodiacSign};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "horoscopo-store";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The unique (sign, day) constraint rejected the batch. The whole
    /// batch is discarded; no per-row peel-off is attempted.
    #[error("unique constraint rejected the forecast batch")]
    Duplicate,
    #[error("unknown sign label in store: {0}")]
    UnknownSign(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Persistence seam for the generation job. Implementations must make
/// `insert_batch` all-or-nothing with respect to the uniqueness invariant.
#[async_trait]
pub trait ForecastStore: Send + Sync {
    /// Signs that already have a forecast for the day. Read-only.
    async fn signs_for_day(&self, day: NaiveDate) -> Result<HashSet<ZodiacSign>, StoreError>;

    /// Single multi-row insert. Returns the number of rows written.
    /// An empty batch writes nothing and returns 0.
    async fn insert_batch(&self, forecasts: &[DailyForecast]) -> Result<usize, StoreError>;

    async fn get(&self, sign: ZodiacSign, day: NaiveDate)
        -> Result<Option<DailyForecast>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgForecastStore {
    pool: PgPool,
}

impl PgForecastStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl ForecastStore for PgForecastStore {
    async fn signs_for_day(&self, day: NaiveDate) -> Result<HashSet<ZodiacSign>, StoreError> {
        let rows = sqlx::query("SELECT sign FROM daily_forecasts WHERE day = $1")
            .bind(day)
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let label: String = row.try_get("sign")?;
            let sign = ZodiacSign::from_label(&label)
                .ok_or_else(|| StoreError::UnknownSign(label))?;
            out.insert(sign);
        }
        Ok(out)
    }

    async fn insert_batch(&self, forecasts: &[DailyForecast]) -> Result<usize, StoreError> {
        if forecasts.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO daily_forecasts \
             (sign, day, summary, love, career, wellness, lucky_number, color_of_day) ",
        );
        builder.push_values(forecasts, |mut b, f| {
            b.push_bind(f.sign.label())
                .push_bind(f.day)
                .push_bind(&f.content.summary)
                .push_bind(&f.content.love)
                .push_bind(&f.content.career)
                .push_bind(&f.content.wellness)
                .push_bind(f.content.lucky_number)
                .push_bind(&f.content.color_of_day);
        });

        let result = builder.build().execute(&self.pool).await.map_err(|err| {
            if let sqlx::Error::Database(db_err) = &err {
                if db_err.is_unique_violation() {
                    return StoreError::Duplicate;
                }
            }
            StoreError::Database(err)
        })?;

        debug!(rows = result.rows_affected(), "persisted forecast batch");
        Ok(result.rows_affected() as usize)
    }

    async fn get(
        &self,
        sign: ZodiacSign,
        day: NaiveDate,
    ) -> Result<Option<DailyForecast>, StoreError> {
        let row = sqlx::query(
            "SELECT summary, love, career, wellness, lucky_number, color_of_day \
             FROM daily_forecasts WHERE sign = $1 AND day = $2",
        )
        .bind(sign.label())
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DailyForecast::new(
            sign,
            day,
            ForecastContent {
                summary: row.try_get("summary")?,
                love: row.try_get("love")?,
                career: row.try_get("career")?,
                wellness: row.try_get("wellness")?,
                lucky_number: row.try_get("lucky_number")?,
                color_of_day: row.try_get("color_of_day")?,
            },
        )))
    }
}

/// In-memory store with the same all-or-nothing uniqueness semantics as
/// Postgres. Backs tests and DB-less local runs.
#[derive(Debug, Default)]
pub struct MemoryForecastStore {
    rows: Mutex<BTreeMap<(ZodiacSign, NaiveDate), DailyForecast>>,
}

impl MemoryForecastStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl ForecastStore for MemoryForecastStore {
    async fn signs_for_day(&self, day: NaiveDate) -> Result<HashSet<ZodiacSign>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .keys()
            .filter(|(_, d)| *d == day)
            .map(|(sign, _)| *sign)
            .collect())
    }

    async fn insert_batch(&self, forecasts: &[DailyForecast]) -> Result<usize, StoreError> {
        if forecasts.is_empty() {
            return Ok(0);
        }

        // Lock held across check + write: the whole batch is rejected if
        // any key collides, matching the database constraint behavior.
        let mut rows = self.rows.lock().await;
        let mut incoming = HashSet::with_capacity(forecasts.len());
        for f in forecasts {
            let key = (f.sign, f.day);
            if rows.contains_key(&key) || !incoming.insert(key) {
                return Err(StoreError::Duplicate);
            }
        }
        for f in forecasts {
            rows.insert((f.sign, f.day), f.clone());
        }
        Ok(forecasts.len())
    }

    async fn get(
        &self,
        sign: ZodiacSign,
        day: NaiveDate,
    ) -> Result<Option<DailyForecast>, StoreError> {
        Ok(self.rows.lock().await.get(&(sign, day)).cloned())
    }
}
