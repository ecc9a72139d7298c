// src/store.rs
use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tracing::info;

use crate::error::StoreError;
use crate::parser::Fix;

const SQL_BY_NUMBER: &str = "select id::int8 from trackers.trackers \
     where num = $1 \
     and typeid = (select id from trackers.types where name = $2)";

const SQL_BY_PHONE: &str = "select id::int8 from trackers.trackers \
     where (sim = $1 or sim2 = $1) \
     and typeid = (select id from trackers.types where name = $2) \
     limit 1";

const SQL_LOGINSERT: &str = "select trackers.loginsert(\
     $1::integer, $2::timestamp, $3::double precision, $4::double precision, \
     $5::integer, $6::integer, $7::integer, $8::integer, $9::integer)";

/// Parameter row of `trackers.loginsert`.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRow {
    pub tracker_id: u32,
    pub datetime: String,
    pub lon: f64,
    pub lat: f64,
    pub speed: u32,
    pub odometer: u32,
    pub course: i32,
    pub sats_glonass: u32,
    pub sats_gps: u32,
}

impl LogRow {
    /// Speed and course are truncated to integers, as the procedure expects.
    pub fn new(tracker_id: u32, fix: &Fix) -> Self {
        Self {
            tracker_id,
            datetime: fix.datetime.clone(),
            lon: fix.lon,
            lat: fix.lat,
            speed: fix.speed as u32,
            odometer: fix.odometer,
            course: fix.course as i32,
            sats_glonass: fix.sats_glonass,
            sats_gps: fix.sats_gps,
        }
    }

    /// Fails instead of wrapping when a value does not fit `integer`.
    pub fn int_params(&self) -> Result<IntParams, StoreError> {
        Ok(IntParams {
            tracker_id: int4("tracker_id", self.tracker_id)?,
            speed: int4("speed", self.speed)?,
            odometer: int4("odometer", self.odometer)?,
            sats_glonass: int4("sats_glonass", self.sats_glonass)?,
            sats_gps: int4("sats_gps", self.sats_gps)?,
        })
    }
}

/// The unsigned columns of a [`LogRow`] as `integer` parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntParams {
    pub tracker_id: i32,
    pub speed: i32,
    pub odometer: i32,
    pub sats_glonass: i32,
    pub sats_gps: i32,
}

fn int4(field: &'static str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::IntRange { field, value })
}

/// What the persistence pipeline needs from the database.
#[async_trait]
pub trait Store: Send {
    async fn tracker_by_number(&mut self, num: &str, kind: &str) -> Result<Option<u32>, StoreError>;

    /// Primary or secondary SIM; first match wins.
    async fn tracker_by_phone(&mut self, phone: &str, kind: &str) -> Result<Option<u32>, StoreError>;

    async fn log_insert(&mut self, row: &LogRow) -> Result<(), StoreError>;
}

pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let conn = PgConnection::connect(url).await?;
        Ok(Self { conn })
    }
}

fn tracker_id(id: i64) -> Result<u32, StoreError> {
    u32::try_from(id).map_err(|_| StoreError::IdRange(id))
}

#[async_trait]
impl Store for PgStore {
    async fn tracker_by_number(&mut self, num: &str, kind: &str) -> Result<Option<u32>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar(SQL_BY_NUMBER)
            .bind(num)
            .bind(kind)
            .fetch_optional(&mut self.conn)
            .await?;
        id.map(tracker_id).transpose()
    }

    async fn tracker_by_phone(&mut self, phone: &str, kind: &str) -> Result<Option<u32>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar(SQL_BY_PHONE)
            .bind(phone)
            .bind(kind)
            .fetch_optional(&mut self.conn)
            .await?;
        id.map(tracker_id).transpose()
    }

    async fn log_insert(&mut self, row: &LogRow) -> Result<(), StoreError> {
        let p = row.int_params()?;
        sqlx::query(SQL_LOGINSERT)
            .bind(p.tracker_id)
            .bind(&row.datetime)
            .bind(row.lon)
            .bind(row.lat)
            .bind(p.speed)
            .bind(p.odometer)
            .bind(row.course)
            .bind(p.sats_glonass)
            .bind(p.sats_gps)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }
}

/// Fixed, ordered set of store connections. Writes are sharded by tracker id,
/// identity lookups always go to the first connection.
pub struct StorePool<S> {
    stores: Vec<S>,
}

impl<S: Store> StorePool<S> {
    pub fn new(stores: Vec<S>) -> Result<Self, StoreError> {
        if stores.is_empty() {
            return Err(StoreError::EmptyPool);
        }
        Ok(Self { stores })
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    #[inline]
    pub fn shard_for(&self, tracker_id: u32) -> usize {
        tracker_id as usize % self.stores.len()
    }

    pub fn shard_mut(&mut self, shard: usize) -> &mut S {
        &mut self.stores[shard]
    }

    pub fn primary_mut(&mut self) -> &mut S {
        &mut self.stores[0]
    }
}

impl StorePool<PgStore> {
    /// Opens every connection up front. Any failure aborts the whole pool.
    pub async fn connect(urls: &[String]) -> Result<Self, StoreError> {
        let mut stores = Vec::with_capacity(urls.len());
        for (shard, url) in urls.iter().enumerate() {
            let store = PgStore::connect(url)
                .await
                .map_err(|source| StoreError::Connect { shard, source })?;
            info!("store: connection #{shard} open");
            stores.push(store);
        }
        Self::new(stores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(tracker_id: u32, speed: f64) -> LogRow {
        let fix = Fix {
            speed,
            odometer: 12,
            sats_glonass: 7,
            sats_gps: 8,
            ..Default::default()
        };
        LogRow::new(tracker_id, &fix)
    }

    #[test]
    fn int_params_pass_values_that_fit() {
        let p = row(i32::MAX as u32, 60.9).int_params().unwrap();
        assert_eq!(p.tracker_id, i32::MAX);
        assert_eq!(p.speed, 60);
        assert_eq!(p.odometer, 12);
        assert_eq!((p.sats_glonass, p.sats_gps), (7, 8));
    }

    #[test]
    fn int_params_reject_instead_of_wrapping() {
        assert!(matches!(
            row(3_000_000_000, 60.0).int_params(),
            Err(StoreError::IntRange { field: "tracker_id", value: 3_000_000_000 })
        ));
        assert!(matches!(
            row(17, 3_000_000_000.0).int_params(),
            Err(StoreError::IntRange { field: "speed", value: 3_000_000_000 })
        ));
    }
}
