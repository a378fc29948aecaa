//! Storage seam for the ingestion pipeline and the broadcaster.
//!
//! - Synchronous diesel calls; async callers go through `tokio::task::spawn_blocking`.
//! - `PgStore` pools connections with r2d2 and runs every ingestion write as one
//!   read-committed transaction with a statement timeout.

use crate::config::DatabaseSettings;
use crate::db::models::{
    Device, LatestValueRow, Measurement, NewDeviceData, NewDeviceLatestData, NewMeasurement, NewRawLog,
};
use crate::models::telemetry::{DepartmentId, DeviceHierarchy, DeviceId, MeasurementInfo, OrganizationId};
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::upsert::excluded;
use diesel::PgConnection;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Connection loss, lock contention, deadlock, timeouts. Worth retrying as-is.
    Transient(String),
    /// A row referenced a measurement id the table no longer has. Fatal unless the id came from
    /// the process cache, in which case a fresh lookup may resolve it.
    StaleReference(String),
    /// Constraint violations, unresolved dimension rows and anything else that would fail again.
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Transient(s) => write!(f, "transient store error: {}", s),
            StoreError::StaleReference(s) => write!(f, "stale measurement reference: {}", s),
            StoreError::Fatal(s) => write!(f, "store error: {}", s),
        }
    }
}

impl Error for StoreError {}

/// Message fragments PostgreSQL and libpq use for failures that clear up on their own.
const TRANSIENT_MARKERS: [&str; 10] = [
    "deadlock",
    "lock timeout",
    "could not obtain lock",
    "canceling statement due to statement timeout",
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "server closed the connection",
    "terminating connection",
];

pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Foreign keys on `measurement_id` are named `<table>_measurement_id_fkey`.
pub fn references_measurement(constraint: Option<&str>, message: &str) -> bool {
    constraint.is_some_and(|c| c.contains("measurement_id")) || message.contains("measurement_id")
}

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error as DieselError};

        let transient = match &value {
            DieselError::DatabaseError(
                DatabaseErrorKind::SerializationFailure | DatabaseErrorKind::ClosedConnection,
                _,
            ) => true,
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info)
                if references_measurement(info.constraint_name(), info.message()) =>
            {
                return StoreError::StaleReference(value.to_string());
            }
            DieselError::DatabaseError(
                DatabaseErrorKind::UniqueViolation
                | DatabaseErrorKind::ForeignKeyViolation
                | DatabaseErrorKind::NotNullViolation
                | DatabaseErrorKind::CheckViolation,
                _,
            ) => false,
            DieselError::DatabaseError(_, info) => is_transient_message(info.message()),
            DieselError::BrokenTransactionManager => true,
            other => is_transient_message(&other.to_string()),
        };
        if transient {
            StoreError::Transient(value.to_string())
        } else {
            StoreError::Fatal(value.to_string())
        }
    }
}

impl From<diesel::r2d2::PoolError> for StoreError {
    fn from(value: diesel::r2d2::PoolError) -> Self {
        StoreError::Transient(format!("connection pool: {}", value))
    }
}

/// What a committed ingestion transaction wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    /// name -> measurement, resolved inside the transaction.
    pub measurements: BTreeMap<String, MeasurementInfo>,
    pub history_ids: Vec<i64>,
    pub latest_rows: usize,
}

/// Operations available inside one ingestion transaction.
pub trait StoreTx {
    fn find_measurement(&mut self, name: &str) -> Result<Option<Measurement>, StoreError>;
    /// Idempotent by name: concurrent creators all end up with the same row.
    fn create_measurement(&mut self, new: &NewMeasurement) -> Result<Measurement, StoreError>;
    /// Returns ids of the rows actually inserted (existing (device, measurement, timestamp) rows are kept).
    fn insert_history(&mut self, rows: &[NewDeviceData]) -> Result<Vec<i64>, StoreError>;
    /// Rows older than the stored value for their (device, measurement) are skipped; returns the
    /// number of rows written.
    fn upsert_latest(&mut self, rows: &[NewDeviceLatestData]) -> Result<usize, StoreError>;
}

pub type TxBody<'a> = &'a mut dyn FnMut(&mut dyn StoreTx) -> Result<WriteOutcome, StoreError>;

pub trait TelemetryStore: Send + Sync {
    fn load_active_devices(&self) -> Result<Vec<Device>, StoreError>;
    fn load_measurements(&self) -> Result<Vec<Measurement>, StoreError>;
    fn load_latest_values(&self) -> Result<Vec<LatestValueRow>, StoreError>;
    fn append_raw_log(&self, row: &NewRawLog) -> Result<i64, StoreError>;
    fn touch_last_connected(&self, device_id: DeviceId, at: DateTime<Utc>) -> Result<(), StoreError>;
    /// Runs `body` atomically: either everything it wrote commits or nothing does.
    fn run_transaction(&self, body: TxBody<'_>) -> Result<WriteOutcome, StoreError>;
}

pub trait HierarchySource: Send + Sync {
    /// `None` for unknown or inactive devices.
    fn fetch_hierarchy(&self, device_id: DeviceId) -> Result<Option<DeviceHierarchy>, StoreError>;
}

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

pub struct PgStore {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgStore {
    pub fn connect(settings: &DatabaseSettings) -> Result<Self, String> {
        let manager = ConnectionManager::<PgConnection>::new(settings.url.clone());
        let pool = Pool::builder()
            .max_size(settings.pool_size)
            .connection_timeout(settings.acquire_timeout)
            .build(manager)
            .map_err(|e| format!("DB pool setup failed: {}", e))?;
        Ok(PgStore {
            pool,
            statement_timeout: settings.statement_timeout,
        })
    }

    pub fn connection(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        Ok(self.pool.get()?)
    }
}

impl TelemetryStore for PgStore {
    fn load_active_devices(&self) -> Result<Vec<Device>, StoreError> {
        use schema::devices::dsl as D;

        let mut conn = self.connection()?;
        Ok(D::devices
            .filter(D::is_active.eq(true))
            .order(D::id.asc())
            .select(Device::as_select())
            .load(&mut conn)?)
    }

    fn load_measurements(&self) -> Result<Vec<Measurement>, StoreError> {
        use schema::measurements::dsl as M;

        let mut conn = self.connection()?;
        Ok(M::measurements.select(Measurement::as_select()).load(&mut conn)?)
    }

    fn load_latest_values(&self) -> Result<Vec<LatestValueRow>, StoreError> {
        use schema::device_latest_data::dsl as L;
        use schema::measurements::dsl as M;

        let mut conn = self.connection()?;
        Ok(L::device_latest_data
            .inner_join(M::measurements)
            .select((L::device_id, M::name, M::data_type, L::value, L::timestamp))
            .load::<LatestValueRow>(&mut conn)?)
    }

    fn append_raw_log(&self, row: &NewRawLog) -> Result<i64, StoreError> {
        use schema::device_raw_logs::dsl as R;

        let mut conn = self.connection()?;
        Ok(diesel::insert_into(R::device_raw_logs)
            .values(row)
            .returning(R::id)
            .get_result(&mut conn)?)
    }

    fn touch_last_connected(&self, device_id: DeviceId, at: DateTime<Utc>) -> Result<(), StoreError> {
        use schema::devices::dsl as D;

        let mut conn = self.connection()?;
        diesel::update(D::devices.filter(D::id.eq(device_id.0)))
            .set(D::last_connected.eq(at))
            .execute(&mut conn)?;
        Ok(())
    }

    fn run_transaction(&self, body: TxBody<'_>) -> Result<WriteOutcome, StoreError> {
        let mut conn = self.connection()?;
        let timeout_ms = self.statement_timeout.as_millis();
        conn.build_transaction().read_committed().run(|conn| {
            diesel::sql_query(format!("SET LOCAL statement_timeout = {}", timeout_ms)).execute(conn)?;
            body(&mut PgTx { conn })
        })
    }
}

impl HierarchySource for PgStore {
    fn fetch_hierarchy(&self, device_id: DeviceId) -> Result<Option<DeviceHierarchy>, StoreError> {
        use schema::devices::dsl as D;

        let mut conn = self.connection()?;
        let row = D::devices
            .filter(D::id.eq(device_id.0).and(D::is_active.eq(true)))
            .select((D::organization_id, D::department_id, D::name, D::serial_number))
            .first::<(i64, Option<i64>, Option<String>, String)>(&mut conn)
            .optional()?;

        Ok(row.map(|(org, dept, name, serial)| DeviceHierarchy {
            organization_id: Some(OrganizationId(org)),
            department_id: dept.map(DepartmentId),
            display_name: name.filter(|n| !n.trim().is_empty()).unwrap_or(serial),
        }))
    }
}

struct PgTx<'a> {
    conn: &'a mut PgConnection,
}

impl StoreTx for PgTx<'_> {
    fn find_measurement(&mut self, name: &str) -> Result<Option<Measurement>, StoreError> {
        use schema::measurements::dsl as M;

        Ok(M::measurements
            .filter(M::name.eq(name))
            .select(Measurement::as_select())
            .first(self.conn)
            .optional()?)
    }

    fn create_measurement(&mut self, new: &NewMeasurement) -> Result<Measurement, StoreError> {
        use schema::measurements::dsl as M;

        // a concurrent transaction may insert the same name first; do nothing and read it back
        diesel::insert_into(M::measurements)
            .values(new)
            .on_conflict(M::name)
            .do_nothing()
            .execute(self.conn)?;

        self.find_measurement(&new.name)?
            .ok_or_else(|| StoreError::Fatal(format!("measurement {:?} missing after upsert", new.name)))
    }

    fn insert_history(&mut self, rows: &[NewDeviceData]) -> Result<Vec<i64>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        use schema::device_data::dsl as DD;

        Ok(diesel::insert_into(DD::device_data)
            .values(rows)
            .on_conflict((DD::device_id, DD::measurement_id, DD::timestamp))
            .do_nothing()
            .returning(DD::id)
            .get_results(self.conn)?)
    }

    fn upsert_latest(&mut self, rows: &[NewDeviceLatestData]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        use diesel::query_dsl::methods::FilterDsl;
        use schema::device_latest_data::dsl as L;

        Ok(diesel::insert_into(L::device_latest_data)
            .values(rows)
            .on_conflict((L::device_id, L::measurement_id))
            .do_update()
            .set((
                L::value.eq(excluded(L::value)),
                L::timestamp.eq(excluded(L::timestamp)),
                L::updated_at.eq(Utc::now()),
            ))
            // an older reading (a replayed retry) never replaces a newer one
            .filter(L::timestamp.le(excluded(L::timestamp)))
            .execute(self.conn)?)
    }
}
