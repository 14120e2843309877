use std::{collections::BTreeSet, net::IpAddr, str::FromStr, time::Duration};

use async_trait::async_trait;
use sqlx::{
    ConnectOptions,
    sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions},
};
use thiserror::Error;
use tracing::{Instrument, debug};

use crate::{
    CredentialQuery, CredentialRecord, CredentialStore, Identity, LeaseUpdate, OwnerQuery,
    Unset,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error")]
    Db(#[from] sqlx::Error),
    #[error("migration error")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("corrupt credential row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// how long a connection waits on another's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn is_in_memory(uri: &str) -> bool {
    uri.contains(":memory:") || uri.contains("mode=memory")
}

#[derive(Debug, Clone)]
pub struct SqliteDb {
    inner: SqlitePool,
}

impl SqliteDb {
    pub async fn new(uri: impl AsRef<str>) -> Result<Self, StoreError> {
        let mut opts = SqliteConnectOptions::from_str(uri.as_ref())?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);
        // make sqlite log queries at trace level so we don't get a bloated log on `info`
        opts.log_statements(tracing::log::LevelFilter::Trace);

        // in memory dbs share one cache between conns, where sqlite reports
        // lock contention as an error instead of waiting. a single connection
        // serializes callers on the pool instead.
        let pool = if is_in_memory(uri.as_ref()) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
                .connect_with(opts)
                .await?
        } else {
            SqlitePool::connect_with(opts).await?
        };
        sqlx::migrate!("../../migrations").run(&pool).await?;
        Ok(Self { inner: pool })
    }

    /// add a record, as the signing workflow would
    pub async fn insert(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        let mut trans = self.inner.begin().await?;
        let id = util::insert(&mut trans, record).await?;
        for addr in &record.internal_addresses {
            util::add_address(&mut trans, id, *addr).await?;
        }
        trans.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteDb {
    type Error = StoreError;

    /// runs as a detached task inside a `BEGIN IMMEDIATE` transaction so the
    /// read of the pre-image and the write share one write lock, and a caller
    /// that stops waiting cannot leave the transaction open on a pooled conn
    async fn find_one_and_update(
        &self,
        query: &CredentialQuery,
        update: &LeaseUpdate,
    ) -> Result<Option<CredentialRecord>, Self::Error> {
        let pool = self.inner.clone();
        let query = query.clone();
        let update = update.clone();
        tokio::spawn(async move {
            let mut conn = pool.acquire().await?;
            util::begin_immediate(&mut conn).await?;
            let res = util::find_one_and_update(&mut conn, &query, &update).await;
            util::finish(&mut conn, res).await
        }
        .in_current_span())
        .await?
    }

    async fn update_many(&self, query: &OwnerQuery, unset: &Unset) -> Result<u64, Self::Error> {
        let pool = self.inner.clone();
        let query = query.clone();
        let unset = *unset;
        tokio::spawn(async move {
            let mut conn = pool.acquire().await?;
            util::begin_immediate(&mut conn).await?;
            let res = util::update_many(&mut conn, &query, unset).await;
            util::finish(&mut conn, res).await
        }
        .in_current_span())
        .await?
    }

    async fn find_one(
        &self,
        query: &CredentialQuery,
    ) -> Result<Option<CredentialRecord>, Self::Error> {
        // deferred transaction: one consistent snapshot across both tables
        let mut trans = self.inner.begin().await?;
        let record = match util::find(&mut trans, query).await? {
            Some(row) => {
                let addrs = util::addresses(&mut trans, row.id).await?;
                Some(row.into_record(addrs)?)
            }
            None => None,
        };
        trans.commit().await?;
        Ok(record)
    }
}

mod util {
    use chrono::{DateTime, TimeZone, Utc};
    use sqlx::Sqlite;

    use crate::{Instance, Remote, SerialNumber, Status};

    use super::*;

    #[derive(Debug, sqlx::FromRow)]
    pub struct CredentialRow {
        pub id: i64,
        serial_number: String,
        distinguished_name: String,
        status: String,
        remote_addr: Option<String>,
        remote_port: Option<i64>,
        last_seen: Option<i64>,
        instance: Option<String>,
        not_after: Option<i64>,
    }

    impl CredentialRow {
        pub fn into_record(self, addrs: Vec<String>) -> Result<CredentialRecord, StoreError> {
            let id = self.id;
            let corrupt = |reason: String| StoreError::Corrupt { id, reason };

            let serial_number =
                SerialNumber::from_hex(&self.serial_number).map_err(|e| corrupt(e.to_string()))?;
            let status = self
                .status
                .parse::<Status>()
                .map_err(|e| corrupt(e.to_string()))?;
            let remote = match (self.remote_addr, self.remote_port) {
                (Some(addr), Some(port)) => Some(Remote {
                    addr: addr
                        .parse()
                        .map_err(|_| corrupt(format!("bad remote addr {addr:?}")))?,
                    port: u16::try_from(port)
                        .map_err(|_| corrupt(format!("bad remote port {port}")))?,
                }),
                _ => None,
            };
            let internal_addresses = addrs
                .iter()
                .map(|addr| {
                    addr.parse::<IpAddr>()
                        .map_err(|_| corrupt(format!("bad internal addr {addr:?}")))
                })
                .collect::<Result<BTreeSet<_>, _>>()?;
            let last_seen = self
                .last_seen
                .map(|secs| to_datetime(secs).ok_or_else(|| corrupt("bad last_seen".into())))
                .transpose()?;
            let not_after = self
                .not_after
                .map(|secs| to_datetime(secs).ok_or_else(|| corrupt("bad not_after".into())))
                .transpose()?;

            Ok(CredentialRecord {
                serial_number,
                distinguished_name: self.distinguished_name,
                status,
                internal_addresses,
                remote,
                last_seen,
                owning_instance: self.instance.map(Instance::from),
                not_after,
            })
        }
    }

    pub fn to_datetime(secs: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(secs, 0).single()
    }

    pub async fn begin_immediate(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(())
    }

    /// commit on success, roll back on failure (including a failed commit)
    pub async fn finish<T>(
        conn: &mut SqliteConnection,
        res: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let res = match res {
            Ok(val) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => return Ok(val),
                Err(err) => Err(StoreError::from(err)),
            },
            Err(err) => Err(err),
        };
        // sqlite may already have rolled back on its own, that error is expected
        if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
            debug!(?rollback_err, "rollback after failed transaction");
        }
        res
    }

    pub async fn find<'a, E>(
        conn: E,
        query: &CredentialQuery,
    ) -> Result<Option<CredentialRow>, sqlx::Error>
    where
        E: sqlx::Executor<'a, Database = Sqlite>,
    {
        let (sql, key) = match &query.identity {
            Identity::Serial(serial) => (
                r#"SELECT * FROM credentials
                WHERE
                    serial_number = ?1 AND status = ?2
                    AND (?3 IS NULL OR not_after IS NULL OR not_after > ?3)
                LIMIT 1"#,
                serial.as_hex().to_owned(),
            ),
            Identity::DistinguishedName(dn) => (
                r#"SELECT * FROM credentials
                WHERE
                    distinguished_name = ?1 AND status = ?2
                    AND (?3 IS NULL OR not_after IS NULL OR not_after > ?3)
                LIMIT 1"#,
                dn.clone(),
            ),
        };
        sqlx::query_as::<_, CredentialRow>(sql)
            .bind(key)
            .bind(query.status.as_str())
            .bind(query.valid_at.map(|at| at.timestamp()))
            .fetch_optional(conn)
            .await
    }

    pub async fn addresses<'a, E>(conn: E, id: i64) -> Result<Vec<String>, sqlx::Error>
    where
        E: sqlx::Executor<'a, Database = Sqlite>,
    {
        sqlx::query_scalar::<_, String>(
            "SELECT addr FROM credential_addresses WHERE credential_id = ?1",
        )
        .bind(id)
        .fetch_all(conn)
        .await
    }

    pub async fn add_address<'a, E>(conn: E, id: i64, addr: IpAddr) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'a, Database = Sqlite>,
    {
        // primary key on (credential_id, addr) gives set semantics
        sqlx::query(
            "INSERT OR IGNORE INTO credential_addresses (credential_id, addr) VALUES (?1, ?2)",
        )
        .bind(id)
        .bind(addr.to_string())
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn insert<'a, E>(conn: E, record: &CredentialRecord) -> Result<i64, sqlx::Error>
    where
        E: sqlx::Executor<'a, Database = Sqlite>,
    {
        let done = sqlx::query(
            r#"INSERT INTO credentials
                (serial_number, distinguished_name, status, remote_addr, remote_port,
                 last_seen, instance, not_after)
            VALUES
                (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
        )
        .bind(record.serial_number.as_hex())
        .bind(&record.distinguished_name)
        .bind(record.status.as_str())
        .bind(record.remote.map(|r| r.addr.to_string()))
        .bind(record.remote.map(|r| i64::from(r.port)))
        .bind(record.last_seen.map(|at| at.timestamp()))
        .bind(record.owning_instance.as_ref().map(|i| i.as_str().to_owned()))
        .bind(record.not_after.map(|at| at.timestamp()))
        .execute(conn)
        .await?;
        Ok(done.last_insert_rowid())
    }

    /// must run inside a write transaction
    pub async fn find_one_and_update(
        conn: &mut SqliteConnection,
        query: &CredentialQuery,
        update: &LeaseUpdate,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let Some(row) = find(&mut *conn, query).await? else {
            debug!(identity = %query.identity, "no credential matched");
            return Ok(None);
        };
        let id = row.id;
        let addrs = addresses(&mut *conn, id).await?;
        let before = row.into_record(addrs)?;

        sqlx::query(
            r#"
            UPDATE credentials
            SET
                last_seen = ?2, instance = ?3, remote_addr = ?4, remote_port = ?5
            WHERE
                id = ?1
            "#,
        )
        .bind(id)
        .bind(update.last_seen.timestamp())
        .bind(update.instance.as_str())
        .bind(update.remote.addr.to_string())
        .bind(i64::from(update.remote.port))
        .execute(&mut *conn)
        .await?;
        add_address(&mut *conn, id, update.internal_addr).await?;

        Ok(Some(before))
    }

    /// must run inside a write transaction
    pub async fn update_many(
        conn: &mut SqliteConnection,
        query: &OwnerQuery,
        unset: Unset,
    ) -> Result<u64, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM credentials WHERE instance = ?1")
            .bind(query.instance.as_str())
            .fetch_all(&mut *conn)
            .await?;
        if unset.internal_addresses {
            sqlx::query(
                r#"DELETE FROM credential_addresses
                WHERE credential_id IN (SELECT id FROM credentials WHERE instance = ?1)"#,
            )
            .bind(query.instance.as_str())
            .execute(&mut *conn)
            .await?;
        }
        if unset.owning_instance {
            sqlx::query("UPDATE credentials SET instance = NULL WHERE instance = ?1")
                .bind(query.instance.as_str())
                .execute(&mut *conn)
                .await?;
        }
        Ok(ids.len() as u64)
    }
}
