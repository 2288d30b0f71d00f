//! SQLite stats engine.

use color_eyre::eyre::WrapErr as _;
use diesel::connection::SimpleConnection as _;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool};
use diesel::sqlite::SqliteConnection;

use push_core::Platform;

use crate::models::*;
use crate::schema::*;
use crate::traits::*;

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

/// Applied to every pooled connection so concurrent workers wait on the
/// write lock instead of failing with `database is locked`.
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Counters persisted in a SQLite table, surviving restarts.
#[derive(Clone)]
pub struct SqliteStats {
    pool: SqlitePool,
}

impl SqliteStats {
    /// Create a new SQLite stats store from a database path or URL.
    pub fn new(database_url: &str) -> color_eyre::eyre::Result<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(8)
            .connection_customizer(Box::new(ConnectionOptions))
            .build(manager)
            .wrap_err("failed to create connection pool")?;

        Ok(Self { pool })
    }

    /// Run migrations.
    pub fn run_migrations(&self) -> color_eyre::eyre::Result<()> {
        use diesel_migrations::MigrationHarness as _;

        let mut conn = self
            .pool
            .get()
            .wrap_err("failed to get connection for migrations")?;

        conn.run_pending_migrations(crate::MIGRATIONS)
            .map_err(|e| color_eyre::eyre::eyre!("migration failed: {}", e))?;

        Ok(())
    }

    fn conn(
        &self,
    ) -> color_eyre::eyre::Result<diesel::r2d2::PooledConnection<ConnectionManager<SqliteConnection>>>
    {
        self.pool
            .get()
            .wrap_err("failed to get database connection")
    }

    /// Add `n` to every key in one transaction.
    fn add(&self, names: &[&str], n: u64) -> color_eyre::eyre::Result<()> {
        let delta = i64::try_from(n).wrap_err("counter increment out of range")?;
        let now = chrono::Utc::now().naive_utc();
        let mut conn = self.conn()?;

        conn.immediate_transaction(|conn| {
            for &key in names {
                diesel::insert_into(counters::table)
                    .values(&NewCounter {
                        key,
                        value: delta,
                        updated_at: now,
                    })
                    .on_conflict(counters::key)
                    .do_update()
                    .set((
                        counters::value.eq(counters::value + delta),
                        counters::updated_at.eq(now),
                    ))
                    .execute(conn)?;
            }
            Ok::<_, diesel::result::Error>(())
        })
        .wrap_err_with(|| format!("failed to increment {}", names.join(", ")))
    }
}

impl StatStore for SqliteStats {
    fn increment_submitted(&self, n: u64) -> color_eyre::eyre::Result<()> {
        self.add(&[keys::SUBMITTED], n)
    }

    fn increment_succeeded(&self, platform: Platform, n: u64) -> color_eyre::eyre::Result<()> {
        self.add(&[keys::SUCCEEDED, keys::success(platform).as_str()], n)
    }

    fn increment_failed(&self, platform: Platform, n: u64) -> color_eyre::eyre::Result<()> {
        self.add(&[keys::FAILED, keys::failure(platform).as_str()], n)
    }

    fn snapshot(&self) -> color_eyre::eyre::Result<StatsSnapshot> {
        let mut conn = self.conn()?;

        let rows: Vec<CounterRow> = counters::table
            .select(CounterRow::as_select())
            .load(&mut conn)
            .wrap_err("failed to load counters")?;

        let mut snapshot = StatsSnapshot::default();
        for platform in Platform::KNOWN {
            snapshot
                .platforms
                .insert(platform.name().to_string(), PlatformStats::default());
        }

        for row in rows {
            let value = u64::try_from(row.value).unwrap_or_default();
            match row.key.as_str() {
                keys::SUBMITTED => snapshot.submitted = value,
                keys::SUCCEEDED => snapshot.succeeded = value,
                keys::FAILED => snapshot.failed = value,
                other => {
                    let Some((name, kind)) = other.split_once('.') else {
                        tracing::warn!(key = %other, "ignoring unrecognised counter");
                        continue;
                    };
                    let entry = snapshot.platforms.entry(name.to_string()).or_default();
                    match kind {
                        "success" => entry.success = value,
                        "failure" => entry.failure = value,
                        _ => tracing::warn!(key = %other, "ignoring unrecognised counter"),
                    }
                }
            }
        }

        Ok(snapshot)
    }

    fn reset(&self) -> color_eyre::eyre::Result<()> {
        let mut conn = self.conn()?;

        diesel::delete(counters::table)
            .execute(&mut conn)
            .wrap_err("failed to reset counters")?;

        Ok(())
    }
}
