//! Push Stats
//!
//! Process-wide delivery counters with in-memory and SQLite engines.

mod memory;
mod models;
mod schema;
mod sqlite;
mod traits;

pub use memory::MemoryStats;
pub use sqlite::SqliteStats;
pub use traits::*;

use std::sync::Arc;

use diesel_migrations::{EmbeddedMigrations, embed_migrations};
use push_core::{StatConfig, StatEngine};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Open the stats engine selected by configuration.
pub fn open_store(config: &StatConfig) -> color_eyre::eyre::Result<Arc<dyn StatStore>> {
    match config.engine {
        StatEngine::Memory => Ok(Arc::new(MemoryStats::new())),
        StatEngine::Sqlite => {
            let store = SqliteStats::new(&config.sqlite.path)?;
            store.run_migrations()?;
            tracing::info!(path = %config.sqlite.path, "sqlite stats engine ready");
            Ok(Arc::new(store))
        }
    }
}
