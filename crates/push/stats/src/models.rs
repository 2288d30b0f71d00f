//! Database models.

use diesel::prelude::*;

use crate::schema::counters;

/// Counter record.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = counters)]
pub struct CounterRow {
    pub key: String,
    pub value: i64,
    pub updated_at: chrono::NaiveDateTime,
}

/// Counter increment for upsert.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = counters)]
pub struct NewCounter<'a> {
    pub key: &'a str,
    pub value: i64,
    pub updated_at: chrono::NaiveDateTime,
}
