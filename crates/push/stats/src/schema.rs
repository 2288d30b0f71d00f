//! Diesel schema definitions.

diesel::table! {
    counters (key) {
        key -> Text,
        value -> BigInt,
        updated_at -> Timestamp,
    }
}
