//! Static descriptors for the flights tables.

use crate::normalize::ColumnTransform::{self, JsonEncode, ParseTimestampOrNull};
use crate::upsert::UpsertSpec;

pub const STAGING_BUCKET: &str = "extracted-data";
pub const STAGING_PREFIX: &str = "temp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub transforms: &'static [(&'static str, ColumnTransform)],
    pub target: &'static str,
    pub conflict_key: &'static [&'static str],
}

impl TableSpec {
    /// Name of the extract query in the SQL catalog.
    pub fn query_name(&self) -> String {
        format!("query/{}", self.name)
    }

    pub fn upsert_spec(&self) -> UpsertSpec {
        UpsertSpec::new(self.target, self.conflict_key)
    }
}

/// Extract group order.
pub static TABLES: [TableSpec; 8] = [
    TableSpec {
        name: "tickets",
        transforms: &[("contact_data", JsonEncode)],
        target: "stg.tickets",
        conflict_key: &["ticket_no"],
    },
    TableSpec {
        name: "aircrafts_data",
        transforms: &[("model", JsonEncode)],
        target: "stg.aircrafts_data",
        conflict_key: &["aircraft_code"],
    },
    TableSpec {
        name: "airports_data",
        transforms: &[("airport_name", JsonEncode), ("city", JsonEncode)],
        target: "stg.airports_data",
        conflict_key: &["airport_code"],
    },
    TableSpec {
        name: "boarding_passes",
        transforms: &[],
        target: "stg.boarding_passes",
        conflict_key: &["ticket_no", "flight_id"],
    },
    TableSpec {
        name: "bookings",
        transforms: &[],
        target: "stg.bookings",
        conflict_key: &["book_ref"],
    },
    TableSpec {
        name: "flights",
        transforms: &[
            ("scheduled_departure", ParseTimestampOrNull),
            ("scheduled_arrival", ParseTimestampOrNull),
            ("actual_departure", ParseTimestampOrNull),
            ("actual_arrival", ParseTimestampOrNull),
        ],
        target: "stg.flights",
        conflict_key: &["flight_id"],
    },
    TableSpec {
        name: "seats",
        transforms: &[],
        target: "stg.seats",
        conflict_key: &["aircraft_code", "seat_no"],
    },
    TableSpec {
        name: "ticket_flights",
        transforms: &[],
        target: "stg.ticket_flights",
        conflict_key: &["ticket_no", "flight_id"],
    },
];

/// Load group order when loads are chained.
pub const LOAD_ORDER: [&str; 8] = [
    "aircrafts_data",
    "airports_data",
    "bookings",
    "tickets",
    "seats",
    "flights",
    "ticket_flights",
    "boarding_passes",
];

/// Mart statements, dimensions before facts.
pub const TRANSFORM_STEPS: [&str; 8] = [
    "dim_aircraft",
    "dim_airport",
    "dim_passenger",
    "dim_seat",
    "fct_boarding_pass",
    "fct_booking_ticket",
    "fct_flight_activity",
    "fct_seat_occupied_daily",
];

pub fn table(name: &str) -> Option<&'static TableSpec> {
    TABLES.iter().find(|t| t.name == name)
}

pub fn staging_key(prefix: &str, table: &str) -> String {
    if prefix.is_empty() {
        format!("{table}.csv")
    } else {
        format!("{}/{table}.csv", prefix.trim_end_matches('/'))
    }
}

pub fn transform_query_name(step: &str) -> String {
    format!("transform/{step}")
}
