#![allow(dead_code)]

use std::sync::Arc;

use flights_etl::memory::{MemoryBlobStore, MemoryWarehouse};
use flights_etl::pipeline::PipelineHandles;
use flights_etl::sql::SqlCatalog;
use flights_etl::tables::TABLES;
use flights_etl::{FlightsPipeline, PipelineConfig, RowSet, rowset};

pub const SOURCE: &str = "flight_src_db";

pub fn catalog() -> SqlCatalog {
    let sql = TABLES.iter().fold(SqlCatalog::new(), |c, t| {
        let text = format!("SELECT * FROM bookings.{}", t.name);
        c.with(t.query_name(), text)
    });
    flights_etl::tables::TRANSFORM_STEPS.iter().fold(sql, |c, step| {
        c.with(
            flights_etl::tables::transform_query_name(step),
            format!("INSERT INTO mart.{step} SELECT * FROM stg.source_for_{step}"),
        )
    })
}

pub fn source_rows(table: &str) -> RowSet {
    match table {
        "tickets" => rowset!(
            ["ticket_no", "book_ref", "passenger_id", "passenger_name", "contact_data"],
            ["0005432000987", "06B046", "8149 604011", "VALERIY TIKHONOV", r#"{"phone": "+70127117011"}"#],
            ["0005432000988", "06B046", "8499 420203", "EVGENIYA ALEKSEEVA", r#"{"phone": "+70378089255"}"#],
        ),
        "aircrafts_data" => rowset!(
            ["aircraft_code", "model", "range"],
            ["773", r#"{"en": "Boeing 777-300"}"#, 11100i64],
            ["SU9", r#"{"en": "Sukhoi Superjet-100"}"#, 3000i64],
        ),
        "airports_data" => rowset!(
            ["airport_code", "airport_name", "city", "timezone"],
            ["DME", r#"{"en": "Domodedovo International Airport"}"#, r#"{"en": "Moscow"}"#, "Europe/Moscow"],
        ),
        "boarding_passes" => rowset!(
            ["ticket_no", "flight_id", "boarding_no", "seat_no"],
            ["0005432000987", 28935i64, 1i64, "2A"],
        ),
        "bookings" => rowset!(
            ["book_ref", "book_date", "total_amount"],
            ["06B046", "2017-07-05 20:19:00+03", 12400.0],
        ),
        "flights" => rowset!(
            ["flight_id", "flight_no", "scheduled_departure", "scheduled_arrival", "actual_departure", "actual_arrival"],
            [28935i64, "PG0405", "2017-07-16 09:35:00+03", "2017-07-16 10:30:00+03", "not-a-date", ""],
        ),
        "seats" => rowset!(
            ["aircraft_code", "seat_no", "fare_conditions"],
            ["SU9", "2A", "Business"],
            ["SU9", "2C", "Business"],
        ),
        "ticket_flights" => rowset!(
            ["ticket_no", "flight_id", "fare_conditions", "amount"],
            ["0005432000987", 28935i64, "Business", 12400.0],
        ),
        other => panic!("no sample rows for {other}"),
    }
}

pub struct Harness {
    pub source: MemoryWarehouse,
    pub warehouse: MemoryWarehouse,
    pub blobs: Arc<MemoryBlobStore>,
    pub sql: SqlCatalog,
}

impl Harness {
    pub fn seeded() -> Self {
        let source = MemoryWarehouse::new();
        let sql = catalog();
        for table in &TABLES {
            source.seed_query(SOURCE, sql.get(&table.query_name()).unwrap(), source_rows(table.name));
        }
        Self {
            source,
            warehouse: MemoryWarehouse::new(),
            blobs: Arc::new(MemoryBlobStore::new()),
            sql,
        }
    }

    pub fn query_for(&self, table: &str) -> String {
        self.sql.get(&format!("query/{table}")).unwrap().to_string()
    }

    pub fn handles(&self) -> PipelineHandles {
        PipelineHandles {
            source: Arc::new(self.source.clone()),
            warehouse: Arc::new(self.warehouse.clone()),
            blobs: self.blobs.clone(),
            sql: Arc::new(self.sql.clone()),
        }
    }

    pub fn pipeline(&self, config: PipelineConfig) -> FlightsPipeline {
        FlightsPipeline::new(config, self.handles()).unwrap()
    }
}
