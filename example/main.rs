use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use flights_etl::logging::init_logging;
use flights_etl::memory::{MemoryBlobStore, MemoryWarehouse};
use flights_etl::pipeline::PipelineHandles;
use flights_etl::sql::SqlCatalog;
use flights_etl::tables::TABLES;
use flights_etl::{FlightsPipeline, PipelineConfig, RowSet, rowset};

// 演示数据
fn sample_rows(table: &str) -> RowSet {
    match table {
        "tickets" => rowset!(
            ["ticket_no", "book_ref", "passenger_id", "passenger_name", "contact_data"],
            ["0005432000987", "06B046", "8149 604011", "VALERIY TIKHONOV", r#"{"phone": "+70127117011"}"#],
            ["0005432000988", "06B046", "8499 420203", "EVGENIYA ALEKSEEVA", r#"{"phone": "+70378089255"}"#],
        ),
        "aircrafts_data" => rowset!(
            ["aircraft_code", "model", "range"],
            ["773", r#"{"en": "Boeing 777-300", "ru": "Боинг 777-300"}"#, 11100i64],
            ["SU9", r#"{"en": "Sukhoi Superjet-100", "ru": "Сухой Суперджет-100"}"#, 3000i64],
        ),
        "airports_data" => rowset!(
            ["airport_code", "airport_name", "city", "coordinates", "timezone"],
            ["DME", r#"{"en": "Domodedovo International Airport"}"#, r#"{"en": "Moscow"}"#, "(37.90,55.40)", "Europe/Moscow"],
            ["LED", r#"{"en": "Pulkovo Airport"}"#, r#"{"en": "St. Petersburg"}"#, "(30.26,59.80)", "Europe/Moscow"],
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
            [
                "flight_id", "flight_no", "scheduled_departure", "scheduled_arrival",
                "departure_airport", "arrival_airport", "status", "aircraft_code",
                "actual_departure", "actual_arrival",
            ],
            [
                28935i64, "PG0405", "2017-07-16 09:35:00+03", "2017-07-16 10:30:00+03",
                "DME", "LED", "Arrived", "SU9", "2017-07-16 09:44:00+03", "2017-07-16 10:39:00+03",
            ],
            [
                28936i64, "PG0405", "2017-08-16 09:35:00+03", "2017-08-16 10:30:00+03",
                "DME", "LED", "Scheduled", "SU9", "", "",
            ],
        ),
        "seats" => rowset!(
            ["aircraft_code", "seat_no", "fare_conditions"],
            ["SU9", "2A", "Business"],
            ["SU9", "2C", "Business"],
        ),
        "ticket_flights" => rowset!(
            ["ticket_no", "flight_id", "fare_conditions", "amount"],
            ["0005432000987", 28935i64, "Business", 12400.0],
            ["0005432000988", 28935i64, "Economy", 6200.0],
        ),
        _ => RowSet::default(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(&PathBuf::from(path)).await?,
        None => PipelineConfig::default(),
    };
    init_logging(&config.logging);

    let sql = SqlCatalog::load_dir(&config.sql_dir).await?;

    let source = MemoryWarehouse::new();
    for table in &TABLES {
        source.seed_query(
            &config.source_connection,
            sql.get(&table.query_name())?,
            sample_rows(table.name),
        );
    }
    let warehouse = MemoryWarehouse::new();

    let handles = PipelineHandles {
        source: Arc::new(source),
        warehouse: Arc::new(warehouse.clone()),
        blobs: Arc::new(MemoryBlobStore::new()),
        sql: Arc::new(sql),
    };
    let pipeline = FlightsPipeline::new(config, handles)?;

    println!("=== 任务依赖图 ===");
    print!("{}", pipeline.describe());

    let logical_date: NaiveDate = Utc::now().date_naive() - Days::new(1);
    println!("=== 开始执行 {logical_date} ===");
    let start = std::time::Instant::now();
    let record = pipeline.run(logical_date).await?;
    let duration = start.elapsed();

    println!("=== 执行完成 ===");
    println!("执行时间: {:?}", duration);
    println!("{}", record.report());
    println!("执行顺序: {}", record.execution_order.join(" -> "));
    for table in &TABLES {
        println!("{}: {} rows", table.target, warehouse.row_count(table.target));
    }

    // 重复执行，upsert 保持幂等
    let rerun = pipeline.run(logical_date).await?;
    println!("重复执行: {}", rerun.report());
    println!("stg.tickets: {} rows", warehouse.row_count("stg.tickets"));

    Ok(())
}
