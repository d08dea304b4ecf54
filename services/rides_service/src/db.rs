use sqlx::postgres::{PgPool, PgPoolOptions};

fn table_name(schema: &Option<String>, name: &str) -> String {
    match schema {
        Some(s) => format!("{s}.{name}"),
        None => name.to_string(),
    }
}

pub async fn connect(db_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(db_url)
        .await
}

pub async fn ensure_schema(pool: &PgPool, db_schema: &Option<String>) -> Result<(), sqlx::Error> {
    if let Some(schema) = db_schema {
        let ddl = format!("CREATE SCHEMA IF NOT EXISTS {schema}");
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    let users = table_name(db_schema, "users");
    let rides = table_name(db_schema, "rides");
    let bookings = table_name(db_schema, "bookings");
    let payments = table_name(db_schema, "payments");
    let reviews = table_name(db_schema, "reviews");

    let ddls = [
        format!(
            "CREATE TABLE IF NOT EXISTS {users} (\
             id VARCHAR(36) PRIMARY KEY,\
             name VARCHAR(120) NOT NULL,\
             phone VARCHAR(32),\
             role VARCHAR(16) NOT NULL DEFAULT 'passenger',\
             driver_approved INTEGER NOT NULL DEFAULT 0,\
             driver_rating DOUBLE PRECISION NOT NULL DEFAULT 0,\
             total_rides INTEGER NOT NULL DEFAULT 0,\
             balance_cents BIGINT NOT NULL DEFAULT 0,\
             created_at TEXT\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {rides} (\
             id VARCHAR(36) PRIMARY KEY,\
             driver_id VARCHAR(36) NOT NULL,\
             source VARCHAR(120) NOT NULL,\
             destination VARCHAR(120) NOT NULL,\
             ride_date VARCHAR(10) NOT NULL,\
             ride_time VARCHAR(5) NOT NULL,\
             seats_total INTEGER NOT NULL DEFAULT 3,\
             seats_available INTEGER NOT NULL DEFAULT 3,\
             base_fare_cents BIGINT NOT NULL DEFAULT 0,\
             rate_per_km_cents BIGINT NOT NULL DEFAULT 0,\
             total_distance_km DOUBLE PRECISION NOT NULL DEFAULT 0,\
             estimated_fare_cents BIGINT NOT NULL DEFAULT 0,\
             status VARCHAR(16) NOT NULL DEFAULT 'scheduled',\
             created_at TEXT\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {bookings} (\
             id VARCHAR(36) PRIMARY KEY,\
             ride_id VARCHAR(36) NOT NULL,\
             passenger_id VARCHAR(36) NOT NULL,\
             pickup VARCHAR(120) NOT NULL,\
             dropoff VARCHAR(120) NOT NULL,\
             distance_km DOUBLE PRECISION NOT NULL DEFAULT 0,\
             fare_cents BIGINT NOT NULL DEFAULT 0,\
             seats INTEGER NOT NULL DEFAULT 1,\
             status VARCHAR(16) NOT NULL DEFAULT 'pending',\
             created_at TEXT\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {payments} (\
             id VARCHAR(36) PRIMARY KEY,\
             booking_id VARCHAR(36) NOT NULL,\
             passenger_id VARCHAR(36) NOT NULL,\
             driver_id VARCHAR(36) NOT NULL,\
             order_id VARCHAR(64),\
             gateway_payment_id VARCHAR(64),\
             gateway_signature VARCHAR(128),\
             amount_cents BIGINT NOT NULL,\
             currency VARCHAR(3) NOT NULL DEFAULT 'INR',\
             status VARCHAR(16) NOT NULL DEFAULT 'pending',\
             kind VARCHAR(16) NOT NULL DEFAULT 'booking',\
             driver_payment_status VARCHAR(16) NOT NULL DEFAULT 'pending',\
             driver_paid_at TEXT,\
             created_at TEXT\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {reviews} (\
             id VARCHAR(36) PRIMARY KEY,\
             booking_id VARCHAR(36) NOT NULL,\
             reviewer_id VARCHAR(36) NOT NULL,\
             driver_id VARCHAR(36) NOT NULL,\
             rating INTEGER NOT NULL,\
             comment VARCHAR(1024),\
             created_at TEXT\
             )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_rides_driver ON {rides}(driver_id)"),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_rides_search ON {rides}(source,destination,ride_date)"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_bookings_ride ON {bookings}(ride_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_bookings_passenger ON {bookings}(passenger_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_payments_booking ON {payments}(booking_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_payments_order ON {payments}(order_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_payments_driver ON {payments}(driver_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_reviews_driver ON {reviews}(driver_id)"),
        // One review per booking, enforced at the store so concurrent submits
        // cannot both land.
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_reviews_booking ON {reviews}(booking_id)"
        ),
    ];

    for ddl in ddls {
        let _ = sqlx::query(&ddl).execute(pool).await;
    }

    let _ = sqlx::query(&format!(
        "ALTER TABLE {payments} ADD COLUMN IF NOT EXISTS gateway_signature VARCHAR(128)"
    ))
    .execute(pool)
    .await;
    let _ = sqlx::query(&format!(
        "ALTER TABLE {users} ADD COLUMN IF NOT EXISTS total_rides INTEGER DEFAULT 0"
    ))
    .execute(pool)
    .await;

    Ok(())
}
