pub mod bookings;
pub mod drivers;
pub mod payments;
pub mod reviews;
pub mod rides;

use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

/// Identity injected by the fronting gateway after authentication. Core
/// operations take it as an explicit value; nothing reads ambient state.
pub const IDENTITY_HEADER: &str = "x-user-id";

pub async fn health(State(state): State<AppState>) -> axum::Json<HealthOut> {
    axum::Json(HealthOut {
        status: "ok",
        env: state.env_name.clone(),
        service: "Rides API",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn require_identity(headers: &HeaderMap) -> ApiResult<String> {
    let raw = headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if raw.is_empty() || raw.len() > 64 {
        return Err(ApiError::unauthorized("authentication required"));
    }
    Ok(raw.to_string())
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn for_update_suffix(state: &AppState) -> &'static str {
    let _ = state;
    " FOR UPDATE"
}

pub fn normalize_limit(raw: Option<i64>, default: i64, min: i64, max: i64) -> i64 {
    raw.unwrap_or(default).clamp(min, max)
}

/// Seats going back to a ride on cancellation. The clamp keeps
/// `seats_available <= seats_total` even if a double restitution ever
/// slipped through.
pub fn clamp_restored_seats(available: i32, returned: i32, total: i32) -> i32 {
    (available + returned).min(total)
}

fn parse_db_dt(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let s = s.replace('Z', "+00:00");
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn row_dt_opt(row: &PgRow, col: &str) -> Option<DateTime<Utc>> {
    row.try_get::<Option<String>, _>(col)
        .ok()
        .flatten()
        .and_then(|s| parse_db_dt(&s))
}

pub fn make_in_clause(start_index: usize, n: usize) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(n);
    for i in 0..n {
        parts.push(format!("${}", start_index + i));
    }
    format!("({})", parts.join(","))
}

pub fn ride_out_from_row(row: &PgRow) -> RideOut {
    RideOut {
        id: row.try_get("id").unwrap_or_default(),
        driver_id: row.try_get("driver_id").unwrap_or_default(),
        source: row.try_get("source").unwrap_or_default(),
        destination: row.try_get("destination").unwrap_or_default(),
        ride_date: row.try_get("ride_date").unwrap_or_default(),
        ride_time: row.try_get("ride_time").unwrap_or_default(),
        seats_total: row.try_get("seats_total").unwrap_or(0),
        seats_available: row.try_get("seats_available").unwrap_or(0),
        base_fare_cents: row.try_get("base_fare_cents").unwrap_or(0),
        rate_per_km_cents: row.try_get("rate_per_km_cents").unwrap_or(0),
        total_distance_km: row.try_get("total_distance_km").unwrap_or(0.0),
        estimated_fare_cents: row.try_get("estimated_fare_cents").unwrap_or(0),
        status: row
            .try_get("status")
            .unwrap_or_else(|_| ride_status::SCHEDULED.to_string()),
        created_at: row_dt_opt(row, "created_at"),
    }
}

pub fn booking_out_from_row(row: &PgRow) -> BookingOut {
    BookingOut {
        id: row.try_get("id").unwrap_or_default(),
        ride_id: row.try_get("ride_id").unwrap_or_default(),
        passenger_id: row.try_get("passenger_id").unwrap_or_default(),
        pickup: row.try_get("pickup").unwrap_or_default(),
        dropoff: row.try_get("dropoff").unwrap_or_default(),
        distance_km: row.try_get("distance_km").unwrap_or(0.0),
        fare_cents: row.try_get("fare_cents").unwrap_or(0),
        seats: row.try_get("seats").unwrap_or(0),
        status: row
            .try_get("status")
            .unwrap_or_else(|_| booking_status::PENDING.to_string()),
        created_at: row_dt_opt(row, "created_at"),
    }
}

pub fn payment_out_from_row(row: &PgRow) -> PaymentOut {
    PaymentOut {
        id: row.try_get("id").unwrap_or_default(),
        booking_id: row.try_get("booking_id").unwrap_or_default(),
        passenger_id: row.try_get("passenger_id").unwrap_or_default(),
        driver_id: row.try_get("driver_id").unwrap_or_default(),
        order_id: row.try_get("order_id").unwrap_or(None),
        gateway_payment_id: row.try_get("gateway_payment_id").unwrap_or(None),
        amount_cents: row.try_get("amount_cents").unwrap_or(0),
        currency: row.try_get("currency").unwrap_or_else(|_| "INR".to_string()),
        status: row
            .try_get("status")
            .unwrap_or_else(|_| payment_status::PENDING.to_string()),
        kind: row
            .try_get("kind")
            .unwrap_or_else(|_| payment_kind::BOOKING.to_string()),
        driver_payment_status: row
            .try_get("driver_payment_status")
            .unwrap_or_else(|_| payout_status::PENDING.to_string()),
        driver_paid_at: row_dt_opt(row, "driver_paid_at"),
        created_at: row_dt_opt(row, "created_at"),
    }
}

pub const RIDE_COLUMNS: &str = "id,driver_id,source,destination,ride_date,ride_time,seats_total,\
     seats_available,base_fare_cents,rate_per_km_cents,total_distance_km,estimated_fare_cents,\
     status,created_at";

pub const BOOKING_COLUMNS: &str =
    "id,ride_id,passenger_id,pickup,dropoff,distance_km,fare_cents,seats,status,created_at";

pub const PAYMENT_COLUMNS: &str = "id,booking_id,passenger_id,driver_id,order_id,\
     gateway_payment_id,amount_cents,currency,status,kind,driver_payment_status,\
     driver_paid_at,created_at";

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn identity_header_is_required_and_bounded() {
        let mut headers = HeaderMap::new();
        assert!(require_identity(&headers).is_err());

        headers.insert(IDENTITY_HEADER, HeaderValue::from_static("  "));
        assert!(require_identity(&headers).is_err());

        let long = "u".repeat(65);
        headers.insert(IDENTITY_HEADER, HeaderValue::from_str(&long).unwrap());
        assert!(require_identity(&headers).is_err());

        headers.insert(IDENTITY_HEADER, HeaderValue::from_static("user-42"));
        assert_eq!(require_identity(&headers).unwrap(), "user-42");
    }

    #[test]
    fn seat_restitution_conserves_capacity() {
        // availableSeats + seats held by live bookings == seats_total before
        // and after a cancel returns its seats.
        assert_eq!(clamp_restored_seats(1, 2, 3), 3);
        assert_eq!(clamp_restored_seats(0, 1, 3), 1);
        // A stray double restitution cannot push past capacity.
        assert_eq!(clamp_restored_seats(3, 2, 3), 3);
    }

    #[test]
    fn in_clause_enumerates_placeholders() {
        assert_eq!(make_in_clause(1, 3), "($1,$2,$3)");
        assert_eq!(make_in_clause(4, 1), "($4)");
    }

    #[test]
    fn db_datetime_parsing_tolerates_z_suffix() {
        assert!(parse_db_dt("2026-03-01T10:00:00Z").is_some());
        assert!(parse_db_dt("2026-03-01T10:00:00+00:00").is_some());
        assert!(parse_db_dt("").is_none());
        assert!(parse_db_dt("yesterday").is_none());
    }
}
