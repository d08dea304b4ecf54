use super::{
    booking_out_from_row, for_update_suffix, now_iso, require_identity, ride_out_from_row,
    BOOKING_COLUMNS, RIDE_COLUMNS,
};
use super::drivers::{fetch_driver_summaries, fetch_user};
use crate::error::{ApiError, ApiResult};
use crate::fare;
use crate::models::*;
use crate::notify::{self, events};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use chrono::{NaiveDate, NaiveTime};
use uuid::Uuid;

const MAX_SEATS_PER_RIDE: i32 = 8;

#[derive(Debug, serde::Deserialize)]
pub struct SearchRidesParams {
    pub source: String,
    pub destination: String,
    pub date: String, // YYYY-MM-DD
    pub min_fare_cents: Option<i64>,
    pub max_fare_cents: Option<i64>,
    pub min_driver_rating: Option<f64>,
}

fn validate_ride_date(raw: &str) -> ApiResult<String> {
    let s = raw.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ApiError::bad_request("invalid ride_date (YYYY-MM-DD)"))?;
    Ok(s.to_string())
}

fn validate_ride_time(raw: &str) -> ApiResult<String> {
    let s = raw.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| ApiError::bad_request("invalid ride_time (HH:MM)"))?;
    Ok(s.to_string())
}

fn validate_label(raw: &str, field: &str) -> ApiResult<String> {
    let s = raw.trim().to_string();
    if s.is_empty() {
        return Err(ApiError::bad_request(format!("{field} required")));
    }
    if s.len() > 120 {
        return Err(ApiError::bad_request(format!("{field} too long")));
    }
    Ok(s)
}

pub(crate) async fn fetch_ride(
    state: &AppState,
    ride_id: &str,
) -> ApiResult<Option<RideOut>> {
    let rides = state.table("rides");
    let row = sqlx::query(&format!("SELECT {RIDE_COLUMNS} FROM {rides} WHERE id=$1"))
        .bind(ride_id.trim())
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db ride lookup failed");
            ApiError::internal("database error")
        })?;
    Ok(row.map(|r| ride_out_from_row(&r)))
}

pub async fn post_ride(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<RideIn>,
) -> ApiResult<axum::Json<RideOut>> {
    let driver_id = require_identity(&headers)?;

    let driver = fetch_user(&state, &driver_id)
        .await?
        .ok_or_else(|| ApiError::not_found("driver not found"))?;
    if driver.role != user_role::DRIVER {
        return Err(ApiError::forbidden("only drivers can post rides"));
    }
    if !driver.driver_approved {
        return Err(ApiError::forbidden("driver not approved"));
    }

    let source = validate_label(&body.source, "source")?;
    let destination = validate_label(&body.destination, "destination")?;
    let ride_date = validate_ride_date(&body.ride_date)?;
    let ride_time = validate_ride_time(&body.ride_time)?;
    if !(1..=MAX_SEATS_PER_RIDE).contains(&body.seats_total) {
        return Err(ApiError::bad_request("invalid seats_total"));
    }
    if body.base_fare_cents < 0 || body.rate_per_km_cents < 0 {
        return Err(ApiError::bad_request("fares must not be negative"));
    }

    let total_distance_km = fare::route_distance_km(&source, &destination);
    let estimated_fare_cents = fare::fare_cents(
        body.base_fare_cents,
        body.rate_per_km_cents,
        total_distance_km,
    );

    let id = Uuid::new_v4().to_string();
    let rides = state.table("rides");
    let sql = format!(
        "INSERT INTO {rides} (id,driver_id,source,destination,ride_date,ride_time,seats_total,\
         seats_available,base_fare_cents,rate_per_km_cents,total_distance_km,estimated_fare_cents,\
         status,created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)"
    );
    sqlx::query(&sql)
        .bind(&id)
        .bind(&driver_id)
        .bind(&source)
        .bind(&destination)
        .bind(&ride_date)
        .bind(&ride_time)
        .bind(body.seats_total)
        .bind(body.seats_total)
        .bind(body.base_fare_cents)
        .bind(body.rate_per_km_cents)
        .bind(total_distance_km)
        .bind(estimated_fare_cents)
        .bind(ride_status::SCHEDULED)
        .bind(now_iso())
        .execute(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db post_ride failed");
            ApiError::internal("database error")
        })?;

    Ok(axum::Json(RideOut {
        id,
        driver_id,
        source,
        destination,
        ride_date,
        ride_time,
        seats_total: body.seats_total,
        seats_available: body.seats_total,
        base_fare_cents: body.base_fare_cents,
        rate_per_km_cents: body.rate_per_km_cents,
        total_distance_km,
        estimated_fare_cents,
        status: ride_status::SCHEDULED.to_string(),
        created_at: None,
    }))
}

pub async fn search_rides(
    State(state): State<AppState>,
    Query(params): Query<SearchRidesParams>,
) -> ApiResult<axum::Json<Vec<RideSearchOut>>> {
    let source = params.source.trim().to_lowercase();
    let destination = params.destination.trim().to_lowercase();
    if source.is_empty() || destination.is_empty() {
        return Err(ApiError::bad_request("source and destination required"));
    }
    let date = validate_ride_date(&params.date)?;

    let rides = state.table("rides");
    let sql = format!(
        "SELECT {RIDE_COLUMNS} FROM {rides} WHERE LOWER(source)=$1 AND LOWER(destination)=$2 \
         AND ride_date=$3 AND status=$4 AND seats_available > 0 \
         ORDER BY ride_date DESC, ride_time DESC"
    );
    let rows = sqlx::query(&sql)
        .bind(&source)
        .bind(&destination)
        .bind(&date)
        .bind(ride_status::SCHEDULED)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db search_rides failed");
            ApiError::internal("database error")
        })?;

    let rides_out: Vec<RideOut> = rows.iter().map(ride_out_from_row).collect();
    let driver_ids: Vec<String> = rides_out.iter().map(|r| r.driver_id.clone()).collect();
    let driver_map = fetch_driver_summaries(&state, &driver_ids).await?;

    // Price and rating filters run in-process over the already-narrowed rows.
    let mut out: Vec<RideSearchOut> = Vec::with_capacity(rides_out.len());
    for ride in rides_out {
        if let Some(min) = params.min_fare_cents {
            if ride.estimated_fare_cents < min {
                continue;
            }
        }
        if let Some(max) = params.max_fare_cents {
            if ride.estimated_fare_cents > max {
                continue;
            }
        }
        let driver = driver_map
            .get(&ride.driver_id)
            .cloned()
            .unwrap_or(DriverSummaryOut {
                id: ride.driver_id.clone(),
                name: "".to_string(),
                driver_rating: 0.0,
                total_rides: 0,
            });
        if let Some(min_rating) = params.min_driver_rating {
            if driver.driver_rating < min_rating {
                continue;
            }
        }
        out.push(RideSearchOut { ride, driver });
    }
    Ok(axum::Json(out))
}

pub async fn my_rides(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<axum::Json<Vec<RideOut>>> {
    let driver_id = require_identity(&headers)?;
    let limit = super::normalize_limit(params.limit, 50, 1, 200);
    let rides = state.table("rides");
    let sql = format!(
        "SELECT {RIDE_COLUMNS} FROM {rides} WHERE driver_id=$1 ORDER BY created_at DESC LIMIT $2"
    );
    let rows = sqlx::query(&sql)
        .bind(&driver_id)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db my_rides failed");
            ApiError::internal("database error")
        })?;
    Ok(axum::Json(rows.iter().map(ride_out_from_row).collect()))
}

pub async fn ride_detail(
    Path(ride_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<axum::Json<RideOut>> {
    let ride = fetch_ride(&state, ride_id.trim())
        .await?
        .ok_or_else(|| ApiError::not_found("ride not found"))?;
    Ok(axum::Json(ride))
}

pub async fn update_ride(
    Path(ride_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<RideUpdateIn>,
) -> ApiResult<axum::Json<RideOut>> {
    let driver_id = require_identity(&headers)?;
    let ride_id = ride_id.trim().to_string();

    let rides = state.table("rides");
    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    let row = sqlx::query(&format!(
        "SELECT {RIDE_COLUMNS} FROM {rides} WHERE id=$1{}",
        for_update_suffix(&state)
    ))
    .bind(&ride_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db update_ride lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("ride not found"))?;
    let mut ride = ride_out_from_row(&row);

    if ride.driver_id != driver_id {
        return Err(ApiError::forbidden("not your ride"));
    }
    if ride.status != ride_status::SCHEDULED {
        return Err(ApiError::conflict(format!(
            "ride is {}; only scheduled rides can be updated",
            ride.status
        )));
    }

    // Each optional field is applied on its own; absent fields stay untouched.
    if let Some(d) = body.ride_date.as_deref() {
        ride.ride_date = validate_ride_date(d)?;
    }
    if let Some(t) = body.ride_time.as_deref() {
        ride.ride_time = validate_ride_time(t)?;
    }
    if let Some(seats) = body.seats_total {
        if !(1..=MAX_SEATS_PER_RIDE).contains(&seats) {
            return Err(ApiError::bad_request("invalid seats_total"));
        }
        if ride.seats_available != ride.seats_total {
            return Err(ApiError::conflict(
                "seats_total cannot change once seats are booked",
            ));
        }
        ride.seats_total = seats;
        ride.seats_available = seats;
    }

    sqlx::query(&format!(
        "UPDATE {rides} SET ride_date=$1, ride_time=$2, seats_total=$3, seats_available=$4 WHERE id=$5"
    ))
    .bind(&ride.ride_date)
    .bind(&ride.ride_time)
    .bind(ride.seats_total)
    .bind(ride.seats_available)
    .bind(&ride_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db update_ride failed");
        ApiError::internal("database error")
    })?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    Ok(axum::Json(ride))
}

pub async fn start_ride(
    Path(ride_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<RideOut>> {
    let driver_id = require_identity(&headers)?;
    let ride_id = ride_id.trim().to_string();

    let rides = state.table("rides");
    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    let row = sqlx::query(&format!(
        "SELECT {RIDE_COLUMNS} FROM {rides} WHERE id=$1{}",
        for_update_suffix(&state)
    ))
    .bind(&ride_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db start_ride lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("ride not found"))?;
    let mut ride = ride_out_from_row(&row);

    if ride.driver_id != driver_id {
        return Err(ApiError::forbidden("not your ride"));
    }
    if ride.status != ride_status::SCHEDULED {
        return Err(ApiError::conflict(format!("ride is {}", ride.status)));
    }

    sqlx::query(&format!("UPDATE {rides} SET status=$1 WHERE id=$2"))
        .bind(ride_status::ONGOING)
        .bind(&ride_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db start_ride update failed");
            ApiError::internal("database error")
        })?;
    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    ride.status = ride_status::ONGOING.to_string();
    Ok(axum::Json(ride))
}

pub async fn complete_ride(
    Path(ride_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<RideOut>> {
    let driver_id = require_identity(&headers)?;
    let ride_id = ride_id.trim().to_string();

    let rides = state.table("rides");
    let bookings = state.table("bookings");
    let users = state.table("users");

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    let row = sqlx::query(&format!(
        "SELECT {RIDE_COLUMNS} FROM {rides} WHERE id=$1{}",
        for_update_suffix(&state)
    ))
    .bind(&ride_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db complete_ride lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("ride not found"))?;
    let mut ride = ride_out_from_row(&row);

    if ride.driver_id != driver_id {
        return Err(ApiError::forbidden("not your ride"));
    }
    if ride_status::is_terminal(&ride.status) {
        return Err(ApiError::conflict(format!("ride is {}", ride.status)));
    }

    // Confirmed passengers rode to the end; their bookings close with the ride.
    sqlx::query(&format!(
        "UPDATE {bookings} SET status=$1 WHERE ride_id=$2 AND status=$3"
    ))
    .bind(booking_status::COMPLETED)
    .bind(&ride_id)
    .bind(booking_status::CONFIRMED)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db complete_ride booking cascade failed");
        ApiError::internal("database error")
    })?;

    sqlx::query(&format!("UPDATE {rides} SET status=$1 WHERE id=$2"))
        .bind(ride_status::COMPLETED)
        .bind(&ride_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db complete_ride update failed");
            ApiError::internal("database error")
        })?;

    sqlx::query(&format!(
        "UPDATE {users} SET total_rides = total_rides + 1 WHERE id=$1"
    ))
    .bind(&driver_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db complete_ride driver counter failed");
        ApiError::internal("database error")
    })?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    ride.status = ride_status::COMPLETED.to_string();
    Ok(axum::Json(ride))
}

pub async fn cancel_ride(
    Path(ride_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<RideOut>> {
    let driver_id = require_identity(&headers)?;
    let ride_id = ride_id.trim().to_string();

    let rides = state.table("rides");
    let bookings = state.table("bookings");
    let payments = state.table("payments");

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    let row = sqlx::query(&format!(
        "SELECT {RIDE_COLUMNS} FROM {rides} WHERE id=$1{}",
        for_update_suffix(&state)
    ))
    .bind(&ride_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db cancel_ride lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("ride not found"))?;
    let mut ride = ride_out_from_row(&row);

    if ride.driver_id != driver_id {
        return Err(ApiError::forbidden("not your ride"));
    }
    if ride_status::is_terminal(&ride.status) {
        return Err(ApiError::conflict(format!("ride is {}", ride.status)));
    }

    // Cascade: every live booking on the ride goes down with it, seats come
    // back, and settled payments flip to refunded. One transaction; a partial
    // cascade must never be observable.
    let live = sqlx::query(&format!(
        "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE ride_id=$1 AND status IN ($2,$3){}",
        for_update_suffix(&state)
    ))
    .bind(&ride_id)
    .bind(booking_status::PENDING)
    .bind(booking_status::CONFIRMED)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db cancel_ride booking fetch failed");
        ApiError::internal("database error")
    })?;
    let cancelled: Vec<BookingOut> = live.iter().map(booking_out_from_row).collect();

    sqlx::query(&format!(
        "UPDATE {bookings} SET status=$1 WHERE ride_id=$2 AND status IN ($3,$4)"
    ))
    .bind(booking_status::CANCELLED)
    .bind(&ride_id)
    .bind(booking_status::PENDING)
    .bind(booking_status::CONFIRMED)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db cancel_ride booking cascade failed");
        ApiError::internal("database error")
    })?;

    for b in &cancelled {
        sqlx::query(&format!(
            "UPDATE {payments} SET status=$1 WHERE booking_id=$2 AND kind=$3 AND status=$4"
        ))
        .bind(payment_status::REFUNDED)
        .bind(&b.id)
        .bind(payment_kind::BOOKING)
        .bind(payment_status::SUCCESS)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db cancel_ride payment refund mark failed");
            ApiError::internal("database error")
        })?;
        sqlx::query(&format!(
            "UPDATE {payments} SET status=$1 WHERE booking_id=$2 AND kind=$3 AND status=$4"
        ))
        .bind(payment_status::FAILED)
        .bind(&b.id)
        .bind(payment_kind::BOOKING)
        .bind(payment_status::PENDING)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db cancel_ride payment fail mark failed");
            ApiError::internal("database error")
        })?;
    }

    sqlx::query(&format!(
        "UPDATE {rides} SET status=$1, seats_available=seats_total WHERE id=$2"
    ))
    .bind(ride_status::CANCELLED)
    .bind(&ride_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db cancel_ride update failed");
        ApiError::internal("database error")
    })?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    // Settled money goes back through the gateway after commit; the
    // cancellation itself is already durable.
    for b in &cancelled {
        super::payments::refund_booking_order_best_effort(&state, &b.id).await;
        notify::send_event(
            &state,
            events::RIDE_CANCELLED,
            serde_json::json!({
                "ride_id": ride_id,
                "booking_id": b.id,
                "passenger_id": b.passenger_id,
            }),
        );
    }

    ride.status = ride_status::CANCELLED.to_string();
    ride.seats_available = ride.seats_total;
    Ok(axum::Json(ride))
}
