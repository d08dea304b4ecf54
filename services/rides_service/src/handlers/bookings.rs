use super::drivers::fetch_user;
use super::{
    booking_out_from_row, for_update_suffix, normalize_limit, now_iso, require_identity,
    ride_out_from_row, BOOKING_COLUMNS, RIDE_COLUMNS,
};
use crate::error::{ApiError, ApiResult};
use crate::fare;
use crate::models::*;
use crate::notify::{self, events};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use sqlx::Row;
use uuid::Uuid;

const MAX_SEATS_PER_BOOKING: i32 = 8;

pub(crate) async fn fetch_booking(
    state: &AppState,
    booking_id: &str,
) -> ApiResult<Option<BookingOut>> {
    let bookings = state.table("bookings");
    let row = sqlx::query(&format!(
        "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE id=$1"
    ))
    .bind(booking_id.trim())
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db booking lookup failed");
        ApiError::internal("database error")
    })?;
    Ok(row.map(|r| booking_out_from_row(&r)))
}

pub async fn create_booking(
    Path(ride_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<BookReq>,
) -> ApiResult<axum::Json<BookingOut>> {
    let passenger_id = require_identity(&headers)?;
    let ride_id = ride_id.trim().to_string();
    if ride_id.is_empty() {
        return Err(ApiError::bad_request("ride_id required"));
    }
    if !(1..=MAX_SEATS_PER_BOOKING).contains(&body.seats) {
        return Err(ApiError::bad_request("invalid seats"));
    }

    let passenger = fetch_user(&state, &passenger_id)
        .await?
        .ok_or_else(|| ApiError::not_found("passenger not found"))?;

    let rides = state.table("rides");
    let bookings = state.table("bookings");

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    // The availability check and the decrement live inside one transaction
    // holding the ride row, so two concurrent bookings serialize and the
    // count can never go negative.
    let row = sqlx::query(&format!(
        "SELECT {RIDE_COLUMNS} FROM {rides} WHERE id=$1{}",
        for_update_suffix(&state)
    ))
    .bind(&ride_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db create_booking ride lock failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("ride not found"))?;
    let ride = ride_out_from_row(&row);

    if ride.status != ride_status::SCHEDULED {
        return Err(ApiError::conflict(format!("ride is {}", ride.status)));
    }
    if ride.driver_id == passenger.id {
        return Err(ApiError::bad_request("cannot book your own ride"));
    }
    if body.seats > ride.seats_available {
        return Err(ApiError::bad_request(format!(
            "not enough seats: {} available",
            ride.seats_available
        )));
    }

    let pickup = body
        .pickup
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&ride.source)
        .to_string();
    let dropoff = body
        .dropoff
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&ride.destination)
        .to_string();

    // A leg can never be longer than the route it is part of.
    let distance_km = fare::route_distance_km(&pickup, &dropoff).min(ride.total_distance_km);
    let fare_cents = fare::proportional_fare_cents(
        ride.estimated_fare_cents,
        ride.total_distance_km,
        distance_km,
    ) * body.seats as i64;

    sqlx::query(&format!(
        "UPDATE {rides} SET seats_available = seats_available - $1 WHERE id=$2"
    ))
    .bind(body.seats)
    .bind(&ride_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db create_booking seat decrement failed");
        ApiError::internal("database error")
    })?;

    // Seats are committed here; with a gateway configured the booking waits
    // on verified payment, otherwise it confirms immediately. Test runs skip
    // the payment gate.
    let require_payment = state.gateway_enabled() && state.env_lower != "test";
    let status = if require_payment {
        booking_status::PENDING
    } else {
        booking_status::CONFIRMED
    };

    let id = Uuid::new_v4().to_string();
    sqlx::query(&format!(
        "INSERT INTO {bookings} (id,ride_id,passenger_id,pickup,dropoff,distance_km,fare_cents,\
         seats,status,created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)"
    ))
    .bind(&id)
    .bind(&ride_id)
    .bind(&passenger_id)
    .bind(&pickup)
    .bind(&dropoff)
    .bind(distance_km)
    .bind(fare_cents)
    .bind(body.seats)
    .bind(status)
    .bind(now_iso())
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db create_booking insert failed");
        ApiError::internal("database error")
    })?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    notify::send_event(
        &state,
        events::BOOKING_PLACED,
        serde_json::json!({
            "booking_id": id,
            "ride_id": ride_id,
            "passenger_id": passenger_id,
            "driver_id": ride.driver_id,
            "seats": body.seats,
            "fare_cents": fare_cents,
        }),
    );

    Ok(axum::Json(BookingOut {
        id,
        ride_id,
        passenger_id,
        pickup,
        dropoff,
        distance_km,
        fare_cents,
        seats: body.seats,
        status: status.to_string(),
        created_at: None,
    }))
}

pub async fn cancel_booking(
    Path(booking_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<BookingCancelOut>> {
    let passenger_id = require_identity(&headers)?;
    let booking_id = booking_id.trim().to_string();
    if booking_id.is_empty() {
        return Err(ApiError::bad_request("booking_id required"));
    }

    let bookings = state.table("bookings");
    let rides = state.table("rides");
    let payments = state.table("payments");

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    let b_row = sqlx::query(&format!(
        "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE id=$1{}",
        for_update_suffix(&state)
    ))
    .bind(&booking_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db cancel_booking lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("booking not found"))?;
    let mut booking = booking_out_from_row(&b_row);

    if booking.passenger_id != passenger_id {
        return Err(ApiError::forbidden("not your booking"));
    }
    if booking_status::is_terminal(&booking.status) {
        return Err(ApiError::conflict(format!("booking is {}", booking.status)));
    }

    // Seat restitution and the status flip are one atomic unit with the ride
    // row held, mirroring the booking path.
    let r_row = sqlx::query(&format!(
        "SELECT {RIDE_COLUMNS} FROM {rides} WHERE id=$1{}",
        for_update_suffix(&state)
    ))
    .bind(&booking.ride_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db cancel_booking ride lock failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("ride not found"))?;
    let ride = ride_out_from_row(&r_row);

    let new_avail =
        super::clamp_restored_seats(ride.seats_available, booking.seats, ride.seats_total);
    sqlx::query(&format!(
        "UPDATE {rides} SET seats_available=$1 WHERE id=$2"
    ))
    .bind(new_avail)
    .bind(&booking.ride_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db cancel_booking seat restore failed");
        ApiError::internal("database error")
    })?;

    sqlx::query(&format!("UPDATE {bookings} SET status=$1 WHERE id=$2"))
        .bind(booking_status::CANCELLED)
        .bind(&booking_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db cancel_booking update failed");
            ApiError::internal("database error")
        })?;

    // A settled charge flips to refunded; an order still waiting on its
    // callback is closed out as failed.
    let mut refunded_cents: i64 = 0;
    let p_rows = sqlx::query(&format!(
        "SELECT id,order_id,amount_cents,status FROM {payments} WHERE booking_id=$1 AND kind=$2{}",
        for_update_suffix(&state)
    ))
    .bind(&booking_id)
    .bind(payment_kind::BOOKING)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db cancel_booking payment fetch failed");
        ApiError::internal("database error")
    })?;
    for p in &p_rows {
        let p_id: String = p.try_get("id").unwrap_or_default();
        let p_status: String = p
            .try_get("status")
            .unwrap_or_else(|_| payment_status::PENDING.to_string());
        match p_status.as_str() {
            payment_status::SUCCESS => {
                refunded_cents += p.try_get::<i64, _>("amount_cents").unwrap_or(0);
                sqlx::query(&format!("UPDATE {payments} SET status=$1 WHERE id=$2"))
                    .bind(payment_status::REFUNDED)
                    .bind(&p_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "db cancel_booking refund mark failed");
                        ApiError::internal("database error")
                    })?;
            }
            payment_status::PENDING => {
                sqlx::query(&format!("UPDATE {payments} SET status=$1 WHERE id=$2"))
                    .bind(payment_status::FAILED)
                    .bind(&p_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "db cancel_booking fail mark failed");
                        ApiError::internal("database error")
                    })?;
            }
            _ => {}
        }
    }

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    // Gateway refund runs after commit so the upstream call never holds the
    // seat lock.
    if refunded_cents > 0 {
        super::payments::refund_booking_order_best_effort(&state, &booking_id).await;
    }
    notify::send_event(
        &state,
        events::BOOKING_CANCELLED,
        serde_json::json!({
            "booking_id": booking_id,
            "ride_id": booking.ride_id,
            "passenger_id": booking.passenger_id,
            "driver_id": ride.driver_id,
            "refunded_cents": refunded_cents,
        }),
    );

    booking.status = booking_status::CANCELLED.to_string();
    Ok(axum::Json(BookingCancelOut {
        booking,
        refunded_cents,
    }))
}

pub async fn my_bookings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<axum::Json<Vec<BookingOut>>> {
    let passenger_id = require_identity(&headers)?;
    let limit = normalize_limit(params.limit, 50, 1, 200);
    let bookings = state.table("bookings");
    let sql = format!(
        "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE passenger_id=$1 \
         ORDER BY created_at DESC LIMIT $2"
    );
    let rows = sqlx::query(&sql)
        .bind(&passenger_id)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db my_bookings failed");
            ApiError::internal("database error")
        })?;
    Ok(axum::Json(rows.iter().map(booking_out_from_row).collect()))
}

pub async fn ride_bookings(
    Path(ride_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<Vec<BookingOut>>> {
    let identity = require_identity(&headers)?;
    let ride = super::rides::fetch_ride(&state, ride_id.trim())
        .await?
        .ok_or_else(|| ApiError::not_found("ride not found"))?;
    if ride.driver_id != identity {
        return Err(ApiError::forbidden("not your ride"));
    }

    let bookings = state.table("bookings");
    let sql = format!(
        "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE ride_id=$1 ORDER BY created_at DESC"
    );
    let rows = sqlx::query(&sql)
        .bind(ride_id.trim())
        .fetch_all(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db ride_bookings failed");
            ApiError::internal("database error")
        })?;
    Ok(axum::Json(rows.iter().map(booking_out_from_row).collect()))
}

pub async fn driver_bookings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<axum::Json<Vec<BookingOut>>> {
    let driver_id = require_identity(&headers)?;
    let limit = normalize_limit(params.limit, 50, 1, 200);
    let bookings = state.table("bookings");
    let rides = state.table("rides");
    let sql = format!(
        "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE ride_id IN \
         (SELECT id FROM {rides} WHERE driver_id=$1) ORDER BY created_at DESC LIMIT $2"
    );
    let rows = sqlx::query(&sql)
        .bind(&driver_id)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db driver_bookings failed");
            ApiError::internal("database error")
        })?;
    Ok(axum::Json(rows.iter().map(booking_out_from_row).collect()))
}

pub async fn booking_detail(
    Path(booking_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<BookingOut>> {
    let identity = require_identity(&headers)?;
    let booking = fetch_booking(&state, booking_id.trim())
        .await?
        .ok_or_else(|| ApiError::not_found("booking not found"))?;

    if booking.passenger_id != identity {
        let ride = super::rides::fetch_ride(&state, &booking.ride_id).await?;
        let is_driver = ride.map(|r| r.driver_id == identity).unwrap_or(false);
        if !is_driver {
            return Err(ApiError::forbidden("not your booking"));
        }
    }
    Ok(axum::Json(booking))
}
