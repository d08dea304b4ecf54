use super::bookings::fetch_booking;
use super::rides::fetch_ride;
use super::{now_iso, require_identity};
use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use chrono::{NaiveDate, Utc};
use sqlx::Row;
use uuid::Uuid;

fn ride_date_is_past(ride_date: &str) -> bool {
    NaiveDate::parse_from_str(ride_date.trim(), "%Y-%m-%d")
        .map(|d| d < Utc::now().date_naive())
        .unwrap_or(false)
}

/// A booking can be reviewed once the journey is over: either it closed as
/// completed, or it stayed confirmed and the ride date has passed.
fn review_eligible(booking_status_raw: &str, ride_date: &str) -> bool {
    match booking_status_raw {
        booking_status::COMPLETED => true,
        booking_status::CONFIRMED => ride_date_is_past(ride_date),
        _ => false,
    }
}

pub async fn submit_review(
    Path(booking_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ReviewIn>,
) -> ApiResult<axum::Json<ReviewOut>> {
    let passenger_id = require_identity(&headers)?;
    let booking_id = booking_id.trim().to_string();

    if !(1..=5).contains(&body.rating) {
        return Err(ApiError::bad_request("rating must be between 1 and 5"));
    }
    let comment = body
        .comment
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    if let Some(c) = comment.as_deref() {
        if c.len() > 1024 {
            return Err(ApiError::bad_request("comment too long"));
        }
    }

    let booking = fetch_booking(&state, &booking_id)
        .await?
        .ok_or_else(|| ApiError::not_found("booking not found"))?;
    if booking.passenger_id != passenger_id {
        return Err(ApiError::forbidden("not your booking"));
    }

    let ride = fetch_ride(&state, &booking.ride_id)
        .await?
        .ok_or_else(|| ApiError::not_found("ride not found"))?;
    if !review_eligible(&booking.status, &ride.ride_date) {
        return Err(ApiError::conflict(format!(
            "booking is {}; not eligible for review",
            booking.status
        )));
    }

    let reviews = state.table("reviews");
    let users = state.table("users");

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    let id = Uuid::new_v4().to_string();
    // The unique index on booking_id makes concurrent duplicate submits lose
    // the race here rather than both landing.
    let insert = sqlx::query(&format!(
        "INSERT INTO {reviews} (id,booking_id,reviewer_id,driver_id,rating,comment,created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7)"
    ))
    .bind(&id)
    .bind(&booking_id)
    .bind(&passenger_id)
    .bind(&ride.driver_id)
    .bind(body.rating)
    .bind(&comment)
    .bind(now_iso())
    .execute(&mut *tx)
    .await;
    if let Err(e) = insert {
        let duplicate = e
            .as_database_error()
            .map(|d| d.is_unique_violation())
            .unwrap_or(false);
        if duplicate {
            return Err(ApiError::conflict("review already submitted"));
        }
        tracing::error!(error = %e, "db submit_review insert failed");
        return Err(ApiError::internal("database error"));
    }

    // AVG over integers comes back as NUMERIC; cast so it decodes as f64.
    let avg_row = sqlx::query(&format!(
        "SELECT COALESCE(AVG(rating),0)::float8 AS avg_rating FROM {reviews} WHERE driver_id=$1"
    ))
    .bind(&ride.driver_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db submit_review average failed");
        ApiError::internal("database error")
    })?;
    let average: f64 = avg_row.try_get("avg_rating").unwrap_or(0.0);

    sqlx::query(&format!(
        "UPDATE {users} SET driver_rating=$1 WHERE id=$2"
    ))
    .bind(average)
    .bind(&ride.driver_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db submit_review rating update failed");
        ApiError::internal("database error")
    })?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    Ok(axum::Json(ReviewOut {
        id,
        booking_id,
        reviewer_id: passenger_id,
        driver_id: ride.driver_id,
        rating: body.rating,
        comment,
        created_at: None,
    }))
}

pub async fn has_reviewed(
    Path(booking_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<ReviewedOut>> {
    let passenger_id = require_identity(&headers)?;
    let booking_id = booking_id.trim().to_string();

    let booking = fetch_booking(&state, &booking_id)
        .await?
        .ok_or_else(|| ApiError::not_found("booking not found"))?;
    if booking.passenger_id != passenger_id {
        return Err(ApiError::forbidden("not your booking"));
    }

    let reviews = state.table("reviews");
    let exists = sqlx::query(&format!(
        "SELECT 1 FROM {reviews} WHERE booking_id=$1 LIMIT 1"
    ))
    .bind(&booking_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db has_reviewed failed");
        ApiError::internal("database error")
    })?
    .is_some();

    Ok(axum::Json(ReviewedOut {
        booking_id,
        reviewed: exists,
    }))
}

pub async fn driver_rating(
    Path(driver_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<axum::Json<RatingOut>> {
    let driver_id = driver_id.trim().to_string();
    let reviews = state.table("reviews");

    // 0.0 when no reviews exist, never null.
    let row = sqlx::query(&format!(
        "SELECT COALESCE(AVG(rating),0)::float8 AS avg_rating, COUNT(id) AS review_count \
         FROM {reviews} WHERE driver_id=$1"
    ))
    .bind(&driver_id)
    .fetch_one(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db driver_rating failed");
        ApiError::internal("database error")
    })?;

    Ok(axum::Json(RatingOut {
        driver_id,
        average_rating: row.try_get("avg_rating").unwrap_or(0.0),
        review_count: row.try_get("review_count").unwrap_or(0),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_bookings_are_eligible() {
        assert!(review_eligible(booking_status::COMPLETED, "2099-01-01"));
    }

    #[test]
    fn confirmed_bookings_need_a_past_ride_date() {
        assert!(review_eligible(booking_status::CONFIRMED, "2000-01-01"));
        assert!(!review_eligible(booking_status::CONFIRMED, "2099-01-01"));
        assert!(!review_eligible(booking_status::CONFIRMED, "not-a-date"));
    }

    #[test]
    fn other_states_are_never_eligible() {
        assert!(!review_eligible(booking_status::PENDING, "2000-01-01"));
        assert!(!review_eligible(booking_status::CANCELLED, "2000-01-01"));
    }
}
