use super::bookings::fetch_booking;
use super::rides::fetch_ride;
use super::{
    for_update_suffix, now_iso, payment_out_from_row, require_identity, PAYMENT_COLUMNS,
};
use crate::error::{ApiError, ApiResult};
use crate::gateway;
use crate::models::*;
use crate::notify::{self, events};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

pub async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<OrderReq>,
) -> ApiResult<axum::Json<OrderOut>> {
    let passenger_id = require_identity(&headers)?;
    let booking_id = body.booking_id.trim().to_string();
    if booking_id.is_empty() {
        return Err(ApiError::bad_request("booking_id required"));
    }

    let booking = fetch_booking(&state, &booking_id)
        .await?
        .ok_or_else(|| ApiError::not_found("booking not found"))?;
    if booking.passenger_id != passenger_id {
        return Err(ApiError::forbidden("not your booking"));
    }
    if booking.status != booking_status::PENDING {
        return Err(ApiError::conflict(format!("booking is {}", booking.status)));
    }

    let ride = fetch_ride(&state, &booking.ride_id)
        .await?
        .ok_or_else(|| ApiError::not_found("ride not found"))?;

    // The booking's stored fare is the only amount ever charged; whatever a
    // client claims the price is never reaches the gateway.
    let amount_cents = booking.fare_cents;

    let payments = state.table("payments");

    // An order already awaiting its callback is handed back instead of
    // creating a second gateway order for the same booking.
    let existing = sqlx::query(&format!(
        "SELECT order_id,amount_cents FROM {payments} WHERE booking_id=$1 AND kind=$2 AND status=$3 \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(&booking_id)
    .bind(payment_kind::BOOKING)
    .bind(payment_status::PENDING)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db create_order existing lookup failed");
        ApiError::internal("database error")
    })?;
    if let Some(row) = existing {
        let order_id: Option<String> = row.try_get("order_id").unwrap_or(None);
        if let Some(order_id) = order_id.filter(|s| !s.trim().is_empty()) {
            return Ok(axum::Json(OrderOut {
                order_id,
                booking_id,
                amount_cents: row.try_get("amount_cents").unwrap_or(amount_cents),
                currency: state.currency.clone(),
            }));
        }
    }

    let order = gateway::create_order(&state, &booking_id, amount_cents).await?;

    let id = Uuid::new_v4().to_string();
    sqlx::query(&format!(
        "INSERT INTO {payments} (id,booking_id,passenger_id,driver_id,order_id,amount_cents,\
         currency,status,kind,driver_payment_status,created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)"
    ))
    .bind(&id)
    .bind(&booking_id)
    .bind(&passenger_id)
    .bind(&ride.driver_id)
    .bind(&order.order_id)
    .bind(order.amount_cents)
    .bind(&order.currency)
    .bind(payment_status::PENDING)
    .bind(payment_kind::BOOKING)
    .bind(payout_status::PENDING)
    .bind(now_iso())
    .execute(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db create_order insert failed");
        ApiError::internal("database error")
    })?;

    Ok(axum::Json(OrderOut {
        order_id: order.order_id,
        booking_id,
        amount_cents: order.amount_cents,
        currency: order.currency,
    }))
}

pub async fn verify_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<VerifyReq>,
) -> ApiResult<axum::Json<VerifyOut>> {
    let passenger_id = require_identity(&headers)?;
    let order_id = body.order_id.trim().to_string();
    let gateway_payment_id = body.gateway_payment_id.trim().to_string();
    if order_id.is_empty() || gateway_payment_id.is_empty() {
        return Err(ApiError::bad_request(
            "order_id and gateway_payment_id required",
        ));
    }

    // Generic rejection only; neither the expected nor the supplied digest is
    // ever echoed back.
    if !gateway::verify_callback_signature(
        &state.gateway_webhook_secret,
        &order_id,
        &gateway_payment_id,
        &body.signature,
    ) {
        return Err(ApiError::unauthorized("signature verification failed"));
    }

    let payments = state.table("payments");
    let bookings = state.table("bookings");

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    let p_row = sqlx::query(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM {payments} WHERE order_id=$1 AND kind=$2{}",
        for_update_suffix(&state)
    ))
    .bind(&order_id)
    .bind(payment_kind::BOOKING)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db verify_payment lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("payment record not found"))?;
    let payment = payment_out_from_row(&p_row);

    if payment.passenger_id != passenger_id {
        return Err(ApiError::forbidden("not your payment"));
    }
    if payment.status != payment_status::PENDING {
        return Err(ApiError::conflict(format!("payment is {}", payment.status)));
    }

    let b_row = sqlx::query(&format!(
        "SELECT id,status FROM {bookings} WHERE id=$1{}",
        for_update_suffix(&state)
    ))
    .bind(&payment.booking_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db verify_payment booking lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("booking not found"))?;
    let b_status: String = b_row
        .try_get("status")
        .unwrap_or_else(|_| booking_status::PENDING.to_string());
    if b_status != booking_status::PENDING {
        // A late callback for a booking that already resolved (for example a
        // cancellation beat the gateway) must not resurrect it.
        return Err(ApiError::conflict(format!("booking is {b_status}")));
    }

    // Seats were committed when the booking was created; verification only
    // settles the money and confirms.
    sqlx::query(&format!(
        "UPDATE {payments} SET status=$1, gateway_payment_id=$2, gateway_signature=$3 WHERE id=$4"
    ))
    .bind(payment_status::SUCCESS)
    .bind(&gateway_payment_id)
    .bind(body.signature.trim())
    .bind(&payment.id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db verify_payment payment update failed");
        ApiError::internal("database error")
    })?;

    sqlx::query(&format!("UPDATE {bookings} SET status=$1 WHERE id=$2"))
        .bind(booking_status::CONFIRMED)
        .bind(&payment.booking_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db verify_payment booking update failed");
            ApiError::internal("database error")
        })?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    notify::send_event(
        &state,
        events::BOOKING_CONFIRMED,
        serde_json::json!({
            "booking_id": payment.booking_id,
            "passenger_id": payment.passenger_id,
            "driver_id": payment.driver_id,
            "amount_cents": payment.amount_cents,
        }),
    );

    Ok(axum::Json(VerifyOut {
        booking_id: payment.booking_id,
        payment_status: payment_status::SUCCESS.to_string(),
        booking_status: booking_status::CONFIRMED.to_string(),
    }))
}

pub async fn payment_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<axum::Json<Vec<PaymentOut>>> {
    let passenger_id = require_identity(&headers)?;
    let limit = super::normalize_limit(params.limit, 50, 1, 200);
    let payments = state.table("payments");
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM {payments} WHERE passenger_id=$1 AND kind=$2 \
         ORDER BY created_at DESC LIMIT $3"
    );
    let rows = sqlx::query(&sql)
        .bind(&passenger_id)
        .bind(payment_kind::BOOKING)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db payment_history failed");
            ApiError::internal("database error")
        })?;
    Ok(axum::Json(rows.iter().map(payment_out_from_row).collect()))
}

pub async fn driver_payment_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> ApiResult<axum::Json<Vec<PaymentOut>>> {
    let driver_id = require_identity(&headers)?;
    let limit = super::normalize_limit(params.limit, 50, 1, 200);
    let payments = state.table("payments");
    let sql = format!(
        "SELECT {PAYMENT_COLUMNS} FROM {payments} WHERE driver_id=$1 \
         ORDER BY created_at DESC LIMIT $2"
    );
    let rows = sqlx::query(&sql)
        .bind(&driver_id)
        .bind(limit)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "db driver_payment_history failed");
            ApiError::internal("database error")
        })?;
    Ok(axum::Json(rows.iter().map(payment_out_from_row).collect()))
}

pub async fn transfer_to_driver(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<PayoutReq>,
) -> ApiResult<axum::Json<PayoutOut>> {
    let driver_id = require_identity(&headers)?;
    let booking_id = body.booking_id.trim().to_string();
    if booking_id.is_empty() {
        return Err(ApiError::bad_request("booking_id required"));
    }

    let booking = fetch_booking(&state, &booking_id)
        .await?
        .ok_or_else(|| ApiError::not_found("booking not found"))?;
    if booking.status != booking_status::COMPLETED {
        return Err(ApiError::conflict("booking not completed"));
    }
    let ride = fetch_ride(&state, &booking.ride_id)
        .await?
        .ok_or_else(|| ApiError::not_found("ride not found"))?;
    if ride.driver_id != driver_id {
        return Err(ApiError::forbidden("not your booking"));
    }

    let payments = state.table("payments");
    let users = state.table("users");

    let mut tx = state.pool.begin().await.map_err(|e| {
        tracing::error!(error = %e, "db begin tx failed");
        ApiError::internal("database error")
    })?;

    // Single-writer guarantee: the payment row is held for the whole credit,
    // so the first caller flips it to completed and any racer sees that flip.
    let p_row = sqlx::query(&format!(
        "SELECT {PAYMENT_COLUMNS} FROM {payments} WHERE booking_id=$1 AND kind=$2 AND status=$3{}",
        for_update_suffix(&state)
    ))
    .bind(&booking_id)
    .bind(payment_kind::BOOKING)
    .bind(payment_status::SUCCESS)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db transfer payment lock failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("payment record not found"))?;
    let payment = payment_out_from_row(&p_row);

    match payment.driver_payment_status.as_str() {
        payout_status::COMPLETED => {
            return Err(ApiError::conflict("payout already transferred"));
        }
        // An interrupted or failed earlier attempt never credited, so these
        // all retry from scratch.
        payout_status::PENDING | payout_status::PROCESSING | payout_status::FAILED => {}
        other => {
            tracing::error!(status = other, "unknown driver payment status");
            return Err(ApiError::internal("payout state corrupted"));
        }
    }

    let u_row = sqlx::query(&format!(
        "SELECT id,balance_cents FROM {users} WHERE id=$1{}",
        for_update_suffix(&state)
    ))
    .bind(&driver_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db transfer wallet lock failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("driver not found"))?;
    let old_balance: i64 = u_row.try_get("balance_cents").unwrap_or(0);
    let new_balance = old_balance
        .checked_add(payment.amount_cents)
        .ok_or_else(|| ApiError::internal("balance overflow"))?;

    sqlx::query(&format!(
        "UPDATE {users} SET balance_cents=$1 WHERE id=$2"
    ))
    .bind(new_balance)
    .bind(&driver_id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db transfer wallet update failed");
        ApiError::internal("database error")
    })?;

    let now = Utc::now();
    sqlx::query(&format!(
        "UPDATE {payments} SET driver_payment_status=$1, driver_paid_at=$2 WHERE id=$3"
    ))
    .bind(payout_status::COMPLETED)
    .bind(now.to_rfc3339())
    .bind(&payment.id)
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db transfer payment update failed");
        ApiError::internal("database error")
    })?;

    // Ledger row so the payout shows up in the driver's history on its own.
    sqlx::query(&format!(
        "INSERT INTO {payments} (id,booking_id,passenger_id,driver_id,amount_cents,currency,\
         status,kind,driver_payment_status,driver_paid_at,created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)"
    ))
    .bind(Uuid::new_v4().to_string())
    .bind(&booking_id)
    .bind(&payment.passenger_id)
    .bind(&driver_id)
    .bind(payment.amount_cents)
    .bind(&payment.currency)
    .bind(payment_status::SUCCESS)
    .bind(payment_kind::DRIVER_PAYOUT)
    .bind(payout_status::COMPLETED)
    .bind(now.to_rfc3339())
    .bind(now_iso())
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db transfer payout insert failed");
        ApiError::internal("database error")
    })?;

    tx.commit().await.map_err(|e| {
        tracing::error!(error = %e, "db commit failed");
        ApiError::internal("database error")
    })?;

    notify::send_event(
        &state,
        events::PAYOUT_COMPLETED,
        serde_json::json!({
            "booking_id": booking_id,
            "driver_id": driver_id,
            "amount_cents": payment.amount_cents,
        }),
    );

    Ok(axum::Json(PayoutOut {
        booking_id,
        amount_cents: payment.amount_cents,
        balance_cents: new_balance,
        driver_paid_at: now,
    }))
}

pub async fn driver_wallet(
    Path(driver_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<axum::Json<WalletOut>> {
    let identity = require_identity(&headers)?;
    let driver_id = driver_id.trim().to_string();
    if identity != driver_id {
        return Err(ApiError::forbidden("not your wallet"));
    }

    let users = state.table("users");
    let payments = state.table("payments");

    let u_row = sqlx::query(&format!(
        "SELECT balance_cents FROM {users} WHERE id=$1"
    ))
    .bind(&driver_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, "db wallet lookup failed");
        ApiError::internal("database error")
    })?
    .ok_or_else(|| ApiError::not_found("driver not found"))?;
    let balance_cents: i64 = u_row.try_get("balance_cents").unwrap_or(0);

    let completed_payout_cents = sum_payments(
        &state,
        &format!(
            "SELECT COALESCE(SUM(amount_cents),0)::bigint AS s FROM {payments} \
             WHERE driver_id=$1 AND kind=$2 AND driver_payment_status=$3"
        ),
        &[
            driver_id.as_str(),
            payment_kind::BOOKING,
            payout_status::COMPLETED,
        ],
    )
    .await?;

    // Earned but not yet transferred: the charge settled and no payout has
    // completed for it.
    let pending_payout_cents = sum_payments(
        &state,
        &format!(
            "SELECT COALESCE(SUM(amount_cents),0)::bigint AS s FROM {payments} \
             WHERE driver_id=$1 AND kind=$2 AND status=$3 AND driver_payment_status != $4"
        ),
        &[
            driver_id.as_str(),
            payment_kind::BOOKING,
            payment_status::SUCCESS,
            payout_status::COMPLETED,
        ],
    )
    .await?;

    Ok(axum::Json(WalletOut {
        driver_id,
        balance_cents,
        completed_payout_cents,
        pending_payout_cents,
        currency: state.currency.clone(),
    }))
}

async fn sum_payments(state: &AppState, sql: &str, binds: &[&str]) -> ApiResult<i64> {
    let mut q = sqlx::query(sql);
    for b in binds {
        q = q.bind(*b);
    }
    let row = q.fetch_one(&state.pool).await.map_err(|e| {
        tracing::error!(error = %e, "db payment sum failed");
        ApiError::internal("database error")
    })?;
    Ok(row.try_get::<i64, _>("s").unwrap_or(0))
}

/// Issues the gateway refund for a booking whose payment row was already
/// marked refunded. Best-effort by contract: the cancellation is committed
/// and a gateway failure only leaves a log line for operators.
pub(crate) async fn refund_booking_order_best_effort(state: &AppState, booking_id: &str) {
    let payments = state.table("payments");
    let row = sqlx::query(&format!(
        "SELECT order_id,amount_cents FROM {payments} WHERE booking_id=$1 AND kind=$2 AND status=$3 \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(booking_id)
    .bind(payment_kind::BOOKING)
    .bind(payment_status::REFUNDED)
    .fetch_optional(&state.pool)
    .await;

    let row = match row {
        Ok(Some(r)) => r,
        Ok(None) => return,
        Err(e) => {
            tracing::error!(error = %e, booking_id, "db refund lookup failed");
            return;
        }
    };
    let order_id: Option<String> = row.try_get("order_id").unwrap_or(None);
    let amount_cents: i64 = row.try_get("amount_cents").unwrap_or(0);
    let Some(order_id) = order_id.filter(|s| !s.trim().is_empty()) else {
        return;
    };
    if let Err(e) = gateway::refund_order(state, &order_id, amount_cents).await {
        tracing::warn!(booking_id, order_id = %order_id, detail = %e.detail, "gateway refund failed");
    }
}
