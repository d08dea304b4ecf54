use crate::handlers::{booking_out_from_row, for_update_suffix, ride_out_from_row};
use crate::handlers::{BOOKING_COLUMNS, RIDE_COLUMNS};
use crate::models::*;
use crate::state::AppState;
use chrono::{Duration, Utc};
use sqlx::Row;
use std::time::Duration as StdDuration;

/// Bookings stuck `pending` past the payment TTL never saw their gateway
/// callback. The sweep returns their seats and closes out the dangling
/// payment rows, on the same lock discipline as the foreground paths.
pub fn spawn(state: AppState, interval_secs: u64, ttl_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match sweep_once(&state, ttl_secs).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(expired = n, "reconciled stale pending bookings"),
                Err(e) => tracing::error!(error = %e, "pending-booking sweep failed"),
            }
        }
    })
}

fn cutoff_iso(ttl_secs: u64) -> String {
    (Utc::now() - Duration::seconds(ttl_secs as i64)).to_rfc3339()
}

pub async fn sweep_once(state: &AppState, ttl_secs: u64) -> Result<u64, sqlx::Error> {
    let bookings = state.table("bookings");
    let cutoff = cutoff_iso(ttl_secs);

    // RFC3339 timestamps in a single offset compare lexicographically, the
    // same trick the foreground queries rely on.
    let stale = sqlx::query(&format!(
        "SELECT id FROM {bookings} WHERE status=$1 AND created_at < $2 LIMIT 100"
    ))
    .bind(booking_status::PENDING)
    .bind(&cutoff)
    .fetch_all(&state.pool)
    .await?;

    let mut expired = 0u64;
    for row in stale {
        let booking_id: String = row.try_get("id").unwrap_or_default();
        if booking_id.is_empty() {
            continue;
        }
        if expire_booking(state, &booking_id).await? {
            expired += 1;
        }
    }

    // Orders created moments before their booking resolved stay pending with
    // nothing left to verify; close them out too.
    let payments = state.table("payments");
    sqlx::query(&format!(
        "UPDATE {payments} SET status=$1 WHERE status=$2 AND kind=$3 AND created_at < $4 \
         AND booking_id IN (SELECT id FROM {bookings} WHERE status IN ($5,$6))"
    ))
    .bind(payment_status::FAILED)
    .bind(payment_status::PENDING)
    .bind(payment_kind::BOOKING)
    .bind(&cutoff)
    .bind(booking_status::CANCELLED)
    .bind(booking_status::COMPLETED)
    .execute(&state.pool)
    .await?;

    Ok(expired)
}

async fn expire_booking(state: &AppState, booking_id: &str) -> Result<bool, sqlx::Error> {
    let bookings = state.table("bookings");
    let rides = state.table("rides");
    let payments = state.table("payments");

    let mut tx = state.pool.begin().await?;

    let b_row = sqlx::query(&format!(
        "SELECT {BOOKING_COLUMNS} FROM {bookings} WHERE id=$1{}",
        for_update_suffix(state)
    ))
    .bind(booking_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(b_row) = b_row else {
        tx.rollback().await.ok();
        return Ok(false);
    };
    let booking = booking_out_from_row(&b_row);
    // A verify or cancel may have won since the candidate query ran.
    if booking.status != booking_status::PENDING {
        tx.rollback().await.ok();
        return Ok(false);
    }

    if let Some(r_row) = sqlx::query(&format!(
        "SELECT {RIDE_COLUMNS} FROM {rides} WHERE id=$1{}",
        for_update_suffix(state)
    ))
    .bind(&booking.ride_id)
    .fetch_optional(&mut *tx)
    .await?
    {
        let ride = ride_out_from_row(&r_row);
        if !ride_status::is_terminal(&ride.status) {
            let new_avail = crate::handlers::clamp_restored_seats(
                ride.seats_available,
                booking.seats,
                ride.seats_total,
            );
            sqlx::query(&format!(
                "UPDATE {rides} SET seats_available=$1 WHERE id=$2"
            ))
            .bind(new_avail)
            .bind(&booking.ride_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    sqlx::query(&format!("UPDATE {bookings} SET status=$1 WHERE id=$2"))
        .bind(booking_status::CANCELLED)
        .bind(booking_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(&format!(
        "UPDATE {payments} SET status=$1 WHERE booking_id=$2 AND kind=$3 AND status=$4"
    ))
    .bind(payment_status::FAILED)
    .bind(booking_id)
    .bind(payment_kind::BOOKING)
    .bind(payment_status::PENDING)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    tracing::info!(booking_id, "expired pending booking");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_is_in_the_past_and_rfc3339() {
        let now = Utc::now().to_rfc3339();
        let cutoff = cutoff_iso(900);
        assert!(cutoff < now);
        assert!(chrono::DateTime::parse_from_rfc3339(&cutoff).is_ok());
    }

    #[test]
    fn rfc3339_utc_strings_order_lexicographically() {
        let earlier = (Utc::now() - Duration::seconds(60)).to_rfc3339();
        let later = Utc::now().to_rfc3339();
        assert!(earlier < later);
    }
}
