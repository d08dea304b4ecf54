use crate::state::AppState;

/// Fire-and-forget notification to the mail/SMS relay. Runs on its own task
/// after the triggering transaction has committed; failures are logged and
/// never reach the caller.
pub fn send_event(state: &AppState, event: &'static str, payload: serde_json::Value) {
    if !state.notify_enabled() {
        tracing::debug!(event, "notification relay not configured; skipping");
        return;
    }
    let base = state
        .notify_base_url
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    let http = state.http.clone();
    let url = format!("{}/notifications", base.trim_end_matches('/'));
    let body = serde_json::json!({
        "event": event,
        "data": payload,
    });

    tokio::spawn(async move {
        match http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(event, "notification delivered");
            }
            Ok(resp) => {
                tracing::warn!(event, status = %resp.status(), "notification relay rejected event");
            }
            Err(e) => {
                tracing::warn!(event, error = %e, "notification send failed");
            }
        }
    });
}

pub mod events {
    pub const BOOKING_PLACED: &str = "booking_placed";
    pub const BOOKING_CONFIRMED: &str = "booking_confirmed";
    pub const BOOKING_CANCELLED: &str = "booking_cancelled";
    pub const RIDE_CANCELLED: &str = "ride_cancelled";
    pub const PAYOUT_COMPLETED: &str = "payout_completed";
    pub const DRIVER_APPROVAL: &str = "driver_approval";
}
